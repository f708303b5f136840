//! Face display lists.
//!
//! A face's display list is its edge loop turned into a triangle fan with
//! texture and lightmap coordinates precomputed. Lists are built once per
//! map load, after the face has its lightmap placement.

use quake_shared::{
    bsp::{BspModel, LightmapSlot, SurfaceFlags},
    math::Vec3,
    render::PolyVertex,
};
use tracing::debug;

use crate::lightmap::{BLOCK_HEIGHT, BLOCK_WIDTH};

/// Per-axis tolerance for treating two edge directions as the same.
pub const COLLINEAR_EPSILON: f32 = 0.001;

/// Builds the display list of `face`.
///
/// Texture ST is the texinfo projection divided by the texture size.
/// Lightmap ST addresses the face's block inside its atlas page, sampling
/// luxel centres. Collinear vertices are dropped unless `keep_tjunctions` is
/// set or the face is a liquid surface.
pub fn build_surface_display_list(
    model: &BspModel,
    face: usize,
    placement: Option<LightmapSlot>,
    keep_tjunctions: bool,
) -> Vec<PolyVertex> {
    let f = &model.faces[face];
    let tex = model.texinfo_of(face);
    let texture = &model.textures[tex.texture];
    let width = texture.width.max(1) as f32;
    let height = texture.height.max(1) as f32;
    let (light_s, light_t) = placement.map(|p| (p.s, p.t)).unwrap_or((0, 0));

    let mut verts: Vec<PolyVertex> = model
        .face_vertices(face)
        .map(|pos| {
            let s = tex.project(pos, 0);
            let t = tex.project(pos, 1);
            let lm_s = (s - f.texture_mins[0] as f32 + (light_s * 16) as f32 + 8.0)
                / (BLOCK_WIDTH * 16) as f32;
            let lm_t = (t - f.texture_mins[1] as f32 + (light_t * 16) as f32 + 8.0)
                / (BLOCK_HEIGHT * 16) as f32;
            PolyVertex {
                pos,
                st: [s / width, t / height],
                lm: [lm_s, lm_t],
            }
        })
        .collect();

    if !keep_tjunctions && !f.flags.contains(SurfaceFlags::DRAWTURB) {
        let before = verts.len();
        reduce_collinear(&mut verts, COLLINEAR_EPSILON);
        if verts.len() != before {
            debug!(face, removed = before - verts.len(), "collinear vertices removed");
        }
    }
    verts
}

/// Removes vertices lying on the straight line between their neighbours.
///
/// Runs until a full pass removes nothing, so applying it twice changes
/// nothing. Never reduces a polygon below a triangle.
pub fn reduce_collinear(verts: &mut Vec<PolyVertex>, eps: f32) -> usize {
    let mut removed = 0;
    loop {
        let mut changed = false;
        let mut i = 0;
        while i < verts.len() && verts.len() > 3 {
            let n = verts.len();
            let prev = verts[(i + n - 1) % n].pos;
            let this = verts[i].pos;
            let next = verts[(i + 1) % n].pos;
            if is_collinear(prev, this, next, eps) {
                verts.remove(i);
                removed += 1;
                changed = true;
            } else {
                i += 1;
            }
        }
        if !changed {
            return removed;
        }
    }
}

fn is_collinear(prev: Vec3, this: Vec3, next: Vec3, eps: f32) -> bool {
    let v1 = (this - prev).normalize();
    let v2 = (next - prev).normalize();
    (0..3).all(|i| (v1[i] - v2[i]).abs() <= eps)
}

/// Builds and stores display lists for every face of `model`.
pub fn build_all_display_lists(model: &mut BspModel, keep_tjunctions: bool) {
    for face in 0..model.faces.len() {
        let placement = model.faces[face].cache.lightmap;
        let list = build_surface_display_list(model, face, placement, keep_tjunctions);
        model.faces[face].cache.display_list = Some(list);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use quake_shared::bsp::{Edge, Plane};

    use crate::visibility::tests::{face, slab_world};

    /// A 64x64 square in the z = 0 plane with an extra vertex halfway along
    /// its first edge. Face 0 of the returned model.
    pub(crate) fn square_world() -> BspModel {
        let mut model = slab_world(1024.0);
        model.planes.push(Plane::new(Vec3::new(0.0, 0.0, 1.0), 0.0));
        model.vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(64.0, 0.0, 0.0),
            Vec3::new(64.0, 64.0, 0.0),
            Vec3::new(0.0, 64.0, 0.0),
            Vec3::new(32.0, 0.0, 0.0),
        ];
        model.edges = vec![
            Edge::default(),
            Edge { v: [0, 4] },
            Edge { v: [4, 1] },
            Edge { v: [1, 2] },
            Edge { v: [2, 3] },
            Edge { v: [3, 0] },
        ];
        model.surf_edges = vec![1, 2, 3, 4, 5];
        let mut f = face(3, SurfaceFlags::empty());
        f.num_edges = 5;
        f.extents = [64, 64];
        model.faces[0] = f;
        model
    }

    fn vert(x: f32, y: f32) -> PolyVertex {
        PolyVertex {
            pos: Vec3::new(x, y, 0.0),
            ..Default::default()
        }
    }

    #[test]
    fn collinear_reduction_is_idempotent() {
        let mut verts = vec![
            vert(0.0, 0.0),
            vert(16.0, 0.0),
            vert(32.0, 0.0),
            vert(32.0, 32.0),
            vert(16.0, 32.0),
            vert(0.0, 32.0),
            vert(0.0, 16.0),
        ];
        assert_eq!(reduce_collinear(&mut verts, COLLINEAR_EPSILON), 3);
        assert_eq!(verts.len(), 4);
        let once = verts.clone();
        assert_eq!(reduce_collinear(&mut verts, COLLINEAR_EPSILON), 0);
        assert_eq!(verts, once);
    }

    #[test]
    fn triangle_is_never_reduced() {
        let mut verts = vec![vert(0.0, 0.0), vert(10.0, 0.0), vert(20.0, 0.0)];
        reduce_collinear(&mut verts, COLLINEAR_EPSILON);
        assert_eq!(verts.len(), 3);
    }

    #[test]
    fn display_list_coordinates() {
        let model = square_world();
        let slot = LightmapSlot { page: 0, s: 2, t: 3 };
        let list = build_surface_display_list(&model, 0, Some(slot), true);
        assert_eq!(list.len(), 5);
        let mid = list[1];
        assert_eq!(mid.pos, Vec3::new(32.0, 0.0, 0.0));
        assert_eq!(mid.st, [0.5, 0.0]);
        assert_eq!(mid.lm[0], (32.0 + 32.0 + 8.0) / 2048.0);
        assert_eq!(mid.lm[1], (0.0 + 48.0 + 8.0) / 2048.0);

        let reduced = build_surface_display_list(&model, 0, Some(slot), false);
        assert_eq!(reduced.len(), 4);
    }

    #[test]
    fn liquid_faces_keep_every_vertex() {
        let mut model = square_world();
        model.faces[0].flags = SurfaceFlags::DRAWTURB;
        build_all_display_lists(&mut model, false);
        assert_eq!(model.faces[0].cache.display_list.as_ref().map(Vec::len), Some(5));
    }
}
