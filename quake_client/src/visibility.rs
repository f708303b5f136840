//! World visibility.
//!
//! Each frame runs in two passes over the BSP tree:
//! 1. [`VisState::mark_leaves`] stamps every leaf in the view leaf's
//!    potentially visible set, and all of their ancestors, with the current
//!    vis frame.
//! 2. [`walk_world`] descends from the root front to back, pruning subtrees
//!    that were not stamped or fall outside the [`Frustum`], and reports the
//!    faces and entities of every leaf it reaches to a [`WorldVisitor`].

use std::collections::{HashMap, HashSet};

use quake_shared::{
    bsp::{BspModel, Child, Plane, SurfaceFlags, CONTENTS_SOLID},
    math::{angle_vectors, rotate_point_around_vector, Vec3},
};
use tracing::trace;

/// PVS marking state carried across frames.
#[derive(Debug, Default)]
pub struct VisState {
    view_leaf: Option<usize>,
    visframe: u32,
}

impl VisState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visframe(&self) -> u32 {
        self.visframe
    }

    /// Forgets the cached view leaf; the next mark re-stamps everything.
    pub fn reset(&mut self) {
        self.view_leaf = None;
    }

    /// Stamps the leaves visible from `view_leaf` and their parent nodes.
    ///
    /// Does nothing when the view leaf has not changed, unless `novis` is
    /// set, in which case every leaf is stamped every call.
    pub fn mark_leaves(&mut self, model: &mut BspModel, view_leaf: usize, novis: bool) -> u32 {
        if self.view_leaf == Some(view_leaf) && !novis {
            return self.visframe;
        }
        self.view_leaf = Some(view_leaf);
        self.visframe = self.visframe.wrapping_add(1).max(1);
        let visframe = self.visframe;

        let count = model.vis_leaf_count();
        let pvs = if novis || model.visibility.is_empty() {
            vec![0xff; (count + 7) >> 3]
        } else {
            model.leaf_pvs(view_leaf)
        };

        let mut marked = 0usize;
        for i in 0..count {
            if pvs[i >> 3] & (1 << (i & 7)) == 0 {
                continue;
            }
            let Some(leaf) = model.leaves.get_mut(i + 1) else {
                break;
            };
            if leaf.visframe == visframe {
                continue;
            }
            leaf.visframe = visframe;
            marked += 1;
            let mut parent = leaf.parent;
            while let Some(n) = parent {
                let node = &mut model.nodes[n];
                if node.visframe == visframe {
                    break;
                }
                node.visframe = visframe;
                parent = node.parent;
            }
        }
        trace!(view_leaf, visframe, marked, "marked visible leaves");
        visframe
    }
}

/// Which side(s) of `plane` a box touches: bit 0 front, bit 1 back.
pub fn box_on_plane_side(mins: Vec3, maxs: Vec3, plane: &Plane) -> u8 {
    let mut near = Vec3::ZERO;
    let mut far = Vec3::ZERO;
    for i in 0..3 {
        if plane.normal[i] >= 0.0 {
            far[i] = maxs[i];
            near[i] = mins[i];
        } else {
            far[i] = mins[i];
            near[i] = maxs[i];
        }
    }
    let mut sides = 0;
    if plane.normal.dot(far) >= plane.dist {
        sides |= 1;
    }
    if plane.normal.dot(near) < plane.dist {
        sides |= 2;
    }
    sides
}

/// Four side planes of the view volume. Normals point inward.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Plane; 4],
}

impl Frustum {
    pub fn from_view(origin: Vec3, angles: Vec3, fov_x: f32, fov_y: f32) -> Self {
        let basis = angle_vectors(angles);
        let half_x = 90.0 - fov_x / 2.0;
        let half_y = 90.0 - fov_y / 2.0;
        let normals = [
            rotate_point_around_vector(basis.up, basis.forward, -half_x),
            rotate_point_around_vector(basis.up, basis.forward, half_x),
            rotate_point_around_vector(basis.right, basis.forward, half_y),
            rotate_point_around_vector(basis.right, basis.forward, -half_y),
        ];
        // plane_type 3: always the full dot product.
        let planes = normals.map(|n| Plane {
            normal: n,
            dist: n.dot(origin),
            plane_type: 3,
        });
        Self { planes }
    }

    /// True when the box lies completely behind any plane.
    pub fn cull_box(&self, mins: Vec3, maxs: Vec3) -> bool {
        self.planes
            .iter()
            .any(|p| box_on_plane_side(mins, maxs, p) == 2)
    }
}

/// Receives what the walker finds, in front-to-back order.
pub trait WorldVisitor {
    /// A face in a visited leaf that points toward the viewer. Each face is
    /// reported at most once per frame.
    fn on_face(&mut self, model: &BspModel, face: usize);

    /// Entity slots linked into a visited leaf.
    fn on_efrags(&mut self, _leaf: usize, _entities: &[usize]) {}
}

/// Counters for one walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub nodes: usize,
    pub leaves: usize,
    pub faces: usize,
    pub culled: usize,
}

/// Traverses the world front to back from the root node.
///
/// `visframe` is the stamp left by [`VisState::mark_leaves`]; `frame` is the
/// render frame, stamped onto every visited leaf and emitted face.
pub fn walk_world<V: WorldVisitor>(
    model: &mut BspModel,
    origin: Vec3,
    frustum: &Frustum,
    visframe: u32,
    frame: u32,
    efrags: &EfragTable,
    visitor: &mut V,
) -> WalkStats {
    let mut stats = WalkStats::default();
    let mut stack = vec![model.root()];

    while let Some(child) = stack.pop() {
        match child {
            Child::Node(n) => {
                let node = &model.nodes[n];
                if node.visframe != visframe {
                    continue;
                }
                if frustum.cull_box(node.mins, node.maxs) {
                    stats.culled += 1;
                    continue;
                }
                stats.nodes += 1;
                let side = model.planes[node.plane].side(origin);
                let (near, far) = (node.children[side], node.children[side ^ 1]);
                // Popped in reverse: the near side is finished first.
                stack.push(far);
                stack.push(near);
            }
            Child::Leaf(l) => {
                let leaf = &model.leaves[l];
                if leaf.contents == CONTENTS_SOLID || leaf.visframe != visframe {
                    continue;
                }
                if frustum.cull_box(leaf.mins, leaf.maxs) {
                    stats.culled += 1;
                    continue;
                }
                stats.leaves += 1;
                model.leaves[l].drawframe = frame;
                visitor.on_efrags(l, efrags.in_leaf(l));

                for k in 0..model.leaves[l].faces.len() {
                    let f = model.leaves[l].faces[k];
                    let face = &mut model.faces[f];
                    if face.cache.visframe == frame {
                        continue;
                    }
                    face.cache.visframe = frame;
                    let back = face.flags.contains(SurfaceFlags::PLANEBACK);
                    let d = model.planes[face.plane].distance(origin);
                    if (d < 0.0) != back {
                        continue;
                    }
                    stats.faces += 1;
                    visitor.on_face(model, f);
                }
            }
        }
    }
    stats
}

/// Per-frame face lists grouped by texture, built by the walker.
///
/// Sky and liquid faces are drawn with their own passes and collected
/// separately.
#[derive(Debug, Default)]
pub struct TextureChains {
    /// Indexed by texture; each list is in front-to-back order.
    pub chains: Vec<Vec<usize>>,
    pub sky: Vec<usize>,
    pub water: Vec<usize>,
    /// Entity slots seen in visited leaves, first sighting order.
    pub entities: Vec<usize>,
    seen_entities: HashSet<usize>,
}

impl TextureChains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empties every chain, keeping allocations.
    pub fn clear(&mut self, texture_count: usize) {
        self.chains.resize_with(texture_count, Vec::new);
        for c in &mut self.chains {
            c.clear();
        }
        self.sky.clear();
        self.water.clear();
        self.entities.clear();
        self.seen_entities.clear();
    }

    pub fn face_count(&self) -> usize {
        self.chains.iter().map(Vec::len).sum::<usize>() + self.sky.len() + self.water.len()
    }

    /// Non-empty texture chains.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> {
        self.chains
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty())
            .map(|(t, c)| (t, c.as_slice()))
    }
}

impl WorldVisitor for TextureChains {
    fn on_face(&mut self, model: &BspModel, face: usize) {
        let flags = model.faces[face].flags;
        if flags.contains(SurfaceFlags::DRAWSKY) {
            self.sky.push(face);
        } else if flags.contains(SurfaceFlags::DRAWTURB) {
            self.water.push(face);
        } else {
            let texture = model.texinfo_of(face).texture;
            if texture >= self.chains.len() {
                self.chains.resize_with(texture + 1, Vec::new);
            }
            self.chains[texture].push(face);
        }
    }

    fn on_efrags(&mut self, _leaf: usize, entities: &[usize]) {
        for &e in entities {
            if self.seen_entities.insert(e) {
                self.entities.push(e);
            }
        }
    }
}

/// Links entities into the world leaves their bounding boxes touch.
#[derive(Debug, Default)]
pub struct EfragTable {
    by_leaf: HashMap<usize, Vec<usize>>,
    by_entity: HashMap<usize, Vec<usize>>,
}

impl EfragTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)links `entity` with an absolute bounding box.
    pub fn link(&mut self, model: &BspModel, entity: usize, mins: Vec3, maxs: Vec3) {
        self.unlink(entity);
        let mut leaves = Vec::new();
        let mut stack = vec![model.root()];
        while let Some(child) = stack.pop() {
            match child {
                Child::Leaf(l) => {
                    if model.leaves[l].contents != CONTENTS_SOLID {
                        leaves.push(l);
                    }
                }
                Child::Node(n) => {
                    let node = &model.nodes[n];
                    let sides = box_on_plane_side(mins, maxs, &model.planes[node.plane]);
                    if sides & 2 != 0 {
                        stack.push(node.children[1]);
                    }
                    if sides & 1 != 0 {
                        stack.push(node.children[0]);
                    }
                }
            }
        }
        for &l in &leaves {
            self.by_leaf.entry(l).or_default().push(entity);
        }
        self.by_entity.insert(entity, leaves);
    }

    pub fn unlink(&mut self, entity: usize) {
        let Some(leaves) = self.by_entity.remove(&entity) else {
            return;
        };
        for l in leaves {
            if let Some(list) = self.by_leaf.get_mut(&l) {
                list.retain(|&e| e != entity);
                if list.is_empty() {
                    self.by_leaf.remove(&l);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_leaf.clear();
        self.by_entity.clear();
    }

    pub fn in_leaf(&self, leaf: usize) -> &[usize] {
        self.by_leaf.get(&leaf).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn leaves_of(&self, entity: usize) -> &[usize] {
        self.by_entity
            .get(&entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use quake_shared::bsp::{
        Face, Leaf, Node, SurfaceCache, TexInfo, Texture, CONTENTS_EMPTY,
    };

    fn leaf(x0: f32, x1: f32, half: f32, parent: usize, faces: Vec<usize>) -> Leaf {
        Leaf {
            contents: CONTENTS_EMPTY,
            vis_offset: None,
            mins: Vec3::new(x0, -half, -half),
            maxs: Vec3::new(x1, half, half),
            faces,
            ambient_level: [0; 4],
            parent: Some(parent),
            visframe: 0,
            drawframe: 0,
        }
    }

    fn node(plane: usize, children: [Child; 2], x0: f32, x1: f32, half: f32, parent: Option<usize>) -> Node {
        Node {
            plane,
            children,
            mins: Vec3::new(x0, -half, -half),
            maxs: Vec3::new(x1, half, half),
            first_face: 0,
            num_faces: 0,
            parent,
            visframe: 0,
        }
    }

    pub(crate) fn face(plane: usize, flags: SurfaceFlags) -> Face {
        Face {
            plane,
            flags,
            first_edge: 0,
            num_edges: 0,
            texinfo: 0,
            styles: [0, 255, 255, 255],
            light_offset: None,
            texture_mins: [0, 0],
            extents: [0, 0],
            cache: SurfaceCache::default(),
        }
    }

    /// Three nodes splitting x at 0, 64 and -64 into four slabs.
    ///
    /// Leaf 1 is x in [64, 128], leaf 2 [0, 64], leaf 3 [-64, 0] and leaf 4
    /// [-128, -64]. Face `i - 1` sits in leaf `i`; all faces lie on the x = 0
    /// plane facing +x. Boxes extend `half` units in y and z.
    pub(crate) fn slab_world(half: f32) -> BspModel {
        let planes = vec![
            Plane::new(Vec3::new(1.0, 0.0, 0.0), 0.0),
            Plane::new(Vec3::new(1.0, 0.0, 0.0), 64.0),
            Plane::new(Vec3::new(1.0, 0.0, 0.0), -64.0),
        ];
        let nodes = vec![
            node(0, [Child::Node(1), Child::Node(2)], -128.0, 128.0, half, None),
            node(1, [Child::Leaf(1), Child::Leaf(2)], 0.0, 128.0, half, Some(0)),
            node(2, [Child::Leaf(3), Child::Leaf(4)], -128.0, 0.0, half, Some(0)),
        ];
        let mut solid = leaf(0.0, 0.0, 0.0, 0, vec![]);
        solid.contents = CONTENTS_SOLID;
        solid.parent = None;
        let leaves = vec![
            solid,
            leaf(64.0, 128.0, half, 1, vec![0]),
            leaf(0.0, 64.0, half, 1, vec![1]),
            leaf(-64.0, 0.0, half, 2, vec![2]),
            leaf(-128.0, -64.0, half, 2, vec![3]),
        ];
        BspModel {
            name: "maps/slabs.bsp".into(),
            planes,
            nodes,
            leaves,
            faces: (0..4).map(|_| face(0, SurfaceFlags::empty())).collect(),
            texinfo: vec![TexInfo {
                vecs: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]],
                texture: 0,
                flags: 0,
            }],
            textures: vec![Texture {
                name: "wall".into(),
                width: 64,
                height: 64,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Order {
        faces: Vec<usize>,
        leaves: Vec<usize>,
    }

    impl WorldVisitor for Order {
        fn on_face(&mut self, _model: &BspModel, face: usize) {
            self.faces.push(face);
        }
        fn on_efrags(&mut self, leaf: usize, _entities: &[usize]) {
            self.leaves.push(leaf);
        }
    }

    fn walk(model: &mut BspModel, origin: Vec3, angles: Vec3, frame: u32) -> Order {
        let mut vis = VisState::new();
        let view_leaf = model.point_in_leaf(origin);
        let visframe = vis.mark_leaves(model, view_leaf, true);
        let frustum = Frustum::from_view(origin, angles, 90.0, 90.0);
        let mut order = Order::default();
        walk_world(model, origin, &frustum, visframe, frame, &EfragTable::new(), &mut order);
        order
    }

    #[test]
    fn walks_front_to_back() {
        let mut model = slab_world(1024.0);
        let order = walk(&mut model, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO, 1);
        assert_eq!(order.leaves, vec![2, 1, 3, 4]);
        assert_eq!(order.faces, vec![1, 0, 2, 3]);
        assert_eq!(model.leaves[3].drawframe, 1);

        let order = walk(&mut model, Vec3::new(-100.0, 0.0, 0.0), Vec3::ZERO, 2);
        assert_eq!(order.leaves, vec![4, 3, 2, 1]);
    }

    #[test]
    fn eye_on_a_plane_starts_in_its_own_leaf() {
        let mut model = slab_world(1024.0);
        let eye = Vec3::ZERO;
        let order = walk(&mut model, eye, Vec3::ZERO, 1);
        assert_eq!(model.point_in_leaf(eye), 2);
        assert_eq!(order.leaves.first(), Some(&2));
        assert_eq!(order.leaves, vec![2, 1, 3, 4]);
    }

    #[test]
    fn leaf_behind_the_frustum_is_never_emitted() {
        let mut model = slab_world(16.0);
        let order = walk(&mut model, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO, 1);
        assert!(!order.leaves.contains(&4));
        assert!(!order.faces.contains(&3));
        assert!(order.faces.contains(&0));
        assert_ne!(model.leaves[4].drawframe, 1);
    }

    #[test]
    fn back_faces_and_duplicates_are_skipped() {
        let mut model = slab_world(1024.0);
        model.faces[0].flags = SurfaceFlags::PLANEBACK;
        model.leaves[2].faces.push(2);
        let order = walk(&mut model, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO, 7);
        // Face 2 reported once, via leaf 2.
        assert_eq!(order.faces, vec![1, 2, 3]);
        assert_eq!(model.faces[0].cache.visframe, 7);
    }

    #[test]
    fn unmarked_subtrees_are_pruned() {
        let mut model = slab_world(1024.0);
        let mut vis = VisState::new();
        let visframe = vis.mark_leaves(&mut model, 2, false);
        assert_eq!(model.nodes[0].visframe, visframe);
        // Hide the back half of the world from this frame.
        model.nodes[2].visframe = 0;
        let frustum = Frustum::from_view(Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO, 90.0, 90.0);
        let mut order = Order::default();
        let stats = walk_world(
            &mut model,
            Vec3::new(10.0, 0.0, 0.0),
            &frustum,
            visframe,
            1,
            &EfragTable::new(),
            &mut order,
        );
        assert_eq!(order.leaves, vec![2, 1]);
        assert_eq!(stats.nodes, 2);

        // Same view leaf: marking is skipped.
        assert_eq!(vis.mark_leaves(&mut model, 2, false), visframe);
    }

    #[test]
    fn frustum_culls_boxes_behind_viewer() {
        let f = Frustum::from_view(Vec3::ZERO, Vec3::ZERO, 90.0, 90.0);
        assert!(!f.cull_box(Vec3::new(50.0, -8.0, -8.0), Vec3::new(60.0, 8.0, 8.0)));
        assert!(f.cull_box(Vec3::new(-60.0, -8.0, -8.0), Vec3::new(-50.0, 8.0, 8.0)));
        // Straight left, outside a 90 degree field of view.
        assert!(f.cull_box(Vec3::new(-8.0, 50.0, -8.0), Vec3::new(8.0, 60.0, 8.0)));
    }

    #[test]
    fn chains_group_by_texture_and_collect_entities() {
        let mut model = slab_world(1024.0);
        model.faces[3].flags = SurfaceFlags::DRAWTURB;
        let origin = Vec3::new(10.0, 0.0, 0.0);
        let mut efrags = EfragTable::new();
        efrags.link(&model, 5, Vec3::new(-8.0, -8.0, -8.0), Vec3::new(8.0, 8.0, 8.0));
        assert_eq!(efrags.leaves_of(5), &[2, 3]);

        let mut vis = VisState::new();
        let visframe = vis.mark_leaves(&mut model, 2, true);
        let frustum = Frustum::from_view(origin, Vec3::ZERO, 90.0, 90.0);
        let mut chains = TextureChains::new();
        chains.clear(model.textures.len());
        walk_world(&mut model, origin, &frustum, visframe, 1, &efrags, &mut chains);

        assert_eq!(chains.iter().collect::<Vec<_>>(), vec![(0, &[1, 0, 2][..])]);
        assert_eq!(chains.water, vec![3]);
        assert_eq!(chains.entities, vec![5]);
        assert_eq!(chains.face_count(), 4);

        efrags.unlink(5);
        assert!(efrags.in_leaf(2).is_empty());
    }
}
