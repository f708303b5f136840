//! World renderer.
//!
//! Ties the visibility walker, the surface caches and the lightmap atlas
//! to a [`RenderBackend`]. Per frame:
//! - mark the PVS of the view leaf and build the view frustum
//! - flag faces touched by dynamic lights
//! - walk the world front to back into texture chains
//! - rebuild and upload the lightmaps whose inputs changed
//! - draw the chains, then the entities found in visited leaves

use std::collections::HashMap;

use quake_shared::{
    bsp::BspModel,
    config::RenderConfig,
    error::CapacityError,
    math::Vec3,
    render::{ModelInstance, RefDef, RenderBackend},
};
use tracing::{debug, info, trace};

use crate::{
    lightmap::LightmapAtlas,
    lights::{DynamicLights, LightStyles},
    surface::build_all_display_lists,
    visibility::{walk_world, EfragTable, Frustum, TextureChains, VisState, WalkStats},
};

/// What one frame did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub walk: WalkStats,
    pub dlit_faces: usize,
    pub lightmaps_rebuilt: usize,
    pub lightmap_uploads: usize,
    pub polygons: usize,
    pub entities: usize,
}

/// Per-map renderer state.
pub struct WorldRenderer {
    atlas: LightmapAtlas,
    vis: VisState,
    chains: TextureChains,
    efrags: EfragTable,
    instances: HashMap<usize, ModelInstance>,
    frame: u32,
}

impl WorldRenderer {
    pub fn new(cfg: &RenderConfig) -> Self {
        Self {
            atlas: LightmapAtlas::new(cfg.lightmap_pages.max(1.0) as usize),
            vis: VisState::new(),
            chains: TextureChains::new(),
            efrags: EfragTable::new(),
            instances: HashMap::new(),
            frame: 0,
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn atlas(&self) -> &LightmapAtlas {
        &self.atlas
    }

    pub fn chains(&self) -> &TextureChains {
        &self.chains
    }

    /// Prepares a freshly loaded world: lightmaps, display lists and
    /// texture uploads.
    pub fn load_world(
        &mut self,
        model: &mut BspModel,
        styles: &LightStyles,
        backend: &mut dyn RenderBackend,
        cfg: &RenderConfig,
    ) -> Result<(), CapacityError> {
        self.atlas = LightmapAtlas::new(cfg.lightmap_pages.max(1.0) as usize);
        self.vis.reset();
        self.efrags.clear();
        self.instances.clear();

        self.atlas.build_all(model, styles, cfg.full_bright)?;
        build_all_display_lists(model, cfg.keep_tjunctions);
        for tex in &mut model.textures {
            let pixels = tex.pixels.as_deref().unwrap_or(&[]);
            tex.handle = Some(backend.upload_texture(&tex.name, tex.width, tex.height, pixels));
        }
        let uploads = self.atlas.upload_dirty(backend);
        info!(
            map = %model.name,
            lightmap_pages = self.atlas.page_count(),
            uploads,
            "world prepared"
        );
        Ok(())
    }

    /// Places this frame's entities. `radius` bounds each model around its
    /// origin.
    pub fn link_entities<I>(&mut self, model: &BspModel, entities: I)
    where
        I: IntoIterator<Item = (usize, ModelInstance, f32)>,
    {
        self.efrags.clear();
        self.instances.clear();
        for (slot, instance, radius) in entities {
            let r = Vec3::splat(radius);
            self.efrags.link(model, slot, instance.origin - r, instance.origin + r);
            self.instances.insert(slot, instance);
        }
    }

    /// Draws the world and linked entities from `view`.
    ///
    /// The caller brackets this with `begin_frame`/`end_frame` so overlays
    /// can be drawn on top.
    #[allow(clippy::too_many_arguments)]
    pub fn render_frame(
        &mut self,
        model: &mut BspModel,
        view: &RefDef,
        time: f64,
        styles: &LightStyles,
        dlights: &DynamicLights,
        backend: &mut dyn RenderBackend,
        cfg: &RenderConfig,
    ) -> FrameStats {
        self.frame = self.frame.wrapping_add(1).max(1);
        let frame = self.frame;
        let mut stats = FrameStats::default();

        let view_leaf = model.point_in_leaf(view.origin);
        let visframe = self.vis.mark_leaves(model, view_leaf, cfg.novis);
        let frustum = Frustum::from_view(view.origin, view.angles, view.fov_x, view.fov_y);
        if cfg.dynamic_lights {
            stats.dlit_faces = dlights.mark_lights(model, time, frame);
        }

        self.chains.clear(model.textures.len());
        stats.walk = walk_world(
            model,
            view.origin,
            &frustum,
            visframe,
            frame,
            &self.efrags,
            &mut self.chains,
        );

        backend.set_view(view);

        for (_, faces) in self.chains.iter() {
            for &face in faces {
                if self
                    .atlas
                    .refresh_face(model, face, styles, dlights, frame, cfg.full_bright)
                {
                    stats.lightmaps_rebuilt += 1;
                }
            }
        }
        stats.lightmap_uploads = self.atlas.upload_dirty(backend);

        for (texture, faces) in self.chains.iter() {
            let frame_tex = model.animated_texture(texture, false, time);
            stats.polygons += draw_chain(model, frame_tex, faces, true, backend);
        }
        for liquid in [&self.chains.sky, &self.chains.water] {
            for &face in liquid.iter() {
                let texture = model.texinfo_of(face).texture;
                let frame_tex = model.animated_texture(texture, false, time);
                stats.polygons += draw_chain(model, frame_tex, &[face], false, backend);
            }
        }

        if cfg.draw_entities {
            for slot in &self.chains.entities {
                if let Some(instance) = self.instances.get(slot) {
                    backend.draw_model(instance);
                    stats.entities += 1;
                }
            }
        }

        trace!(
            frame,
            leaves = stats.walk.leaves,
            faces = stats.walk.faces,
            rebuilt = stats.lightmaps_rebuilt,
            "world frame"
        );
        stats
    }
}

/// Binds `texture` once and draws the display list of each face.
fn draw_chain(
    model: &BspModel,
    texture: usize,
    faces: &[usize],
    lightmapped: bool,
    backend: &mut dyn RenderBackend,
) -> usize {
    let mut drawn = 0;
    let mut bound = false;
    for &face in faces {
        let cache = &model.faces[face].cache;
        let Some(verts) = cache.display_list.as_deref().filter(|v| v.len() >= 3) else {
            continue;
        };
        if !bound {
            match model.textures[texture].handle {
                Some(handle) => backend.bind_texture(handle),
                None => debug!(texture = %model.textures[texture].name, "texture not uploaded"),
            }
            bound = true;
        }
        let page = if lightmapped {
            cache.lightmap.map(|slot| slot.page)
        } else {
            None
        };
        backend.draw_polygon(verts, page);
        drawn += 1;
    }
    drawn
}
