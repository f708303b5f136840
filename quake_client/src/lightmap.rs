//! Lightmap atlas and per-face lightmap construction.
//!
//! Every lit face owns a rectangle in one of the atlas pages. Pages are
//! filled with a skyline allocator: each page tracks the filled height of
//! every column and a block goes at the lowest position where it fits.
//!
//! Lightmaps are rebuilt only when something that feeds them changed: an
//! animated light style, or a dynamic light arriving or leaving. Rebuilt
//! texels are copied into the page and the page's dirty rectangle grows to
//! cover them; [`LightmapAtlas::upload_dirty`] sends the dirty regions to
//! the backend before any face is drawn.

use quake_shared::{
    bsp::{BspModel, LightmapSlot, MAX_LIGHTMAPS_PER_FACE},
    error::CapacityError,
    render::{LightmapRect, RenderBackend},
};
use tracing::{debug, trace};

use crate::lights::{DynamicLights, LightStyles};

pub const BLOCK_WIDTH: usize = 128;
pub const BLOCK_HEIGHT: usize = 128;

/// Where an allocated block landed.
pub type BlockPlacement = LightmapSlot;

#[derive(Debug, Clone)]
struct LightmapPage {
    /// Filled height of each column.
    allocated: [usize; BLOCK_WIDTH],
    texels: Vec<u8>,
    dirty: Option<LightmapRect>,
}

impl LightmapPage {
    fn new() -> Self {
        Self {
            allocated: [0; BLOCK_WIDTH],
            texels: vec![0; BLOCK_WIDTH * BLOCK_HEIGHT],
            dirty: None,
        }
    }

    /// Skyline fit: lowest `y` over all `x` in `0..=BLOCK_WIDTH - w`.
    fn fit(&self, w: usize, h: usize) -> Option<(usize, usize)> {
        let mut best = BLOCK_HEIGHT;
        let mut best_x = None;
        for x in 0..=BLOCK_WIDTH - w {
            let top = self.allocated[x..x + w].iter().copied().max().unwrap_or(0);
            if top < best {
                best = top;
                best_x = Some(x);
            }
        }
        let x = best_x?;
        (best + h <= BLOCK_HEIGHT).then_some((x, best))
    }

    fn mark_dirty(&mut self, rect: LightmapRect) {
        self.dirty = Some(match self.dirty {
            None => rect,
            Some(d) => {
                let x0 = d.x.min(rect.x);
                let y0 = d.y.min(rect.y);
                let x1 = (d.x + d.w).max(rect.x + rect.w);
                let y1 = (d.y + d.h).max(rect.y + rect.h);
                LightmapRect {
                    x: x0,
                    y: y0,
                    w: x1 - x0,
                    h: y1 - y0,
                }
            }
        });
    }
}

/// Pages of luminance lightmaps.
#[derive(Debug, Clone)]
pub struct LightmapAtlas {
    pages: Vec<LightmapPage>,
    max_pages: usize,
}

impl LightmapAtlas {
    pub fn new(max_pages: usize) -> Self {
        Self {
            pages: Vec::new(),
            max_pages: max_pages.max(1),
        }
    }

    /// Drops every page; used on map change.
    pub fn reset(&mut self) {
        self.pages.clear();
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn texels(&self, page: usize) -> Option<&[u8]> {
        self.pages.get(page).map(|p| p.texels.as_slice())
    }

    pub fn dirty_rect(&self, page: usize) -> Option<LightmapRect> {
        self.pages.get(page).and_then(|p| p.dirty)
    }

    /// Reserves a `w` by `h` block. The first page with room wins.
    pub fn alloc_block(&mut self, w: usize, h: usize) -> Result<BlockPlacement, CapacityError> {
        let full = CapacityError::LightmapFull {
            width: w,
            height: h,
        };
        if w == 0 || h == 0 || w > BLOCK_WIDTH || h > BLOCK_HEIGHT {
            return Err(full);
        }
        let mut page = 0;
        loop {
            if page == self.pages.len() {
                if page == self.max_pages {
                    return Err(full);
                }
                self.pages.push(LightmapPage::new());
                trace!(page, "lightmap page opened");
            }
            if let Some((x, y)) = self.pages[page].fit(w, h) {
                for col in &mut self.pages[page].allocated[x..x + w] {
                    *col = y + h;
                }
                return Ok(BlockPlacement { page, s: x, t: y });
            }
            page += 1;
        }
    }

    /// Copies a `w` by `h` block of texels into its page and marks it dirty.
    pub fn write_block(&mut self, slot: BlockPlacement, w: usize, h: usize, texels: &[u8]) {
        let Some(page) = self.pages.get_mut(slot.page) else {
            return;
        };
        for row in 0..h {
            let dst = (slot.t + row) * BLOCK_WIDTH + slot.s;
            page.texels[dst..dst + w].copy_from_slice(&texels[row * w..row * w + w]);
        }
        page.mark_dirty(LightmapRect {
            x: slot.s,
            y: slot.t,
            w,
            h,
        });
    }

    /// Sends every dirty region to the backend and clears it.
    pub fn upload_dirty(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let mut uploaded = 0;
        for (index, page) in self.pages.iter_mut().enumerate() {
            let Some(rect) = page.dirty.take() else {
                continue;
            };
            let mut region = Vec::with_capacity(rect.w * rect.h);
            for row in rect.y..rect.y + rect.h {
                let start = row * BLOCK_WIDTH + rect.x;
                region.extend_from_slice(&page.texels[start..start + rect.w]);
            }
            backend.upload_lightmap_region(index, rect, &region);
            uploaded += 1;
        }
        uploaded
    }

    /// Places and builds lightmaps for every lit face of a freshly loaded
    /// model.
    pub fn build_all(
        &mut self,
        model: &mut BspModel,
        styles: &LightStyles,
        full_bright: bool,
    ) -> Result<(), CapacityError> {
        self.reset();
        let mut placed = 0;
        for face in 0..model.faces.len() {
            if !model.faces[face].is_lit() {
                continue;
            }
            let (w, h) = model.faces[face].lightmap_size();
            let slot = self.alloc_block(w, h)?;
            model.faces[face].cache.lightmap = Some(slot);
            let texels = build_lightmap(model, face, styles, None, full_bright);
            self.write_block(slot, w, h, &texels);
            placed += 1;
        }
        debug!(faces = placed, pages = self.pages.len(), "lightmaps built");
        Ok(())
    }

    /// Rebuilds the lightmap of `face` if any input changed since it was
    /// last built. Returns whether it was rebuilt.
    pub fn refresh_face(
        &mut self,
        model: &mut BspModel,
        face: usize,
        styles: &LightStyles,
        dlights: &DynamicLights,
        frame: u32,
        full_bright: bool,
    ) -> bool {
        let f = &model.faces[face];
        let Some(slot) = f.cache.lightmap else {
            return false;
        };
        let style_changed = f
            .styles
            .iter()
            .take(f.style_count())
            .zip(f.cache.cached_light.iter())
            .any(|(&s, &cached)| styles.value(s) != cached);
        let lit_now = f.cache.dlightframe == frame;
        if !style_changed && !lit_now && !f.cache.cached_dlight {
            return false;
        }
        let (w, h) = f.lightmap_size();
        let texels = build_lightmap(model, face, styles, lit_now.then_some(dlights), full_bright);
        self.write_block(slot, w, h, &texels);
        true
    }
}

/// Computes the luminance lightmap of `face`.
///
/// Sums every style's samples scaled by that style's current value, adds
/// the dynamic lights flagged on the face when `dlights` is given, then
/// shifts down by 8 and clamps to 255. Faces without light samples are
/// full bright. Records the style values used and whether dynamic light
/// contributed in the face cache.
pub fn build_lightmap(
    model: &mut BspModel,
    face: usize,
    styles: &LightStyles,
    dlights: Option<&DynamicLights>,
    full_bright: bool,
) -> Vec<u8> {
    let (smax, tmax) = model.faces[face].lightmap_size();
    let size = smax * tmax;
    let mut blocklights = vec![0u32; size];

    let f = &model.faces[face];
    let samples = f
        .light_offset
        .filter(|_| !full_bright)
        .and_then(|off| model.lighting.get(off..));
    let mut cached = [0i32; MAX_LIGHTMAPS_PER_FACE];
    for (map, &style) in f.styles.iter().take(f.style_count()).enumerate() {
        cached[map] = styles.value(style);
    }

    match samples {
        None => blocklights.fill(255 << 8),
        Some(mut data) => {
            for &scale in cached.iter().take(f.style_count()) {
                let Some(layer) = data.get(..size) else {
                    break;
                };
                for (bl, &sample) in blocklights.iter_mut().zip(layer) {
                    *bl += u32::from(sample) * scale as u32;
                }
                data = &data[size..];
            }
            if let Some(dlights) = dlights {
                dlights.add_to_lightmap(model, face, smax, tmax, &mut blocklights);
            }
        }
    }

    let cache = &mut model.faces[face].cache;
    cache.cached_light = cached;
    cache.cached_dlight = dlights.is_some();

    blocklights
        .into_iter()
        .map(|b| (b >> 8).min(255) as u8)
        .collect()
}
