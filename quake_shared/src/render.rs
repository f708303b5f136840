//! Rendering abstraction.
//!
//! This crate intentionally does not depend on a graphics backend.
//! The world renderer talks to a [`RenderBackend`] in terms of textures,
//! lightmap pages and triangle fans; a real backend uploads and draws them.

use crate::math::Vec3;

/// One display-list vertex: position, texture ST, lightmap ST.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PolyVertex {
    pub pos: Vec3,
    pub st: [f32; 2],
    pub lm: [f32; 2],
}

/// View definition handed to the backend each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefDef {
    pub origin: Vec3,
    pub angles: Vec3,
    pub fov_x: f32,
    pub fov_y: f32,
}

impl Default for RefDef {
    fn default() -> Self {
        Self {
            origin: Vec3::ZERO,
            angles: Vec3::ZERO,
            fov_x: 90.0,
            fov_y: 73.74,
        }
    }
}

/// Sub-rectangle of a lightmap page, in luxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightmapRect {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

/// A positioned model instance (alias model, sprite or brush entity).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInstance {
    pub model: usize,
    pub origin: Vec3,
    pub angles: Vec3,
    pub frame: u8,
    pub skin: u8,
}

/// Swappable graphics backend.
pub trait RenderBackend: Send + Sync {
    fn begin_frame(&mut self);
    fn set_view(&mut self, view: &RefDef);
    /// Uploads an 8-bit paletted texture, returning its handle.
    fn upload_texture(&mut self, name: &str, width: u32, height: u32, pixels: &[u8]) -> u32;
    fn bind_texture(&mut self, handle: u32);
    /// Replaces `rect` of lightmap page `page` with row-major luminance texels.
    fn upload_lightmap_region(&mut self, page: usize, rect: LightmapRect, texels: &[u8]);
    /// Draws a triangle fan, modulated by lightmap `page` when given.
    fn draw_polygon(&mut self, verts: &[PolyVertex], lightmap_page: Option<usize>);
    fn draw_model(&mut self, instance: &ModelInstance);
    fn draw_text(&mut self, x: i32, y: i32, text: &str);
    fn end_frame(&mut self);
}

/// A no-op renderer useful for headless runs.
#[derive(Default)]
pub struct NullRenderer {
    next_handle: u32,
}

impl RenderBackend for NullRenderer {
    fn begin_frame(&mut self) {}
    fn set_view(&mut self, _view: &RefDef) {}
    fn upload_texture(&mut self, _name: &str, _width: u32, _height: u32, _pixels: &[u8]) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }
    fn bind_texture(&mut self, _handle: u32) {}
    fn upload_lightmap_region(&mut self, _page: usize, _rect: LightmapRect, _texels: &[u8]) {}
    fn draw_polygon(&mut self, _verts: &[PolyVertex], _lightmap_page: Option<usize>) {}
    fn draw_model(&mut self, _instance: &ModelInstance) {}
    fn draw_text(&mut self, _x: i32, _y: i32, _text: &str) {}
    fn end_frame(&mut self) {}
}

/// Backend call, as captured by [`RecordingRenderer`].
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCall {
    BeginFrame,
    SetView(RefDef),
    UploadTexture { name: String, handle: u32 },
    BindTexture(u32),
    UploadLightmap { page: usize, rect: LightmapRect },
    Polygon { verts: usize, lightmap_page: Option<usize> },
    Model(ModelInstance),
    Text { x: i32, y: i32, text: String },
    EndFrame,
}

/// Records every call; used by tests to check what a frame submitted.
#[derive(Default)]
pub struct RecordingRenderer {
    pub calls: Vec<DrawCall>,
    next_handle: u32,
}

impl RecordingRenderer {
    pub fn polygons(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, DrawCall::Polygon { .. }))
            .count()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                DrawCall::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl RenderBackend for RecordingRenderer {
    fn begin_frame(&mut self) {
        self.calls.push(DrawCall::BeginFrame);
    }
    fn set_view(&mut self, view: &RefDef) {
        self.calls.push(DrawCall::SetView(*view));
    }
    fn upload_texture(&mut self, name: &str, _width: u32, _height: u32, _pixels: &[u8]) -> u32 {
        self.next_handle += 1;
        self.calls.push(DrawCall::UploadTexture {
            name: name.to_string(),
            handle: self.next_handle,
        });
        self.next_handle
    }
    fn bind_texture(&mut self, handle: u32) {
        self.calls.push(DrawCall::BindTexture(handle));
    }
    fn upload_lightmap_region(&mut self, page: usize, rect: LightmapRect, _texels: &[u8]) {
        self.calls.push(DrawCall::UploadLightmap { page, rect });
    }
    fn draw_polygon(&mut self, verts: &[PolyVertex], lightmap_page: Option<usize>) {
        self.calls.push(DrawCall::Polygon {
            verts: verts.len(),
            lightmap_page,
        });
    }
    fn draw_model(&mut self, instance: &ModelInstance) {
        self.calls.push(DrawCall::Model(*instance));
    }
    fn draw_text(&mut self, x: i32, y: i32, text: &str) {
        self.calls.push(DrawCall::Text {
            x,
            y,
            text: text.to_string(),
        });
    }
    fn end_frame(&mut self) {
        self.calls.push(DrawCall::EndFrame);
    }
}
