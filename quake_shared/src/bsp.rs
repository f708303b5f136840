//! BSP map loader and world model.
//!
//! This module parses version 29 BSP files (the brush/world format) into a
//! runtime [`BspModel`]: planes, nodes, leaves, faces, edges, vertices,
//! textures with animation chains, lighting, visibility and submodels for
//! brush entities.
//!
//! Everything is validated at load time. Once a model exists, every node,
//! leaf, face and texture index inside it is in range and the node graph is
//! an acyclic tree, so traversal code can index without checks.
//!
//! # Usage
//! ```ignore
//! let data = vfs.open_read("maps/e1m1.bsp")?;
//! let world = BspModel::load("maps/e1m1.bsp", &data)?;
//! let leaf = world.point_in_leaf(origin);
//! ```

use std::collections::HashMap;
use std::path::Path;

use bitflags::bitflags;
use bytes::Buf;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LoadError;
use crate::math::Vec3;
use crate::render::PolyVertex;

/// BSP version handled by this loader.
pub const BSP_VERSION: i32 = 29;

/// Number of lumps in a BSP header.
pub const HEADER_LUMPS: usize = 15;

pub const MAX_LIGHTMAPS_PER_FACE: usize = 4;

/// Texture animation frames advance every `ANIM_CYCLE` tenths of a second.
pub const ANIM_CYCLE: i32 = 2;

pub const CONTENTS_EMPTY: i32 = -1;
pub const CONTENTS_SOLID: i32 = -2;
pub const CONTENTS_WATER: i32 = -3;
pub const CONTENTS_SLIME: i32 = -4;
pub const CONTENTS_LAVA: i32 = -5;
pub const CONTENTS_SKY: i32 = -6;

/// Texinfo flag: sky or liquid, no lightmap.
pub const TEX_SPECIAL: i32 = 1;

/// Largest lit surface extent in texels.
pub const MAX_SURFACE_EXTENT: i32 = 512;

/// Lump indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LumpIndex {
    Entities = 0,
    Planes = 1,
    Textures = 2,
    Vertexes = 3,
    Visibility = 4,
    Nodes = 5,
    TexInfo = 6,
    Faces = 7,
    Lighting = 8,
    ClipNodes = 9,
    Leafs = 10,
    MarkSurfaces = 11,
    Edges = 12,
    SurfEdges = 13,
    Models = 14,
}

impl LumpIndex {
    fn label(self) -> &'static str {
        match self {
            LumpIndex::Entities => "entities",
            LumpIndex::Planes => "planes",
            LumpIndex::Textures => "textures",
            LumpIndex::Vertexes => "vertexes",
            LumpIndex::Visibility => "visibility",
            LumpIndex::Nodes => "nodes",
            LumpIndex::TexInfo => "texinfo",
            LumpIndex::Faces => "faces",
            LumpIndex::Lighting => "lighting",
            LumpIndex::ClipNodes => "clipnodes",
            LumpIndex::Leafs => "leafs",
            LumpIndex::MarkSurfaces => "marksurfaces",
            LumpIndex::Edges => "edges",
            LumpIndex::SurfEdges => "surfedges",
            LumpIndex::Models => "models",
        }
    }
}

/// Lump descriptor from the BSP header.
#[derive(Debug, Clone, Copy, Default)]
pub struct LumpEntry {
    pub offset: i32,
    pub length: i32,
}

bitflags! {
    /// Per-face surface flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SurfaceFlags: u32 {
        /// Face points away from its plane's normal.
        const PLANEBACK = 1 << 1;
        const DRAWSKY = 1 << 2;
        const DRAWTURB = 1 << 4;
        const DRAWTILED = 1 << 5;
        const UNDERWATER = 1 << 7;
    }
}

/// A 3D plane.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vec3,
    pub dist: f32,
    /// 0..=2 for axial planes (x, y, z), 3..=5 otherwise.
    pub plane_type: i32,
}

impl Plane {
    pub fn new(normal: Vec3, dist: f32) -> Self {
        let plane_type = if normal.x == 1.0 {
            0
        } else if normal.y == 1.0 {
            1
        } else if normal.z == 1.0 {
            2
        } else {
            3
        };
        Self {
            normal,
            dist,
            plane_type,
        }
    }

    /// Signed distance of `p` from the plane; positive is the front side.
    #[inline]
    pub fn distance(&self, p: Vec3) -> f32 {
        if (0..3).contains(&self.plane_type) {
            p[self.plane_type as usize] - self.dist
        } else {
            self.normal.dot(p) - self.dist
        }
    }

    /// Child index on `p`'s side: 0 for front, 1 for back. Points on the
    /// plane are on the front.
    #[inline]
    pub fn side(&self, p: Vec3) -> usize {
        usize::from(self.distance(p) < 0.0)
    }
}

/// Reference from a node to one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Node(usize),
    Leaf(usize),
}

impl Child {
    /// Decodes the on-disk child number: non-negative is a node, negative is
    /// leaf `-(c + 1)`.
    fn from_raw(c: i16) -> Self {
        if c >= 0 {
            Child::Node(c as usize)
        } else {
            Child::Leaf((-1 - c as i32) as usize)
        }
    }
}

/// Interior BSP element.
#[derive(Debug, Clone)]
pub struct Node {
    pub plane: usize,
    /// Front (`[0]`) and back (`[1]`) children.
    pub children: [Child; 2],
    pub mins: Vec3,
    pub maxs: Vec3,
    /// Faces lying on this node's plane.
    pub first_face: usize,
    pub num_faces: usize,
    pub parent: Option<usize>,
    /// Frame in which the PVS last marked this node.
    pub visframe: u32,
}

/// Terminal BSP element: a convex visibility cluster.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub contents: i32,
    /// Offset into the visibility lump, if the leaf has PVS data.
    pub vis_offset: Option<usize>,
    pub mins: Vec3,
    pub maxs: Vec3,
    /// Faces contained in this leaf (resolved marksurfaces).
    pub faces: Vec<usize>,
    pub ambient_level: [u8; 4],
    pub parent: Option<usize>,
    /// Frame in which the PVS last marked this leaf.
    pub visframe: u32,
    /// Render frame in which the walker last visited this leaf.
    pub drawframe: u32,
}

/// An edge: two vertex indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct Edge {
    pub v: [u16; 2],
}

/// Texture projection for a face.
#[derive(Debug, Clone, Copy)]
pub struct TexInfo {
    /// `s = dot(p, vecs[0].xyz) + vecs[0][3]`, likewise for `t`.
    pub vecs: [[f32; 4]; 2],
    pub texture: usize,
    pub flags: i32,
}

impl TexInfo {
    #[inline]
    pub fn project(&self, p: Vec3, axis: usize) -> f32 {
        let v = &self.vecs[axis];
        p.x * v[0] + p.y * v[1] + p.z * v[2] + v[3]
    }

    #[inline]
    pub fn axis(&self, axis: usize) -> Vec3 {
        let v = &self.vecs[axis];
        Vec3::new(v[0], v[1], v[2])
    }
}

/// Named image shared across faces.
#[derive(Debug, Clone, Default)]
pub struct Texture {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Palette indices of mip level 0, when present in the file.
    pub pixels: Option<Vec<u8>>,
    /// Total animation length in tenths of a second (0 = static).
    pub anim_total: i32,
    pub anim_min: i32,
    pub anim_max: i32,
    pub anim_next: Option<usize>,
    pub alternate: Option<usize>,
    /// Backend handle, assigned when the renderer uploads the map.
    pub handle: Option<u32>,
}

/// Lightmap placement of a face inside the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightmapSlot {
    pub page: usize,
    pub s: usize,
    pub t: usize,
}

/// Renderer-owned cache state carried on each face.
#[derive(Debug, Clone, Default)]
pub struct SurfaceCache {
    /// Frame in which the visibility walker last emitted this face.
    pub visframe: u32,
    /// Frame in which a dynamic light last touched this face.
    pub dlightframe: u32,
    pub dlightbits: u32,
    /// Style values the current lightmap was built with.
    pub cached_light: [i32; MAX_LIGHTMAPS_PER_FACE],
    /// Whether dynamic light contributed to the current lightmap.
    pub cached_dlight: bool,
    pub lightmap: Option<LightmapSlot>,
    /// Triangle-fan display list, rebuilt on map load or texture change.
    pub display_list: Option<Vec<PolyVertex>>,
}

/// Polygon face.
#[derive(Debug, Clone)]
pub struct Face {
    pub plane: usize,
    pub flags: SurfaceFlags,
    pub first_edge: usize,
    pub num_edges: usize,
    pub texinfo: usize,
    pub styles: [u8; MAX_LIGHTMAPS_PER_FACE],
    /// Byte offset into the lighting lump.
    pub light_offset: Option<usize>,
    pub texture_mins: [i32; 2],
    pub extents: [i32; 2],
    pub cache: SurfaceCache,
}

impl Face {
    /// Lightmap dimensions in luxels.
    pub fn lightmap_size(&self) -> (usize, usize) {
        (
            (self.extents[0] >> 4) as usize + 1,
            (self.extents[1] >> 4) as usize + 1,
        )
    }

    /// Number of light styles in use (styles end at 255).
    pub fn style_count(&self) -> usize {
        self.styles.iter().take_while(|&&s| s != 255).count()
    }

    pub fn is_lit(&self) -> bool {
        !self
            .flags
            .intersects(SurfaceFlags::DRAWSKY | SurfaceFlags::DRAWTURB)
    }
}

/// Submodel (world or brush entity).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submodel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub head_nodes: [i32; 4],
    pub vis_leafs: i32,
    pub first_face: usize,
    pub num_faces: usize,
}

/// Parsed entity from the entity lump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BspEntity {
    pub classname: String,
    pub properties: HashMap<String, String>,
}

impl BspEntity {
    /// Gets a property value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    /// Parses the "origin" property as Vec3.
    pub fn origin(&self) -> Option<Vec3> {
        self.get("origin").and_then(parse_vec3)
    }

    /// Parses "angles", falling back to the single-yaw "angle" key.
    pub fn angles(&self) -> Option<Vec3> {
        if let Some(v) = self.get("angles").and_then(parse_vec3) {
            return Some(v);
        }
        let yaw: f32 = self.get("angle")?.trim().parse().ok()?;
        Some(Vec3::new(0.0, yaw, 0.0))
    }
}

fn parse_vec3(s: &str) -> Option<Vec3> {
    let mut it = s.split_whitespace().map(|p| p.parse::<f32>());
    match (it.next(), it.next(), it.next(), it.next()) {
        (Some(Ok(x)), Some(Ok(y)), Some(Ok(z)), None) => Some(Vec3::new(x, y, z)),
        _ => None,
    }
}

/// Loaded world model.
#[derive(Debug, Clone, Default)]
pub struct BspModel {
    pub name: String,

    pub entities: Vec<BspEntity>,
    pub planes: Vec<Plane>,
    pub vertices: Vec<Vec3>,
    pub edges: Vec<Edge>,
    pub surf_edges: Vec<i32>,
    pub textures: Vec<Texture>,
    pub texinfo: Vec<TexInfo>,
    pub faces: Vec<Face>,
    pub nodes: Vec<Node>,
    pub leaves: Vec<Leaf>,
    pub lighting: Vec<u8>,
    pub visibility: Vec<u8>,
    pub submodels: Vec<Submodel>,
}

impl BspModel {
    /// Loads a BSP file from disk.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let data = std::fs::read(path).map_err(|source| LoadError::Io {
            name: name.clone(),
            source,
        })?;
        Self::load(&name, &data)
    }

    /// Parses a BSP image already in memory.
    pub fn load(name: &str, data: &[u8]) -> Result<Self, LoadError> {
        let loader = Loader::new(name, data)?;

        let mut model = BspModel {
            name: name.to_string(),
            ..Default::default()
        };

        model.entities = parse_entity_lump(&String::from_utf8_lossy(
            loader.lump(LumpIndex::Entities)?,
        ));
        model.vertices = loader.read_vertices()?;
        model.edges = loader.read_edges(model.vertices.len())?;
        model.surf_edges = loader.read_surf_edges(model.edges.len())?;
        model.textures = loader.read_textures()?;
        link_texture_animations(name, &mut model.textures)?;
        model.lighting = loader.lump(LumpIndex::Lighting)?.to_vec();
        model.planes = loader.read_planes()?;
        model.texinfo = loader.read_texinfo(&mut model.textures)?;
        model.faces = loader.read_faces(&model)?;
        let marks = loader.read_mark_surfaces(model.faces.len())?;
        model.visibility = loader.lump(LumpIndex::Visibility)?.to_vec();
        model.leaves = loader.read_leaves(&marks, model.visibility.len())?;
        model.nodes = loader.read_nodes(&model)?;
        model.submodels = loader.read_submodels(&model)?;
        model.link_parents()?;

        info!(
            map = %model.name,
            nodes = model.nodes.len(),
            leaves = model.leaves.len(),
            faces = model.faces.len(),
            textures = model.textures.len(),
            submodels = model.submodels.len(),
            "BSP loaded"
        );
        Ok(model)
    }

    /// Traversal root.
    pub fn root(&self) -> Child {
        if self.nodes.is_empty() {
            Child::Leaf(0)
        } else {
            Child::Node(0)
        }
    }

    /// Number of leaves covered by the PVS (the world's vis leafs).
    pub fn vis_leaf_count(&self) -> usize {
        self.submodels
            .first()
            .map(|m| m.vis_leafs.max(0) as usize)
            .unwrap_or(self.leaves.len().saturating_sub(1))
    }

    pub fn plane_of(&self, face: usize) -> &Plane {
        &self.planes[self.faces[face].plane]
    }

    pub fn texinfo_of(&self, face: usize) -> &TexInfo {
        &self.texinfo[self.faces[face].texinfo]
    }

    /// Vertex positions around a face, in edge-loop order.
    pub fn face_vertices(&self, face: usize) -> impl Iterator<Item = Vec3> + '_ {
        let f = &self.faces[face];
        self.surf_edges[f.first_edge..f.first_edge + f.num_edges]
            .iter()
            .map(move |&e| {
                let v = if e >= 0 {
                    self.edges[e as usize].v[0]
                } else {
                    self.edges[(-e) as usize].v[1]
                };
                self.vertices[v as usize]
            })
    }

    /// Finds the leaf containing `p`.
    pub fn point_in_leaf(&self, p: Vec3) -> usize {
        let mut child = self.root();
        loop {
            match child {
                Child::Leaf(l) => return l,
                Child::Node(n) => {
                    let node = &self.nodes[n];
                    child = node.children[self.planes[node.plane].side(p)];
                }
            }
        }
    }

    pub fn point_contents(&self, p: Vec3) -> i32 {
        self.leaves[self.point_in_leaf(p)].contents
    }

    /// Decompresses the potentially visible set of `leaf`.
    ///
    /// Bit `i` of the result stands for leaf `i + 1`. A leaf without vis
    /// data sees everything.
    pub fn leaf_pvs(&self, leaf: usize) -> Vec<u8> {
        let row = (self.vis_leaf_count() + 7) >> 3;
        let offset = match self.leaves.get(leaf).and_then(|l| l.vis_offset) {
            Some(off) if leaf != 0 => off,
            _ => return vec![0xff; row],
        };
        decompress_vis(&self.visibility[offset..], row)
    }

    /// Returns the animation frame of texture `base` at `time`.
    pub fn animated_texture(&self, base: usize, alternate: bool, time: f64) -> usize {
        let mut tex = base;
        if alternate {
            if let Some(alt) = self.textures[tex].alternate {
                tex = alt;
            }
        }
        let total = self.textures[tex].anim_total;
        if total == 0 {
            return tex;
        }
        let relative = ((time * 10.0) as i64).rem_euclid(total as i64) as i32;
        // Chains are validated at load, so each step reaches a frame.
        for _ in 0..=total {
            let t = &self.textures[tex];
            if t.anim_min <= relative && relative < t.anim_max {
                break;
            }
            match t.anim_next {
                Some(next) => tex = next,
                None => break,
            }
        }
        tex
    }

    /// Traces a line through the world hull.
    ///
    /// Returns the first point at which the segment enters solid space, or
    /// `None` if the whole segment is open. A start inside solid returns
    /// `start`.
    pub fn trace_line(&self, start: Vec3, end: Vec3) -> Option<Vec3> {
        self.trace_child(self.root(), start, end)
    }

    fn trace_child(&self, child: Child, p1: Vec3, p2: Vec3) -> Option<Vec3> {
        match child {
            Child::Leaf(l) => (self.leaves[l].contents == CONTENTS_SOLID).then_some(p1),
            Child::Node(n) => {
                let node = &self.nodes[n];
                let plane = &self.planes[node.plane];
                let t1 = plane.distance(p1);
                let t2 = plane.distance(p2);
                if t1 >= 0.0 && t2 >= 0.0 {
                    return self.trace_child(node.children[0], p1, p2);
                }
                if t1 < 0.0 && t2 < 0.0 {
                    return self.trace_child(node.children[1], p1, p2);
                }
                let side = usize::from(t1 < 0.0);
                let frac = t1 / (t1 - t2);
                let mid = p1 + (p2 - p1) * frac;
                self.trace_child(node.children[side], p1, mid)
                    .or_else(|| self.trace_child(node.children[side ^ 1], mid, p2))
            }
        }
    }

    /// Walks down from the root recording each element's parent, rejecting
    /// node graphs that revisit a node.
    fn link_parents(&mut self) -> Result<(), LoadError> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![0usize];
        seen[0] = true;
        while let Some(n) = stack.pop() {
            for child in self.nodes[n].children {
                match child {
                    Child::Node(c) => {
                        if seen[c] {
                            return Err(LoadError::Malformed {
                                name: self.name.clone(),
                                reason: format!("node {c} reachable twice"),
                            });
                        }
                        seen[c] = true;
                        self.nodes[c].parent = Some(n);
                        stack.push(c);
                    }
                    Child::Leaf(l) => self.leaves[l].parent = Some(n),
                }
            }
        }
        Ok(())
    }
}

/// Run-length zero decompression of one PVS row.
pub fn decompress_vis(input: &[u8], row: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(row);
    let mut i = 0;
    while out.len() < row {
        let Some(&b) = input.get(i) else {
            // Truncated rows fill with "visible".
            out.resize(row, 0xff);
            break;
        };
        if b != 0 {
            out.push(b);
            i += 1;
            continue;
        }
        let run = input.get(i + 1).copied().unwrap_or(0) as usize;
        i += 2;
        let fill = run.min(row - out.len());
        out.extend(std::iter::repeat(0).take(fill));
        if run == 0 {
            // A zero-length run would never advance.
            out.resize(row, 0);
        }
    }
    out
}

/// Groups `+0name`.. / `+aname`.. textures into animation chains.
fn link_texture_animations(name: &str, textures: &mut [Texture]) -> Result<(), LoadError> {
    let malformed = |reason: String| LoadError::Malformed {
        name: name.to_string(),
        reason,
    };

    for i in 0..textures.len() {
        let tex_name = textures[i].name.clone();
        if !tex_name.starts_with('+') || textures[i].anim_next.is_some() {
            continue;
        }
        // Names come from lossy UTF-8, so index bytes rather than chars.
        let Some(suffix) = tex_name.as_bytes().get(2..) else {
            continue;
        };

        let mut anims: [Option<usize>; 10] = [None; 10];
        let mut alts: [Option<usize>; 10] = [None; 10];
        let mut max = 0;
        let mut alt_max = 0;

        for (j, t) in textures.iter().enumerate().skip(i) {
            let bytes = t.name.as_bytes();
            if bytes.first() != Some(&b'+') || bytes.get(2..) != Some(suffix) {
                continue;
            }
            let c = bytes[1].to_ascii_uppercase();
            match c {
                b'0'..=b'9' => {
                    let n = (c - b'0') as usize;
                    anims[n] = Some(j);
                    max = max.max(n + 1);
                }
                b'A'..=b'J' => {
                    let n = (c - b'A') as usize;
                    alts[n] = Some(j);
                    alt_max = alt_max.max(n + 1);
                }
                _ => return Err(malformed(format!("bad animating texture {}", t.name))),
            }
        }

        for (frames, count, other) in [(&anims, max, &alts), (&alts, alt_max, &anims)] {
            for j in 0..count {
                let t = frames[j].ok_or_else(|| malformed(format!("missing frame {j} of {tex_name}")))?;
                let next = frames[(j + 1) % count]
                    .ok_or_else(|| malformed(format!("missing frame {} of {tex_name}", (j + 1) % count)))?;
                let tex = &mut textures[t];
                tex.anim_total = count as i32 * ANIM_CYCLE;
                tex.anim_min = j as i32 * ANIM_CYCLE;
                tex.anim_max = (j as i32 + 1) * ANIM_CYCLE;
                tex.anim_next = Some(next);
                tex.alternate = other[0];
            }
        }
        let texture = String::from_utf8_lossy(suffix);
        debug!(%texture, frames = max, alternates = alt_max, "Linked texture animation");
    }
    Ok(())
}

struct Loader<'a> {
    name: &'a str,
    data: &'a [u8],
    lumps: [LumpEntry; HEADER_LUMPS],
}

impl<'a> Loader<'a> {
    fn new(name: &'a str, data: &'a [u8]) -> Result<Self, LoadError> {
        const HEADER_SIZE: usize = 4 + HEADER_LUMPS * 8;
        if data.len() < HEADER_SIZE {
            return Err(LoadError::Truncated {
                name: name.to_string(),
                what: "header",
            });
        }
        let mut buf = data;
        let version = buf.get_i32_le();
        if version != BSP_VERSION {
            return Err(LoadError::BadVersion {
                name: name.to_string(),
                found: version,
                expected: BSP_VERSION,
            });
        }
        let mut lumps = [LumpEntry::default(); HEADER_LUMPS];
        for lump in &mut lumps {
            lump.offset = buf.get_i32_le();
            lump.length = buf.get_i32_le();
        }
        Ok(Self { name, data, lumps })
    }

    fn lump(&self, idx: LumpIndex) -> Result<&'a [u8], LoadError> {
        let lump = self.lumps[idx as usize];
        let (off, len) = (lump.offset as i64, lump.length as i64);
        if off < 0 || len < 0 || off + len > self.data.len() as i64 {
            return Err(LoadError::LumpOutOfBounds {
                name: self.name.to_string(),
                what: idx.label(),
                offset: off,
                length: len,
                file_len: self.data.len(),
            });
        }
        Ok(&self.data[off as usize..(off + len) as usize])
    }

    /// Splits a lump into fixed-size records.
    fn records(&self, idx: LumpIndex, size: usize) -> Result<std::slice::ChunksExact<'a, u8>, LoadError> {
        let data = self.lump(idx)?;
        if data.len() % size != 0 {
            return Err(LoadError::BadLumpSize {
                name: self.name.to_string(),
                what: idx.label(),
                length: data.len(),
            });
        }
        Ok(data.chunks_exact(size))
    }

    fn bad_index(&self, what: &'static str, index: i64, count: usize) -> LoadError {
        LoadError::BadIndex {
            name: self.name.to_string(),
            what,
            index,
            count,
        }
    }

    fn check(&self, what: &'static str, index: i64, count: usize) -> Result<usize, LoadError> {
        if index < 0 || index as usize >= count {
            Err(self.bad_index(what, index, count))
        } else {
            Ok(index as usize)
        }
    }

    fn read_vertices(&self) -> Result<Vec<Vec3>, LoadError> {
        Ok(self
            .records(LumpIndex::Vertexes, 12)?
            .map(|mut d| read_vec3(&mut d))
            .collect())
    }

    fn read_edges(&self, num_vertices: usize) -> Result<Vec<Edge>, LoadError> {
        self.records(LumpIndex::Edges, 4)?
            .map(|mut d| {
                let v = [d.get_u16_le(), d.get_u16_le()];
                for &i in &v {
                    self.check("edge vertex", i as i64, num_vertices)?;
                }
                Ok(Edge { v })
            })
            .collect()
    }

    fn read_surf_edges(&self, num_edges: usize) -> Result<Vec<i32>, LoadError> {
        self.records(LumpIndex::SurfEdges, 4)?
            .map(|mut d| {
                let e = d.get_i32_le();
                self.check("surfedge", (e as i64).abs(), num_edges)?;
                Ok(e)
            })
            .collect()
    }

    fn read_planes(&self) -> Result<Vec<Plane>, LoadError> {
        Ok(self
            .records(LumpIndex::Planes, 20)?
            .map(|mut d| {
                let normal = read_vec3(&mut d);
                let dist = d.get_f32_le();
                let plane_type = d.get_i32_le();
                Plane {
                    normal,
                    dist,
                    plane_type,
                }
            })
            .collect())
    }

    fn read_textures(&self) -> Result<Vec<Texture>, LoadError> {
        let data = self.lump(LumpIndex::Textures)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let truncated = || LoadError::Truncated {
            name: self.name.to_string(),
            what: "miptex",
        };
        let mut header = data;
        if header.remaining() < 4 {
            return Err(truncated());
        }
        let count = header.get_i32_le();
        if count < 0 || header.remaining() < count as usize * 4 {
            return Err(truncated());
        }

        let mut textures = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let ofs = header.get_i32_le();
            if ofs < 0 {
                textures.push(missing_texture());
                continue;
            }
            let ofs = ofs as usize;
            let mut mip = data.get(ofs..).filter(|m| m.len() >= 40).ok_or_else(truncated)?;
            let raw_name = &mip[..16];
            let end = raw_name.iter().position(|&b| b == 0).unwrap_or(16);
            let name = String::from_utf8_lossy(&raw_name[..end]).to_ascii_lowercase();
            mip.advance(16);
            let width = mip.get_u32_le();
            let height = mip.get_u32_le();
            let pix_ofs = mip.get_u32_le() as usize;
            if width % 16 != 0 || height % 16 != 0 || width == 0 || height == 0 {
                return Err(LoadError::Malformed {
                    name: self.name.to_string(),
                    reason: format!("texture {name} is not 16 aligned ({width}x{height})"),
                });
            }
            let size = width
                .checked_mul(height)
                .map(|s| s as usize)
                .filter(|&s| s <= data.len())
                .ok_or_else(|| LoadError::Malformed {
                    name: self.name.to_string(),
                    reason: format!("texture {name} is larger than its lump ({width}x{height})"),
                })?;
            let pixels = (pix_ofs != 0)
                .then(|| {
                    let start = ofs.checked_add(pix_ofs)?;
                    data.get(start..start.checked_add(size)?).map(<[u8]>::to_vec)
                })
                .flatten();
            textures.push(Texture {
                name,
                width,
                height,
                pixels,
                ..Default::default()
            });
        }
        Ok(textures)
    }

    fn read_texinfo(&self, textures: &mut Vec<Texture>) -> Result<Vec<TexInfo>, LoadError> {
        let mut missing: Option<usize> = None;
        let mut out = Vec::new();
        for mut d in self.records(LumpIndex::TexInfo, 40)? {
            let mut vecs = [[0.0f32; 4]; 2];
            for row in &mut vecs {
                for v in row.iter_mut() {
                    *v = d.get_f32_le();
                }
            }
            let miptex = d.get_i32_le();
            let flags = d.get_i32_le();
            let texture = if miptex >= 0 && (miptex as usize) < textures.len() {
                miptex as usize
            } else {
                // Faces referencing a missing texture draw with a placeholder.
                *missing.get_or_insert_with(|| {
                    textures.push(missing_texture());
                    textures.len() - 1
                })
            };
            out.push(TexInfo {
                vecs,
                texture,
                flags,
            });
        }
        Ok(out)
    }

    fn read_faces(&self, model: &BspModel) -> Result<Vec<Face>, LoadError> {
        let mut faces = Vec::new();
        for (index, mut d) in self.records(LumpIndex::Faces, 20)?.enumerate() {
            let plane = self.check("face plane", d.get_i16_le() as i64, model.planes.len())?;
            let side = d.get_i16_le();
            let first_edge = d.get_i32_le();
            let num_edges = d.get_i16_le();
            let texinfo = self.check("face texinfo", d.get_i16_le() as i64, model.texinfo.len())?;
            let mut styles = [0u8; MAX_LIGHTMAPS_PER_FACE];
            d.copy_to_slice(&mut styles);
            let light_ofs = d.get_i32_le();

            if first_edge < 0
                || num_edges < 3
                || first_edge as usize + num_edges as usize > model.surf_edges.len()
            {
                return Err(self.bad_index("face edges", first_edge as i64, model.surf_edges.len()));
            }

            let tex = &model.textures[model.texinfo[texinfo].texture];
            let mut flags = SurfaceFlags::empty();
            if side != 0 {
                flags |= SurfaceFlags::PLANEBACK;
            }
            if tex.name.starts_with("sky") {
                flags |= SurfaceFlags::DRAWSKY | SurfaceFlags::DRAWTILED;
            } else if tex.name.starts_with('*') {
                flags |= SurfaceFlags::DRAWTURB | SurfaceFlags::DRAWTILED;
            }

            let light_offset = (light_ofs >= 0 && (light_ofs as usize) < model.lighting.len())
                .then_some(light_ofs as usize);

            let mut face = Face {
                plane,
                flags,
                first_edge: first_edge as usize,
                num_edges: num_edges as usize,
                texinfo,
                styles,
                light_offset,
                texture_mins: [0; 2],
                extents: [0; 2],
                cache: SurfaceCache::default(),
            };
            self.calc_surface_extents(model, index, &mut face)?;
            faces.push(face);
        }
        Ok(faces)
    }

    fn calc_surface_extents(&self, model: &BspModel, index: usize, face: &mut Face) -> Result<(), LoadError> {
        let tex = &model.texinfo[face.texinfo];
        let mut mins = [f32::MAX; 2];
        let mut maxs = [f32::MIN; 2];
        for &e in &model.surf_edges[face.first_edge..face.first_edge + face.num_edges] {
            let v = if e >= 0 {
                model.edges[e as usize].v[0]
            } else {
                model.edges[(-e) as usize].v[1]
            };
            let p = model.vertices[v as usize];
            for axis in 0..2 {
                let val = tex.project(p, axis);
                mins[axis] = mins[axis].min(val);
                maxs[axis] = maxs[axis].max(val);
            }
        }
        for axis in 0..2 {
            let bmin = (mins[axis] / 16.0).floor() as i32;
            let bmax = (maxs[axis] / 16.0).ceil() as i32;
            face.texture_mins[axis] = bmin * 16;
            face.extents[axis] = (bmax - bmin) * 16;
            if tex.flags & TEX_SPECIAL == 0 && face.extents[axis] > MAX_SURFACE_EXTENT {
                return Err(LoadError::BadSurfaceExtents {
                    name: self.name.to_string(),
                    face: index,
                });
            }
        }
        Ok(())
    }

    fn read_mark_surfaces(&self, num_faces: usize) -> Result<Vec<usize>, LoadError> {
        self.records(LumpIndex::MarkSurfaces, 2)?
            .map(|mut d| self.check("marksurface", d.get_u16_le() as i64, num_faces))
            .collect()
    }

    fn read_leaves(&self, marks: &[usize], vis_len: usize) -> Result<Vec<Leaf>, LoadError> {
        self.records(LumpIndex::Leafs, 28)?
            .map(|mut d| {
                let contents = d.get_i32_le();
                let visofs = d.get_i32_le();
                let mins = read_short_vec3(&mut d);
                let maxs = read_short_vec3(&mut d);
                let first = d.get_u16_le() as usize;
                let count = d.get_u16_le() as usize;
                let mut ambient_level = [0u8; 4];
                d.copy_to_slice(&mut ambient_level);
                if first + count > marks.len() {
                    return Err(self.bad_index("leaf marksurfaces", (first + count) as i64, marks.len()));
                }
                Ok(Leaf {
                    contents,
                    vis_offset: (visofs >= 0 && (visofs as usize) < vis_len).then_some(visofs as usize),
                    mins,
                    maxs,
                    faces: marks[first..first + count].to_vec(),
                    ambient_level,
                    parent: None,
                    visframe: 0,
                    drawframe: 0,
                })
            })
            .collect()
    }

    fn read_nodes(&self, model: &BspModel) -> Result<Vec<Node>, LoadError> {
        let records = self.records(LumpIndex::Nodes, 24)?;
        let num_nodes = records.len();
        records
            .map(|mut d| {
                let plane = self.check("node plane", d.get_i32_le() as i64, model.planes.len())?;
                let mut children = [Child::Leaf(0); 2];
                for c in &mut children {
                    *c = Child::from_raw(d.get_i16_le());
                    match *c {
                        Child::Node(n) => {
                            self.check("node child", n as i64, num_nodes)?;
                        }
                        Child::Leaf(l) => {
                            self.check("leaf child", l as i64, model.leaves.len())?;
                        }
                    }
                }
                let mins = read_short_vec3(&mut d);
                let maxs = read_short_vec3(&mut d);
                let first_face = d.get_u16_le() as usize;
                let num_faces = d.get_u16_le() as usize;
                if first_face + num_faces > model.faces.len() {
                    return Err(self.bad_index("node faces", (first_face + num_faces) as i64, model.faces.len()));
                }
                Ok(Node {
                    plane,
                    children,
                    mins,
                    maxs,
                    first_face,
                    num_faces,
                    parent: None,
                    visframe: 0,
                })
            })
            .collect()
    }

    fn read_submodels(&self, model: &BspModel) -> Result<Vec<Submodel>, LoadError> {
        self.records(LumpIndex::Models, 64)?
            .map(|mut d| {
                // Brush models are expanded by a unit to avoid edge cases.
                let mins = read_vec3(&mut d) - Vec3::splat(1.0);
                let maxs = read_vec3(&mut d) + Vec3::splat(1.0);
                let origin = read_vec3(&mut d);
                let mut head_nodes = [0i32; 4];
                for h in &mut head_nodes {
                    *h = d.get_i32_le();
                }
                let vis_leafs = d.get_i32_le();
                let first_face = d.get_i32_le();
                let num_faces = d.get_i32_le();
                let end = first_face as i64 + num_faces as i64;
                if first_face < 0 || num_faces < 0 || end as usize > model.faces.len() {
                    return Err(self.bad_index("model faces", end, model.faces.len()));
                }
                if !model.nodes.is_empty() || head_nodes[0] != 0 {
                    self.check("model headnode", head_nodes[0] as i64, model.nodes.len())?;
                }
                Ok(Submodel {
                    mins,
                    maxs,
                    origin,
                    head_nodes,
                    vis_leafs,
                    first_face: first_face as usize,
                    num_faces: num_faces as usize,
                })
            })
            .collect()
    }
}

fn missing_texture() -> Texture {
    Texture {
        name: "notexture".to_string(),
        width: 16,
        height: 16,
        ..Default::default()
    }
}

fn read_vec3(d: &mut &[u8]) -> Vec3 {
    Vec3::new(d.get_f32_le(), d.get_f32_le(), d.get_f32_le())
}

fn read_short_vec3(d: &mut &[u8]) -> Vec3 {
    Vec3::new(
        d.get_i16_le() as f32,
        d.get_i16_le() as f32,
        d.get_i16_le() as f32,
    )
}

/// Parses the entity lump text into structured entities.
///
/// The lump is a sequence of `{ "key" "value" ... }` blocks; tokens may
/// share lines.
pub fn parse_entity_lump(text: &str) -> Vec<BspEntity> {
    let mut entities = Vec::new();
    let mut tokens = EntityTokens::new(text);
    while let Some(tok) = tokens.next() {
        if tok != "{" {
            continue;
        }
        let mut ent = BspEntity::default();
        while let Some(key) = tokens.next() {
            if key == "}" {
                break;
            }
            let Some(value) = tokens.next() else { break };
            if key == "classname" {
                ent.classname = value.to_string();
            }
            ent.properties.insert(key.to_string(), value.to_string());
        }
        entities.push(ent);
    }
    entities
}

/// Tokenizer for the entity lump: quoted strings, braces, bare words.
struct EntityTokens<'a> {
    rest: &'a str,
}

impl<'a> EntityTokens<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text }
    }
}

impl<'a> Iterator for EntityTokens<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        loop {
            self.rest = self.rest.trim_start();
            if let Some(after) = self.rest.strip_prefix("//") {
                self.rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("");
                continue;
            }
            break;
        }
        let s = self.rest;
        let first = s.chars().next()?;
        if first == '"' {
            let body = &s[1..];
            let end = body.find('"').unwrap_or(body.len());
            self.rest = body.get(end + 1..).unwrap_or("");
            return Some(&body[..end]);
        }
        if first == '{' || first == '}' {
            self.rest = &s[1..];
            return Some(&s[..1]);
        }
        let end = s
            .find(|c: char| c.is_whitespace() || c == '"' || c == '{' || c == '}')
            .unwrap_or(s.len());
        self.rest = &s[end..];
        Some(&s[..end])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fixtures::{assemble, two_room_lumps};

    fn two_room_bsp() -> Vec<u8> {
        crate::fixtures::two_room_bsp(r#"{ "classname" "worldspawn" }"#)
    }

    #[test]
    fn parse_entity_lump_basic() {
        let text = r#"
{
"classname" "worldspawn"
"wad" "gfx/base.wad"
}
{ "classname" "info_player_start" "origin" "0 0 64" "angle" "90" }
"#;
        let ents = parse_entity_lump(text);
        assert_eq!(ents.len(), 2);
        assert_eq!(ents[0].classname, "worldspawn");
        assert_eq!(ents[1].classname, "info_player_start");
        assert_eq!(ents[1].origin(), Some(Vec3::new(0.0, 0.0, 64.0)));
        assert_eq!(ents[1].angles(), Some(Vec3::new(0.0, 90.0, 0.0)));
    }

    #[test]
    fn decompress_vis_expands_zero_runs() {
        // 0xff, then a run of three zero bytes, then 0x01.
        let out = decompress_vis(&[0xff, 0x00, 0x03, 0x01], 5);
        assert_eq!(out, vec![0xff, 0, 0, 0, 0x01]);
    }

    #[test]
    fn loads_two_room_world() {
        let data = two_room_bsp();
        let m = BspModel::load("test.bsp", &data).unwrap();
        assert_eq!(m.nodes.len(), 1);
        assert_eq!(m.leaves.len(), 3);
        assert_eq!(m.faces.len(), 2);
        assert_eq!(m.root(), Child::Node(0));
        assert_eq!(m.nodes[0].children, [Child::Leaf(1), Child::Leaf(2)]);
        assert_eq!(m.leaves[1].parent, Some(0));
        assert!(m.faces[0].flags.contains(SurfaceFlags::PLANEBACK));
        assert_eq!(m.face_vertices(1).count(), 4);
        assert_eq!(m.entities[0].classname, "worldspawn");
        assert_eq!(m.texinfo_of(0).texture, 0);
        assert_eq!(m.textures[0].name, "wall");
    }

    #[test]
    fn point_in_leaf_picks_side() {
        let m = BspModel::load("test.bsp", &two_room_bsp()).unwrap();
        assert_eq!(m.point_in_leaf(Vec3::new(10.0, 0.0, 0.0)), 1);
        assert_eq!(m.point_in_leaf(Vec3::new(-10.0, 0.0, 0.0)), 2);
        assert_eq!(m.point_contents(Vec3::new(10.0, 0.0, 0.0)), CONTENTS_EMPTY);
        // On the plane counts as the front side.
        assert_eq!(m.point_in_leaf(Vec3::ZERO), 1);
        assert_eq!(m.planes[0].side(Vec3::ZERO), 0);
        assert_eq!(m.planes[0].side(Vec3::new(-0.5, 0.0, 0.0)), 1);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut data = two_room_bsp();
        data[0] = 30;
        match BspModel::load("bad.bsp", &data) {
            Err(LoadError::BadVersion { found: 30, .. }) => {}
            other => panic!("expected BadVersion, got {other:?}"),
        }
    }

    #[test]
    fn rejects_lump_past_end_of_file() {
        let mut data = two_room_bsp();
        let len = data.len() as i32;
        // Planes lump offset.
        data[12..16].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(
            BspModel::load("bad.bsp", &data),
            Err(LoadError::LumpOutOfBounds { what: "planes", .. })
        ));
    }

    /// Loads the two-room world after `patch` rewrites its first miptex.
    fn load_with_miptex(patch: impl FnOnce(&mut [u8])) -> Result<BspModel, LoadError> {
        let mut lumps = two_room_lumps(r#"{ "classname" "worldspawn" }"#);
        patch(&mut lumps[LumpIndex::Textures as usize][crate::fixtures::FIRST_MIPTEX..]);
        BspModel::load("bad.bsp", &assemble(&lumps))
    }

    #[test]
    fn non_ascii_animated_texture_name_is_an_error() {
        let result = load_with_miptex(|mip| mip[..4].copy_from_slice(b"+\xffwa"));
        assert!(
            matches!(result, Err(LoadError::Malformed { .. })),
            "got {result:?}"
        );
    }

    #[test]
    fn oversized_texture_is_an_error() {
        let result = load_with_miptex(|mip| {
            mip[16..20].copy_from_slice(&0x10000u32.to_le_bytes());
            mip[20..24].copy_from_slice(&0x10000u32.to_le_bytes());
        });
        assert!(
            matches!(&result, Err(LoadError::Malformed { reason, .. }) if reason.contains("larger than")),
            "got {result:?}"
        );

        let result = load_with_miptex(|mip| {
            mip[16..20].copy_from_slice(&0x8000u32.to_le_bytes());
            mip[20..24].copy_from_slice(&0x8000u32.to_le_bytes());
        });
        assert!(matches!(result, Err(LoadError::Malformed { .. })), "got {result:?}");
    }

    #[test]
    fn extents_cover_face() {
        let m = BspModel::load("test.bsp", &two_room_bsp()).unwrap();
        let f = &m.faces[1];
        assert_eq!(f.texture_mins, [-16, -16]);
        assert_eq!(f.extents, [32, 32]);
        assert_eq!(f.lightmap_size(), (3, 3));
    }

    #[test]
    fn texture_animation_cycles() {
        let mut textures = vec![
            Texture { name: "+0slime".into(), ..Default::default() },
            Texture { name: "+1slime".into(), ..Default::default() },
            Texture { name: "+aslime".into(), ..Default::default() },
        ];
        link_texture_animations("t", &mut textures).unwrap();
        assert_eq!(textures[0].anim_total, 2 * ANIM_CYCLE);
        assert_eq!(textures[0].anim_next, Some(1));
        assert_eq!(textures[1].anim_next, Some(0));
        assert_eq!(textures[0].alternate, Some(2));

        let model = BspModel {
            textures,
            ..Default::default()
        };
        assert_eq!(model.animated_texture(0, false, 0.0), 0);
        assert_eq!(model.animated_texture(0, false, 0.25), 1);
        assert_eq!(model.animated_texture(0, false, 0.45), 0);
        assert_eq!(model.animated_texture(0, true, 0.0), 2);
    }
}
