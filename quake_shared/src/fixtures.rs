//! Hand-built BSP images for tests.
//!
//! Compiled for this crate's unit tests and, behind the `test-fixtures`
//! feature, for the integration test crate.

use bytes::BufMut;

use crate::bsp::{LumpIndex, BSP_VERSION, CONTENTS_EMPTY, CONTENTS_SOLID, HEADER_LUMPS};

/// Byte offset of the first miptex inside the textures lump.
pub const FIRST_MIPTEX: usize = 8;

/// Writes a BSP image from lump payloads in header order.
pub fn assemble(lumps: &[Vec<u8>; HEADER_LUMPS]) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_i32_le(BSP_VERSION);
    let mut offset = 4 + HEADER_LUMPS * 8;
    for l in lumps {
        out.put_i32_le(offset as i32);
        out.put_i32_le(l.len() as i32);
        offset += l.len();
    }
    for l in lumps {
        out.extend_from_slice(l);
    }
    out
}

/// A one-node world: an axial plane at x = 0 splitting two empty leaves,
/// with one square face on each side. `entities` becomes the entity lump.
pub fn two_room_bsp(entities: &str) -> Vec<u8> {
    assemble(&two_room_lumps(entities))
}

/// The lumps of [`two_room_bsp`], for tests that corrupt one of them.
pub fn two_room_lumps(entities: &str) -> [Vec<u8>; HEADER_LUMPS] {
    let mut lumps: [Vec<u8>; HEADER_LUMPS] = Default::default();

    let mut ents = entities.as_bytes().to_vec();
    ents.push(0);
    lumps[LumpIndex::Entities as usize] = ents;

    let planes = &mut lumps[LumpIndex::Planes as usize];
    for d in [0.0f32, -32.0, 32.0] {
        for c in [1.0f32, 0.0, 0.0] {
            planes.put_f32_le(c);
        }
        planes.put_f32_le(d);
        planes.put_i32_le(0);
    }

    let tex = &mut lumps[LumpIndex::Textures as usize];
    tex.put_i32_le(1);
    tex.put_i32_le(FIRST_MIPTEX as i32);
    let mut name = [0u8; 16];
    name[..4].copy_from_slice(b"wall");
    tex.extend_from_slice(&name);
    tex.put_u32_le(16);
    tex.put_u32_le(16);
    for _ in 0..4 {
        tex.put_u32_le(0);
    }

    // Square at x = -32 (faces +x) and x = 32 (faces -x).
    let verts = &mut lumps[LumpIndex::Vertexes as usize];
    for x in [-32.0f32, 32.0] {
        for (y, z) in [(-16.0f32, -16.0f32), (16.0, -16.0), (16.0, 16.0), (-16.0, 16.0)] {
            for c in [x, y, z] {
                verts.put_f32_le(c);
            }
        }
    }

    let nodes = &mut lumps[LumpIndex::Nodes as usize];
    nodes.put_i32_le(0);
    nodes.put_i16_le(-2); // front: leaf 1
    nodes.put_i16_le(-3); // back: leaf 2
    for v in [-64i16, -64, -64, 64, 64, 64] {
        nodes.put_i16_le(v);
    }
    nodes.put_u16_le(0);
    nodes.put_u16_le(0);

    let ti = &mut lumps[LumpIndex::TexInfo as usize];
    for v in [0.0f32, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
        ti.put_f32_le(v);
    }
    ti.put_i32_le(0);
    ti.put_i32_le(0);

    let faces = &mut lumps[LumpIndex::Faces as usize];
    for (plane, side, first) in [(2i16, 1i16, 4i32), (1, 0, 0)] {
        faces.put_i16_le(plane);
        faces.put_i16_le(side);
        faces.put_i32_le(first);
        faces.put_i16_le(4);
        faces.put_i16_le(0);
        faces.put_slice(&[0, 255, 255, 255]);
        faces.put_i32_le(-1);
    }

    let leafs = &mut lumps[LumpIndex::Leafs as usize];
    for (contents, first, count) in [(CONTENTS_SOLID, 0u16, 0u16), (CONTENTS_EMPTY, 0, 1), (CONTENTS_EMPTY, 1, 1)] {
        leafs.put_i32_le(contents);
        leafs.put_i32_le(-1);
        let (lo, hi) = match first {
            0 if count == 1 => ([0i16, -64, -64], [64i16, 64, 64]),
            _ => ([-64i16, -64, -64], [0i16, 64, 64]),
        };
        for v in lo.into_iter().chain(hi) {
            leafs.put_i16_le(v);
        }
        leafs.put_u16_le(first);
        leafs.put_u16_le(count);
        leafs.put_slice(&[0; 4]);
    }

    let marks = &mut lumps[LumpIndex::MarkSurfaces as usize];
    marks.put_u16_le(0);
    marks.put_u16_le(1);

    let edges = &mut lumps[LumpIndex::Edges as usize];
    edges.put_u16_le(0);
    edges.put_u16_le(0);
    for base in [0u16, 4] {
        for i in 0..4u16 {
            edges.put_u16_le(base + i);
            edges.put_u16_le(base + (i + 1) % 4);
        }
    }

    let surf = &mut lumps[LumpIndex::SurfEdges as usize];
    for e in 1..=8i32 {
        surf.put_i32_le(e);
    }

    let models = &mut lumps[LumpIndex::Models as usize];
    for v in [-64.0f32, -64.0, -64.0, 64.0, 64.0, 64.0, 0.0, 0.0, 0.0] {
        models.put_f32_le(v);
    }
    for h in [0i32, 0, 0, 0] {
        models.put_i32_le(h);
    }
    models.put_i32_le(2);
    models.put_i32_le(0);
    models.put_i32_le(2);

    lumps
}
