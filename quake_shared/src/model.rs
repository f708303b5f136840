//! Model format detection.
//!
//! Three binary formats share the model namespace. The first four bytes
//! select the interpretation:
//! - `IDPO`: alias (skeletal/vertex-animated) model, version 6
//! - `IDSP`: sprite, version 1
//! - little-endian `29`: brush model (see [`crate::bsp`])
//!
//! Alias and sprite bodies are decoded by the backend; the engine core only
//! needs their headers (bounding radius for culling, frame counts for frame
//! selection).

use bytes::Buf;

use crate::bsp::{BspModel, BSP_VERSION};
use crate::error::LoadError;
use crate::math::Vec3;

pub const ALIAS_IDENT: u32 = u32::from_le_bytes(*b"IDPO");
pub const ALIAS_VERSION: i32 = 6;
pub const SPRITE_IDENT: u32 = u32::from_le_bytes(*b"IDSP");
pub const SPRITE_VERSION: i32 = 1;

pub const MAX_ALIAS_VERTS: i32 = 1024;
pub const MAX_ALIAS_FRAMES: i32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Brush,
    Alias,
    Sprite,
}

impl ModelKind {
    /// Identifies a model image by its magic number.
    pub fn detect(name: &str, data: &[u8]) -> Result<Self, LoadError> {
        let Some(mut head) = data.get(..4) else {
            return Err(LoadError::Truncated {
                name: name.to_string(),
                what: "model magic",
            });
        };
        let magic = head.get_u32_le();
        match magic {
            ALIAS_IDENT => Ok(ModelKind::Alias),
            SPRITE_IDENT => Ok(ModelKind::Sprite),
            m if m as i32 == BSP_VERSION => Ok(ModelKind::Brush),
            found => Err(LoadError::BadMagic {
                name: name.to_string(),
                found,
            }),
        }
    }
}

/// Alias model header.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasHeader {
    pub scale: Vec3,
    pub scale_origin: Vec3,
    pub bounding_radius: f32,
    pub eye_position: Vec3,
    pub num_skins: i32,
    pub skin_width: i32,
    pub skin_height: i32,
    pub num_verts: i32,
    pub num_tris: i32,
    pub num_frames: i32,
    pub sync_type: i32,
    pub flags: i32,
    pub size: f32,
}

/// Sprite header.
#[derive(Debug, Clone, PartialEq)]
pub struct SpriteHeader {
    pub sprite_type: i32,
    pub bounding_radius: f32,
    pub max_width: i32,
    pub max_height: i32,
    pub num_frames: i32,
    pub beam_length: f32,
    pub sync_type: i32,
}

/// A loaded model of any kind.
#[derive(Debug, Clone)]
pub enum Model {
    Brush(Box<BspModel>),
    Alias(AliasHeader),
    Sprite(SpriteHeader),
}

impl Model {
    pub fn load(name: &str, data: &[u8]) -> Result<Self, LoadError> {
        match ModelKind::detect(name, data)? {
            ModelKind::Brush => Ok(Model::Brush(Box::new(BspModel::load(name, data)?))),
            ModelKind::Alias => Ok(Model::Alias(parse_alias_header(name, data)?)),
            ModelKind::Sprite => Ok(Model::Sprite(parse_sprite_header(name, data)?)),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Model::Brush(_) => ModelKind::Brush,
            Model::Alias(_) => ModelKind::Alias,
            Model::Sprite(_) => ModelKind::Sprite,
        }
    }

    /// Radius of a sphere around the origin enclosing every frame.
    pub fn radius(&self) -> f32 {
        match self {
            Model::Brush(b) => b
                .submodels
                .first()
                .map(|m| m.mins.abs().length().max(m.maxs.abs().length()))
                .unwrap_or(0.0),
            Model::Alias(h) => h.bounding_radius,
            Model::Sprite(h) => h.bounding_radius,
        }
    }

    pub fn num_frames(&self) -> i32 {
        match self {
            Model::Brush(_) => 1,
            Model::Alias(h) => h.num_frames,
            Model::Sprite(h) => h.num_frames,
        }
    }
}

fn header<'a>(name: &str, data: &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8], LoadError> {
    data.get(4..len).ok_or_else(|| LoadError::Truncated {
        name: name.to_string(),
        what,
    })
}

fn check_version(name: &str, found: i32, expected: i32) -> Result<(), LoadError> {
    if found != expected {
        return Err(LoadError::BadVersion {
            name: name.to_string(),
            found,
            expected,
        });
    }
    Ok(())
}

fn read_vec3(d: &mut &[u8]) -> Vec3 {
    Vec3::new(d.get_f32_le(), d.get_f32_le(), d.get_f32_le())
}

pub fn parse_alias_header(name: &str, data: &[u8]) -> Result<AliasHeader, LoadError> {
    let mut d = header(name, data, 84, "alias header")?;
    check_version(name, d.get_i32_le(), ALIAS_VERSION)?;
    let h = AliasHeader {
        scale: read_vec3(&mut d),
        scale_origin: read_vec3(&mut d),
        bounding_radius: d.get_f32_le(),
        eye_position: read_vec3(&mut d),
        num_skins: d.get_i32_le(),
        skin_width: d.get_i32_le(),
        skin_height: d.get_i32_le(),
        num_verts: d.get_i32_le(),
        num_tris: d.get_i32_le(),
        num_frames: d.get_i32_le(),
        sync_type: d.get_i32_le(),
        flags: d.get_i32_le(),
        size: d.get_f32_le(),
    };
    let malformed = |reason: String| LoadError::Malformed {
        name: name.to_string(),
        reason,
    };
    if h.num_verts <= 0 || h.num_verts > MAX_ALIAS_VERTS {
        return Err(malformed(format!("invalid vertex count {}", h.num_verts)));
    }
    if h.num_tris <= 0 {
        return Err(malformed(format!("invalid triangle count {}", h.num_tris)));
    }
    if h.num_frames < 1 || h.num_frames > MAX_ALIAS_FRAMES {
        return Err(malformed(format!("invalid frame count {}", h.num_frames)));
    }
    if h.skin_width % 8 != 0 || h.skin_height <= 0 {
        return Err(malformed(format!(
            "skin size {}x{} not supported",
            h.skin_width, h.skin_height
        )));
    }
    Ok(h)
}

pub fn parse_sprite_header(name: &str, data: &[u8]) -> Result<SpriteHeader, LoadError> {
    let mut d = header(name, data, 36, "sprite header")?;
    check_version(name, d.get_i32_le(), SPRITE_VERSION)?;
    let h = SpriteHeader {
        sprite_type: d.get_i32_le(),
        bounding_radius: d.get_f32_le(),
        max_width: d.get_i32_le(),
        max_height: d.get_i32_le(),
        num_frames: d.get_i32_le(),
        beam_length: d.get_f32_le(),
        sync_type: d.get_i32_le(),
    };
    if h.num_frames < 1 {
        return Err(LoadError::Malformed {
            name: name.to_string(),
            reason: format!("invalid sprite frame count {}", h.num_frames),
        });
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn sprite_bytes(frames: i32) -> Vec<u8> {
        let mut b = Vec::new();
        b.put_slice(b"IDSP");
        b.put_i32_le(SPRITE_VERSION);
        b.put_i32_le(2);
        b.put_f32_le(12.5);
        b.put_i32_le(32);
        b.put_i32_le(64);
        b.put_i32_le(frames);
        b.put_f32_le(0.0);
        b.put_i32_le(0);
        b
    }

    #[test]
    fn detects_by_magic() {
        assert_eq!(ModelKind::detect("s.spr", b"IDSPxxxx").unwrap(), ModelKind::Sprite);
        assert_eq!(ModelKind::detect("a.mdl", b"IDPOxxxx").unwrap(), ModelKind::Alias);
        assert_eq!(
            ModelKind::detect("b.bsp", &29i32.to_le_bytes()).unwrap(),
            ModelKind::Brush
        );
        assert!(matches!(
            ModelKind::detect("x", b"WAD2"),
            Err(LoadError::BadMagic { .. })
        ));
        assert!(matches!(
            ModelKind::detect("x", b"ID"),
            Err(LoadError::Truncated { .. })
        ));
    }

    #[test]
    fn sprite_header_parses() {
        let m = Model::load("s_light.spr", &sprite_bytes(3)).unwrap();
        assert_eq!(m.kind(), ModelKind::Sprite);
        assert_eq!(m.num_frames(), 3);
        assert_eq!(m.radius(), 12.5);
    }

    #[test]
    fn sprite_without_frames_is_rejected() {
        assert!(Model::load("s.spr", &sprite_bytes(0)).is_err());
    }

    #[test]
    fn alias_wrong_version_is_rejected() {
        let mut b = Vec::new();
        b.put_slice(b"IDPO");
        b.put_i32_le(7);
        b.resize(84, 0);
        assert!(matches!(
            parse_alias_header("a.mdl", &b),
            Err(LoadError::BadVersion { found: 7, .. })
        ));
    }
}
