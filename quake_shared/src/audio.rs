//! Audio collaborator.
//!
//! The engine only decides *what* to play; mixing and spatialization are the
//! backend's job.

use crate::math::{Basis, Vec3};

/// A positional sound request.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundParams {
    pub entity: u16,
    pub channel: u8,
    pub origin: Vec3,
    /// `0.0..=1.0`
    pub volume: f32,
    /// Distance falloff; 0 plays everywhere at full volume.
    pub attenuation: f32,
}

pub trait AudioBackend: Send {
    fn play(&mut self, sound: &str, params: &SoundParams);
    fn set_listener(&mut self, origin: Vec3, basis: &Basis);
    fn stop_all(&mut self);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullAudio;

impl AudioBackend for NullAudio {
    fn play(&mut self, _sound: &str, _params: &SoundParams) {}
    fn set_listener(&mut self, _origin: Vec3, _basis: &Basis) {}
    fn stop_all(&mut self) {}
}

/// Keeps a log of started sounds.
#[derive(Debug, Default)]
pub struct RecordingAudio {
    pub played: Vec<(String, SoundParams)>,
    pub listener: Option<Vec3>,
    pub stops: usize,
}

impl AudioBackend for RecordingAudio {
    fn play(&mut self, sound: &str, params: &SoundParams) {
        self.played.push((sound.to_string(), params.clone()));
    }

    fn set_listener(&mut self, origin: Vec3, _basis: &Basis) {
        self.listener = Some(origin);
    }

    fn stop_all(&mut self) {
        self.stops += 1;
    }
}
