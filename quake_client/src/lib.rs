//! `quake_client`
//!
//! Client-side systems:
//! - Connection state machine and signon (`client`)
//! - Entity snapshots and interpolation (`entity`)
//! - Key bindings and command generation (`input`)
//! - Camera pipeline (`view`)
//! - World visibility, surface display lists, lightmaps and lights
//! - World renderer wiring over a swappable backend (`render`)
//! - Screen overlays (`overlay`)
//! - The engine host that runs all of the above each frame (`host`)

pub mod client;
pub mod entity;
pub mod host;
pub mod input;
pub mod lightmap;
pub mod lights;
pub mod overlay;
pub mod render;
pub mod surface;
pub mod view;
pub mod visibility;

pub use client::Client;
pub use host::{EngineHost, SimulationClock};
