//! `quake_server`
//!
//! Listen server for local play and tests:
//! - Level state built from a world model's entity lump
//! - Connect/accept with a fixed number of player slots
//! - Three-stage signon (serverinfo, baselines, player state)
//! - Fixed timestep loop sending time and entity updates as datagrams
//!
//! The server talks through any [`PacketSocket`](quake_shared::net::PacketSocket),
//! so the same code serves real UDP and the in-process loopback hub.

pub mod level;
pub mod server;

pub use level::Level;
pub use server::{GameServer, ServerState, SignonStage};
