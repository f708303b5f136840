//! `quake_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Content formats are validated at load; nothing downstream re-checks
//!   indices.
//! - Clear separation of concerns (formats, wire, transport, console).
//! - Traits at the seams the host plugs into (render, audio, sockets).
//! - No `unsafe`.

pub mod audio;
pub mod bsp;
pub mod config;
pub mod console;
pub mod error;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;
pub mod math;
pub mod model;
pub mod net;
pub mod protocol;
pub mod render;
pub mod vfs;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::net::{Delivered, NetChannel, PacketSocket};
    pub use crate::protocol::{ClientMessage, ServerMessage, UserCmd};
}
