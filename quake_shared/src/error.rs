//! Error taxonomy.
//!
//! Errors are grouped by how far their damage reaches:
//! - [`LoadError`]: a malformed or missing asset. Aborts the level load only.
//! - [`ProtocolError`]: bad framing or sequencing. Drops that connection only.
//! - [`CapacityError`]: a fixed table ran out of room. Ends the session.
//!
//! Transient I/O (`WouldBlock`) never becomes an error value; socket
//! wrappers report it as "no data" and the frame polls again next tick.

use thiserror::Error;

/// Content error raised while parsing level or model data.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{name}: i/o error: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name}: file not found")]
    NotFound { name: String },
    #[error("{name}: bad magic {found:#010x}")]
    BadMagic { name: String, found: u32 },
    #[error("{name}: wrong version {found} (should be {expected})")]
    BadVersion {
        name: String,
        found: i32,
        expected: i32,
    },
    #[error("{name}: {what} lump out of bounds (offset {offset}, length {length}, file {file_len})")]
    LumpOutOfBounds {
        name: String,
        what: &'static str,
        offset: i64,
        length: i64,
        file_len: usize,
    },
    #[error("{name}: funny {what} lump size {length}")]
    BadLumpSize {
        name: String,
        what: &'static str,
        length: usize,
    },
    #[error("{name}: bad {what} index {index} (count {count})")]
    BadIndex {
        name: String,
        what: &'static str,
        index: i64,
        count: usize,
    },
    #[error("{name}: truncated data reading {what}")]
    Truncated { name: String, what: &'static str },
    #[error("{name}: bad surface extents on face {face}")]
    BadSurfaceExtents { name: String, face: usize },
    #[error("{name}: {reason}")]
    Malformed { name: String, reason: String },
}

/// Connection-scoped protocol error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message truncated reading {0}")]
    Truncated(&'static str),
    #[error("illegible server message: command {0}")]
    BadServerCommand(u8),
    #[error("illegible client message: command {0}")]
    BadClientCommand(u8),
    #[error("packet header length {declared} does not match datagram size {actual}")]
    BadLength { declared: usize, actual: usize },
    #[error("unknown packet flags {0:#x}")]
    BadFlags(u32),
    #[error("server uses protocol {found}, not {expected}")]
    WrongVersion { found: i32, expected: i32 },
    #[error("received signon {received} when at {current}")]
    SignonOrder { received: u8, current: u8 },
    #[error("unexpected control packet {0:#x}")]
    BadControl(u8),
    #[error("reliable message exceeds {limit} bytes")]
    Oversize { limit: usize },
    #[error("light style {style} pattern {pattern:?} is invalid")]
    BadLightStyle { style: usize, pattern: String },
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

/// Fixed-size table exhaustion.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("lightmap atlas full allocating {width}x{height} block")]
    LightmapFull { width: usize, height: usize },
    #[error("entity slot {slot} out of range (max {max})")]
    EntitySlots { slot: usize, max: usize },
    #[error("too many {what} (max {max})")]
    Table { what: &'static str, max: usize },
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the current level transition, keep running.
    Level,
    /// Drop the current connection, keep running.
    Connection,
    /// End the current session with a hard error.
    Session,
}

/// Any engine-level error surfaced to the host.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("content error: {0}")]
    Content(#[from] LoadError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("capacity error: {0}")]
    Capacity(#[from] CapacityError),
}

impl EngineError {
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Content(_) => Severity::Level,
            EngineError::Protocol(_) => Severity::Connection,
            EngineError::Capacity(_) => Severity::Session,
        }
    }
}
