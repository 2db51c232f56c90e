//! Error handling module
//!
//! Defines the error taxonomy for the Oldscape server. Inbound protocol
//! errors are session-fatal; codec truncation is an internal wait signal
//! that never escapes the packet pipeline; save errors are localized to
//! the persistence layer and fall back to new-player defaults.

use std::io;

use thiserror::Error;

/// Main error type for the Oldscape server
#[derive(Error, Debug)]
pub enum ServerError {
    /// Wire codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Save file errors
    #[error("Save error: {0}")]
    Save(#[from] SaveError),

    /// Game logic errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Wire codec errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes remained than the read requested. Recoverable: the
    /// caller waits for more bytes.
    #[error("Truncated read: needed {needed}, had {available}")]
    Truncated { needed: usize, available: usize },

    /// A bounded write exceeded the remaining capacity. Fatal for the
    /// frame being built.
    #[error("Buffer overflow: requested {requested}, capacity {capacity}")]
    Overflow { requested: usize, capacity: usize },
}

/// Protocol violations. All of these terminate the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid handshake opcode: {0}")]
    BadHandshake(u8),

    #[error("Invalid revision: expected {expected}, got {actual}")]
    BadRevision { expected: u16, actual: u16 },

    #[error("Frame too large: opcode {opcode}, {len} bytes (max {max})")]
    FrameTooLarge { opcode: u8, len: usize, max: usize },

    #[error("Malformed login block: {0}")]
    MalformedLogin(String),

    #[error("Malformed packet: opcode {opcode}: {reason}")]
    MalformedPacket { opcode: u8, reason: &'static str },

    #[error("Walk origin {dist} tiles from player (max 104)")]
    WalkTooFar { dist: u32 },

    #[error("Waypoint ({x}, {z}) is not an adjacent step")]
    ImpossibleStep { x: u16, z: u16 },
}

/// Save file errors. The load path converts all of these into
/// new-player defaults.
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Save file too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad magic: {0:#06x}")]
    BadMagic(u16),

    #[error("Unsupported save version: {0}")]
    UnsupportedVersion(u16),

    #[error("Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Save truncated mid-field")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Game logic errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    /// Every PID in [1, 2047] is taken. The new connection is closed.
    #[error("Player index pool exhausted")]
    PidPoolExhausted,

    #[error("Player in slot {0} is not logged in")]
    NotLoggedIn(usize),
}

/// Result type alias for Oldscape operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Response codes for the login protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginResponse {
    /// Successful login
    Success = 2,
    /// Invalid username or password
    InvalidCredentials = 3,
    /// Account is already logged in
    AlreadyLoggedIn = 5,
    /// Game has been updated
    GameUpdated = 6,
    /// World is full
    WorldFull = 7,
    /// Could not complete login
    CouldNotComplete = 13,
}

impl LoginResponse {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
