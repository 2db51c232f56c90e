//! Oldscape Game Server Library
//!
//! Core of a revision-225 game server: the TCP front end, the
//! fixed-tick simulation, the cipher-masked wire protocol, per-player
//! movement and visibility, and the checksummed save format.
//!
//! ## Modules
//!
//! - `config` - server configuration
//! - `crypto` - ISAAC keystream for opcode masking
//! - `error` - error types and result definitions
//! - `game` - world, entities, movement, sync, persistence
//! - `net` - wire codec, listener, and the main loop
//! - `protocol` - handshake, packet tables, dispatch

pub mod config;
pub mod crypto;
pub mod error;
pub mod game;
pub mod net;
pub mod protocol;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{Result, ServerError};

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client revision this server speaks (May 2004)
pub use protocol::handshake::REVISION;
