//! Protocol implementation
//!
//! - `handshake` - pre-login exchange and login block parsing
//! - `packets` - opcode tables and the outgoing frame builder
//! - `game` - in-game packet dispatcher

pub mod game;
pub mod handshake;
pub mod packets;
