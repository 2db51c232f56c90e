//! Player synchronization
//!
//! - `update_flags` - per-tick update mask
//! - `player_sync` - visibility sets and the player-info frame

pub mod player_sync;
pub mod update_flags;
