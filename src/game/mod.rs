//! Game world and entity management

pub mod movement;
pub mod persistence;
pub mod player;
pub mod registry;
pub mod sync;
pub mod world;
