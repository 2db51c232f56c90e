//! Cryptographic utilities
//!
//! The revision-225 protocol masks every post-login opcode with a
//! per-direction ISAAC keystream seeded during the login exchange.

pub mod isaac;

pub use isaac::{Isaac, IsaacPair};
