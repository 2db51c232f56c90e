//! Network handling
//!
//! - `buffer` - wire codec primitives
//! - `server` - listener, acceptor, and the main loop

pub mod buffer;
pub mod server;
