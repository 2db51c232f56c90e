//! Handshake protocol handler
//!
//! The pre-login exchange for a game connection:
//!
//! 1. Client sends `[14, name_hash]`. Server replies with eight filler
//!    bytes and a random 64-bit nonce, then waits for the login block.
//! 2. Client sends `[type, len, payload]` where type is 16 (fresh login)
//!    or 18 (reconnect) and the payload carries the client revision, the
//!    four ISAAC seed words, and the credentials.
//!
//! Parsers consume nothing until a complete unit has arrived; `Ok(None)`
//! means "wait for more bytes".

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{ProtocolError, SaveError};
use crate::net::buffer::PacketBuf;

/// Client revision this server speaks
pub const REVISION: u16 = 225;

/// Handshake opcode for a game login connection
pub const HANDSHAKE_GAME: u8 = 14;

/// Login block type: fresh session
pub const LOGIN_TYPE_NEW: u8 = 16;

/// Login block type: reconnect after a dropped socket
pub const LOGIN_TYPE_RECONNECT: u8 = 18;

/// Longest permitted username
pub const MAX_USERNAME_LEN: usize = 12;

/// The client's opening handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHello {
    /// Hash of the username, used by login servers for routing. Read and
    /// ignored here.
    pub name_hash: u8,
}

/// Parse the opening handshake. Consumes it from `buf` on success.
pub fn parse_hello(buf: &mut PacketBuf) -> Result<Option<HandshakeHello>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let bytes = buf.as_slice();
    let opcode = bytes[0];
    if opcode != HANDSHAKE_GAME {
        return Err(ProtocolError::BadHandshake(opcode));
    }
    let name_hash = bytes[1];
    buf.consume_front(2);
    Ok(Some(HandshakeHello { name_hash }))
}

/// Server reply to the opening handshake: eight filler bytes, then the
/// nonce the client folds into its seed exchange.
pub fn hello_response(server_nonce: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[8..].copy_from_slice(&server_nonce.to_be_bytes());
    out
}

/// A parsed login block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    /// True for type-18 (reconnect) blocks
    pub reconnect: bool,
    /// ISAAC seed words for the session ciphers
    pub seeds: [u32; 4],
    /// Lower-cased account name
    pub username: String,
    /// Clear-text password (hashed immediately after verification)
    pub password: String,
}

/// Parse the login block. Consumes it from `buf` on success.
pub fn parse_login(buf: &mut PacketBuf) -> Result<Option<LoginRequest>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let bytes = buf.as_slice();
    let login_type = bytes[0];
    if login_type != LOGIN_TYPE_NEW && login_type != LOGIN_TYPE_RECONNECT {
        return Err(ProtocolError::MalformedLogin(format!(
            "unknown login type {login_type}"
        )));
    }
    let block_len = bytes[1] as usize;
    if buf.len() < 2 + block_len {
        return Ok(None);
    }

    let mut block = PacketBuf::from_bytes(&bytes[2..2 + block_len]);
    let parse = |_: crate::error::CodecError| {
        ProtocolError::MalformedLogin("login block shorter than its fields".to_string())
    };

    let revision = block.read_u16().map_err(parse)?;
    if revision != REVISION {
        return Err(ProtocolError::BadRevision {
            expected: REVISION,
            actual: revision,
        });
    }

    let mut seeds = [0u32; 4];
    for seed in seeds.iter_mut() {
        *seed = block.read_u32().map_err(parse)?;
    }

    let username = block.read_str8().map_err(parse)?;
    let password = block.read_str8().map_err(parse)?;
    let username = normalize_username(&username)?;

    buf.consume_front(2 + block_len);
    Ok(Some(LoginRequest {
        reconnect: login_type == LOGIN_TYPE_RECONNECT,
        seeds,
        username,
        password,
    }))
}

/// Lower-case and validate an account name: 1–12 chars of `[a-z0-9_]`
fn normalize_username(raw: &str) -> Result<String, ProtocolError> {
    let name = raw.to_ascii_lowercase().replace(' ', "_");
    if name.is_empty() || name.len() > MAX_USERNAME_LEN {
        return Err(ProtocolError::MalformedLogin(format!(
            "username length {}",
            name.len()
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(ProtocolError::MalformedLogin(
            "username has non-ascii characters".to_string(),
        ));
    }
    Ok(name)
}

/// Bcrypt credential store, one hash file per account. The save format
/// has no credential field, so passwords live beside the saves.
pub struct CredentialVault {
    dir: PathBuf,
}

/// Work factor for new hashes. Interactive logins tolerate this fine.
const BCRYPT_COST: u32 = 8;

impl CredentialVault {
    /// Create a vault rooted at `dir` (usually `data/accounts`)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, username: &str) -> PathBuf {
        self.dir.join(format!("{username}.cred"))
    }

    /// Verify a password, registering the account on first sight.
    /// Returns false only for a wrong password on an existing account.
    pub fn verify_or_register(&self, username: &str, password: &str) -> Result<bool, SaveError> {
        let path = self.path_for(username);
        match fs::read_to_string(&path) {
            Ok(stored) => Ok(bcrypt::verify(password, stored.trim()).unwrap_or(false)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let hash = bcrypt::hash(password, BCRYPT_COST).map_err(|e| {
                    SaveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                })?;
                fs::create_dir_all(&self.dir)?;
                fs::write(&path, hash)?;
                debug!(username, "registered new account");
                Ok(true)
            }
            Err(e) => Err(SaveError::Io(e)),
        }
    }
}
