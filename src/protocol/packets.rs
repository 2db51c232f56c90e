//! Packet definitions module
//!
//! The opcode→length table for incoming game packets, the opcode
//! constants for both directions, and the outgoing frame builder that
//! masks opcodes with the session's ISAAC keystream.

use crate::crypto::Isaac;
use crate::error::CodecError;
use crate::net::buffer::{PacketBuf, MAX_PACKET_SIZE};

/// Payload length descriptor for a packet opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Fixed payload of exactly `n` bytes
    Fixed(usize),
    /// Variable payload, 1-byte length prefix
    VarU8,
    /// Variable payload, 2-byte length prefix
    VarU16,
}

impl FrameKind {
    /// Header size on the wire: opcode byte plus the length prefix
    pub fn header_len(self) -> usize {
        match self {
            FrameKind::Fixed(_) => 1,
            FrameKind::VarU8 => 2,
            FrameKind::VarU16 => 3,
        }
    }
}

/// Incoming (client → server) opcodes handled by the dispatcher
pub mod client {
    /// Walk via a map click
    pub const WALK_MAP: u8 = 93;
    /// Walk via a minimap click (14 trailing camera bytes)
    pub const WALK_MINIMAP: u8 = 165;
    /// Walk via an interface-driven click
    pub const WALK_INTERFACE: u8 = 181;
    /// Character design screen submission
    pub const PLAYER_DESIGN: u8 = 52;
    /// Interface button click
    pub const IF_BUTTON: u8 = 155;
    /// Client command line
    pub const COMMAND: u8 = 158;
    /// Map region data request (primary)
    pub const REGION_REQUEST_A: u8 = 150;
    /// Map region data request (secondary)
    pub const REGION_REQUEST_B: u8 = 81;
    /// Client idle-timer logout
    pub const IDLE_LOGOUT: u8 = 30;
}

/// Outgoing (server → client) opcodes
pub mod server {
    /// Player info / viewport delta update
    pub const PLAYER_INFO: u8 = 184;
    /// Rebuild the map around a new region anchor
    pub const REBUILD_REGION: u8 = 237;
    /// Log the client out
    pub const LOGOUT: u8 = 142;
    /// Game message in the chatbox
    pub const MESSAGE_GAME: u8 = 203;
    /// Run energy percentage
    pub const UPDATE_RUN_ENERGY: u8 = 240;
    /// One skill's level and experience
    pub const UPDATE_STAT: u8 = 44;
    /// Attach an interface to a sidebar tab
    pub const IF_SET_TAB: u8 = 167;
    /// Open a full-screen/main interface
    pub const IF_OPEN_MAIN: u8 = 168;
    /// Close the open interface
    pub const IF_CLOSE: u8 = 199;
}

/// The 256-entry incoming length table. Opcodes the server does not
/// handle default to a 1-byte length prefix so their payload can be
/// consumed and the cipher kept in step.
pub const INCOMING_LENGTHS: [FrameKind; 256] = {
    let mut table = [FrameKind::VarU8; 256];
    table[client::WALK_MAP as usize] = FrameKind::VarU8;
    table[client::WALK_MINIMAP as usize] = FrameKind::VarU8;
    table[client::WALK_INTERFACE as usize] = FrameKind::VarU8;
    table[client::PLAYER_DESIGN as usize] = FrameKind::Fixed(13);
    table[client::IF_BUTTON as usize] = FrameKind::Fixed(2);
    table[client::COMMAND as usize] = FrameKind::VarU8;
    table[client::REGION_REQUEST_A as usize] = FrameKind::Fixed(4);
    table[client::REGION_REQUEST_B as usize] = FrameKind::Fixed(4);
    table[client::IDLE_LOGOUT as usize] = FrameKind::Fixed(0);
    table
};

/// Look up the length descriptor for an incoming opcode
#[inline]
pub fn incoming_kind(opcode: u8) -> FrameKind {
    INCOMING_LENGTHS[opcode as usize]
}

/// An outgoing game frame: opcode, length kind, payload under
/// construction. Encoded onto a player's pending buffer with
/// [`OutgoingFrame::encode_into`].
#[derive(Debug, Clone)]
pub struct OutgoingFrame {
    pub opcode: u8,
    pub kind: FrameKind,
    pub body: PacketBuf,
}

impl OutgoingFrame {
    /// Start a fixed-length frame
    pub fn fixed(opcode: u8, len: usize) -> Self {
        Self {
            opcode,
            kind: FrameKind::Fixed(len),
            body: PacketBuf::with_capacity(len),
        }
    }

    /// Start a frame with a 1-byte length prefix
    pub fn var_u8(opcode: u8) -> Self {
        Self {
            opcode,
            kind: FrameKind::VarU8,
            body: PacketBuf::new(),
        }
    }

    /// Start a frame with a 2-byte length prefix
    pub fn var_u16(opcode: u8) -> Self {
        Self {
            opcode,
            kind: FrameKind::VarU16,
            body: PacketBuf::new(),
        }
    }

    /// Encode this frame onto `out`: masked opcode, length placeholder,
    /// payload, then the backfilled length. On any error the partial
    /// frame is removed from `out` and the outbound cipher step stands —
    /// the caller must treat the session as dead.
    pub fn encode_into(&self, cipher: &mut Isaac, out: &mut PacketBuf) -> Result<(), CodecError> {
        let start = out.len();
        match self.try_encode(cipher, out) {
            Ok(()) => Ok(()),
            Err(e) => {
                out.truncate(start);
                Err(e)
            }
        }
    }

    fn try_encode(&self, cipher: &mut Isaac, out: &mut PacketBuf) -> Result<(), CodecError> {
        let body = self.body.as_slice();
        out.write_u8(self.opcode.wrapping_add(cipher.next_u8()))?;
        match self.kind {
            FrameKind::Fixed(len) => {
                debug_assert_eq!(body.len(), len, "fixed frame body size mismatch");
                out.write_bytes(body)?;
            }
            FrameKind::VarU8 => {
                if body.len() > u8::MAX as usize {
                    return Err(CodecError::Overflow {
                        requested: body.len(),
                        capacity: u8::MAX as usize,
                    });
                }
                let placeholder = out.len();
                out.write_u8(0)?;
                out.write_bytes(body)?;
                out.set_u8_at(placeholder, body.len() as u8);
            }
            FrameKind::VarU16 => {
                if body.len() > MAX_PACKET_SIZE {
                    return Err(CodecError::Overflow {
                        requested: body.len(),
                        capacity: MAX_PACKET_SIZE,
                    });
                }
                let placeholder = out.len();
                out.write_u16(0)?;
                out.write_bytes(body)?;
                out.set_u16_at(placeholder, body.len() as u16);
            }
        }
        Ok(())
    }
}

// ============ Standard outgoing frames ============

/// Chatbox message
pub fn game_message(text: &str) -> OutgoingFrame {
    let mut frame = OutgoingFrame::var_u8(server::MESSAGE_GAME);
    let _ = frame.body.write_str8(text);
    frame
}

/// Log the client out cleanly
pub fn logout() -> OutgoingFrame {
    OutgoingFrame::fixed(server::LOGOUT, 0)
}

/// Run energy as a display percentage (0–100)
pub fn run_energy(energy: u16) -> OutgoingFrame {
    let mut frame = OutgoingFrame::fixed(server::UPDATE_RUN_ENERGY, 1);
    let _ = frame.body.write_u8((energy / 100) as u8);
    frame
}

/// One skill's level and experience
pub fn update_stat(skill: u8, level: u8, experience: u32) -> OutgoingFrame {
    let mut frame = OutgoingFrame::fixed(server::UPDATE_STAT, 6);
    let _ = frame.body.write_u8(skill);
    let _ = frame.body.write_u8(level);
    let _ = frame.body.write_u32(experience);
    frame
}

/// Rebuild the map around the zone containing `(x, z)`
pub fn rebuild_region(x: u16, z: u16) -> OutgoingFrame {
    let mut frame = OutgoingFrame::fixed(server::REBUILD_REGION, 4);
    let _ = frame.body.write_u16(x >> 3);
    let _ = frame.body.write_u16(z >> 3);
    frame
}

/// Attach an interface to a sidebar tab
pub fn sidebar_tab(tab: u8, interface: u16) -> OutgoingFrame {
    let mut frame = OutgoingFrame::fixed(server::IF_SET_TAB, 3);
    let _ = frame.body.write_u8(tab);
    let _ = frame.body.write_u16(interface);
    frame
}

/// Open a main (full-screen) interface
pub fn open_main_interface(interface: u16) -> OutgoingFrame {
    let mut frame = OutgoingFrame::fixed(server::IF_OPEN_MAIN, 2);
    let _ = frame.body.write_u16(interface);
    frame
}

/// Close whatever main interface is open
pub fn close_interface() -> OutgoingFrame {
    OutgoingFrame::fixed(server::IF_CLOSE, 0)
}
