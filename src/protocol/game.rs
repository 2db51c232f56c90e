//! Game protocol handler
//!
//! Dispatches decrypted in-game packets to handlers that mutate the
//! player. Handlers return whether the session should keep running;
//! every parse failure bubbles up as a protocol violation and ends the
//! session. Unhandled opcodes are consumed so the inbound cipher stays
//! in step with the client.

use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};
use crate::game::player::{Player, Position};
use crate::net::buffer::PacketBuf;
use crate::protocol::packets::{self, client};

/// Interface component: the logout button on the options tab
pub const COMPONENT_LOGOUT: u16 = 2458;

/// Main interface: the character design screen
pub const DESIGN_INTERFACE: u16 = 3559;

/// Sidebar tab interfaces sent once the design screen closes
pub const SIDEBAR_INTERFACES: [(u8, u16); 7] = [
    (0, 2433), // combat styles
    (1, 3917), // skills
    (2, 638),  // quest journal
    (3, 3213), // inventory
    (4, 1644), // worn equipment
    (5, 5608), // prayers
    (6, 1151), // spellbook
];

/// Longest walk request origin distance, Manhattan, before the packet is
/// treated as an attack on the session
const MAX_WALK_ORIGIN_DIST: u32 = 104;

/// Trailing camera metadata on minimap walk packets, discarded unparsed
const MINIMAP_CAMERA_BYTES: usize = 14;

/// What the world should do with the session after a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep the session running
    Continue,
    /// Save and disconnect cleanly (client asked to leave)
    Logout,
}

/// Route one decrypted packet to its handler
pub fn dispatch(player: &mut Player, opcode: u8, payload: &[u8]) -> Result<Dispatch> {
    match opcode {
        client::WALK_MAP | client::WALK_MINIMAP | client::WALK_INTERFACE => {
            handle_walk(player, opcode, payload)?;
            Ok(Dispatch::Continue)
        }
        client::PLAYER_DESIGN => {
            handle_design(player, payload)?;
            Ok(Dispatch::Continue)
        }
        client::IF_BUTTON => handle_button(player, payload),
        client::COMMAND => {
            handle_command(player, payload);
            Ok(Dispatch::Continue)
        }
        client::REGION_REQUEST_A | client::REGION_REQUEST_B => {
            // The asset pipeline serves region data elsewhere; the core
            // only needs the bytes consumed.
            Ok(Dispatch::Continue)
        }
        client::IDLE_LOGOUT => Ok(Dispatch::Logout),
        _ => {
            trace!(opcode, len = payload.len(), "ignoring unhandled packet");
            Ok(Dispatch::Continue)
        }
    }
}

/// Walk request: `[ctrl, sx, sz, (dx, dz) × n]`, with 14 trailing camera
/// bytes on the minimap variant. Waypoints are reconstructed by
/// cumulative sum from the start tile.
fn handle_walk(player: &mut Player, opcode: u8, payload: &[u8]) -> Result<()> {
    let extra = if opcode == client::WALK_MINIMAP {
        MINIMAP_CAMERA_BYTES
    } else {
        0
    };
    if payload.len() < 5 + extra {
        return Err(ProtocolError::MalformedPacket {
            opcode,
            reason: "walk request shorter than its header",
        }
        .into());
    }

    let mut buf = PacketBuf::from_bytes(payload);
    let ctrl = buf.read_u8().map_err(crate::error::ServerError::from)?;
    let sx = buf.read_u16().map_err(crate::error::ServerError::from)?;
    let sz = buf.read_u16().map_err(crate::error::ServerError::from)?;
    let steps = (payload.len() - 5 - extra) / 2;

    let dist = (sx as i32 - player.position.x as i32).unsigned_abs()
        + (sz as i32 - player.position.z as i32).unsigned_abs();
    if dist > MAX_WALK_ORIGIN_DIST {
        return Err(ProtocolError::WalkTooFar { dist }.into());
    }

    player.movement.clear();
    player.set_run(ctrl == 1);

    if steps == 0 {
        player
            .movement
            .naive_path(player.position, sx, sz);
        return Ok(());
    }

    let mut x = sx as i32;
    let mut z = sz as i32;
    let current = player.position;
    // The first tile is the click origin itself; skip it when the player
    // is already standing there.
    if !(sx == current.x && sz == current.z) {
        player.movement.add(current.height, sx, sz);
    }
    for _ in 0..steps {
        x += buf.read_i8().map_err(crate::error::ServerError::from)? as i32;
        z += buf.read_i8().map_err(crate::error::ServerError::from)? as i32;
        match (u16::try_from(x), u16::try_from(z)) {
            (Ok(wx), Ok(wz)) => player.movement.add(current.height, wx, wz),
            _ => debug!(x, z, "skipping negative waypoint"),
        }
    }
    Ok(())
}

/// Character design submission: `[gender, idkit × 7, color × 5]`.
/// Only honoured while the design screen is open.
fn handle_design(player: &mut Player, payload: &[u8]) -> Result<()> {
    if payload.len() != 13 {
        return Err(ProtocolError::MalformedPacket {
            opcode: client::PLAYER_DESIGN,
            reason: "design payload is not 13 bytes",
        }
        .into());
    }
    if !player.allow_design {
        debug!(slot = player.slot, "design packet outside design screen");
        return Ok(());
    }

    player.appearance.gender = payload[0];
    player.appearance.body.copy_from_slice(&payload[1..8]);
    player.appearance.colors.copy_from_slice(&payload[8..13]);
    player.design_complete = true;
    player.flags |= crate::game::sync::update_flags::UpdateFlags::APPEARANCE;
    Ok(())
}

/// Interface button click: `[component]`
fn handle_button(player: &mut Player, payload: &[u8]) -> Result<Dispatch> {
    let mut buf = PacketBuf::from_bytes(payload);
    let component = buf.read_u16().map_err(crate::error::ServerError::from)?;

    if component == COMPONENT_LOGOUT {
        return Ok(Dispatch::Logout);
    }

    if player.allow_design && player.design_complete {
        // Leaving the design screen: close it and hand over the sidebar.
        player.allow_design = false;
        player.send(&packets::close_interface());
        for (tab, interface) in SIDEBAR_INTERFACES {
            player.send(&packets::sidebar_tab(tab, interface));
        }
        return Ok(Dispatch::Continue);
    }

    debug!(component, "unhandled interface button");
    Ok(Dispatch::Continue)
}

/// Command line: a raw ASCII blob. Supports `tele <x> <z> <h>` with an
/// optional `::` prefix; everything else earns a help line.
fn handle_command(player: &mut Player, payload: &[u8]) {
    let text: String = payload.iter().map(|&b| b as char).collect();
    let text = text.trim().trim_start_matches("::");
    let mut parts = text.split_whitespace();

    match parts.next() {
        Some("tele") => {
            let args: Vec<i32> = parts.filter_map(|p| p.parse().ok()).collect();
            if let [x, z, h] = args[..] {
                if (0..=16383).contains(&x) && (0..=16383).contains(&z) && (0..=3).contains(&h) {
                    player.teleport(Position::new(x as u16, z as u16, h as u8));
                    debug!(
                        slot = player.slot,
                        username = %player.username,
                        x, z, h,
                        "teleport command"
                    );
                    return;
                }
            }
            player.send(&packets::game_message("Usage: ::tele <x> <z> <h>"));
        }
        _ => {
            player.send(&packets::game_message("Commands: ::tele <x> <z> <h>"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IsaacPair;
    use crate::game::player::ConnectionState;

    fn logged_in_player() -> Player {
        let mut player = Player::new(0);
        player.state = ConnectionState::LoggedIn;
        player.pid = 1;
        player.username = "tester".to_string();
        player.position = Position::new(3222, 3218, 0);
        player.origin = player.position;
        player.ciphers = Some(IsaacPair::new([1, 2, 3, 4]));
        player
    }

    fn walk_payload(ctrl: u8, sx: u16, sz: u16, deltas: &[(i8, i8)], camera: bool) -> Vec<u8> {
        let mut buf = PacketBuf::new();
        buf.write_u8(ctrl).unwrap();
        buf.write_u16(sx).unwrap();
        buf.write_u16(sz).unwrap();
        for &(dx, dz) in deltas {
            buf.write_i8(dx).unwrap();
            buf.write_i8(dz).unwrap();
        }
        if camera {
            buf.write_bytes(&[0u8; MINIMAP_CAMERA_BYTES]).unwrap();
        }
        buf.as_slice().to_vec()
    }

    #[test]
    fn test_walk_enqueues_cumulative_tiles() {
        let mut player = logged_in_player();
        let payload = walk_payload(0, 3222, 3218, &[(1, 0), (1, 0), (1, 0)], false);
        let out = dispatch(&mut player, client::WALK_MAP, &payload).unwrap();

        assert_eq!(out, Dispatch::Continue);
        // Start tile equals the player's tile, so only the three deltas
        // become waypoints.
        assert_eq!(player.movement.len(), 3);
        assert!(!player.run_path);
    }

    #[test]
    fn test_walk_includes_start_tile_when_distinct() {
        let mut player = logged_in_player();
        let payload = walk_payload(0, 3223, 3218, &[(1, 0)], false);
        dispatch(&mut player, client::WALK_MAP, &payload).unwrap();
        assert_eq!(player.movement.len(), 2);
    }

    #[test]
    fn test_walk_ctrl_sets_run() {
        let mut player = logged_in_player();
        let payload = walk_payload(1, 3222, 3218, &[(0, 1)], false);
        dispatch(&mut player, client::WALK_MAP, &payload).unwrap();
        assert!(player.run_path);
        assert!(player.running);
    }

    #[test]
    fn test_walk_destination_click_builds_naive_path() {
        let mut player = logged_in_player();
        let payload = walk_payload(0, 3225, 3221, &[], false);
        dispatch(&mut player, client::WALK_MAP, &payload).unwrap();
        // Three diagonal steps to (3225, 3221).
        assert_eq!(player.movement.len(), 3);
    }

    #[test]
    fn test_walk_rejects_distant_origin() {
        let mut player = logged_in_player();
        let payload = walk_payload(0, 3000, 3000, &[], false);
        let err = dispatch(&mut player, client::WALK_MAP, &payload).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ServerError::Protocol(ProtocolError::WalkTooFar { .. })
        ));
    }

    #[test]
    fn test_minimap_walk_discards_camera_block() {
        let mut player = logged_in_player();
        let payload = walk_payload(0, 3222, 3218, &[(0, 1), (0, 1)], true);
        dispatch(&mut player, client::WALK_MINIMAP, &payload).unwrap();
        assert_eq!(player.movement.len(), 2);
    }

    #[test]
    fn test_minimap_walk_too_short_is_malformed() {
        let mut player = logged_in_player();
        // Header only, no camera block.
        let payload = walk_payload(0, 3222, 3218, &[], false);
        assert!(dispatch(&mut player, client::WALK_MINIMAP, &payload).is_err());
    }

    #[test]
    fn test_design_requires_open_screen() {
        let mut player = logged_in_player();
        let payload: Vec<u8> = vec![1, 45, 0, 56, 61, 67, 70, 79, 3, 2, 1, 0, 4];
        dispatch(&mut player, client::PLAYER_DESIGN, &payload).unwrap();
        // Screen closed: nothing stored.
        assert_eq!(player.appearance.gender, 0);
        assert!(!player.design_complete);

        player.allow_design = true;
        dispatch(&mut player, client::PLAYER_DESIGN, &payload).unwrap();
        assert_eq!(player.appearance.gender, 1);
        assert_eq!(player.appearance.body, [45, 0, 56, 61, 67, 70, 79]);
        assert_eq!(player.appearance.colors, [3, 2, 1, 0, 4]);
        assert!(player.design_complete);
        assert!(player.flags.needs_appearance());
    }

    #[test]
    fn test_logout_button() {
        let mut player = logged_in_player();
        let out = dispatch(&mut player, client::IF_BUTTON, &COMPONENT_LOGOUT.to_be_bytes())
            .unwrap();
        assert_eq!(out, Dispatch::Logout);
    }

    #[test]
    fn test_button_closes_design_screen_once_complete() {
        let mut player = logged_in_player();
        player.allow_design = true;
        player.design_complete = true;

        let out = dispatch(&mut player, client::IF_BUTTON, &100u16.to_be_bytes()).unwrap();
        assert_eq!(out, Dispatch::Continue);
        assert!(!player.allow_design);
        // Close frame plus seven sidebar tabs were queued.
        assert!(!player.outbound.is_empty());
    }

    #[test]
    fn test_idle_logout() {
        let mut player = logged_in_player();
        let out = dispatch(&mut player, client::IDLE_LOGOUT, &[]).unwrap();
        assert_eq!(out, Dispatch::Logout);
    }

    #[test]
    fn test_tele_command() {
        let mut player = logged_in_player();
        let payload = b"::tele 3100 3500 2".to_vec();
        dispatch(&mut player, client::COMMAND, &payload).unwrap();
        assert_eq!(player.position, Position::new(3100, 3500, 2));
        assert!(player.needs_placement);
        assert!(player.movement.is_empty());
    }

    #[test]
    fn test_tele_command_without_prefix() {
        let mut player = logged_in_player();
        dispatch(&mut player, client::COMMAND, b"tele 3000 3000 0").unwrap();
        assert_eq!(player.position, Position::new(3000, 3000, 0));
    }

    #[test]
    fn test_tele_rejects_out_of_range() {
        let mut player = logged_in_player();
        let before = player.position;
        dispatch(&mut player, client::COMMAND, b"::tele 99999 10 0").unwrap();
        assert_eq!(player.position, before);
        // A usage hint was queued instead.
        assert!(!player.outbound.is_empty());
    }

    #[test]
    fn test_unknown_command_gets_help() {
        let mut player = logged_in_player();
        dispatch(&mut player, client::COMMAND, b"::abracadabra").unwrap();
        assert!(!player.outbound.is_empty());
    }

    #[test]
    fn test_unknown_opcode_is_ignored() {
        let mut player = logged_in_player();
        let out = dispatch(&mut player, 211, &[1, 2, 3]).unwrap();
        assert_eq!(out, Dispatch::Continue);
        assert!(player.outbound.is_empty());
    }
}
