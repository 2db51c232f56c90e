//! Player visibility and the player-info frame
//!
//! Each tick, every logged-in player gets one player-info frame carrying
//! their own movement, the movement or removal of every player they were
//! already tracking, the players entering their viewport, and the
//! byte-aligned update blocks (appearance and friends) those segments
//! flagged.
//!
//! Visibility rule: a target is visible iff it is another logged-in
//! player on the same height within Chebyshev distance 15 that is not
//! hard-invisible. Candidates are scanned in ascending PID order and the
//! set is capped, so truncation under crowding is deterministic.

use crate::game::player::{Appearance, Player, Position};
use crate::game::registry::{PlayerRegistry, MAX_PLAYERS};
use crate::game::movement::Direction;
use crate::game::sync::update_flags::UpdateFlags;
use crate::net::buffer::PacketBuf;
use crate::protocol::packets::{server, OutgoingFrame};

/// How far players can see each other, in tiles (Chebyshev)
pub const VIEW_DISTANCE: u16 = 15;

/// Cap on one viewer's local set
pub const MAX_LOCAL_PLAYERS: usize = MAX_PLAYERS - 1;

/// PID written to terminate the addition segment (11 bits, all ones)
const ADDITION_TERMINATOR: u16 = 2047;

/// Bitmap over the PID space for O(1) membership checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidSet([u64; 32]);

impl PidSet {
    pub fn new() -> Self {
        Self([0; 32])
    }

    pub fn contains(&self, pid: u16) -> bool {
        self.0[(pid / 64) as usize] & (1u64 << (pid % 64)) != 0
    }

    pub fn insert(&mut self, pid: u16) {
        self.0[(pid / 64) as usize] |= 1u64 << (pid % 64);
    }

    pub fn remove(&mut self, pid: u16) {
        self.0[(pid / 64) as usize] &= !(1u64 << (pid % 64));
    }

    pub fn clear(&mut self) {
        self.0 = [0; 32];
    }
}

impl Default for PidSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Start-of-phase copy of one active player, taken after movement has
/// advanced so every viewer works from the same world state.
#[derive(Debug, Clone)]
pub struct TickSnapshot {
    pub pid: u16,
    pub slot: usize,
    pub position: Position,
    pub needs_placement: bool,
    pub primary: Option<Direction>,
    pub secondary: Option<Direction>,
    pub flags: UpdateFlags,
    pub appearance: Appearance,
}

/// Snapshot every logged-in player in ascending PID order
pub fn collect_snapshots(registry: &PlayerRegistry) -> Vec<TickSnapshot> {
    let mut snapshots = Vec::with_capacity(registry.count());
    for pid in 1..=MAX_PLAYERS as u16 {
        let Some(slot) = registry.slot_of_pid(pid) else {
            continue;
        };
        let player = registry.get(slot);
        if !player.is_active() {
            continue;
        }
        snapshots.push(TickSnapshot {
            pid,
            slot,
            position: player.position,
            needs_placement: player.needs_placement,
            primary: player.primary_direction,
            secondary: player.secondary_direction,
            flags: player.flags,
            appearance: player.appearance,
        });
    }
    snapshots
}

/// Find a snapshot by PID (the snapshot list is PID-sorted)
fn snapshot_of(snapshots: &[TickSnapshot], pid: u16) -> Option<&TickSnapshot> {
    snapshots
        .binary_search_by_key(&pid, |s| s.pid)
        .ok()
        .map(|i| &snapshots[i])
}

/// Compute the PIDs visible to a viewer, in ascending PID order, capped
/// deterministically
pub fn visible_pids(
    viewer_pid: u16,
    viewer_pos: Position,
    snapshots: &[TickSnapshot],
) -> Vec<u16> {
    let mut visible = Vec::new();
    for snap in snapshots {
        if snap.pid == viewer_pid {
            continue;
        }
        if snap.flags.is_hidden() {
            continue;
        }
        match viewer_pos.chebyshev(&snap.position) {
            Some(d) if d <= VIEW_DISTANCE => {}
            _ => continue,
        }
        if visible.len() == MAX_LOCAL_PLAYERS {
            break;
        }
        visible.push(snap.pid);
    }
    visible
}

/// Write one player's movement bits. Used for the viewer's own segment
/// and for every tracked player that stays visible.
fn write_movement(
    bits: &mut PacketBuf,
    snap: &TickSnapshot,
    has_block: bool,
) -> Result<(), crate::error::CodecError> {
    match (snap.secondary, snap.primary) {
        (Some(second), Some(first)) => {
            bits.write_bits(1, 1)?;
            bits.write_bits(2, 2)?;
            bits.write_bits(3, first.as_u8() as u32)?;
            bits.write_bits(3, second.as_u8() as u32)?;
            bits.write_bits(1, has_block as u32)?;
        }
        (None, Some(first)) => {
            bits.write_bits(1, 1)?;
            bits.write_bits(2, 1)?;
            bits.write_bits(3, first.as_u8() as u32)?;
            bits.write_bits(1, has_block as u32)?;
        }
        _ if has_block => {
            bits.write_bits(1, 1)?;
            bits.write_bits(2, 0)?;
        }
        _ => {
            bits.write_bits(1, 0)?;
        }
    }
    Ok(())
}

/// Append one player's update block: a mask byte, then the payload of
/// each flagged section. Additions always carry appearance.
fn write_block(body: &mut PacketBuf, snap: &TickSnapshot, force_appearance: bool) {
    let mut flags = snap.flags;
    if force_appearance {
        flags |= UpdateFlags::APPEARANCE;
    }
    let _ = body.write_u8((flags.bits() & 0xFF) as u8);
    if flags.needs_appearance() {
        let _ = body.write_u8(snap.appearance.gender);
        let _ = body.write_bytes(&snap.appearance.body);
        let _ = body.write_bytes(&snap.appearance.colors);
    }
}

/// Build the player-info frame for one viewer and roll the viewer's
/// local list forward to match what the frame told the client.
pub fn build_player_info(
    viewer: &mut Player,
    snapshots: &[TickSnapshot],
    visible: &[u16],
) -> OutgoingFrame {
    let mut frame = OutgoingFrame::var_u16(server::PLAYER_INFO);
    let body = &mut frame.body;

    // Blocks are queued in flag order: self, kept tracked, additions.
    let mut block_queue: Vec<(u16, bool)> = Vec::new();

    let visible_set = {
        let mut set = PidSet::new();
        for &pid in visible {
            set.insert(pid);
        }
        set
    };

    body.start_bit_write();

    // Self segment.
    if let Some(self_snap) = snapshot_of(snapshots, viewer.pid) {
        let has_block = self_snap.flags.has_update();
        if self_snap.needs_placement {
            let _ = body.write_bits(1, 1);
            let _ = body.write_bits(2, 3);
            let _ = body.write_bits(2, self_snap.position.height as u32);
            // Tile offsets within the 104x104 build area around the
            // anchor. A same-region teleport can land below the base, so
            // the offsets are clamped rather than wrapped.
            let base_x = (((viewer.origin.x >> 3).saturating_sub(6)) << 3) as i32;
            let base_z = (((viewer.origin.z >> 3).saturating_sub(6)) << 3) as i32;
            let local_x = (self_snap.position.x as i32 - base_x).clamp(0, 127);
            let local_z = (self_snap.position.z as i32 - base_z).clamp(0, 127);
            let _ = body.write_bits(7, local_x as u32);
            let _ = body.write_bits(7, local_z as u32);
            let _ = body.write_bits(1, has_block as u32);
        } else {
            let _ = write_movement(body, self_snap, has_block);
        }
        if has_block {
            block_queue.push((viewer.pid, false));
        }
    } else {
        let _ = body.write_bits(1, 0);
    }

    // Tracked segment: every previously-tracked player, insertion order.
    let previous: Vec<u16> = viewer.local_players.clone();
    let mut kept: Vec<u16> = Vec::with_capacity(previous.len());
    let _ = body.write_bits(11, previous.len() as u32);
    for &pid in &previous {
        let snap = snapshot_of(snapshots, pid);
        let stays = visible_set.contains(pid)
            && snap.map(|s| !s.needs_placement).unwrap_or(false);
        match (stays, snap) {
            (true, Some(snap)) => {
                let has_block = snap.flags.has_update();
                let _ = write_movement(body, snap, has_block);
                if has_block {
                    block_queue.push((pid, false));
                }
                kept.push(pid);
            }
            _ => {
                // Remove: update bit, then the removal code.
                let _ = body.write_bits(1, 1);
                let _ = body.write_bits(2, 3);
                viewer.local_pids.remove(pid);
            }
        }
    }

    // Addition segment: newly visible players (including teleports that
    // were just removed above), ascending PID order.
    for &pid in visible {
        if kept.contains(&pid) {
            continue;
        }
        let Some(snap) = snapshot_of(snapshots, pid) else {
            continue;
        };
        let _ = body.write_bits(11, pid as u32);
        let dx = snap.position.x as i32 - viewer.position.x as i32;
        let dz = snap.position.z as i32 - viewer.position.z as i32;
        let _ = body.write_bits(5, (dx as u32) & 0x1F);
        let _ = body.write_bits(5, (dz as u32) & 0x1F);
        let _ = body.write_bits(1, 1);
        block_queue.push((pid, true));
        kept.push(pid);
        viewer.local_pids.insert(pid);
    }
    let _ = body.write_bits(11, ADDITION_TERMINATOR as u32);
    body.end_bit_access();

    // Byte-aligned update blocks in flag order.
    for (pid, force_appearance) in block_queue {
        if let Some(snap) = snapshot_of(snapshots, pid) {
            write_block(body, snap, force_appearance);
        }
    }

    viewer.local_players = kept;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::ConnectionState;

    fn active_player(reg: &mut PlayerRegistry, slot: usize, x: u16, z: u16, height: u8) -> u16 {
        let pid = reg.allocate_pid(slot);
        let player = reg.get_mut(slot);
        player.pid = pid;
        player.state = ConnectionState::LoggedIn;
        player.username = format!("player{slot}");
        player.position = Position::new(x, z, height);
        player.origin = player.position;
        pid
    }

    #[test]
    fn test_pid_set() {
        let mut set = PidSet::new();
        assert!(!set.contains(100));
        set.insert(100);
        set.insert(2047);
        assert!(set.contains(100));
        assert!(set.contains(2047));
        set.remove(100);
        assert!(!set.contains(100));
        assert!(set.contains(2047));
    }

    #[test]
    fn test_snapshots_are_pid_ascending() {
        let mut reg = PlayerRegistry::new(8);
        active_player(&mut reg, 0, 3222, 3218, 0);
        active_player(&mut reg, 1, 3223, 3218, 0);
        active_player(&mut reg, 2, 3224, 3218, 0);

        let snaps = collect_snapshots(&reg);
        let pids: Vec<u16> = snaps.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![1, 2, 3]);
    }

    #[test]
    fn test_visibility_basic_rules() {
        let mut reg = PlayerRegistry::new(8);
        let viewer = active_player(&mut reg, 0, 3222, 3218, 0);
        let near = active_player(&mut reg, 1, 3237, 3218, 0); // 15 east
        let far = active_player(&mut reg, 2, 3238, 3218, 0); // 16 east
        let above = active_player(&mut reg, 3, 3222, 3218, 1); // other height

        let snaps = collect_snapshots(&reg);
        let visible = visible_pids(viewer, Position::new(3222, 3218, 0), &snaps);
        assert!(visible.contains(&near));
        assert!(!visible.contains(&far));
        assert!(!visible.contains(&above));
        assert!(!visible.contains(&viewer));
    }

    #[test]
    fn test_visibility_symmetry() {
        let mut reg = PlayerRegistry::new(8);
        let a = active_player(&mut reg, 0, 3222, 3218, 0);
        let b = active_player(&mut reg, 1, 3230, 3225, 0);

        let snaps = collect_snapshots(&reg);
        let a_sees = visible_pids(a, Position::new(3222, 3218, 0), &snaps);
        let b_sees = visible_pids(b, Position::new(3230, 3225, 0), &snaps);
        assert_eq!(a_sees.contains(&b), b_sees.contains(&a));
        assert!(a_sees.contains(&b));
    }

    #[test]
    fn test_hidden_players_are_invisible() {
        let mut reg = PlayerRegistry::new(8);
        let viewer = active_player(&mut reg, 0, 3222, 3218, 0);
        let ghost = active_player(&mut reg, 1, 3223, 3218, 0);
        reg.get_mut(1).flags |= UpdateFlags::HIDDEN;

        let snaps = collect_snapshots(&reg);
        let visible = visible_pids(viewer, Position::new(3222, 3218, 0), &snaps);
        assert!(!visible.contains(&ghost));
    }

    #[test]
    fn test_addition_then_tracking() {
        let mut reg = PlayerRegistry::new(8);
        let viewer_pid = active_player(&mut reg, 0, 3222, 3218, 0);
        let other_pid = active_player(&mut reg, 1, 3224, 3218, 0);

        let snaps = collect_snapshots(&reg);
        let visible = visible_pids(viewer_pid, Position::new(3222, 3218, 0), &snaps);

        // Split the viewer out of the registry borrow by taking the build
        // through get_mut.
        let frame = {
            let viewer = reg.get_mut(0);
            build_player_info(viewer, &snaps, &visible)
        };
        assert_eq!(frame.opcode, server::PLAYER_INFO);

        let viewer = reg.get(0);
        assert_eq!(viewer.local_players, vec![other_pid]);
        assert!(viewer.local_pids.contains(other_pid));
    }

    #[test]
    fn test_departed_player_is_removed_from_tracking() {
        let mut reg = PlayerRegistry::new(8);
        let viewer_pid = active_player(&mut reg, 0, 3222, 3218, 0);
        let other_pid = active_player(&mut reg, 1, 3224, 3218, 0);

        // Tick 1: addition.
        let snaps = collect_snapshots(&reg);
        let visible = visible_pids(viewer_pid, Position::new(3222, 3218, 0), &snaps);
        {
            let viewer = reg.get_mut(0);
            build_player_info(viewer, &snaps, &visible);
        }

        // The other player walks out of range.
        reg.get_mut(1).position = Position::new(3300, 3218, 0);

        // Tick 2: removal.
        let snaps = collect_snapshots(&reg);
        let visible = visible_pids(viewer_pid, Position::new(3222, 3218, 0), &snaps);
        assert!(visible.is_empty());
        {
            let viewer = reg.get_mut(0);
            build_player_info(viewer, &snaps, &visible);
        }

        let viewer = reg.get(0);
        assert!(viewer.local_players.is_empty());
        assert!(!viewer.local_pids.contains(other_pid));
    }

    #[test]
    fn test_self_placement_bits() {
        let mut reg = PlayerRegistry::new(8);
        active_player(&mut reg, 0, 3222, 3218, 0);
        reg.get_mut(0).needs_placement = true;
        reg.get_mut(0).flags = UpdateFlags::APPEARANCE;

        let snaps = collect_snapshots(&reg);
        let frame = {
            let viewer = reg.get_mut(0);
            build_player_info(viewer, &snaps, &[])
        };

        let mut body = PacketBuf::from_bytes(frame.body.as_slice());
        body.start_bit_read();
        assert_eq!(body.read_bits(1), 1); // has update
        assert_eq!(body.read_bits(2), 3); // placement
        assert_eq!(body.read_bits(2), 0); // height
        // Origin equals position, so locals sit at 48 + (coord & 7).
        assert_eq!(body.read_bits(7), 48 + (3222 & 7));
        assert_eq!(body.read_bits(7), 48 + (3218 & 7));
        assert_eq!(body.read_bits(1), 1); // block follows
        assert_eq!(body.read_bits(11), 0); // tracked count
        assert_eq!(body.read_bits(11), ADDITION_TERMINATOR as u32);
    }

    #[test]
    fn test_self_walk_bits() {
        let mut reg = PlayerRegistry::new(8);
        active_player(&mut reg, 0, 3223, 3218, 0);
        reg.get_mut(0).primary_direction = Some(Direction::East);

        let snaps = collect_snapshots(&reg);
        let frame = {
            let viewer = reg.get_mut(0);
            build_player_info(viewer, &snaps, &[])
        };

        let mut body = PacketBuf::from_bytes(frame.body.as_slice());
        body.start_bit_read();
        assert_eq!(body.read_bits(1), 1);
        assert_eq!(body.read_bits(2), 1); // walk
        assert_eq!(body.read_bits(3), Direction::East.as_u8() as u32);
        assert_eq!(body.read_bits(1), 0); // no block
    }

    #[test]
    fn test_addition_appearance_block_content() {
        let mut reg = PlayerRegistry::new(8);
        let viewer_pid = active_player(&mut reg, 0, 3222, 3218, 0);
        let other_pid = active_player(&mut reg, 1, 3223, 3219, 0);

        let snaps = collect_snapshots(&reg);
        let visible = visible_pids(viewer_pid, Position::new(3222, 3218, 0), &snaps);
        let frame = {
            let viewer = reg.get_mut(0);
            build_player_info(viewer, &snaps, &visible)
        };

        let mut body = PacketBuf::from_bytes(frame.body.as_slice());
        body.start_bit_read();
        assert_eq!(body.read_bits(1), 0); // self: nothing
        assert_eq!(body.read_bits(11), 0); // tracked count
        assert_eq!(body.read_bits(11), other_pid as u32);
        assert_eq!(body.read_bits(5), 1); // dx
        assert_eq!(body.read_bits(5), 1); // dz
        assert_eq!(body.read_bits(1), 1); // block follows
        assert_eq!(body.read_bits(11), ADDITION_TERMINATOR as u32);
        body.end_bit_access();

        // The addition's block: mask with the appearance bit, then the
        // default look.
        let mask = body.read_u8().unwrap();
        assert_eq!(mask & 0x01, 0x01);
        assert_eq!(body.read_u8().unwrap(), 0); // gender
        let mut parts = [0u8; 7];
        for p in parts.iter_mut() {
            *p = body.read_u8().unwrap();
        }
        assert_eq!(parts, [0, 10, 18, 26, 33, 36, 42]);
    }

    #[test]
    fn test_crowded_viewport_truncates_by_pid() {
        let mut reg = PlayerRegistry::new(40);
        let viewer = active_player(&mut reg, 0, 3222, 3218, 0);
        for slot in 1..40 {
            active_player(&mut reg, slot, 3223, 3218, 0);
        }
        let snaps = collect_snapshots(&reg);
        let visible = visible_pids(viewer, Position::new(3222, 3218, 0), &snaps);
        assert_eq!(visible.len(), 39);
        // Ascending PID order, viewer excluded.
        assert_eq!(visible[0], 2);
        assert!(visible.windows(2).all(|w| w[0] < w[1]));
    }
}
