//! Player registry module
//!
//! Owns the fixed slot table created at startup and the wire-index (PID)
//! allocator. PIDs live in [1, 2047]; 0 is the "none" sentinel the wire
//! format reserves. Allocation is round-robin from a moving cursor so a
//! recently-released PID is not immediately reissued; lookup and removal
//! are O(1) via an occupancy bitmap and a pid→slot table.

use crate::game::player::{ConnectionState, Player};

/// Protocol ceiling on concurrent players (PIDs 1..=2047)
pub const MAX_PLAYERS: usize = 2047;

/// Words in the PID occupancy bitmap (2048 bits)
const BITMAP_WORDS: usize = 32;

/// Sentinel for "pid not bound to a slot"
const NO_SLOT: u16 = u16::MAX;

/// The player slot table and PID allocator
pub struct PlayerRegistry {
    /// Slot-indexed player table, fixed size for the server's lifetime
    players: Vec<Player>,
    /// One bit per PID; parallel to `pid_slots`
    occupied: [u64; BITMAP_WORDS],
    /// PID → slot index, `NO_SLOT` when free
    pid_slots: Vec<u16>,
    /// Round-robin scan start for the next allocation
    cursor: u16,
    /// Number of allocated PIDs
    count: usize,
}

impl PlayerRegistry {
    /// Create a registry with `capacity` slots (clamped to the protocol
    /// ceiling)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_PLAYERS);
        Self {
            players: (0..capacity).map(Player::new).collect(),
            occupied: [0; BITMAP_WORDS],
            pid_slots: vec![NO_SLOT; MAX_PLAYERS + 1],
            cursor: 1,
            count: 0,
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.players.len()
    }

    /// Number of allocated PIDs
    pub fn count(&self) -> usize {
        self.count
    }

    /// Borrow a slot
    pub fn get(&self, slot: usize) -> &Player {
        &self.players[slot]
    }

    /// Mutably borrow a slot
    pub fn get_mut(&mut self, slot: usize) -> &mut Player {
        &mut self.players[slot]
    }

    /// Iterate all slots in ascending order
    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.iter()
    }

    /// Mutably iterate all slots in ascending order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.players.iter_mut()
    }

    /// Lowest-indexed free (Disconnected) slot
    pub fn find_free_slot(&self) -> Option<usize> {
        self.players
            .iter()
            .position(|p| p.state == ConnectionState::Disconnected)
    }

    /// Whether a PID is currently allocated
    #[inline]
    pub fn pid_in_use(&self, pid: u16) -> bool {
        if pid == 0 || pid as usize > MAX_PLAYERS {
            return false;
        }
        self.occupied[(pid / 64) as usize] & (1u64 << (pid % 64)) != 0
    }

    /// Slot bound to a PID, if any
    pub fn slot_of_pid(&self, pid: u16) -> Option<usize> {
        if !self.pid_in_use(pid) {
            return None;
        }
        let slot = self.pid_slots[pid as usize];
        (slot != NO_SLOT).then_some(slot as usize)
    }

    /// Whether a logged-in player with this (lower-cased) name exists
    pub fn username_online(&self, username: &str) -> bool {
        self.players
            .iter()
            .any(|p| p.is_active() && p.username == username)
    }

    /// Allocate the next PID for `slot`, scanning round-robin from the
    /// cursor and wrapping past the top (PID 0 is never issued). Returns
    /// 0 when every PID is taken.
    pub fn allocate_pid(&mut self, slot: usize) -> u16 {
        let start = self.cursor;
        let mut pid = start;
        loop {
            if !self.pid_in_use(pid) {
                self.occupied[(pid / 64) as usize] |= 1u64 << (pid % 64);
                self.pid_slots[pid as usize] = slot as u16;
                self.count += 1;
                self.cursor = if pid as usize >= MAX_PLAYERS { 1 } else { pid + 1 };
                return pid;
            }
            pid = if pid as usize >= MAX_PLAYERS { 1 } else { pid + 1 };
            if pid == start {
                return 0;
            }
        }
    }

    /// Release a PID. When the last player leaves, the cursor rewinds so
    /// an empty server hands out low PIDs again.
    pub fn release_pid(&mut self, pid: u16) {
        if !self.pid_in_use(pid) {
            return;
        }
        self.occupied[(pid / 64) as usize] &= !(1u64 << (pid % 64));
        self.pid_slots[pid as usize] = NO_SLOT;
        self.count -= 1;
        if self.count == 0 {
            self.cursor = 1;
        }
    }
}
