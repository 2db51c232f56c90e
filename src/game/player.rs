//! Player module
//!
//! The central Player entity: connection state machine, cipher handles,
//! wire buffers, position, movement intent, update flags, and the
//! persistent profile fields. One entry per slot is created at server
//! startup and reused across sessions; a session re-initializes buffers,
//! ciphers, movement, and flags but keeps the slot.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use tracing::warn;

use crate::crypto::IsaacPair;
use crate::error::ProtocolError;
use crate::game::movement::{Direction, MovementQueue};
use crate::game::sync::player_sync::PidSet;
use crate::game::sync::update_flags::UpdateFlags;
use crate::net::buffer::{PacketBuf, MAX_PACKET_SIZE};
use crate::protocol::packets::OutgoingFrame;

/// Number of tracked skills
pub const SKILL_COUNT: usize = 21;

/// Hitpoints skill index
pub const SKILL_HITPOINTS: usize = 3;

/// Run energy ceiling (displayed as percent = energy / 100)
pub const MAX_RUN_ENERGY: u16 = 10_000;

/// Body-part slot value meaning "nothing rendered"
pub const BODY_PART_HIDDEN: u8 = 255;

/// Seconds without inbound bytes before a logged-in player is dropped
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Seconds a fresh connection may sit without completing the handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds a login attempt may take before the session is dropped
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Slot is free; no socket attached
    Disconnected,
    /// Socket attached, waiting for the handshake
    Connected,
    /// Handshake done, waiting for / verifying the login block
    LoggingIn,
    /// In the world
    LoggedIn,
}

/// A tile position in the world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// X coordinate, [0, 16383]
    pub x: u16,
    /// Z coordinate, [0, 16383]
    pub z: u16,
    /// Height level, [0, 3]
    pub height: u8,
}

impl Position {
    pub fn new(x: u16, z: u16, height: u8) -> Self {
        Self { x, z, height }
    }

    /// Default spawn tile
    pub fn spawn() -> Self {
        Self::new(3222, 3218, 0)
    }

    /// Region index X (64-tile regions)
    pub fn region_x(&self) -> u16 {
        self.x >> 6
    }

    /// Region index Z (64-tile regions)
    pub fn region_z(&self) -> u16 {
        self.z >> 6
    }

    /// Chebyshev distance to another position on the same height, or
    /// `None` across heights
    pub fn chebyshev(&self, other: &Position) -> Option<u16> {
        if self.height != other.height {
            return None;
        }
        let dx = (self.x as i32 - other.x as i32).unsigned_abs() as u16;
        let dz = (self.z as i32 - other.z as i32).unsigned_abs() as u16;
        Some(dx.max(dz))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.z, self.height)
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::spawn()
    }
}

/// Character appearance: gender, 7 identity-kit slots, 5 color slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appearance {
    /// 0 = male, 1 = female
    pub gender: u8,
    /// Identity-kit indices: head, beard, torso, arms, hands, legs, feet.
    /// 255 means the part is hidden.
    pub body: [u8; 7],
    /// Color indices: hair, torso, legs, feet, skin
    pub colors: [u8; 5],
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            gender: 0,
            body: [0, 10, 18, 26, 33, 36, 42],
            colors: [0; 5],
        }
    }
}

/// Per-skill experience and level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skills {
    /// Experience, stored ×10 like the wire format
    pub experience: [u32; SKILL_COUNT],
    /// Current levels
    pub levels: [u8; SKILL_COUNT],
}

impl Default for Skills {
    fn default() -> Self {
        let mut levels = [1u8; SKILL_COUNT];
        let mut experience = [0u32; SKILL_COUNT];
        levels[SKILL_HITPOINTS] = 10;
        experience[SKILL_HITPOINTS] = 11_540;
        Self { experience, levels }
    }
}

/// A player slot. Exists for the server's lifetime.
pub struct Player {
    // -- identity --
    /// Table index, [0, MAX_PLAYERS)
    pub slot: usize,
    /// Wire index, [1, 2047]; 0 while not logged in
    pub pid: u16,
    /// Lower-cased account name, at most 12 ASCII chars
    pub username: String,

    // -- connection --
    pub socket: Option<TcpStream>,
    pub state: ConnectionState,
    /// Set when an error or logout requires teardown at a safe point
    pub pending_disconnect: bool,
    /// Last time any inbound bytes arrived
    pub last_read: Instant,
    /// When the current connection state was entered
    pub state_entered: Instant,

    // -- ciphers --
    /// Keystream pair, alive exactly as long as the logged-in session
    pub ciphers: Option<IsaacPair>,

    // -- buffers --
    /// Inbound byte accumulator
    pub inbound: PacketBuf,
    /// Outbound pending bytes, flushed at end of tick
    pub outbound: PacketBuf,

    // -- spatial --
    pub position: Position,
    /// Anchor of the last transmitted region rebuild
    pub origin: Position,
    /// True while the client's map no longer covers the position
    pub region_changed: bool,
    /// True after login or teleport until a placement frame goes out
    pub needs_placement: bool,

    // -- movement --
    pub movement: MovementQueue,
    /// The player's run toggle
    pub run_path: bool,
    /// Effective running state: `run_path && run_energy > 0`
    pub running: bool,
    pub run_energy: u16,
    pub primary_direction: Option<Direction>,
    pub secondary_direction: Option<Direction>,

    // -- update state --
    pub flags: UpdateFlags,
    /// True while the design screen may submit
    pub allow_design: bool,
    /// PIDs currently in this viewer's local list, in insertion order
    pub local_players: Vec<u16>,
    /// Bitmap over the same set for O(1) membership checks
    pub local_pids: PidSet,

    // -- persistent profile --
    pub appearance: Appearance,
    pub design_complete: bool,
    pub skills: Skills,
    /// Lifetime ticks spent logged in
    pub playtime: u32,
    /// Packed public/private/trade chat filter settings
    pub chat_modes: u8,
    /// Wall-clock milliseconds of the previous login
    pub last_login_ms: u64,
}

impl Player {
    /// Create an empty, disconnected slot
    pub fn new(slot: usize) -> Self {
        let now = Instant::now();
        Self {
            slot,
            pid: 0,
            username: String::new(),
            socket: None,
            state: ConnectionState::Disconnected,
            pending_disconnect: false,
            last_read: now,
            state_entered: now,
            ciphers: None,
            inbound: PacketBuf::bounded(MAX_PACKET_SIZE),
            outbound: PacketBuf::bounded(MAX_PACKET_SIZE),
            position: Position::spawn(),
            origin: Position::spawn(),
            region_changed: false,
            needs_placement: false,
            movement: MovementQueue::new(),
            run_path: false,
            running: false,
            run_energy: MAX_RUN_ENERGY,
            primary_direction: None,
            secondary_direction: None,
            flags: UpdateFlags::empty(),
            allow_design: false,
            local_players: Vec::new(),
            local_pids: PidSet::new(),
            appearance: Appearance::default(),
            design_complete: false,
            skills: Skills::default(),
            playtime: 0,
            chat_modes: 0,
            last_login_ms: 0,
        }
    }

    /// Whether this slot is in the world
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::LoggedIn
    }

    /// Attach an accepted socket: Disconnected → Connected. The session
    /// scratch state is re-initialized; the persistent profile fields
    /// keep whatever the next login overwrites them with.
    pub fn attach(&mut self, socket: TcpStream) {
        debug_assert_eq!(self.state, ConnectionState::Disconnected);
        let now = Instant::now();
        self.socket = Some(socket);
        self.state = ConnectionState::Connected;
        self.pending_disconnect = false;
        self.last_read = now;
        self.state_entered = now;
        self.ciphers = None;
        self.inbound.clear();
        self.outbound.clear();
        self.movement.clear();
        self.flags = UpdateFlags::empty();
        self.primary_direction = None;
        self.secondary_direction = None;
        self.local_players.clear();
        self.local_pids.clear();
        self.username.clear();
        self.pid = 0;
    }

    /// Handshake complete: Connected → LoggingIn
    pub fn begin_login(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Connected);
        self.state = ConnectionState::LoggingIn;
        self.state_entered = Instant::now();
    }

    /// Credentials verified: LoggingIn → LoggedIn. The caller has already
    /// applied the loaded profile and assigned a PID.
    pub fn enter_world(&mut self, pid: u16, username: String, ciphers: IsaacPair) {
        debug_assert_eq!(self.state, ConnectionState::LoggingIn);
        debug_assert!(!username.is_empty());
        self.pid = pid;
        self.username = username;
        self.ciphers = Some(ciphers);
        self.state = ConnectionState::LoggedIn;
        self.state_entered = Instant::now();
        self.origin = self.position;
        self.region_changed = false;
        self.needs_placement = true;
        self.run_path = false;
        self.running = false;
        self.allow_design = !self.design_complete;
        self.flags = UpdateFlags::APPEARANCE;
    }

    /// Tear the session down: any state → Disconnected. Dropping the
    /// socket closes it with a FIN.
    pub fn detach(&mut self) {
        self.socket = None;
        self.state = ConnectionState::Disconnected;
        self.pending_disconnect = false;
        self.ciphers = None;
        self.inbound.clear();
        self.outbound.clear();
        self.movement.clear();
        self.flags = UpdateFlags::empty();
        self.primary_direction = None;
        self.secondary_direction = None;
        self.local_players.clear();
        self.local_pids.clear();
        self.state_entered = Instant::now();
    }

    /// Queue an outgoing frame on the pending buffer, masking its opcode
    /// with the outbound cipher. An overflow drops the frame and marks
    /// the session for disconnect. Silently ignored before login.
    pub fn send(&mut self, frame: &OutgoingFrame) {
        let Some(ciphers) = self.ciphers.as_mut() else {
            return;
        };
        if let Err(e) = frame.encode_into(&mut ciphers.outbound, &mut self.outbound) {
            warn!(
                slot = self.slot,
                username = %self.username,
                opcode = frame.opcode,
                error = %e,
                "dropping outgoing frame"
            );
            self.pending_disconnect = true;
        }
    }

    /// Store the run toggle and recompute the effective running state
    pub fn set_run(&mut self, run: bool) {
        self.run_path = run;
        self.running = run && self.run_energy > 0;
    }

    /// Move instantly, clearing the walk queue. The next tick emits a
    /// placement frame.
    pub fn teleport(&mut self, destination: Position) {
        self.movement.clear();
        self.position = destination;
        self.needs_placement = true;
        self.primary_direction = None;
        self.secondary_direction = None;
    }

    /// Consume up to two queued steps (two only while running), moving
    /// the position and paying run energy. Sets the tick's primary and
    /// secondary directions.
    pub fn step_movement(&mut self) -> Result<(), ProtocolError> {
        self.primary_direction = None;
        self.secondary_direction = None;

        if let Some(dir) = self.movement.advance(self.position)? {
            self.apply_step(dir);
            self.primary_direction = Some(dir);

            if self.running {
                if let Some(dir) = self.movement.advance(self.position)? {
                    self.apply_step(dir);
                    self.secondary_direction = Some(dir);
                }
            }
        }

        self.region_changed = self.position.region_x() != self.origin.region_x()
            || self.position.region_z() != self.origin.region_z();

        Ok(())
    }

    fn apply_step(&mut self, dir: Direction) {
        let (dx, dz) = dir.delta();
        self.position.x = (self.position.x as i32 + dx) as u16;
        self.position.z = (self.position.z as i32 + dz) as u16;
        if self.running {
            self.run_energy = self.run_energy.saturating_sub(1);
            if self.run_energy == 0 {
                self.running = false;
            }
        }
    }

    /// Whether the state-specific timeout has expired
    pub fn timed_out(&self, now: Instant) -> bool {
        match self.state {
            ConnectionState::Disconnected => false,
            ConnectionState::Connected => now.duration_since(self.state_entered) > CONNECT_TIMEOUT,
            ConnectionState::LoggingIn => now.duration_since(self.state_entered) > LOGIN_TIMEOUT,
            ConnectionState::LoggedIn => now.duration_since(self.last_read) > IDLE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("slot", &self.slot)
            .field("pid", &self.pid)
            .field("username", &self.username)
            .field("state", &self.state)
            .field("position", &self.position)
            .finish()
    }
}
