//! World module
//!
//! The per-tick orchestrator and the inbound packet pipeline. The world
//! owns the slot table, the save store, and the credential vault; the
//! network layer owns the sockets and calls in here with whole buffers.
//!
//! Tick order is fixed: every player's movement advances before any
//! visibility is computed, so all viewers observe the same start-of-tick
//! snapshot; frames are built after both phases complete.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::crypto::IsaacPair;
use crate::error::{GameError, LoginResponse, ProtocolError, Result, ServerError};
use crate::game::persistence::{PlayerProfile, SaveStore};
use crate::game::player::{ConnectionState, Player, SKILL_COUNT};
use crate::game::registry::PlayerRegistry;
use crate::game::sync::player_sync::{build_player_info, collect_snapshots, visible_pids};
use crate::net::buffer::MAX_PACKET_SIZE;
use crate::protocol::game::{dispatch, Dispatch, DESIGN_INTERFACE, SIDEBAR_INTERFACES};
use crate::protocol::handshake::{self, CredentialVault};
use crate::protocol::packets::{self, incoming_kind, FrameKind};

/// Standard game tick length in milliseconds
pub const TICK_RATE_MS: u64 = 600;

/// Ticks between periodic saves of every logged-in player (60 s)
const AUTOSAVE_INTERVAL_TICKS: u64 = 100;

/// The game world: slot table, persistence, and the tick counter
pub struct World {
    pub registry: PlayerRegistry,
    store: SaveStore,
    vault: CredentialVault,
    /// Completed tick count
    pub tick: u64,
}

impl World {
    /// Build a world from configuration. Fails when the data directory
    /// cannot be created.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_path)
            .map_err(|e| ServerError::Config(format!("cannot create data directory: {e}")))?;
        Ok(Self {
            registry: PlayerRegistry::new(config.max_players),
            store: SaveStore::new(config.data_path.join("players")),
            vault: CredentialVault::new(config.data_path.join("accounts")),
            tick: 0,
        })
    }

    /// Number of players currently in the world
    pub fn player_count(&self) -> usize {
        self.registry.iter().filter(|p| p.is_active()).count()
    }

    // ============ Inbound pipeline ============

    /// Consume whatever has accumulated on a player's inbound buffer.
    /// Any error is session-fatal; the caller tears the session down.
    pub fn process_inbound(&mut self, slot: usize) -> Result<()> {
        loop {
            match self.registry.get(slot).state {
                ConnectionState::Connected => {
                    if !self.process_hello(slot)? {
                        return Ok(());
                    }
                }
                ConnectionState::LoggingIn => {
                    if !self.process_login(slot)? {
                        return Ok(());
                    }
                }
                ConnectionState::LoggedIn => return self.process_frames(slot),
                ConnectionState::Disconnected => return Ok(()),
            }
        }
    }

    /// Handshake parse; true when the state advanced
    fn process_hello(&mut self, slot: usize) -> Result<bool> {
        let player = self.registry.get_mut(slot);
        match handshake::parse_hello(&mut player.inbound)? {
            None => Ok(false),
            Some(hello) => {
                let nonce: u64 = rand::random();
                player
                    .outbound
                    .write_bytes(&handshake::hello_response(nonce))?;
                player.begin_login();
                debug!(slot, name_hash = hello.name_hash, "handshake complete");
                Ok(true)
            }
        }
    }

    /// Login block parse and credential verification; true when the
    /// state advanced
    fn process_login(&mut self, slot: usize) -> Result<bool> {
        let parsed = {
            let player = self.registry.get_mut(slot);
            handshake::parse_login(&mut player.inbound)
        };
        let request = match parsed {
            Ok(None) => return Ok(false),
            Ok(Some(request)) => request,
            Err(e) => {
                // The client still gets its one-byte response code before
                // the session dies.
                let code = match &e {
                    ProtocolError::BadRevision { .. } => LoginResponse::GameUpdated,
                    _ => LoginResponse::CouldNotComplete,
                };
                self.refuse_login(slot, code);
                return Err(e.into());
            }
        };

        if self.registry.username_online(&request.username) {
            self.refuse_login(slot, LoginResponse::AlreadyLoggedIn);
            return Ok(false);
        }

        let verified = match self
            .vault
            .verify_or_register(&request.username, &request.password)
        {
            Ok(v) => v,
            Err(e) => {
                warn!(username = %request.username, error = %e, "credential check failed");
                self.refuse_login(slot, LoginResponse::CouldNotComplete);
                return Ok(false);
            }
        };
        if !verified {
            self.refuse_login(slot, LoginResponse::InvalidCredentials);
            return Ok(false);
        }

        let pid = self.registry.allocate_pid(slot);
        if pid == 0 {
            self.refuse_login(slot, LoginResponse::WorldFull);
            return Ok(false);
        }

        let profile = self.store.load(&request.username);
        let player = self.registry.get_mut(slot);
        profile.apply_to(player);
        player.last_login_ms = Utc::now().timestamp_millis() as u64;
        player.enter_world(pid, request.username.clone(), IsaacPair::new(request.seeds));

        // Raw response; the client switches to ciphered frames after it.
        player
            .outbound
            .write_bytes(&[LoginResponse::Success.as_u8(), 0, 0])?;

        Self::send_login_burst(player);
        info!(
            slot,
            pid,
            username = %request.username,
            reconnect = request.reconnect,
            position = %player.position,
            "player entered world"
        );
        Ok(true)
    }

    /// The initial ciphered packet burst after a successful login
    fn send_login_burst(player: &mut Player) {
        let position = player.position;
        player.send(&packets::rebuild_region(position.x, position.z));
        player.send(&packets::run_energy(player.run_energy));
        for skill in 0..SKILL_COUNT {
            let frame = packets::update_stat(
                skill as u8,
                player.skills.levels[skill],
                player.skills.experience[skill],
            );
            player.send(&frame);
        }
        if player.allow_design {
            player.send(&packets::open_main_interface(DESIGN_INTERFACE));
        } else {
            for (tab, interface) in SIDEBAR_INTERFACES {
                player.send(&packets::sidebar_tab(tab, interface));
            }
        }
        player.send(&packets::game_message("Welcome to Oldscape."));
    }

    /// Write a one-byte refusal and mark the session for teardown
    fn refuse_login(&mut self, slot: usize, code: LoginResponse) {
        let player = self.registry.get_mut(slot);
        let _ = player.outbound.write_bytes(&[code.as_u8()]);
        player.pending_disconnect = true;
        debug!(slot, code = code.as_u8(), "login refused");
    }

    /// The in-game frame loop: peek the masked opcode, resolve its
    /// length from the table, and only commit the cipher step once the
    /// whole frame is buffered. The cipher is never rewound.
    fn process_frames(&mut self, slot: usize) -> Result<()> {
        let mut logout = false;
        {
            let player = self.registry.get_mut(slot);
            loop {
                if player.pending_disconnect || player.inbound.is_empty() {
                    break;
                }

                let buffered = player.inbound.as_slice();
                let raw_opcode = buffered[0];
                let Some(ciphers) = player.ciphers.as_mut() else {
                    // LoggedIn without ciphers cannot happen through the
                    // state machine; fail the session rather than guess.
                    return Err(GameError::NotLoggedIn(slot).into());
                };

                // Provisional decrypt: peek the keystream word without
                // consuming it so a half-arrived frame leaves the cipher
                // untouched.
                let key = (ciphers.inbound.peek() & 0xFF) as u8;
                let opcode = raw_opcode.wrapping_sub(key);
                let kind = incoming_kind(opcode);

                let header = kind.header_len();
                if buffered.len() < header {
                    break;
                }
                let len = match kind {
                    FrameKind::Fixed(n) => n,
                    FrameKind::VarU8 => buffered[1] as usize,
                    FrameKind::VarU16 => ((buffered[1] as usize) << 8) | buffered[2] as usize,
                };
                if len > MAX_PACKET_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        opcode,
                        len,
                        max: MAX_PACKET_SIZE,
                    }
                    .into());
                }
                if buffered.len() < header + len {
                    break;
                }

                // Commit: one keystream step per decoded opcode.
                let committed = (ciphers.inbound.next_u32() & 0xFF) as u8;
                debug_assert_eq!(committed, key);

                let payload = buffered[header..header + len].to_vec();
                player.inbound.consume_front(header + len);

                match dispatch(player, opcode, &payload)? {
                    Dispatch::Continue => {}
                    Dispatch::Logout => {
                        logout = true;
                        break;
                    }
                }
            }
        }

        if logout {
            self.request_logout(slot);
        }
        Ok(())
    }

    // ============ Session lifecycle ============

    /// Clean logout: save, send the logout frame, mark for teardown
    pub fn request_logout(&mut self, slot: usize) {
        self.save_player(slot);
        let player = self.registry.get_mut(slot);
        player.send(&packets::logout());
        player.pending_disconnect = true;
    }

    /// Persist one logged-in player
    pub fn save_player(&mut self, slot: usize) {
        let player = self.registry.get(slot);
        if !player.is_active() {
            return;
        }
        let username = player.username.clone();
        let profile = PlayerProfile::from_player(player);
        if let Err(e) = self.store.save(&username, &profile) {
            warn!(slot, username = %username, error = %e, "save failed");
        }
    }

    /// Persist every logged-in player, ascending slot order
    pub fn save_all(&mut self) {
        for slot in 0..self.registry.capacity() {
            self.save_player(slot);
        }
    }

    /// Final teardown: save, release the PID, drop the socket. The slot
    /// becomes available to the acceptor again.
    pub fn finalize_disconnect(&mut self, slot: usize) {
        let (was_active, pid, username) = {
            let player = self.registry.get(slot);
            if player.state == ConnectionState::Disconnected {
                return;
            }
            (player.is_active(), player.pid, player.username.clone())
        };

        if was_active {
            self.save_player(slot);
            self.registry.release_pid(pid);
            info!(slot, pid, username = %username, "player left world");
        } else {
            debug!(slot, "connection closed before login");
        }
        self.registry.get_mut(slot).detach();
    }

    // ============ Tick ============

    /// One 600 ms simulation step
    pub fn process_tick(&mut self) {
        self.tick += 1;

        // (a) Movement: every player advances before any visibility runs.
        for slot in 0..self.registry.capacity() {
            let player = self.registry.get_mut(slot);
            if !player.is_active() || player.pending_disconnect {
                continue;
            }
            if let Err(e) = player.step_movement() {
                warn!(slot, error = %e, "movement violation");
                player.pending_disconnect = true;
            }
        }

        // (b) Visibility, from one shared start-of-tick snapshot.
        let snapshots = collect_snapshots(&self.registry);
        let mut viewports: Vec<(usize, Vec<u16>)> = Vec::with_capacity(snapshots.len());
        for snap in &snapshots {
            let visible = visible_pids(snap.pid, snap.position, &snapshots);
            viewports.push((snap.slot, visible));
        }

        // (c) Frame emission: region rebuild first so placement bits are
        // relative to the fresh anchor, then the player-info delta.
        for (slot, visible) in viewports {
            let player = self.registry.get_mut(slot);
            if player.region_changed {
                let position = player.position;
                player.send(&packets::rebuild_region(position.x, position.z));
                player.origin = position;
            }
            let frame = build_player_info(player, &snapshots, &visible);
            player.send(&frame);
        }

        // (d) Post-emission bookkeeping.
        for slot in 0..self.registry.capacity() {
            let player = self.registry.get_mut(slot);
            if !player.is_active() {
                continue;
            }
            player.flags.clear_transient();
            player.needs_placement = false;
            player.playtime = player.playtime.wrapping_add(1);
        }

        if self.tick % AUTOSAVE_INTERVAL_TICKS == 0 {
            self.save_all();
        }
    }
}
