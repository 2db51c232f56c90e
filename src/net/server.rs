//! Game server main loop
//!
//! One current-thread task owns everything: the listener, the slot
//! table, and the world. Sockets are non-blocking; the loop wakes about
//! once a millisecond to drain them, runs a 600 ms tick against a
//! non-drifting anchor (a late tick does not cause catch-up ticks), and
//! flushes pending bytes best-effort. Nothing in here blocks and no
//! game state is behind a lock.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::game::world::{World, TICK_RATE_MS};

/// Listen backlog for the game socket
const LISTEN_BACKLOG: u32 = 10;

/// How often the loop polls sockets
const PACE_INTERVAL: Duration = Duration::from_millis(1);

/// Per-call scratch for draining sockets
const READ_CHUNK: usize = 2_048;

/// The game server: listener plus world, driven by [`GameServer::run`]
pub struct GameServer {
    listener: TcpListener,
    world: World,
    tick_interval: Duration,
}

impl GameServer {
    /// Bind the listen socket and build the world. Any failure here is
    /// an init failure; the process should exit non-zero.
    pub async fn init(config: ServerConfig) -> Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
            .parse()
            .map_err(|e| ServerError::Config(format!("bad listen address: {e}")))?;

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        let world = World::new(&config)?;
        info!(
            port = config.port,
            max_players = config.max_players,
            "game server listening"
        );

        Ok(Self {
            listener,
            world,
            tick_interval: Duration::from_millis(config.tick_rate_ms.max(1)),
        })
    }

    /// Port actually bound (useful when configured as 0)
    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    /// Run until the shutdown channel fires, then drain: save every
    /// player, push out pending bytes, close sockets.
    pub async fn run(&mut self, shutdown_rx: &mut broadcast::Receiver<()>) {
        let mut pace = tokio::time::interval(PACE_INTERVAL);
        pace.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick_anchor = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = pace.tick() => {
                    self.pump_sockets();

                    // Anchored, non-drifting tick: fire once when due and
                    // re-anchor to now. No catch-up ticks.
                    if tick_anchor.elapsed() >= self.tick_interval {
                        self.world.process_tick();
                        tick_anchor = Instant::now();
                    }

                    self.flush_all();
                    self.teardown_pending();
                }
            }
        }

        self.drain_and_close();
    }

    /// Place an accepted connection into the lowest free slot. With no
    /// free slot the socket is dropped on the floor, which closes it.
    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let Some(slot) = self.world.registry.find_free_slot() else {
            info!(%addr, "no free slot, dropping connection");
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "set_nodelay failed");
        }
        self.world.registry.get_mut(slot).attach(stream);
        info!(slot, %addr, "connection accepted");
    }

    /// Drain every socket into its player's accumulator, feed the
    /// pipeline, and apply the per-state timeouts.
    fn pump_sockets(&mut self) {
        let now = Instant::now();
        for slot in 0..self.world.registry.capacity() {
            {
                let player = self.world.registry.get_mut(slot);
                let Some(socket) = player.socket.as_ref() else {
                    continue;
                };

                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match socket.try_read(&mut chunk) {
                        Ok(0) => {
                            // Clean EOF.
                            debug!(slot, "peer closed connection");
                            player.pending_disconnect = true;
                            break;
                        }
                        Ok(n) => {
                            player.last_read = now;
                            if let Err(e) = player.inbound.write_bytes(&chunk[..n]) {
                                warn!(slot, error = %e, "inbound accumulator overflow");
                                player.pending_disconnect = true;
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            debug!(slot, error = %e, "read failed");
                            player.pending_disconnect = true;
                            break;
                        }
                    }
                }

                if !player.pending_disconnect && player.timed_out(now) {
                    info!(slot, state = ?player.state, "connection timed out");
                    player.pending_disconnect = true;
                }
                if player.pending_disconnect {
                    continue;
                }
            }

            if let Err(e) = self.world.process_inbound(slot) {
                warn!(slot, error = %e, "protocol error");
                self.world.registry.get_mut(slot).pending_disconnect = true;
            }
        }
    }

    /// Best-effort send of every pending outbound buffer. Partial writes
    /// stay queued for the next iteration.
    fn flush_all(&mut self) {
        for slot in 0..self.world.registry.capacity() {
            let player = self.world.registry.get_mut(slot);
            let Some(socket) = player.socket.as_ref() else {
                continue;
            };
            while !player.outbound.is_empty() {
                match socket.try_write(player.outbound.as_slice()) {
                    Ok(0) => {
                        player.pending_disconnect = true;
                        break;
                    }
                    Ok(n) => player.outbound.consume_front(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(slot, error = %e, "write failed");
                        player.pending_disconnect = true;
                        break;
                    }
                }
            }
        }
    }

    /// Tear down every session marked for disconnect
    fn teardown_pending(&mut self) {
        for slot in 0..self.world.registry.capacity() {
            if self.world.registry.get(slot).pending_disconnect {
                self.world.finalize_disconnect(slot);
            }
        }
    }

    /// Shutdown path: persist everyone, flush, close sockets
    fn drain_and_close(&mut self) {
        let active: Vec<usize> = (0..self.world.registry.capacity())
            .filter(|&slot| self.world.registry.get(slot).is_active())
            .collect();
        for &slot in &active {
            self.world.request_logout(slot);
        }
        self.flush_all();
        for slot in 0..self.world.registry.capacity() {
            self.world.finalize_disconnect(slot);
        }
        info!("all sessions closed");
    }
}
