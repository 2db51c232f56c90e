//! End-to-end scenarios driven through the world and the packet
//! pipeline with in-memory buffers: the network layer is bypassed, the
//! cipher and framing layers are not. The test plays the client side of
//! the protocol, including its half of the ISAAC pair.

use tempfile::TempDir;

use oldscape_server::config::ServerConfig;
use oldscape_server::crypto::IsaacPair;
use oldscape_server::error::LoginResponse;
use oldscape_server::game::persistence::{PlayerProfile, SaveStore};
use oldscape_server::game::player::{ConnectionState, Position, SKILL_HITPOINTS};
use oldscape_server::game::registry::PlayerRegistry;
use oldscape_server::game::world::World;
use oldscape_server::net::buffer::PacketBuf;
use oldscape_server::protocol::handshake::{LOGIN_TYPE_NEW, REVISION};
use oldscape_server::protocol::packets::client;

const SEEDS: [u32; 4] = [0x1111, 0x2222, 0x3333, 0x4444];

/// The test's half of a session: the client cipher pair plus the slot
struct TestClient {
    slot: usize,
    ciphers: IsaacPair,
}

fn new_world() -> (World, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        data_path: dir.path().to_path_buf(),
        max_players: 16,
        ..ServerConfig::default()
    };
    (World::new(&config).unwrap(), dir)
}

/// Walk a connection through handshake + login and return the client
/// half of the cipher pair.
fn login(world: &mut World, slot: usize, username: &str) -> TestClient {
    // The acceptor normally does this; tests skip the socket.
    {
        let player = world.registry.get_mut(slot);
        assert_eq!(player.state, ConnectionState::Disconnected);
        player.state = ConnectionState::Connected;
        player.state_entered = std::time::Instant::now();
        player.pending_disconnect = false;
        player.inbound.clear();
        player.outbound.clear();
    }

    // Handshake.
    world
        .registry
        .get_mut(slot)
        .inbound
        .write_bytes(&[14, 0])
        .unwrap();
    world.process_inbound(slot).unwrap();
    assert_eq!(world.registry.get(slot).state, ConnectionState::LoggingIn);

    // Login block.
    let mut payload = PacketBuf::new();
    payload.write_u16(REVISION).unwrap();
    for seed in SEEDS {
        payload.write_u32(seed).unwrap();
    }
    payload.write_str8(username).unwrap();
    payload.write_str8("hunter2").unwrap();

    let player = world.registry.get_mut(slot);
    player.inbound.write_u8(LOGIN_TYPE_NEW).unwrap();
    player.inbound.write_u8(payload.len() as u8).unwrap();
    player.inbound.write_bytes(payload.as_slice()).unwrap();
    world.process_inbound(slot).unwrap();
    assert_eq!(world.registry.get(slot).state, ConnectionState::LoggedIn);

    // Clear the login burst so assertions see only later frames.
    world.registry.get_mut(slot).outbound.clear();

    TestClient {
        slot,
        ciphers: IsaacPair::for_client(SEEDS),
    }
}

/// Encode one client→server frame the way the real client would
fn client_frame(client: &mut TestClient, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(client.ciphers.encode_opcode(opcode));
    out.push(payload.len() as u8); // every in-game opcode here is VarU8
    out.extend_from_slice(payload);
    out
}

fn walk_payload(ctrl: u8, sx: u16, sz: u16, deltas: &[(i8, i8)]) -> Vec<u8> {
    let mut buf = PacketBuf::new();
    buf.write_u8(ctrl).unwrap();
    buf.write_u16(sx).unwrap();
    buf.write_u16(sz).unwrap();
    for &(dx, dz) in deltas {
        buf.write_i8(dx).unwrap();
        buf.write_i8(dz).unwrap();
    }
    buf.as_slice().to_vec()
}

fn feed(world: &mut World, slot: usize, bytes: &[u8]) {
    world
        .registry
        .get_mut(slot)
        .inbound
        .write_bytes(bytes)
        .unwrap();
}

#[test]
fn fresh_login_and_walk_three_east() {
    let (mut world, _dir) = new_world();
    let mut client = login(&mut world, 0, "newcomer");

    // No save on disk: defaults.
    {
        let player = world.registry.get(0);
        assert_eq!(player.position, Position::new(3222, 3218, 0));
        assert_eq!(player.skills.levels[SKILL_HITPOINTS], 10);
    }

    let frame = client_frame(
        &mut client,
        client::WALK_MAP,
        &walk_payload(0, 3222, 3218, &[(1, 0), (1, 0), (1, 0)]),
    );
    feed(&mut world, 0, &frame);
    world.process_inbound(0).unwrap();

    world.process_tick();

    let player = world.registry.get(0);
    assert_eq!(
        player.primary_direction.map(|d| d.as_u8()),
        Some(4),
        "first step east"
    );
    assert_eq!(player.position, Position::new(3223, 3218, 0));
    assert_eq!(player.movement.len(), 2);
}

#[test]
fn run_four_north() {
    let (mut world, _dir) = new_world();
    let mut client = login(&mut world, 0, "runner");
    {
        let player = world.registry.get_mut(0);
        player.position = Position::new(100, 100, 0);
        player.origin = player.position;
        player.needs_placement = false;
    }

    let frame = client_frame(
        &mut client,
        client::WALK_MAP,
        &walk_payload(1, 100, 100, &[(0, 1), (0, 1), (0, 1), (0, 1)]),
    );
    feed(&mut world, 0, &frame);
    world.process_inbound(0).unwrap();

    world.process_tick();
    world.process_tick();

    let player = world.registry.get(0);
    assert_eq!(player.position, Position::new(100, 104, 0));
    assert_eq!(player.run_energy, 9_996);
    assert!(player.movement.is_empty());
}

#[test]
fn region_crossing_flips_flag_once() {
    let (mut world, _dir) = new_world();
    let mut client = login(&mut world, 0, "wanderer");
    {
        let player = world.registry.get_mut(0);
        player.position = Position::new(3263, 3200, 0);
        player.origin = player.position;
        player.needs_placement = false;
    }

    let frame = client_frame(
        &mut client,
        client::WALK_MAP,
        &walk_payload(0, 3263, 3200, &[(1, 0)]),
    );
    feed(&mut world, 0, &frame);
    world.process_inbound(0).unwrap();

    world.process_tick();
    {
        let player = world.registry.get(0);
        assert_eq!(player.position, Position::new(3264, 3200, 0));
        // The crossing was detected and the rebuild re-anchored the map.
        assert!(player.region_changed);
        assert_eq!(player.origin, Position::new(3264, 3200, 0));
        assert!(!player.outbound.is_empty());
    }

    world.process_tick();
    assert!(!world.registry.get(0).region_changed);
}

#[test]
fn save_round_trip_and_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = SaveStore::new(dir.path().join("players"));

    let mut profile = PlayerProfile::default();
    profile.position = Position::new(3222, 3218, 0);
    profile.appearance.gender = 0;
    profile.appearance.body = [0, 10, 18, 26, 33, 36, 42];
    profile.appearance.colors = [0; 5];

    store.save("scenario", &profile).unwrap();
    assert_eq!(store.load("scenario"), profile);

    // Flip the 17th byte of the file: the checksum catches it and the
    // loader hands back a fresh profile.
    let path = store.path_for("scenario");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[16] ^= 0x80;
    std::fs::write(&path, &bytes).unwrap();
    assert_eq!(store.load("scenario"), PlayerProfile::default());
}

#[test]
fn pid_recycle_policy() {
    let mut registry = PlayerRegistry::new(16);

    assert_eq!(registry.allocate_pid(0), 1);
    assert_eq!(registry.allocate_pid(1), 2);
    assert_eq!(registry.allocate_pid(2), 3);

    registry.release_pid(2);
    // The cursor keeps moving forward from the last allocation.
    assert_eq!(registry.allocate_pid(3), 4);

    registry.release_pid(1);
    registry.release_pid(3);
    registry.release_pid(4);
    // Empty registry: allocation starts over from the bottom.
    assert_eq!(registry.allocate_pid(0), 1);
}

#[test]
fn cipher_desync_terminates_session() {
    let (mut world, _dir) = new_world();
    let mut client = login(&mut world, 0, "victim");

    // One legitimate frame first.
    let frame = client_frame(
        &mut client,
        client::WALK_MAP,
        &walk_payload(0, 3222, 3218, &[(1, 0)]),
    );
    feed(&mut world, 0, &frame);

    // Inject a single byte the client never sent. Crafted from a fork of
    // the keystream so the server reads it as a walk opcode, it consumes
    // one cipher step the client will never account for.
    let mut fork = client.ciphers.clone();
    let injected = fork.encode_opcode(client::WALK_MAP);
    feed(&mut world, 0, &[injected]);

    // The client keeps sending well-formed traffic, unaware. Everything
    // from here on decodes at shifted offsets with a shifted keystream.
    for _ in 0..60 {
        let frame = client_frame(
            &mut client,
            client::WALK_MAP,
            &walk_payload(0, 3222, 3218, &[(0, 1)]),
        );
        feed(&mut world, 0, &frame);
    }

    // The scrambled stream violates the protocol within a few frames.
    assert!(world.process_inbound(0).is_err());
}

#[test]
fn logout_button_saves_and_emits_logout_frame() {
    let (mut world, _dir) = new_world();
    let mut client = login(&mut world, 0, "quitter");
    {
        let player = world.registry.get_mut(0);
        player.position = Position::new(3205, 3209, 0);
    }

    // Button frames are Fixed(2): no length byte on the wire.
    let mut frame = Vec::new();
    frame.push(client.ciphers.encode_opcode(client::IF_BUTTON));
    frame.extend_from_slice(&2458u16.to_be_bytes());
    feed(&mut world, 0, &frame);
    world.process_inbound(0).unwrap();

    let player = world.registry.get(0);
    assert!(player.pending_disconnect);
    // The logout frame went onto the wire buffer before teardown.
    assert!(!player.outbound.is_empty());

    world.finalize_disconnect(0);
    assert_eq!(world.registry.get(0).state, ConnectionState::Disconnected);

    // The save captured the position at logout.
    let client2 = login(&mut world, 0, "quitter");
    assert_eq!(
        world.registry.get(client2.slot).position,
        Position::new(3205, 3209, 0)
    );
}

#[test]
fn world_full_refuses_with_code_seven() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        data_path: dir.path().to_path_buf(),
        max_players: 16,
        ..ServerConfig::default()
    };
    let mut world = World::new(&config).unwrap();

    // Exhaust the PID pool out-of-band, then attempt a real login.
    for _ in 1..=2047u16 {
        assert_ne!(world.registry.allocate_pid(15), 0);
    }

    {
        let player = world.registry.get_mut(0);
        player.state = ConnectionState::Connected;
        player.state_entered = std::time::Instant::now();
        player.inbound.write_bytes(&[14, 0]).unwrap();
    }
    world.process_inbound(0).unwrap();

    let mut payload = PacketBuf::new();
    payload.write_u16(REVISION).unwrap();
    for seed in SEEDS {
        payload.write_u32(seed).unwrap();
    }
    payload.write_str8("unlucky").unwrap();
    payload.write_str8("hunter2").unwrap();
    {
        let player = world.registry.get_mut(0);
        player.inbound.write_u8(LOGIN_TYPE_NEW).unwrap();
        player.inbound.write_u8(payload.len() as u8).unwrap();
        player.inbound.write_bytes(payload.as_slice()).unwrap();
    }
    world.process_inbound(0).unwrap();

    let player = world.registry.get(0);
    assert!(player.pending_disconnect);
    assert_eq!(
        player.outbound.as_slice().last(),
        Some(&LoginResponse::WorldFull.as_u8())
    );
}
