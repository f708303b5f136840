//! Client ↔ server integration over the loopback hub and real UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quake_client::client::{ClientEvent, ConnState};
use quake_client::{Client, EngineHost};
use quake_server::{GameServer, SignonStage};
use quake_shared::audio::NullAudio;
use quake_shared::bsp::{parse_entity_lump, BspModel};
use quake_shared::config::{EngineConfig, NetConfig};
use quake_shared::math::Vec3;
use quake_shared::net::{bind_udp, LoopbackNet, LoopbackSocket, PacketSocket};
use quake_shared::protocol::UserCmd;
use quake_shared::render::NullRenderer;
use quake_shared::vfs::Vfs;
use quake_tests::{init_tracing, temp_game_dir, two_room_bsp, write_map};

const HALL: &str = r#"
{ "classname" "worldspawn" "message" "The Hall" }
{ "classname" "info_player_start" "origin" "10 0 -22" "angle" "180" }
{ "classname" "misc_explobox" "model" "maps/b_explob.bsp" "origin" "-16 0 -16" }
"#;

fn bare_world() -> BspModel {
    BspModel {
        name: "maps/hall.bsp".into(),
        entities: parse_entity_lump(HALL),
        ..Default::default()
    }
}

fn server() -> GameServer {
    let mut sv = GameServer::new(EngineConfig::default(), Arc::new(Vfs::new()));
    sv.spawn_level("hall", bare_world()).unwrap();
    sv
}

/// Runs client and server side by side for `ticks` steps of `dt`.
fn run(
    sv: &mut GameServer,
    sv_socket: &LoopbackSocket,
    client: &mut Client,
    cl_socket: &LoopbackSocket,
    now: &mut f64,
    ticks: usize,
) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    for _ in 0..ticks {
        *now += 0.05;
        sv.step(sv_socket, 0.05).unwrap();
        events.extend(client.pump(cl_socket, *now).unwrap());
    }
    events
}

fn signed_on() -> (LoopbackNet, LoopbackSocket, LoopbackSocket, GameServer, Client, f64) {
    let net = LoopbackNet::new();
    let sv_socket = net.bind(26000);
    let cl_socket = net.bind(0);
    let mut sv = server();
    let mut client = Client::new("ranger", &NetConfig::default());
    client
        .connect(&cl_socket, sv_socket.local_addr().unwrap(), 0.0)
        .unwrap();
    let mut now = 0.0;
    let events = run(&mut sv, &sv_socket, &mut client, &cl_socket, &mut now, 20);
    assert!(events.contains(&ClientEvent::Active), "{events:?}");
    (net, sv_socket, cl_socket, sv, client, now)
}

#[test]
fn client_signs_on_and_receives_entities() {
    init_tracing();
    let (_net, sv_socket, cl_socket, mut sv, mut client, mut now) = signed_on();

    assert!(client.is_active());
    assert_eq!(sv.client_stage(0), Some(SignonStage::Active));
    assert_eq!(sv.client_name(0), Some("ranger"));
    assert_eq!(client.server_info.as_ref().map(|i| i.level_name.as_str()), Some("The Hall"));
    assert_eq!(client.view_entity, 1);
    assert_eq!(client.view_angles, Vec3::new(0.0, 180.0, 0.0));
    assert_eq!(client.light_styles.pattern(0), Some("m"));

    run(&mut sv, &sv_socket, &mut client, &cl_socket, &mut now, 2);
    let player = client.entities.get(1).expect("player entity");
    assert_eq!(player.current.origin, Vec3::new(10.0, 0.0, -22.0));
    let bx = client.entities.get(5).expect("box entity");
    assert_eq!(bx.current.origin, Vec3::new(-16.0, 0.0, -16.0));
    assert_eq!(client.entities.active_count(), 2);
}

#[test]
fn movement_commands_move_the_player() {
    init_tracing();
    let (_net, sv_socket, cl_socket, mut sv, mut client, mut now) = signed_on();

    let cmd = UserCmd {
        view_angles: Vec3::ZERO,
        forward_move: 160.0,
        ..Default::default()
    };
    for _ in 0..4 {
        client.send_cmd(&cl_socket, &cmd);
        run(&mut sv, &sv_socket, &mut client, &cl_socket, &mut now, 1);
    }
    let x = client.entities.get(1).map(|e| e.current.origin.x).unwrap_or_default();
    assert!(x > 10.0, "player did not move: x = {x}");
}

#[test]
fn server_events_reach_the_client() {
    init_tracing();
    let (_net, sv_socket, cl_socket, mut sv, mut client, mut now) = signed_on();

    assert!(sv.start_sound(5, 2, "misc/talk.wav", Vec3::new(-16.0, 0.0, -16.0)));
    sv.damage(0, 0, 15, Vec3::new(100.0, 0.0, 0.0));
    sv.center_print(0, "Welcome to the hall");
    sv.set_light_style(0, "a").unwrap();

    let events = run(&mut sv, &sv_socket, &mut client, &cl_socket, &mut now, 4);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::Sound(s) if s.entity == 5 && s.sound == 1)));
    assert!(events.contains(&ClientEvent::Damage {
        armor: 0,
        blood: 15,
        from: Vec3::new(100.0, 0.0, 0.0)
    }));
    assert!(events.contains(&ClientEvent::CenterPrint("Welcome to the hall".into())));
    assert_eq!(client.client_data.health, 85);
    assert_eq!(client.light_styles.pattern(0), Some("a"));
}

#[test]
fn level_change_signs_on_again() {
    init_tracing();
    let (_net, sv_socket, cl_socket, mut sv, mut client, mut now) = signed_on();

    let mut next = bare_world();
    next.name = "maps/cellar.bsp".into();
    sv.spawn_level("cellar", next).unwrap();

    let events = run(&mut sv, &sv_socket, &mut client, &cl_socket, &mut now, 20);
    let level = events.iter().find_map(|e| match e {
        ClientEvent::LevelChange(info) => Some(info.models[0].clone()),
        _ => None,
    });
    assert_eq!(level.as_deref(), Some("maps/cellar.bsp"));
    assert!(events.contains(&ClientEvent::Active));
    assert!(client.is_active());
}

#[test]
fn shutdown_disconnects_clients() {
    init_tracing();
    let (_net, sv_socket, cl_socket, mut sv, mut client, now) = signed_on();

    sv.shutdown(&sv_socket);
    let events = client.pump(&cl_socket, now + 0.05).unwrap();
    assert!(events.contains(&ClientEvent::Disconnected {
        reason: "server disconnected".into()
    }));
    assert_eq!(client.state(), ConnState::Disconnected);
    assert_eq!(client.entities.active_count(), 0);
    assert_eq!(sv.client_count(), 0);
}

#[test]
fn client_disconnect_frees_the_slot() {
    init_tracing();
    let (_net, sv_socket, cl_socket, mut sv, mut client, mut now) = signed_on();

    client.disconnect(Some(&cl_socket), "user disconnect");
    run(&mut sv, &sv_socket, &mut client, &cl_socket, &mut now, 1);
    assert_eq!(sv.client_count(), 0);
    assert!(sv.level().is_some_and(|l| l.edicts[1].free));
}

#[test]
fn host_loads_the_world_and_renders() {
    init_tracing();
    let game = temp_game_dir("host");
    let bsp = two_room_bsp(HALL);
    write_map(&game, "hall", &bsp);
    let mut vfs = Vfs::new();
    vfs.add_game_directory(&game).unwrap();

    let net = LoopbackNet::new();
    let sv_socket = net.bind(26000);
    let mut sv = GameServer::new(EngineConfig::default(), Arc::new(Vfs::new()));
    sv.spawn_level("hall", BspModel::load("maps/hall.bsp", &bsp).unwrap())
        .unwrap();

    let mut host = EngineHost::new(
        EngineConfig::default(),
        Arc::new(vfs),
        Box::new(net.bind(0)),
        Box::new(NullRenderer::default()),
        Box::new(NullAudio),
    );
    host.exec("connect local").unwrap();
    for _ in 0..40 {
        host.frame(0.05).unwrap();
        sv.step(&sv_socket, 0.05).unwrap();
    }

    assert!(host.client.is_active());
    assert_eq!(host.world().map(|w| w.name.as_str()), Some("maps/hall.bsp"));
    let view = host.last_view().copied().expect("a rendered view");
    assert!((view.origin.x - 10.0).abs() < 2.0, "{view:?}");

    host.exec("disconnect").unwrap();
    assert!(host.world().is_none());
    sv.step(&sv_socket, 0.05).unwrap();
    assert_eq!(sv.client_count(), 0);

    let _ = std::fs::remove_dir_all(&game);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_sign_on() -> anyhow::Result<()> {
    init_tracing();
    let localhost: SocketAddr = ([127, 0, 0, 1], 0).into();
    let sv_socket = bind_udp(localhost).await?;
    let cl_socket = bind_udp(localhost).await?;
    let server_addr = sv_socket.local_addr()?;

    let mut sv = server();
    let mut client = Client::new("udp", &NetConfig::default());
    client.connect(&cl_socket, server_addr, 0.0)?;

    let mut now = 0.0;
    for _ in 0..200 {
        now += 0.02;
        sv.step(&sv_socket, 0.02)?;
        client.pump(&cl_socket, now)?;
        if client.is_active() && client.entities.active_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(client.is_active());
    assert_eq!(sv.client_name(0), Some("udp"));
    assert!(client.entities.get(1).is_some());

    client.disconnect(Some(&cl_socket), "done");
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        sv.step(&sv_socket, 0.02)?;
        if sv.client_count() == 0 {
            break;
        }
    }
    assert_eq!(sv.client_count(), 0);
    Ok(())
}
