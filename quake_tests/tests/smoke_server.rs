use std::net::SocketAddr;
use std::sync::Arc;

use quake_server::{GameServer, ServerState};
use quake_shared::config::EngineConfig;
use quake_shared::net::bind_udp;
use quake_shared::vfs::Vfs;
use quake_tests::{init_tracing, temp_game_dir, two_room_bsp, write_map};

/// Smoke test: server can load a map from disk and run a few ticks.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    init_tracing();
    let game = temp_game_dir("smoke");
    write_map(
        &game,
        "start",
        &two_room_bsp(r#"{ "classname" "worldspawn" "message" "Smoke" }"#),
    );
    let mut vfs = Vfs::new();
    vfs.add_game_directory(&game)?;

    let socket = bind_udp(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let mut server = GameServer::new(EngineConfig::default(), Arc::new(vfs));
    assert_eq!(server.state(), ServerState::Idle);

    server.load_map("start")?;
    assert_eq!(server.state(), ServerState::Running);
    assert_eq!(server.level().map(|l| l.title()), Some("Smoke"));

    for _ in 0..3 {
        server.step(&socket, 0.05)?;
    }
    assert_eq!(server.tick(), 3);
    assert!((server.time() - 0.15).abs() < 1e-9);

    assert!(server.load_map("missing").is_err());
    assert_eq!(server.level().map(|l| l.name.as_str()), Some("start"));

    let _ = std::fs::remove_dir_all(&game);
    Ok(())
}
