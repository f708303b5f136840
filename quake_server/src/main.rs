//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p quake_server -- [--addr 0.0.0.0:26000] [--tick-hz 20] [--basedir .]
//!                                [--game id1] [--maxclients 4] [--config server.json] [--map start]
//!
//! The server listens for client connections, runs a fixed timestep
//! simulation, and sends every spawned client a datagram per tick.
//!
//! Console commands:
//!   map <mapname>              - Load maps/<mapname>.bsp
//!   status                     - Show server status
//!   kick <name | #slot>        - Drop a player
//!   say <text>                 - Message every player
//!   lightstyle <n> <pattern>   - Change a light style
//!   quit                       - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quake_server::GameServer;
use quake_shared::config::EngineConfig;
use quake_shared::net::bind_udp;
use quake_shared::vfs::Vfs;
use tokio::sync::mpsc;
use tracing::{error, info};

struct Args {
    config: EngineConfig,
    map: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = EngineConfig::default();
    let mut map = None;

    if let Some(i) = args.iter().position(|a| a == "--config") {
        let path = args.get(i + 1).context("--config needs a path")?;
        let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
        cfg = EngineConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?;
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(20);
                i += 2;
            }
            "--basedir" if i + 1 < args.len() => {
                cfg.base_dir = args[i + 1].clone();
                i += 2;
            }
            "--game" if i + 1 < args.len() => {
                cfg.game_dir = args[i + 1].clone();
                i += 2;
            }
            "--maxclients" if i + 1 < args.len() => {
                cfg.net.max_clients = args[i + 1].parse().unwrap_or(cfg.net.max_clients);
                i += 2;
            }
            "--map" if i + 1 < args.len() => {
                map = Some(args[i + 1].clone());
                i += 2;
            }
            "--config" => i += 2,
            _ => i += 1,
        }
    }
    Ok(Args { config: cfg, map })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { config: cfg, map } = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, game = %cfg.game_dir, "Starting server");

    let mut vfs = Vfs::new();
    let game = Path::new(&cfg.base_dir).join(&cfg.game_dir);
    vfs.add_game_directory(&game)
        .with_context(|| format!("game directory {}", game.display()))?;

    let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
    let socket = bind_udp(addr).await?;
    info!(local = %socket.local_addr()?, "Server listening");

    let tick_hz = cfg.tick_hz.max(1);
    let mut server = GameServer::new(cfg, Arc::new(vfs));
    if let Some(map) = map {
        server.load_map(&map).with_context(|| format!("map {map}"))?;
    }

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'map <mapname>' to load a map, 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let tick = Duration::from_secs_f64(1.0 / f64::from(tick_hz));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
        if let Err(e) = server.step(&socket, tick.as_secs_f64()) {
            error!(error = %e, "server step failed");
            break;
        }
        if server.quit_requested() {
            break;
        }
    }

    server.shutdown(&socket);
    Ok(())
}
