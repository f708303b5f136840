//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p quake_client -- [--addr 127.0.0.1:26000] [--basedir .] [--game id1]
//!                                [--name player] [--config client.json] [--connect]
//!
//! Runs the engine host headless (null renderer and audio) at a fixed
//! frame rate. Lines typed on stdin go to the console, so `connect`,
//! `disconnect`, `bind`, cvars and server commands all work.

use std::backtrace::Backtrace;
use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use quake_client::EngineHost;
use quake_shared::audio::NullAudio;
use quake_shared::config::EngineConfig;
use quake_shared::net::bind_udp;
use quake_shared::render::NullRenderer;
use quake_shared::vfs::Vfs;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const FRAME_RATE: f64 = 72.0;
/// Pack handles unused for this long are closed.
const VFS_IDLE: Duration = Duration::from_secs(30);
const CRASH_FILE: &str = "crash.txt";

struct Args {
    config: EngineConfig,
    autoconnect: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = EngineConfig::default();
    let mut autoconnect = false;

    // A config file is applied first so flags override it.
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
            "--basedir" if i + 1 < args.len() => {
                cfg.base_dir = args[i + 1].clone();
                i += 2;
            }
            "--game" if i + 1 < args.len() => {
                cfg.game_dir = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--connect" => {
                autoconnect = true;
                i += 1;
            }
            "--config" => i += 2,
            _ => i += 1,
        }
    }
    Ok(Args {
        config: cfg,
        autoconnect,
    })
}

/// Writes a diagnostic dump for any panic before the default hook runs.
fn install_crash_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        let report = format!(
            "client crashed\n{panic}\n\nbacktrace:\n{}",
            Backtrace::force_capture()
        );
        if let Err(e) = std::fs::write(CRASH_FILE, report) {
            eprintln!("could not write {CRASH_FILE}: {e}");
        }
        default_hook(panic);
    }));
}

fn open_vfs(cfg: &EngineConfig) -> anyhow::Result<Vfs> {
    let mut vfs = Vfs::new();
    let game = Path::new(&cfg.base_dir).join(&cfg.game_dir);
    vfs.add_game_directory(&game)
        .with_context(|| format!("game directory {}", game.display()))?;
    Ok(vfs)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    install_crash_hook();

    let Args {
        config: cfg,
        autoconnect,
    } = parse_args()?;
    info!(server = %cfg.server_addr, game = %cfg.game_dir, "Starting client");

    let vfs = Arc::new(open_vfs(&cfg)?);

    // Reaper for idle pack handles.
    let reaper_vfs = Arc::clone(&vfs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(VFS_IDLE / 2);
        loop {
            interval.tick().await;
            reaper_vfs.reap_idle(Instant::now(), VFS_IDLE);
        }
    });

    // Client ports are picked at random so several clients can share a host.
    let port = rand::thread_rng().gen_range(27001..28000);
    let local: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = match bind_udp(local).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%local, "{e:#}; using an ephemeral port");
            bind_udp(([0, 0, 0, 0], 0).into()).await?
        }
    };

    let mut host = EngineHost::new(
        cfg,
        vfs,
        Box::new(socket),
        Box::new(NullRenderer::default()),
        Box::new(NullAudio),
    );
    if autoconnect {
        host.console.add_text("connect local\n");
    }

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / FRAME_RATE));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }

        while let Ok(line) = console_rx.try_recv() {
            if let Err(e) = host.exec(&line) {
                println!("{e:#}");
            }
        }

        let now = Instant::now();
        let dt = now.duration_since(last).as_secs_f64();
        last = now;
        if let Err(e) = host.frame(dt) {
            error!(error = %e, "session ended");
            println!("Error: {e}");
        }

        if host.quit_requested() {
            break;
        }
    }

    host.shutdown();
    Ok(())
}
