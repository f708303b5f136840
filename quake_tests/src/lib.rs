//! Shared fixtures for the integration tests.

use std::path::{Path, PathBuf};

pub use quake_shared::fixtures::two_room_bsp;

/// Installs a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Creates an empty game directory unique to `tag` and this process.
pub fn temp_game_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("quake_tests_{tag}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("maps")).unwrap_or_else(|e| panic!("create {}: {e}", dir.display()));
    dir
}

/// Writes `data` as `maps/<name>.bsp` under `game`.
pub fn write_map(game: &Path, name: &str, data: &[u8]) {
    let path = game.join("maps").join(format!("{name}.bsp"));
    std::fs::write(&path, data).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
}
