//! Filesystem layout under `<home>/.swarm`.
//!
//! `SWARM_HOME` overrides the root, which tests rely on to stay hermetic.

use std::path::{Path, PathBuf};

pub fn swarm_home() -> PathBuf {
    if let Ok(dir) = std::env::var("SWARM_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".swarm")
}

pub fn state_file(root: &Path) -> PathBuf {
    root.join("state.json")
}

pub fn lock_file(root: &Path) -> PathBuf {
    root.join("state.lock")
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

pub fn log_file(root: &Path, id: &str) -> PathBuf {
    logs_dir(root).join(format!("{id}.log"))
}

pub fn sem_dir(root: &Path) -> PathBuf {
    root.join("sem")
}

pub fn shared_dir(root: &Path, run: &str, iteration: u32) -> PathBuf {
    root.join("shared").join(format!("{run}-{iteration}"))
}

/// Create the directory tree the store and runner expect.
pub fn ensure_layout(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    std::fs::create_dir_all(logs_dir(root))?;
    std::fs::create_dir_all(sem_dir(root))?;
    Ok(())
}
