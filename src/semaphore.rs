//! Cross-process counting semaphores backed by lock files.
//!
//! A semaphore named `build` with 3 slots owns `sem/build.0.lock` ..
//! `sem/build.2.lock`; holding any slot's advisory lock holds a permit.
//! Independent CLI invocations therefore share the same limit. Permits
//! release on guard drop, or with the process if it dies.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;

use fs2::FileExt;

use swarm_core::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct NamedSemaphore {
    dir: PathBuf,
    name: String,
    slots: u32,
}

pub struct SemaphoreGuard {
    file: std::fs::File,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl NamedSemaphore {
    /// `slots = 0` means unlimited: acquire returns immediately with no
    /// permit held.
    pub fn new(dir: impl Into<PathBuf>, name: &str, slots: u32) -> Self {
        Self {
            dir: dir.into(),
            name: sanitize(name),
            slots,
        }
    }

    /// Claim any free slot without blocking.
    pub fn try_acquire(&self) -> Result<Option<SemaphoreGuard>> {
        std::fs::create_dir_all(&self.dir)?;
        for slot in 0..self.slots {
            let path = self.dir.join(format!("{}.{slot}.lock", self.name));
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| Error::LockAcquireFailed(e.to_string()))?;
            if file.try_lock_exclusive().is_ok() {
                return Ok(Some(SemaphoreGuard { file }));
            }
        }
        Ok(None)
    }

    /// Block (polling) until a slot frees up. Returns `None` when the
    /// semaphore is unlimited.
    pub async fn acquire(&self) -> Result<Option<SemaphoreGuard>> {
        if self.slots == 0 {
            return Ok(None);
        }
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(Some(guard));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
