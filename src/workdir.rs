//! Process working-directory switching for runners that rely on the gateway's cwd.
//!
//! The cwd is process-global, so every switch happens under one async lock and
//! is undone when the guard drops, whichever way the run ends.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::Result;

fn cwd_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

pub struct WorkdirGuard {
    previous: PathBuf,
    _lock: MutexGuard<'static, ()>,
}

impl WorkdirGuard {
    /// Waits for exclusive use of the process cwd, then switches into `dir`.
    pub async fn enter(dir: &Path) -> Result<Self> {
        let lock = cwd_lock().lock().await;
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        tracing::debug!(from = %previous.display(), to = %dir.display(), "entered lesson directory");
        Ok(Self {
            previous,
            _lock: lock,
        })
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if let Err(err) = std::env::set_current_dir(&self.previous) {
            tracing::error!(dir = %self.previous.display(), error = %err, "failed to restore working directory");
        }
    }
}
