//! Per-task lock file. One runtime instance drives a task per host; the lock
//! is advisory, with stale takeover after `AGX_LOCK_STALE_MS`.

use crate::atomic::{read_json_safe, write_json_atomic};
use crate::clock::{millis_since, now_rfc3339};
use crate::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".lock";
pub const DEFAULT_LOCK_STALE_MS: i64 = 300_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub at: String,
    pub host: String,
    #[serde(default, rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

pub fn lock_stale_ms_from_env() -> i64 {
    std::env::var("AGX_LOCK_STALE_MS")
        .ok()
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|ms| *ms > 0)
        .unwrap_or(DEFAULT_LOCK_STALE_MS)
}

/// Holds the task lock for its lifetime; the file is removed on drop.
#[derive(Debug)]
pub struct TaskLock {
    path: PathBuf,
    released: bool,
}

impl TaskLock {
    /// Acquire the lock, taking over a stale or unreadable one. A fresh lock
    /// held by another process is an error.
    pub fn acquire(task_dir: &Path, stale_ms: i64) -> StoreResult<Self> {
        let path = task_dir.join(LOCK_FILE);
        if let Some(existing) = read_lock(&path) {
            let age_ms = millis_since(&existing.at);
            let stale = age_ms.is_none_or(|age| age >= stale_ms);
            if !stale {
                return Err(StoreError::LockHeld(format!(
                    "pid {} on {} since {}",
                    existing.pid, existing.host, existing.at
                )));
            }
            tracing::warn!(
                pid = existing.pid,
                host = %existing.host,
                at = %existing.at,
                "taking over stale task lock"
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            at: now_rfc3339(),
            host: hostname(),
            started_at: Some(now_rfc3339()),
        };
        write_json_atomic(&path, &info)?;
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.released {
            self.released = true;
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        self.remove();
    }
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    match read_json_safe::<LockInfo>(path) {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "treating unreadable lock as stale");
            None
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
