//! Durable per-worker-directory locks.
//!
//! A lock file records which process owns an identity's pane. Acquisition
//! happens before the session is created, release after it is killed, so a
//! live lock means "someone is (or believes they are) running this agent".
//! Any process may reap a lock whose pid is dead.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HordeError;
use crate::subprocess::pid_alive;

pub const LOCK_FILE: &str = ".hd.lock";

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    /// A lock is stale iff its owning process is gone.
    pub fn is_stale(&self) -> bool {
        !pid_alive(self.pid)
    }
}

/// An acquired lock. Released explicitly; dropping it does nothing so a
/// crashed process leaves the file behind for stale detection.
#[derive(Debug)]
pub struct Lock {
    path: PathBuf,
    pub info: LockInfo,
}

impl Lock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquire the lock for `worker_dir`, recording our pid and the session id
/// we are about to create. Exclusive-create; a stale incumbent is reaped
/// and acquisition retried once.
pub fn acquire(worker_dir: &Path, session_id: &str) -> anyhow::Result<Lock> {
    let info = LockInfo {
        pid: std::process::id(),
        session_id: session_id.to_string(),
        created_at: Utc::now(),
    };
    match try_create(worker_dir, &info) {
        Ok(lock) => Ok(lock),
        Err(first) => {
            let Some(existing) = read(worker_dir)? else {
                // Unreadable or vanished; surface the original failure.
                return Err(first);
            };
            if existing.is_stale() {
                tracing::info!(
                    dir = %worker_dir.display(),
                    pid = existing.pid,
                    "reaping stale lock"
                );
                let _ = std::fs::remove_file(worker_dir.join(LOCK_FILE));
                return try_create(worker_dir, &info);
            }
            Err(HordeError::SessionRunning {
                session: existing.session_id,
                pid: existing.pid,
            }
            .into())
        }
    }
}

fn try_create(worker_dir: &Path, info: &LockInfo) -> anyhow::Result<Lock> {
    let path = worker_dir.join(LOCK_FILE);
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("creating lock {}", path.display()))?;
    let body = serde_json::to_string(info)?;
    file.write_all(body.as_bytes())?;
    Ok(Lock {
        path,
        info: info.clone(),
    })
}

/// Release a lock we hold.
pub fn release(lock: Lock) -> anyhow::Result<()> {
    std::fs::remove_file(&lock.path)
        .with_context(|| format!("removing lock {}", lock.path.display()))
}

/// Hand lock ownership to the pane's process.
///
/// Acquisition happens before the pane exists, so the file initially holds
/// the orchestrator's pid; once the session is up the pane pid takes over
/// so the lock stays live after this invocation exits.
pub fn transfer_to(lock: &mut Lock, pid: u32) -> anyhow::Result<()> {
    lock.info.pid = pid;
    let body = serde_json::to_string(&lock.info)?;
    std::fs::write(&lock.path, body)
        .with_context(|| format!("rewriting lock {}", lock.path.display()))
}

/// Read the lock in `worker_dir`, if any. A malformed file reads as `None`
/// (it will be reaped by `clean_stale_locks`).
pub fn read(worker_dir: &Path) -> anyhow::Result<Option<LockInfo>> {
    let path = worker_dir.join(LOCK_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading lock {}", path.display()))?;
    Ok(serde_json::from_str(&text).ok())
}

/// Remove whatever lock is present, owned or not. Used by stop paths after
/// killing the session.
pub fn force_release(worker_dir: &Path) {
    let _ = std::fs::remove_file(worker_dir.join(LOCK_FILE));
}

/// All lock files under the encampment, keyed by worker directory.
pub fn find_all(encampment_root: &Path) -> Vec<(PathBuf, LockInfo)> {
    let mut found = Vec::new();
    walk(encampment_root, 0, &mut found);
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

// Deep enough for <root>/<warband>/raiders/<name>/warband/.hd.lock.
const MAX_WALK_DEPTH: usize = 6;

fn walk(dir: &Path, depth: usize, found: &mut Vec<(PathBuf, LockInfo)>) {
    if depth > MAX_WALK_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            // .relics, .git, .mail and friends never hold worker locks.
            if !name.starts_with('.') {
                walk(&path, depth + 1, found);
            }
        } else if name == LOCK_FILE {
            let text = std::fs::read_to_string(&path).unwrap_or_default();
            if let Ok(info) = serde_json::from_str::<LockInfo>(&text) {
                found.push((dir.to_path_buf(), info));
            } else {
                // Unparseable lock: treat as stale garbage.
                found.push((
                    dir.to_path_buf(),
                    LockInfo {
                        pid: 0,
                        session_id: String::new(),
                        created_at: Utc::now(),
                    },
                ));
            }
        }
    }
}

/// Remove every stale lock under the root; returns how many were removed.
pub fn clean_stale_locks(encampment_root: &Path) -> usize {
    let mut removed = 0;
    for (dir, info) in find_all(encampment_root) {
        if info.pid == 0 || info.is_stale() {
            if std::fs::remove_file(dir.join(LOCK_FILE)).is_ok() {
                tracing::info!(dir = %dir.display(), pid = info.pid, "removed stale lock");
                removed += 1;
            }
        }
    }
    removed
}
