//! Single-flight supervisor lease.
//!
//! An advisory exclusive lock on the lease file guarantees one supervisor per
//! repository. The file body carries [`LeaseMetadata`], refreshed by a
//! background heartbeat so other processes can see who holds the lease.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const MIN_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMetadata {
    pub run_id: String,
    pub pid: u32,
    pub host: String,
    pub cwd: String,
    pub acquired_at: String,
    pub renewed_at: String,
    pub expires_at: String,
}

impl LeaseMetadata {
    fn hint(&self) -> String {
        format!(
            "run={} pid={} host={} renewed_at={}",
            self.run_id, self.pid, self.host, self.renewed_at
        )
    }

    fn renewed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.renewed_at)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.renewed_at = rfc3339(now);
        self.expires_at = rfc3339(now + chrono::Duration::from_std(ttl).unwrap_or_default());
    }
}

/// Another supervisor owns the lease.
#[derive(Debug, Error)]
#[error("single-flight lease already held: {hint}")]
pub struct LeaseHeld {
    pub hint: String,
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Heartbeat period for a lease TTL.
pub fn heartbeat_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(MIN_HEARTBEAT)
}

/// Whether metadata last renewed at `renewed_at` is stale at `now`. Inclusive at the TTL.
pub fn is_stale(renewed_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    let age = now.signed_duration_since(renewed_at);
    age >= chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

fn read_metadata(file: &mut File) -> Option<LeaseMetadata> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    serde_json::from_str(raw.trim()).ok()
}

fn write_metadata(file: &mut File, meta: &LeaseMetadata) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(meta).context("serialize lease metadata")?;
    buf.push('\n');
    file.set_len(0).context("truncate lease file")?;
    file.seek(SeekFrom::Start(0)).context("seek lease file")?;
    file.write_all(buf.as_bytes()).context("write lease metadata")?;
    file.sync_all().context("sync lease file")
}

/// A held lease. Released explicitly or on drop.
pub struct SupervisorLease {
    path: PathBuf,
    ttl: Duration,
    file: Arc<Mutex<File>>,
    meta: Arc<Mutex<LeaseMetadata>>,
    released: Arc<AtomicBool>,
    stop: Option<Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SupervisorLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorLease")
            .field("path", &self.path)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SupervisorLease {
    /// Take the lease at `path` or fail with [`LeaseHeld`].
    pub fn acquire(path: &Path, ttl: Duration, run_id: &str, cwd: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lease {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let hint = read_metadata(&mut file)
                .map(|meta| meta.hint())
                .unwrap_or_else(|| format!("lock={}", path.display()));
            return Err(LeaseHeld { hint }.into());
        }

        let now = Utc::now();
        if let Some(existing) = read_metadata(&mut file)
            && existing.run_id != run_id
            && existing
                .renewed_at()
                .is_some_and(|renewed| !is_stale(renewed, now, ttl))
        {
            let _ = FileExt::unlock(&file);
            return Err(LeaseHeld {
                hint: existing.hint(),
            }
            .into());
        }

        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let mut meta = LeaseMetadata {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            host,
            cwd: cwd.display().to_string(),
            acquired_at: rfc3339(now),
            renewed_at: String::new(),
            expires_at: String::new(),
        };
        meta.refresh(now, ttl);
        if let Err(err) = write_metadata(&mut file, &meta) {
            let _ = FileExt::unlock(&file);
            return Err(err.context(format!("write lease metadata {}", path.display())));
        }
        info!(path = %path.display(), run_id, "supervisor lease acquired");

        let mut lease = Self {
            path: path.to_path_buf(),
            ttl,
            file: Arc::new(Mutex::new(file)),
            meta: Arc::new(Mutex::new(meta)),
            released: Arc::new(AtomicBool::new(false)),
            stop: None,
            heartbeat: None,
        };
        lease.start_heartbeat();
        Ok(lease)
    }

    fn start_heartbeat(&mut self) {
        let (tx, rx) = mpsc::channel::<()>();
        let file = Arc::clone(&self.file);
        let meta = Arc::clone(&self.meta);
        let ttl = self.ttl;
        let interval = heartbeat_interval(ttl);
        let handle = thread::spawn(move || {
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = renew_shared(&file, &meta, ttl) {
                            warn!(err = %format!("{err:#}"), "lease heartbeat failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        self.stop = Some(tx);
        self.heartbeat = Some(handle);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Result<LeaseMetadata> {
        self.meta
            .lock()
            .map(|meta| meta.clone())
            .map_err(|_| anyhow!("lease metadata lock poisoned"))
    }

    /// Refresh `renewed_at` and `expires_at` now.
    pub fn renew(&self) -> Result<()> {
        renew_shared(&self.file, &self.meta, self.ttl)
    }

    /// Stop the heartbeat, unlock and remove the lease file.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    /// A release for exit paths that cannot take ownership of the lease, such
    /// as a signal handler that exits the process. Unlocks and removes the
    /// lease file unless it was already released.
    pub fn exit_releaser(&self) -> impl FnOnce() + Send + 'static {
        let file = Arc::clone(&self.file);
        let released = Arc::clone(&self.released);
        let path = self.path.clone();
        move || {
            if released.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Ok(file) = file.lock() {
                let _ = FileExt::unlock(&*file);
            }
            if let Err(err) = remove_lease_file(&path) {
                warn!(err = %format!("{err:#}"), "could not remove lease on exit");
            }
        }
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(stop) = self.stop.take() else {
            return Ok(());
        };
        drop(stop);
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(file) = self.file.lock() {
            let _ = FileExt::unlock(&*file);
        }
        remove_lease_file(&self.path)?;
        debug!(path = %self.path.display(), "supervisor lease released");
        Ok(())
    }
}

impl Drop for SupervisorLease {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(err = %format!("{err:#}"), "lease release on drop failed");
        }
    }
}

fn remove_lease_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove lease {}", path.display())),
    }
}

fn renew_shared(file: &Mutex<File>, meta: &Mutex<LeaseMetadata>, ttl: Duration) -> Result<()> {
    let mut meta = meta.lock().map_err(|_| anyhow!("lease metadata lock poisoned"))?;
    meta.refresh(Utc::now(), ttl);
    let mut file = file.lock().map_err(|_| anyhow!("lease file lock poisoned"))?;
    write_metadata(&mut file, &meta)
}
