//! Per-environment exclusivity shared by backup, restore, and prune.
//!
//! Two layers: an in-process set of held environments, and a lease file at
//! `<backup_root>/<environment>/.lock` so a second process sees the lock too.
//! The holder renews the lease while the guard lives; a lease not renewed
//! within the configured lease time is treated as abandoned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::clock::Clock;
use crate::error::{DrError, DrResult};

pub const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    #[serde(default)]
    token: String,
    pid: u32,
    operation: String,
    acquired_at: DateTime<Utc>,
    #[serde(default)]
    renewed_at: Option<DateTime<Utc>>,
}

impl Lease {
    fn last_renewed(&self) -> DateTime<Utc> {
        self.renewed_at.unwrap_or(self.acquired_at)
    }
}

fn read_lease(path: &Path) -> Option<Lease> {
    std::fs::read(path)
        .ok()
        .and_then(|body| serde_json::from_slice(&body).ok())
}

enum Renewal {
    Renewed,
    Released,
    /// The file vanished or now belongs to another holder.
    Lost,
}

/// The lease file this process wrote, shared between the guard and its
/// renewal task. The mutex orders renewals against release.
#[derive(Debug)]
struct OwnedLease {
    path: PathBuf,
    token: String,
    released: Mutex<bool>,
}

impl OwnedLease {
    fn renew(&self, now: DateTime<Utc>) -> anyhow::Result<Renewal> {
        let released = self.released.lock().unwrap_or_else(|e| e.into_inner());
        if *released {
            return Ok(Renewal::Released);
        }
        let Some(mut lease) = read_lease(&self.path).filter(|l| l.token == self.token) else {
            return Ok(Renewal::Lost);
        };
        lease.renewed_at = Some(now);

        let tmp = self.path.with_extension("renew");
        std::fs::write(&tmp, serde_json::to_vec(&lease)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(Renewal::Renewed)
    }

    fn release(&self) {
        let mut released = self.released.lock().unwrap_or_else(|e| e.into_inner());
        *released = true;
        match read_lease(&self.path) {
            Some(lease) if lease.token == self.token => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove lease file");
                }
            }
            _ => warn!(path = %self.path.display(), "Lease file no longer ours, leaving it"),
        }
    }
}

#[derive(Clone)]
pub struct EnvironmentLocks {
    root: PathBuf,
    lease: Duration,
    clock: Arc<dyn Clock>,
    held: Arc<Mutex<HashSet<String>>>,
}

impl EnvironmentLocks {
    pub fn new(root: impl Into<PathBuf>, lease: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            lease,
            clock,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Take the lock for `environment` or fail immediately with `Busy`.
    ///
    /// Inside a tokio runtime the lease is renewed every third of the lease
    /// time until the guard drops.
    pub fn acquire(&self, environment: &str, operation: &str) -> DrResult<EnvironmentGuard> {
        {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            if !held.insert(environment.to_string()) {
                debug!(environment, operation, "Lock held in-process");
                return Err(DrError::Busy {
                    environment: environment.to_string(),
                });
            }
        }

        // From here on the guard owns the in-process slot; dropping it on an
        // error path releases the slot.
        let mut guard = EnvironmentGuard {
            environment: environment.to_string(),
            held: self.held.clone(),
            lease: None,
            renewal: None,
        };

        let path = self.root.join(environment).join(LOCK_FILE);
        let token = self.claim_file(&path, environment, operation)?;
        let owned = Arc::new(OwnedLease {
            path,
            token,
            released: Mutex::new(false),
        });
        guard.renewal = tokio::runtime::Handle::try_current().ok().map(|handle| {
            handle.spawn(renew_lease(
                owned.clone(),
                self.lease,
                self.clock.clone(),
                environment.to_string(),
            ))
        });
        guard.lease = Some(owned);
        debug!(environment, operation, "Environment lock acquired");
        Ok(guard)
    }

    fn claim_file(&self, path: &Path, environment: &str, operation: &str) -> DrResult<String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create {}: {}", parent.display(), e)
            })?;
        }

        let lease = Lease {
            token: Uuid::now_v7().to_string(),
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at: self.clock.now(),
            renewed_at: None,
        };
        let body = serde_json::to_vec(&lease).map_err(anyhow::Error::from)?;

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    file.write_all(&body)
                        .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?;
                    return Ok(lease.token);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !self.is_stale(path) {
                        return Err(DrError::Busy {
                            environment: environment.to_string(),
                        });
                    }
                    warn!(environment, path = %path.display(), "Removing stale environment lease");
                    let _ = std::fs::remove_file(path);
                }
                Err(e) => {
                    return Err(anyhow::anyhow!("Failed to create {}: {}", path.display(), e).into());
                }
            }
        }

        Err(DrError::Busy {
            environment: environment.to_string(),
        })
    }

    fn is_stale(&self, path: &Path) -> bool {
        let last_alive = match read_lease(path) {
            Some(lease) => lease.last_renewed(),
            // Unparsable lease: either mid-write or left by a crash while
            // writing. The file's own age tells the two apart.
            None => match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => return false,
            },
        };
        let age = self.clock.now() - last_alive;
        age.to_std().map(|age| age > self.lease).unwrap_or(false)
    }
}

async fn renew_lease(
    lease: Arc<OwnedLease>,
    period: Duration,
    clock: Arc<dyn Clock>,
    environment: String,
) {
    let every = (period / 3).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(every).await;
        let now = clock.now();
        let file = lease.clone();
        match tokio::task::spawn_blocking(move || file.renew(now)).await {
            Ok(Ok(Renewal::Renewed)) => debug!(environment = %environment, "Environment lease renewed"),
            Ok(Ok(Renewal::Released)) => return,
            Ok(Ok(Renewal::Lost)) => {
                warn!(environment = %environment, "Environment lease taken over, renewal stopped");
                return;
            }
            Ok(Err(e)) => warn!(environment = %environment, error = %e, "Failed to renew environment lease"),
            Err(e) => {
                warn!(environment = %environment, error = %e, "Lease renewal task failed");
                return;
            }
        }
    }
}

/// Releases the environment lock when dropped.
#[derive(Debug)]
pub struct EnvironmentGuard {
    environment: String,
    held: Arc<Mutex<HashSet<String>>>,
    lease: Option<Arc<OwnedLease>>,
    renewal: Option<JoinHandle<()>>,
}

impl EnvironmentGuard {
    pub fn environment(&self) -> &str {
        &self.environment
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.environment);
        debug!(environment = %self.environment, "Environment lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn second_acquire_is_busy_until_release() {
        let temp = tempdir().unwrap();
        let locks = EnvironmentLocks::new(temp.path(), Duration::from_secs(60), Arc::new(clock()));

        let guard = locks.acquire("prod", "restore").unwrap();
        assert!(matches!(
            locks.acquire("prod", "backup"),
            Err(DrError::Busy { .. })
        ));
        // Other environments are independent
        let _staging = locks.acquire("staging", "restore").unwrap();

        drop(guard);
        assert!(!temp.path().join("prod").join(LOCK_FILE).exists());
        locks.acquire("prod", "backup").unwrap();
    }

    #[test]
    fn lease_file_blocks_other_instances() {
        let temp = tempdir().unwrap();
        let clock = clock();
        let a = EnvironmentLocks::new(temp.path(), Duration::from_secs(60), Arc::new(clock.clone()));
        let b = EnvironmentLocks::new(temp.path(), Duration::from_secs(60), Arc::new(clock.clone()));

        let _guard = a.acquire("prod", "backup").unwrap();
        assert!(matches!(
            b.acquire("prod", "restore"),
            Err(DrError::Busy { .. })
        ));
    }

    #[test]
    fn stale_lease_is_reclaimed() {
        let temp = tempdir().unwrap();
        let clock = clock();
        let a = EnvironmentLocks::new(temp.path(), Duration::from_secs(60), Arc::new(clock.clone()));
        let b = EnvironmentLocks::new(temp.path(), Duration::from_secs(60), Arc::new(clock.clone()));

        let guard = a.acquire("prod", "backup").unwrap();
        // Simulate a crashed holder: leak the guard so the file stays behind
        std::mem::forget(guard);

        clock.advance(chrono::Duration::minutes(5));
        b.acquire("prod", "restore").unwrap();
    }

    #[test]
    fn torn_lease_is_busy_while_fresh_and_stale_once_old() {
        let temp = tempdir().unwrap();
        let clock = clock();
        let locks = EnvironmentLocks::new(temp.path(), Duration::from_secs(60), Arc::new(clock.clone()));
        let path = temp.path().join("prod").join(LOCK_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        // Written just now: another process may still be writing it
        let file = std::fs::File::create(&path).unwrap();
        let now: std::time::SystemTime = clock.now().into();
        file.set_modified(now).unwrap();
        assert!(matches!(
            locks.acquire("prod", "backup"),
            Err(DrError::Busy { .. })
        ));

        // Left behind by a crash an hour ago
        file.set_modified(now - Duration::from_secs(3600)).unwrap();
        drop(file);
        let _guard = locks.acquire("prod", "backup").unwrap();
        assert!(read_lease(&path).is_some());
    }

    #[tokio::test]
    async fn held_lease_is_renewed() {
        let temp = tempdir().unwrap();
        let clock = clock();
        let lease = Duration::from_millis(300);
        let a = EnvironmentLocks::new(temp.path(), lease, Arc::new(clock.clone()));
        let b = EnvironmentLocks::new(temp.path(), lease, Arc::new(clock.clone()));
        let path = temp.path().join("prod").join(LOCK_FILE);

        let guard = a.acquire("prod", "restore").unwrap();
        // Far past the lease since acquisition, but the holder keeps renewing
        clock.advance(chrono::Duration::minutes(5));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let renewed = read_lease(&path).unwrap();
        assert_eq!(renewed.renewed_at, Some(clock.now()));
        assert!(matches!(
            b.acquire("prod", "backup"),
            Err(DrError::Busy { .. })
        ));

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn reclaimed_lease_is_not_removed_by_the_old_holder() {
        let temp = tempdir().unwrap();
        let clock = clock();
        let a = EnvironmentLocks::new(temp.path(), Duration::from_secs(60), Arc::new(clock.clone()));
        let b = EnvironmentLocks::new(temp.path(), Duration::from_secs(60), Arc::new(clock.clone()));
        let path = temp.path().join("prod").join(LOCK_FILE);

        let stalled = a.acquire("prod", "backup").unwrap();
        clock.advance(chrono::Duration::minutes(5));
        let _current = b.acquire("prod", "restore").unwrap();

        drop(stalled);
        assert_eq!(read_lease(&path).unwrap().operation, "restore");
    }
}
