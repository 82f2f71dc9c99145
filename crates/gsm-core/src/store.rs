//! Local state store
//!
//! Manages `servers.json` and `snapshots.json` in the state directory. Every
//! command holds [`StoreLock`] for its whole duration; the documents are only
//! reachable through the lock guard, so an unlocked read-modify-write does not
//! compile.

use crate::error::StoreError;
use crate::model::{ServerInventory, SnapshotInventory};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

const STORE_VERSION: u32 = 1;
const SERVERS_FILE: &str = "servers.json";
const SNAPSHOTS_FILE: &str = "snapshots.json";
const LOCK_FILE: &str = "lock.json";
const BREAK_GUARD_FILE: &str = "lock.json.break";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STALE_LOCK_HOURS: i64 = 1;

/// How long a holder may take to fill in a lock file it just created
const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(10);

type Result<T> = std::result::Result<T, StoreError>;

/// On-disk envelope around an inventory document
#[derive(Debug, Serialize, Deserialize)]
struct Document<T> {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    body: T,
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn is_stale(&self) -> bool {
        Utc::now().signed_duration_since(self.acquired_at).num_hours() >= STALE_LOCK_HOURS
    }
}

/// What a lock file on disk says about its holder
#[derive(Debug)]
enum LockFile {
    Missing,
    Held(LockInfo),
    /// Being written right now, or left empty by a crashed holder
    Unreadable,
    /// Abandoned; safe to break
    Stale(String),
}

impl LockFile {
    async fn inspect(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::Missing),
            Err(e) => return Err(e.into()),
        };

        if let Ok(info) = serde_json::from_slice::<LockInfo>(&bytes) {
            return Ok(if info.is_stale() {
                Self::Stale(format!("{} (pid {})", info.holder, info.pid))
            } else {
                Self::Held(info)
            });
        }

        let Some(age) = file_age(path).await? else {
            return Ok(Self::Missing);
        };
        Ok(if age >= UNREADABLE_LOCK_GRACE {
            Self::Stale(format!("an unreadable lock left {}s ago", age.as_secs()))
        } else {
            Self::Unreadable
        })
    }
}

/// File-backed store rooted at the state directory
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Acquire the exclusive store lock
    ///
    /// Polls until `timeout` while another process holds the lock. A lock
    /// older than one hour is considered abandoned and broken, as is a lock
    /// file that stayed unreadable past a short grace period.
    pub async fn lock(&self, timeout: Duration) -> Result<StoreLock> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            tracing::debug!("Created state directory: {}", self.dir.display());
        }

        let lock_path = self.lock_path();
        let deadline = Instant::now() + timeout;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    let content = serde_json::to_vec_pretty(&LockInfo::current())?;
                    file.write_all(&content).await?;
                    file.flush().await?;
                    tracing::debug!("Acquired store lock");
                    return Ok(StoreLock {
                        dir: self.dir.clone(),
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let existing = match LockFile::inspect(&lock_path).await? {
                LockFile::Missing => continue,
                LockFile::Stale(_) if self.break_stale_lock().await? => continue,
                // another waiter is breaking it
                LockFile::Stale(_) => None,
                LockFile::Held(info) => Some(info),
                LockFile::Unreadable => None,
            };

            if Instant::now() + LOCK_POLL_INTERVAL > deadline {
                return Err(match existing {
                    Some(info) => StoreError::Locked {
                        holder: format!("{} (pid {})", info.holder, info.pid),
                        since: info.acquired_at.to_rfc3339(),
                    },
                    None => StoreError::Locked {
                        holder: "unknown".to_string(),
                        since: "unknown".to_string(),
                    },
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Break a stale lock, one waiter at a time
    ///
    /// Returns false when another waiter holds the break guard. The winner
    /// checks the lock again under the guard, since another waiter may have
    /// broken it and taken a fresh lock in between.
    async fn break_stale_lock(&self) -> Result<bool> {
        let guard_path = self.dir.join(BREAK_GUARD_FILE);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&guard_path)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // left behind by a waiter that died mid-break
                if file_age(&guard_path).await?.is_some_and(|age| age >= UNREADABLE_LOCK_GRACE) {
                    tracing::warn!("Removing abandoned lock break guard");
                    remove_if_exists(&guard_path).await?;
                }
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let result = match LockFile::inspect(&self.lock_path()).await {
            Ok(LockFile::Stale(holder)) => self.set_aside_lock(&holder).await,
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        remove_if_exists(&guard_path).await?;
        result.map(|()| true)
    }

    /// Rename the lock file out of the way and discard it
    ///
    /// The claimed file is inspected again after the rename and put back
    /// when it turns out to be live.
    async fn set_aside_lock(&self, holder: &str) -> Result<()> {
        let lock_path = self.lock_path();
        let claimed = self.dir.join(format!(
            "{}.{}.stale",
            LOCK_FILE,
            uuid::Uuid::new_v4().simple()
        ));

        match fs::rename(&lock_path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        match LockFile::inspect(&claimed).await? {
            LockFile::Stale(_) | LockFile::Missing => {
                tracing::warn!("Broke stale store lock held by {}", holder);
            }
            LockFile::Held(_) | LockFile::Unreadable => {
                tracing::debug!("Store lock changed hands while breaking it, restoring");
                match fs::hard_link(&claimed, &lock_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        tracing::warn!("Store lock was retaken before it could be restored");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        remove_if_exists(&claimed).await
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Time since the file was last written, `None` when it is gone
async fn file_age(path: &Path) -> Result<Option<Duration>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(
            SystemTime::now()
                .duration_since(meta.modified()?)
                .unwrap_or_default(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// RAII guard for the store lock; the only way to read or write documents
#[derive(Debug)]
pub struct StoreLock {
    dir: PathBuf,
    lock_path: PathBuf,
    released: bool,
}

impl StoreLock {
    pub async fn load_servers(&self) -> Result<ServerInventory> {
        read_document(&self.dir.join(SERVERS_FILE)).await
    }

    /// Replace the server inventory atomically
    ///
    /// Refuses an inventory that breaks a record invariant.
    pub async fn save_servers(&self, inventory: &ServerInventory) -> Result<()> {
        inventory.check().map_err(StoreError::Invariant)?;
        write_document(&self.dir.join(SERVERS_FILE), inventory).await?;
        tracing::debug!("Saved {} server record(s)", inventory.servers.len());
        Ok(())
    }

    pub async fn load_snapshots(&self) -> Result<SnapshotInventory> {
        read_document(&self.dir.join(SNAPSHOTS_FILE)).await
    }

    pub async fn save_snapshots(&self, inventory: &SnapshotInventory) -> Result<()> {
        write_document(&self.dir.join(SNAPSHOTS_FILE), inventory).await?;
        tracing::debug!("Saved {} snapshot record(s)", inventory.snapshots.len());
        Ok(())
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            match fs::remove_file(&self.lock_path).await {
                Ok(()) => tracing::debug!("Released store lock"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

async fn read_document<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("{} not found, starting empty", path.display());
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };

    let document: Document<T> =
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupted {
            path: path.to_path_buf(),
            source,
        })?;

    if document.version > STORE_VERSION {
        return Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: document.version,
            supported: STORE_VERSION,
        });
    }
    Ok(document.body)
}

async fn write_document<T: Serialize>(path: &Path, body: &T) -> Result<()> {
    let document = Document {
        version: STORE_VERSION,
        updated_at: Utc::now(),
        body,
    };
    let content = serde_json::to_string_pretty(&document)?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
