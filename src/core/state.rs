//! Per-stack state records: load, lock, conditional atomic save.
//!
//! A record lives at `<location>/<key>`. Writers first take a lease by
//! creating `<record>.lock` exclusively; the lock file carries the lease
//! token. `save` only succeeds while the lock still holds that token and the
//! on-disk serial is the one the lease observed.

use super::types::{BackendDescriptor, StackSpec, StateRecord};
use crate::error::{Result, StrataError};
use crate::provenance::eventlog::now_iso8601;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const RECORD_SCHEMA: &str = "1.0";

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub token: String,
    pub pid: u32,
    pub acquired_at: String,
}

/// Exclusive right to write one stack's record. Dropping it releases the lock.
#[derive(Debug)]
pub struct StateLease {
    backend: BackendDescriptor,
    token: String,
    serial: u64,
    lock_path: PathBuf,
}

impl StateLease {
    /// Serial of the record as of the last lock or save.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for StateLease {
    fn drop(&mut self) {
        if let Ok(Some(info)) = read_lock(&self.lock_path) {
            if info.token == self.token {
                let _ = std::fs::remove_file(&self.lock_path);
            }
        }
    }
}

/// Derive the lock file path for a record.
pub fn lock_file_path(backend: &BackendDescriptor) -> PathBuf {
    sibling(&backend.record_path(), ".lock")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn concurrent(backend: &BackendDescriptor, detail: impl Into<String>) -> StrataError {
    StrataError::ConcurrentModification {
        key: backend.to_string(),
        detail: detail.into(),
    }
}

fn new_token() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("l-{}-{:x}-{}", std::process::id(), nanos & 0xFFFF_FFFF_FFFF, n)
}

fn read_lock(path: &Path) -> Result<Option<LockInfo>> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_yaml_ng::from_str(&content)
            .map(Some)
            .map_err(|e| StrataError::Parse {
                origin: path.display().to_string(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StrataError::io(path, e)),
    }
}

/// Current holder of a record's lock, if any.
pub fn lock_holder(backend: &BackendDescriptor) -> Result<Option<LockInfo>> {
    read_lock(&lock_file_path(backend))
}

/// Load a stack's record. Returns None if it doesn't exist yet.
pub fn load(backend: &BackendDescriptor) -> Result<Option<StateRecord>> {
    let path = backend.record_path();
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StrataError::io(&path, e)),
    };
    let record = serde_yaml_ng::from_str(&content).map_err(|e| StrataError::Parse {
        origin: path.display().to_string(),
        reason: format!("invalid state record: {}", e),
    })?;
    Ok(Some(record))
}

/// Load the record belonging to `stack`. A record written by another stack
/// is a configuration error, never adopted.
pub fn load_for(stack: &StackSpec) -> Result<Option<StateRecord>> {
    let Some(record) = load(&stack.backend)? else {
        return Ok(None);
    };
    if record.stack != stack.name {
        return Err(StrataError::Config(format!(
            "state record {} belongs to stack '{}', not '{}'",
            stack.backend, record.stack, stack.name
        )));
    }
    Ok(Some(record))
}

fn on_disk_serial(backend: &BackendDescriptor) -> Result<u64> {
    Ok(load(backend)?.map(|r| r.serial).unwrap_or(0))
}

/// Take the lease on a stack's record.
pub fn lock(backend: &BackendDescriptor) -> Result<StateLease> {
    let lock_path = lock_file_path(backend);
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StrataError::io(parent, e))?;
    }

    let info = LockInfo {
        token: new_token(),
        pid: std::process::id(),
        acquired_at: now_iso8601(),
    };
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let holder = match read_lock(&lock_path) {
                Ok(Some(h)) => format!(
                    "locked by pid {} since {} ({})",
                    h.pid, h.acquired_at, h.token
                ),
                _ => format!("lock file {} exists", lock_path.display()),
            };
            return Err(concurrent(backend, holder));
        }
        Err(e) => return Err(StrataError::io(&lock_path, e)),
    };
    let yaml = serde_yaml_ng::to_string(&info).map_err(|e| StrataError::Serialize(e.to_string()))?;
    file.write_all(yaml.as_bytes())
        .map_err(|e| StrataError::io(&lock_path, e))?;

    let mut lease = StateLease {
        backend: backend.clone(),
        token: info.token,
        serial: 0,
        lock_path,
    };
    lease.serial = on_disk_serial(backend)?;
    tracing::debug!(record = %backend, serial = lease.serial, "lease acquired");
    Ok(lease)
}

/// Conditionally save a record under `lease`, bumping its serial.
///
/// Fails with `ConcurrentModification` if the lock no longer carries the
/// lease token or the on-disk serial moved since the lease observed it.
pub fn save(lease: &mut StateLease, record: &mut StateRecord) -> Result<()> {
    let backend = lease.backend.clone();
    match read_lock(&lease.lock_path)? {
        Some(info) if info.token == lease.token => {}
        Some(info) => {
            return Err(concurrent(
                &backend,
                format!("lock was taken over by {}", info.token),
            ))
        }
        None => return Err(concurrent(&backend, "lock was released before save")),
    }
    let current = on_disk_serial(&backend)?;
    if current != lease.serial {
        return Err(concurrent(
            &backend,
            format!("expected serial {}, found {}", lease.serial, current),
        ));
    }

    record.serial = lease.serial + 1;
    record.generated_at = now_iso8601();
    let yaml = serde_yaml_ng::to_string(record).map_err(|e| StrataError::Serialize(e.to_string()))?;

    let path = backend.record_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StrataError::io(parent, e))?;
    }
    let tmp_path = sibling(&path, ".tmp");
    std::fs::write(&tmp_path, &yaml).map_err(|e| StrataError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| StrataError::io(&path, e))?;

    lease.serial = record.serial;
    tracing::debug!(record = %backend, serial = record.serial, "state saved");
    Ok(())
}

/// Remove a record's lock regardless of who holds it. Returns whether a
/// lock existed.
pub fn force_unlock(backend: &BackendDescriptor) -> Result<bool> {
    let path = lock_file_path(backend);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::warn!(record = %backend, "lock forcibly removed");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StrataError::io(&path, e)),
    }
}

/// Create a new empty record for a stack.
pub fn new_record(stack: &StackSpec) -> StateRecord {
    StateRecord {
        schema: RECORD_SCHEMA.to_string(),
        stack: stack.name.clone(),
        region: stack.region.clone(),
        serial: 0,
        generated_at: now_iso8601(),
        generator: format!("strata {}", env!("CARGO_PKG_VERSION")),
        resources: indexmap::IndexMap::new(),
        outputs: indexmap::IndexMap::new(),
    }
}
