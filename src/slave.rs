//! Storage-node handles
//!
//! The coordinator never talks to a storage node directly; it goes through
//! the [`SlaveHandle`] trait, an explicit RPC-client seam. [`SlaveRef`] is the
//! shared, cheaply clonable reference stored in replica sets and score
//! charts. Its identity is the slave name and it carries no other state, so
//! status is always queried live through the handle.
//!
//! [`SlaveRegistry`] knows every configured slave, online or not.
//! [`MemorySlave`] is an in-process implementation used by tests, benches
//! and the CLI.

use crate::collections::NameKey;
use crate::error::{Result, StowageError};
use crate::types::{Direction, ListingEntry, SlaveStatus, TransferInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// RPC surface of one storage node
///
/// Implementations must bound every network call: `status` receives the
/// caller's timeout and must return [`StowageError::SlaveUnavailable`] once it
/// expires instead of blocking the selection.
pub trait SlaveHandle: Send + Sync {
    /// Unique slave name
    fn name(&self) -> &str;

    /// Whether the slave is currently connected and merged
    fn is_available(&self) -> bool;

    /// Query live status within `timeout`
    fn status(&self, timeout: Duration) -> Result<SlaveStatus>;

    /// Delete `path` on the slave
    fn delete(&self, path: &str) -> Result<()>;

    /// Rename `from` to `to_dir/to_name` on the slave
    fn rename(&self, from: &str, to_dir: &str, to_name: &str) -> Result<()>;

    /// Compute the checksum of `path` on the slave
    fn checksum(&self, path: &str) -> Result<u64>;

    /// Transfers currently running on the slave
    fn active_transfers(&self) -> Vec<TransferInfo>;

    /// Last time a transfer in `direction` was assigned to this slave
    fn last_transfer(&self, direction: Direction) -> i64;

    /// Record that a transfer in `direction` was assigned at `timestamp`
    fn set_last_transfer(&self, direction: Direction, timestamp: i64);

    /// Status, failing fast when the slave is not available
    fn status_available(&self, timeout: Duration) -> Result<SlaveStatus> {
        if !self.is_available() {
            return Err(StowageError::unavailable(self.name(), "slave is offline"));
        }
        self.status(timeout)
    }
}

/// Per-direction last-transfer timestamps
///
/// Plain atomic stores, safe to update from concurrent selections.
#[derive(Debug, Default)]
pub struct TransferClock {
    up: AtomicI64,
    down: AtomicI64,
}

impl TransferClock {
    /// Clock with both directions at 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the timestamp for a direction
    pub fn get(&self, direction: Direction) -> i64 {
        match direction {
            Direction::Upload => self.up.load(Ordering::Relaxed),
            Direction::Download => self.down.load(Ordering::Relaxed),
        }
    }

    /// Store the timestamp for a direction
    pub fn set(&self, direction: Direction, timestamp: i64) {
        match direction {
            Direction::Upload => self.up.store(timestamp, Ordering::Relaxed),
            Direction::Download => self.down.store(timestamp, Ordering::Relaxed),
        }
    }
}

/// Shared reference to a slave, compared and ordered by name
#[derive(Clone)]
pub struct SlaveRef(Arc<dyn SlaveHandle>);

impl SlaveRef {
    /// Wrap a handle
    pub fn new<H: SlaveHandle + 'static>(handle: H) -> Self {
        SlaveRef(Arc::new(handle))
    }

    /// Wrap an already shared handle
    pub fn from_arc(handle: Arc<dyn SlaveHandle>) -> Self {
        SlaveRef(handle)
    }
}

impl Deref for SlaveRef {
    type Target = dyn SlaveHandle;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for SlaveRef {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for SlaveRef {}

impl Hash for SlaveRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

impl PartialOrd for SlaveRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlaveRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name().cmp(other.name())
    }
}

impl fmt::Debug for SlaveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlaveRef({})", self.name())
    }
}

impl fmt::Display for SlaveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every configured slave, keyed case-insensitively by name
#[derive(Default)]
pub struct SlaveRegistry {
    slaves: RwLock<BTreeMap<NameKey, SlaveRef>>,
}

impl SlaveRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-filled with `slaves`
    pub fn with_slaves(slaves: impl IntoIterator<Item = SlaveRef>) -> Result<Self> {
        let registry = Self::new();
        for slave in slaves {
            registry.register(slave)?;
        }
        Ok(registry)
    }

    /// Add a slave; names must be unique ignoring case
    pub fn register(&self, slave: SlaveRef) -> Result<()> {
        let mut slaves = self.slaves.write();
        let key = NameKey::new(slave.name());
        if slaves.contains_key(&key) {
            return Err(StowageError::AlreadyExists(format!("slave {}", slave.name())));
        }
        debug!("Registered slave {}", slave.name());
        slaves.insert(key, slave);
        Ok(())
    }

    /// Drop a slave from the registry
    pub fn remove(&self, name: &str) -> Option<SlaveRef> {
        self.slaves.write().remove(&NameKey::new(name))
    }

    /// Look up a slave by name
    pub fn get(&self, name: &str) -> Result<SlaveRef> {
        self.slaves
            .read()
            .get(&NameKey::new(name))
            .cloned()
            .ok_or_else(|| StowageError::ObjectNotFound(format!("slave {}", name)))
    }

    /// All registered slaves in name order
    pub fn all(&self) -> Vec<SlaveRef> {
        self.slaves.read().values().cloned().collect()
    }

    /// Registered slaves that are currently available, in name order
    pub fn available(&self) -> Vec<SlaveRef> {
        self.slaves
            .read()
            .values()
            .filter(|s| s.is_available())
            .cloned()
            .collect()
    }

    /// Number of registered slaves
    pub fn len(&self) -> usize {
        self.slaves.read().len()
    }

    /// Whether no slave is registered
    pub fn is_empty(&self) -> bool {
        self.slaves.read().is_empty()
    }
}

impl fmt::Debug for SlaveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.all().iter().map(|s| s.name().to_string())).finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryFile {
    size: u64,
    checksum: u64,
    last_modified: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    status: SlaveStatus,
    transfers: Vec<TransferInfo>,
    rpc_log: Vec<String>,
}

/// In-process slave holding a file map instead of a disk
///
/// RPCs fail with [`StowageError::SlaveUnavailable`] while the slave is
/// offline. Every RPC issued while online is appended to an inspectable log.
#[derive(Debug)]
pub struct MemorySlave {
    name: String,
    online: AtomicBool,
    clock: TransferClock,
    state: Mutex<MemoryState>,
}

impl MemorySlave {
    /// An online slave with no files
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            online: AtomicBool::new(true),
            clock: TransferClock::new(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Wrap into a shared handle, keeping a typed reference for the caller
    pub fn shared(name: impl Into<String>) -> (Arc<MemorySlave>, SlaveRef) {
        let slave = Arc::new(MemorySlave::new(name));
        let handle = SlaveRef::from_arc(slave.clone());
        (slave, handle)
    }

    /// Connect or disconnect the slave
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Replace the reported status
    pub fn set_status(&self, status: SlaveStatus) {
        self.state.lock().status = status;
    }

    /// Place a file on the slave
    pub fn add_file(&self, path: impl Into<String>, size: u64, checksum: u64, last_modified: i64) {
        self.state.lock().files.insert(
            path.into(),
            MemoryFile {
                size,
                checksum,
                last_modified,
            },
        );
    }

    /// Whether the slave stores `path`
    pub fn has_file(&self, path: &str) -> bool {
        self.state.lock().files.contains_key(path)
    }

    /// Paths of all stored files
    pub fn files(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }

    /// Register an active transfer
    pub fn add_transfer(&self, transfer: TransferInfo) {
        self.state.lock().transfers.push(transfer);
    }

    /// Drop all active transfers
    pub fn clear_transfers(&self) {
        self.state.lock().transfers.clear();
    }

    /// RPCs served so far, as `op path` strings
    pub fn rpc_log(&self) -> Vec<String> {
        self.state.lock().rpc_log.clone()
    }

    /// Full listing of the slave, parent directories included
    pub fn listing(&self) -> Vec<ListingEntry> {
        let state = self.state.lock();
        let mut dirs = BTreeSet::new();
        let mut entries = Vec::new();
        for (path, file) in &state.files {
            let mut parent = path.as_str();
            while let Some(idx) = parent.rfind('/') {
                parent = &parent[..idx];
                if parent.is_empty() {
                    break;
                }
                dirs.insert(parent.to_string());
            }
            entries.push(
                ListingEntry::file(path.clone(), file.size, file.last_modified)
                    .with_checksum(file.checksum),
            );
        }
        let mut listing: Vec<ListingEntry> = dirs
            .into_iter()
            .map(|dir| ListingEntry::directory(dir, 0))
            .collect();
        listing.extend(entries);
        listing
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StowageError::unavailable(&self.name, "slave is offline"))
        }
    }
}

impl SlaveHandle for MemorySlave {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn status(&self, _timeout: Duration) -> Result<SlaveStatus> {
        self.check_online()?;
        Ok(self.state.lock().status)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.rpc_log.push(format!("delete {}", path));
        let prefix = format!("{}/", path);
        state
            .files
            .retain(|p, _| p != path && !p.starts_with(&prefix));
        trace!("{}: deleted {}", self.name, path);
        Ok(())
    }

    fn rename(&self, from: &str, to_dir: &str, to_name: &str) -> Result<()> {
        self.check_online()?;
        let to = if to_dir == "/" {
            format!("/{}", to_name)
        } else {
            format!("{}/{}", to_dir, to_name)
        };
        let mut state = self.state.lock();
        state.rpc_log.push(format!("rename {} {}", from, to));
        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .files
            .keys()
            .filter(|p| p.as_str() == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(file) = state.files.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                state.files.insert(new, file);
            }
        }
        Ok(())
    }

    fn checksum(&self, path: &str) -> Result<u64> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.rpc_log.push(format!("checksum {}", path));
        state
            .files
            .get(path)
            .map(|f| f.checksum)
            .ok_or_else(|| StowageError::ObjectNotFound(format!("{} on {}", path, self.name)))
    }

    fn active_transfers(&self) -> Vec<TransferInfo> {
        self.state.lock().transfers.clone()
    }

    fn last_transfer(&self, direction: Direction) -> i64 {
        self.clock.get(direction)
    }

    fn set_last_transfer(&self, direction: Direction, timestamp: i64) {
        self.clock.set(direction, timestamp);
    }
}
