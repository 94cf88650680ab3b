//! Replica tree: the coordinator's merged namespace
//!
//! Every storage node reports a listing of the files it holds. The replica
//! tree reconciles those listings into one directory tree and remembers, for
//! each file, which slaves hold a copy.
//!
//! ## Structure
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. A node owns its
//! children through ids; the parent link is a plain, non-owning id. Children
//! are keyed case-insensitively, so one directory can never hold two entries
//! whose names differ only in case.
//!
//! ```text
//! /                      (directory, no replicas)
//! ├── mp3
//! │   └── Some.Release
//! │       ├── 01.mp3     replicas {slave1, slave2}
//! │       └── 02.mp3     replicas {slave2}
//! └── incoming
//! ```
//!
//! ## Consistency under partial failure
//!
//! - **Remerge** is idempotent: merging the same listing twice leaves the tree
//!   unchanged. Divergent timestamps resolve to the oldest one.
//! - **Unmerge** drops a disconnected slave from every replica set and
//!   detaches files nobody holds any more.
//! - **Delete** against an unreachable slave leaves a tombstone that still
//!   names that slave; its next remerge retries the delete.
//! - **Rename** always moves the in-memory node once the slave RPCs have been
//!   attempted; slaves that missed it catch up on their next remerge.
//!
//! ## Thread Safety
//!
//! One tree-wide `RwLock` serializes structural changes against each other
//! and against reads. Slave RPCs are never issued while the lock is held:
//! operations collect their targets under the lock, talk to slaves without
//! it, then re-acquire it to apply the results.

use crate::collections::{HashSet, HashSetExt, NameKey};
use crate::error::{Result, StowageError};
use crate::slave::SlaveRef;
use crate::types::{now_millis, ListingEntry, NodeKind, TreeStats};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Index, IndexMut};
use tracing::{debug, info, instrument, trace, warn};

/// Arena index of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// One entry of the arena
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) owner: String,
    pub(crate) group: String,
    pub(crate) size: u64,
    pub(crate) last_modified: i64,
    pub(crate) checksum: u64,
    pub(crate) xfertime: i64,
    pub(crate) replicas: BTreeSet<SlaveRef>,
    pub(crate) deleted: bool,
    /// Directory waiting on a directory delete; removed once it empties
    pub(crate) delete_pending: bool,
    pub(crate) children: BTreeMap<NameKey, NodeId>,
    pub(crate) parent: Option<NodeId>,
}

impl Node {
    pub(crate) fn directory(name: &str, owner: &str, group: &str, last_modified: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: NodeKind::Directory,
            owner: owner.to_string(),
            group: group.to_string(),
            size: 0,
            last_modified,
            checksum: 0,
            xfertime: 0,
            replicas: BTreeSet::new(),
            deleted: false,
            delete_pending: false,
            children: BTreeMap::new(),
            parent: None,
        }
    }

    pub(crate) fn file(name: &str, entry: &ListingEntry) -> Self {
        Self {
            name: name.to_string(),
            kind: NodeKind::File,
            owner: entry.owner.clone(),
            group: entry.group.clone(),
            size: entry.size,
            last_modified: entry.last_modified,
            checksum: entry.checksum,
            xfertime: 0,
            replicas: BTreeSet::new(),
            deleted: false,
            delete_pending: false,
            children: BTreeMap::new(),
            parent: None,
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub(crate) fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

/// Read-only view of a node, detached from the tree lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Absolute path
    pub path: String,
    /// Entry name as first seen
    pub name: String,
    /// File or directory
    pub kind: NodeKind,
    /// Owning user
    pub owner: String,
    /// Owning group
    pub group: String,
    /// File size, or total size of live files beneath a directory
    pub size: u64,
    /// Last modification, ms since epoch
    pub last_modified: i64,
    /// Cached checksum, 0 when unknown
    pub checksum: u64,
    /// Upload duration in ms, 0 when unknown
    pub xfertime: i64,
    /// Slaves holding the file (empty for directories)
    pub replicas: Vec<SlaveRef>,
    /// Tombstone flag
    pub deleted: bool,
    /// Names of live children (directories only)
    pub children: Vec<String>,
}

impl NodeInfo {
    /// Whether this is a file
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Whether this is a directory
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Replica names in order
    pub fn replica_names(&self) -> Vec<String> {
        self.replicas.iter().map(|s| s.name().to_string()).collect()
    }

    /// Whether `slave` holds this file
    pub fn has_replica(&self, slave: &str) -> bool {
        self.replicas.iter().any(|s| s.name() == slave)
    }
}

/// Outcome of a remerge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemergeReport {
    /// Entries created in the tree
    pub added: usize,
    /// Existing files the slave was attached to
    pub merged: usize,
    /// Paths skipped because of a file/directory collision
    pub conflicts: Vec<String>,
    /// Files the slave no longer reports and was detached from
    pub vanished: usize,
    /// Tombstoned files whose pending delete succeeded on this slave
    pub deletes_completed: usize,
}

/// Outcome of a delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Files removed from the tree
    pub removed: Vec<String>,
    /// Files left as tombstones because a replica was unreachable
    pub tombstoned: Vec<String>,
}

/// Slave-side work decided while holding the lock
#[derive(Debug)]
enum PendingRpc {
    RetryDelete { path: String },
    DropEmpty { path: String },
    Conflict { path: String, dir: String, name: String },
}

/// Split an absolute path into its components
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(StowageError::InvalidPath(format!("{} is not absolute", path)));
    }
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(StowageError::InvalidPath(format!("{} contains a relative component", path)));
    }
    Ok(parts)
}

/// Join a directory path and a name
pub(crate) fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\n', '\r']) || name == "." || name == ".." {
        return Err(StowageError::InvalidPath(format!("{:?} is not a valid entry name", name)));
    }
    Ok(())
}

/// Owners and groups end up inside `key=value;` snapshot facts
fn validate_ownership(owner: &str, group: &str) -> Result<()> {
    for value in [owner, group] {
        if value.contains([';', '=', '\n', '\r']) {
            return Err(StowageError::InvalidPath(format!("{:?} is not a valid owner or group", value)));
        }
    }
    Ok(())
}

/// Lock-free arena the [`ReplicaTree`] guards
#[derive(Debug, Clone)]
pub(crate) struct TreeInner {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
}

impl Index<NodeId> for TreeInner {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match &self.slots[id.0] {
            Some(node) => node,
            None => panic!("dangling node id {}", id.0),
        }
    }
}

impl IndexMut<NodeId> for TreeInner {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        match &mut self.slots[id.0] {
            Some(node) => node,
            None => panic!("dangling node id {}", id.0),
        }
    }
}

impl TreeInner {
    pub(crate) const ROOT: NodeId = NodeId(0);

    pub(crate) fn new() -> Self {
        Self {
            slots: vec![Some(Node::directory("", "nobody", "nogroup", 0))],
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                NodeId(idx)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Free `id` and its whole subtree; the caller detaches it first
    fn release(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self[id].children.values().copied().collect();
        for child in children {
            self.release(child);
        }
        self.slots[id.0] = None;
        self.free.push(id.0);
    }

    pub(crate) fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self[dir].children.get(&NameKey::new(name)).copied()
    }

    pub(crate) fn children(&self, dir: NodeId) -> Vec<NodeId> {
        self[dir].children.values().copied().collect()
    }

    pub(crate) fn attach(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        node.parent = Some(parent);
        let key = NameKey::new(&node.name);
        let id = self.alloc(node);
        self[parent].children.insert(key, id);
        id
    }

    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self[id].parent.take() {
            let key = NameKey::new(&self[id].name);
            self[parent].children.remove(&key);
        }
    }

    /// Detach and free a node
    fn remove(&mut self, id: NodeId) {
        self.detach(id);
        self.release(id);
    }

    /// Remove directories emptied by a child disappearing, walking upwards
    fn prune_upwards(&mut self, mut dir: NodeId) {
        while dir != Self::ROOT && self[dir].is_dir() && self[dir].children.is_empty() {
            let parent = self[dir].parent;
            trace!("Pruning empty directory {}", self.path_of(dir));
            self.remove(dir);
            match parent {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    /// Like [`TreeInner::prune_upwards`] but stops at directories not being deleted
    fn prune_deleted_upwards(&mut self, mut dir: NodeId) {
        while dir != Self::ROOT && self[dir].delete_pending && self[dir].children.is_empty() {
            let parent = self[dir].parent;
            debug!("Deleted directory {} is empty, removing it", self.path_of(dir));
            self.remove(dir);
            match parent {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    fn mark_delete_pending(&mut self, dir: NodeId) {
        if !self[dir].is_dir() {
            return;
        }
        self[dir].delete_pending = true;
        for child in self.children(dir) {
            self.mark_delete_pending(child);
        }
    }

    /// New content under a deleted directory brings it and its parents back
    fn revive(&mut self, mut id: NodeId) {
        loop {
            self[id].delete_pending = false;
            match self[id].parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
    }

    pub(crate) fn resolve(&self, path: &str) -> Result<Option<NodeId>> {
        let mut current = Self::ROOT;
        for part in split_path(path)? {
            if !self[current].is_dir() {
                return Ok(None);
            }
            match self.child(current, part) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn resolve_live(&self, path: &str) -> Result<NodeId> {
        match self.resolve(path)? {
            Some(id) if !self[id].deleted => Ok(id),
            _ => Err(StowageError::ObjectNotFound(path.to_string())),
        }
    }

    pub(crate) fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == Self::ROOT {
                break;
            }
            parts.push(self[node_id].name.as_str());
            current = self[node_id].parent;
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self[id].parent {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    pub(crate) fn dir_size(&self, dir: NodeId) -> u64 {
        self[dir]
            .children
            .values()
            .map(|&child| {
                let node = &self[child];
                if node.is_dir() {
                    self.dir_size(child)
                } else if node.deleted {
                    0
                } else {
                    node.size
                }
            })
            .sum()
    }

    /// Every file id beneath `id` (or `id` itself when it is a file)
    pub(crate) fn files_beneath(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if self[id].is_file() {
            out.push(id);
            return;
        }
        for child in self.children(id) {
            self.files_beneath(child, out);
        }
    }

    pub(crate) fn info(&self, id: NodeId) -> NodeInfo {
        let node = &self[id];
        let size = if node.is_dir() { self.dir_size(id) } else { node.size };
        NodeInfo {
            path: self.path_of(id),
            name: node.name.clone(),
            kind: node.kind,
            owner: node.owner.clone(),
            group: node.group.clone(),
            size,
            last_modified: node.last_modified,
            checksum: node.checksum,
            xfertime: node.xfertime,
            replicas: node.replicas.iter().cloned().collect(),
            deleted: node.deleted,
            children: node
                .children
                .values()
                .filter(|&&c| !self[c].deleted)
                .map(|&c| self[c].name.clone())
                .collect(),
        }
    }

    /// Walk `parts`, creating missing directories; fails on a file in the way
    fn ensure_dirs(&mut self, parts: &[&str], owner: &str, group: &str, last_modified: i64) -> Result<NodeId> {
        let mut current = Self::ROOT;
        for (depth, part) in parts.iter().enumerate() {
            match self.child(current, part) {
                Some(next) if self[next].is_dir() => current = next,
                Some(_) => {
                    return Err(StowageError::MergeConflict(format!(
                        "/{} is a file where a directory is expected",
                        parts[..=depth].join("/")
                    )));
                }
                None => {
                    validate_name(part)?;
                    current = self.attach(current, Node::directory(part, owner, group, last_modified));
                }
            }
        }
        Ok(current)
    }

    fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            let node = &self[id];
            if node.is_dir() {
                stats.directories += 1;
                stack.extend(node.children.values().copied());
            } else if node.deleted {
                stats.tombstones += 1;
            } else {
                stats.files += 1;
                stats.total_bytes += node.size;
                for slave in &node.replicas {
                    *stats.files_per_slave.entry(slave.name().to_string()).or_insert(0) += 1;
                }
            }
        }
        stats
    }

    /// Drop `slave` from every file under `dir`; returns detached files
    fn unmerge_dir(&mut self, dir: NodeId, slave: &SlaveRef) -> usize {
        let mut detached = 0;
        for child in self.children(dir) {
            if self[child].is_dir() {
                let was_empty = self[child].children.is_empty();
                detached += self.unmerge_dir(child, slave);
                if !was_empty && self[child].children.is_empty() {
                    self.remove(child);
                }
            } else {
                let node = &mut self[child];
                if node.deleted || !node.replicas.remove(slave) {
                    // tombstones keep their pending slaves for the delete retry
                    continue;
                }
                if node.replicas.is_empty() {
                    debug!("{} lost its last replica ({})", node.name, slave.name());
                    self.remove(child);
                    detached += 1;
                }
            }
        }
        detached
    }

    /// Remove directories without children beneath and including `id`
    fn prune_empty_subtree(&mut self, id: NodeId) {
        if !self[id].is_dir() {
            return;
        }
        for child in self.children(id) {
            self.prune_empty_subtree(child);
        }
        if id != Self::ROOT && self[id].children.is_empty() {
            self.remove(id);
        }
    }
}

/// The coordinator's merged namespace
///
/// # Examples
///
/// ```rust
/// use stowage::{ListingEntry, MemorySlave, ReplicaTree};
///
/// let (slave, handle) = MemorySlave::shared("slave1");
/// slave.add_file("/mp3/release/01.mp3", 1024, 0, 1_000);
///
/// let tree = ReplicaTree::new();
/// tree.remerge(&slave.listing(), &handle)?;
///
/// let file = tree.lookup("/mp3/release/01.mp3")?;
/// assert_eq!(file.replica_names(), vec!["slave1".to_string()]);
/// # Ok::<(), stowage::StowageError>(())
/// ```
#[derive(Debug)]
pub struct ReplicaTree {
    inner: RwLock<TreeInner>,
}

impl Default for ReplicaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaTree {
    /// Create an empty tree holding only the root directory
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TreeInner::new()),
        }
    }

    pub(crate) fn from_inner(inner: TreeInner) -> Self {
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub(crate) fn read_inner(&self) -> parking_lot::RwLockReadGuard<'_, TreeInner> {
        self.inner.read()
    }

    pub(crate) fn replace_inner(&self, inner: TreeInner) {
        *self.inner.write() = inner;
    }

    /// Look up a live node
    ///
    /// Tombstoned files are reported as [`StowageError::ObjectNotFound`];
    /// use [`ReplicaTree::inspect`] to see them.
    pub fn lookup(&self, path: &str) -> Result<NodeInfo> {
        let inner = self.inner.read();
        let id = inner.resolve_live(path)?;
        Ok(inner.info(id))
    }

    /// Look up a node including tombstones
    pub fn inspect(&self, path: &str) -> Result<NodeInfo> {
        let inner = self.inner.read();
        match inner.resolve(path)? {
            Some(id) => Ok(inner.info(id)),
            None => Err(StowageError::ObjectNotFound(path.to_string())),
        }
    }

    /// Whether a live node exists at `path`
    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_ok()
    }

    /// Create directory `name` inside `parent`
    #[instrument(skip(self))]
    pub fn create_directory(&self, parent: &str, name: &str, owner: &str, group: &str) -> Result<NodeInfo> {
        validate_name(name)?;
        validate_ownership(owner, group)?;
        let mut inner = self.inner.write();
        let parent_id = inner.resolve_live(parent)?;
        if !inner[parent_id].is_dir() {
            return Err(StowageError::NotADirectory(parent.to_string()));
        }
        if inner.child(parent_id, name).is_some() {
            return Err(StowageError::AlreadyExists(join_path(parent, name)));
        }
        inner.revive(parent_id);
        let id = inner.attach(parent_id, Node::directory(name, owner, group, now_millis()));
        debug!("Created directory {}", inner.path_of(id));
        Ok(inner.info(id))
    }

    /// Insert or update one file and attach `slave` to it
    ///
    /// Missing parent directories are created. An existing file keeps the
    /// older of the two modification times.
    #[instrument(skip(self, entry, slave), fields(path = %entry.path, slave = %slave))]
    pub fn put_file(&self, entry: &ListingEntry, slave: &SlaveRef) -> Result<NodeInfo> {
        if entry.kind != NodeKind::File {
            return Err(StowageError::NotAFile(entry.path.clone()));
        }
        let parts = split_path(&entry.path)?;
        let Some((name, dirs)) = parts.split_last() else {
            return Err(StowageError::NotAFile(entry.path.clone()));
        };
        validate_name(name)?;
        validate_ownership(&entry.owner, &entry.group)?;

        let mut inner = self.inner.write();
        let parent = inner.ensure_dirs(dirs, &entry.owner, &entry.group, entry.last_modified)?;
        let id = match inner.child(parent, name) {
            Some(id) => {
                let node = &mut inner[id];
                if node.is_dir() {
                    return Err(StowageError::MergeConflict(format!(
                        "{} is a directory",
                        entry.path
                    )));
                }
                if node.deleted {
                    return Err(StowageError::AlreadyExists(format!(
                        "{} is pending deletion",
                        entry.path
                    )));
                }
                node.size = entry.size;
                node.owner = entry.owner.clone();
                node.group = entry.group.clone();
                node.last_modified = node.last_modified.min(entry.last_modified);
                if entry.checksum != 0 {
                    node.checksum = entry.checksum;
                }
                node.replicas.insert(slave.clone());
                id
            }
            None => {
                let mut node = Node::file(name, entry);
                node.replicas.insert(slave.clone());
                inner.attach(parent, node)
            }
        };
        inner.revive(parent);
        trace!("Stored {} on {}", entry.path, slave.name());
        Ok(inner.info(id))
    }

    /// Record how long the upload of `path` took
    pub fn set_transfer_time(&self, path: &str, xfertime: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let id = inner.resolve_live(path)?;
        if !inner[id].is_file() {
            return Err(StowageError::NotAFile(path.to_string()));
        }
        inner[id].xfertime = xfertime;
        Ok(())
    }

    /// Reconcile a slave's full listing into the tree
    ///
    /// New entries are created, existing files gain `slave` as a replica and
    /// keep the oldest modification time, and files the slave no longer
    /// reports lose it. Entries whose kind disagrees with the tree are logged
    /// and skipped. Pending deletes of tombstoned files the slave still
    /// reports are retried against it.
    #[instrument(skip(self, listing, slave), fields(slave = %slave, entries = listing.len()))]
    pub fn remerge(&self, listing: &[ListingEntry], slave: &SlaveRef) -> Result<RemergeReport> {
        let mut report = RemergeReport::default();
        let mut pending = Vec::new();

        let mut ordered: Vec<(Vec<&str>, &ListingEntry)> = Vec::with_capacity(listing.len());
        for entry in listing {
            match split_path(&entry.path) {
                Ok(_) if validate_ownership(&entry.owner, &entry.group).is_err() => {
                    warn!("Skipping {} from {}: bad owner or group", entry.path, slave.name());
                    report.conflicts.push(entry.path.clone());
                }
                Ok(parts) if !parts.is_empty() => ordered.push((parts, entry)),
                Ok(_) => {}
                Err(e) => warn!("Skipping listing entry from {}: {}", slave.name(), e),
            }
        }
        ordered.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.1.path.cmp(&b.1.path)));

        {
            let mut inner = self.inner.write();
            let mut seen: HashSet<NodeId> = HashSet::new();

            for (parts, entry) in &ordered {
                let (name, dirs) = match parts.split_last() {
                    Some(split) => split,
                    None => continue,
                };
                let parent = match inner.ensure_dirs(dirs, &entry.owner, &entry.group, entry.last_modified) {
                    Ok(parent) => parent,
                    Err(e) => {
                        warn!("Conflict merging {} from {}: {}", entry.path, slave.name(), e);
                        report.conflicts.push(entry.path.clone());
                        continue;
                    }
                };

                let existing = inner.child(parent, name);
                match (existing, entry.kind) {
                    (None, NodeKind::Directory) => {
                        if validate_name(name).is_err() {
                            report.conflicts.push(entry.path.clone());
                            continue;
                        }
                        inner.attach(
                            parent,
                            Node::directory(name, &entry.owner, &entry.group, entry.last_modified),
                        );
                        report.added += 1;
                    }
                    (None, NodeKind::File) => {
                        if validate_name(name).is_err() {
                            report.conflicts.push(entry.path.clone());
                            continue;
                        }
                        let mut node = Node::file(name, entry);
                        node.replicas.insert(slave.clone());
                        let id = inner.attach(parent, node);
                        seen.insert(id);
                        report.added += 1;
                    }
                    (Some(id), kind) if inner[id].kind != kind => {
                        warn!(
                            "Type conflict for {}: tree has {:?}, {} reports {:?}",
                            entry.path,
                            inner[id].kind,
                            slave.name(),
                            kind
                        );
                        report.conflicts.push(entry.path.clone());
                    }
                    (Some(_), NodeKind::Directory) => {}
                    (Some(id), NodeKind::File) => {
                        self.merge_file(&mut inner, id, parent, entry, slave, &mut seen, &mut pending, &mut report);
                    }
                }
            }

            // drop the slave from files it no longer reports
            let mut files = Vec::new();
            inner.files_beneath(TreeInner::ROOT, &mut files);
            for id in files {
                if seen.contains(&id) || !inner[id].replicas.contains(slave) {
                    continue;
                }
                inner[id].replicas.remove(slave);
                report.vanished += 1;
                if inner[id].replicas.is_empty() {
                    let parent = inner[id].parent;
                    debug!("{} vanished from its last replica {}", inner.path_of(id), slave.name());
                    inner.remove(id);
                    if let Some(parent) = parent {
                        inner.prune_upwards(parent);
                    }
                }
            }
        }

        let mut completed = Vec::new();
        for rpc in pending {
            match rpc {
                PendingRpc::RetryDelete { path } => match slave.delete(&path) {
                    Ok(()) => {
                        info!("Pending delete of {} completed on {}", path, slave.name());
                        completed.push(path);
                    }
                    Err(e) => warn!("Retrying delete of {} on {} failed: {}", path, slave.name(), e),
                },
                PendingRpc::DropEmpty { path } => {
                    if let Err(e) = slave.delete(&path) {
                        warn!("Failed to drop empty {} on {}: {}", path, slave.name(), e);
                    }
                }
                PendingRpc::Conflict { path, dir, name } => {
                    if let Err(e) = slave.rename(&path, &dir, &name) {
                        warn!("Failed to move conflicting {} aside on {}: {}", path, slave.name(), e);
                    }
                }
            }
        }

        if !completed.is_empty() {
            let mut inner = self.inner.write();
            for path in completed {
                if let Ok(Some(id)) = inner.resolve(&path) {
                    if inner[id].is_file() && inner[id].deleted {
                        inner[id].replicas.remove(slave);
                        if inner[id].replicas.is_empty() {
                            debug!("Tombstone {} fully deleted", path);
                            let parent = inner[id].parent;
                            inner.remove(id);
                            if let Some(parent) = parent {
                                inner.prune_deleted_upwards(parent);
                            }
                        }
                        report.deletes_completed += 1;
                    }
                }
            }
        }

        info!(
            "Remerged {}: {} added, {} merged, {} vanished, {} conflicts",
            slave.name(),
            report.added,
            report.merged,
            report.vanished,
            report.conflicts.len()
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_file(
        &self,
        inner: &mut TreeInner,
        id: NodeId,
        parent: NodeId,
        entry: &ListingEntry,
        slave: &SlaveRef,
        seen: &mut HashSet<NodeId>,
        pending: &mut Vec<PendingRpc>,
        report: &mut RemergeReport,
    ) {
        let node = &mut inner[id];
        if node.deleted {
            node.replicas.insert(slave.clone());
            seen.insert(id);
            pending.push(PendingRpc::RetryDelete {
                path: entry.path.clone(),
            });
            return;
        }

        if node.size == entry.size {
            node.replicas.insert(slave.clone());
            node.last_modified = node.last_modified.min(entry.last_modified);
            if node.checksum == 0 {
                node.checksum = entry.checksum;
            }
            seen.insert(id);
            report.merged += 1;
            return;
        }

        if entry.size == 0 {
            debug!("{} holds an empty copy of {}, deleting it", slave.name(), entry.path);
            pending.push(PendingRpc::DropEmpty {
                path: entry.path.clone(),
            });
            return;
        }

        if node.replicas.len() == 1 && node.replicas.contains(slave) {
            node.size = entry.size;
            node.checksum = entry.checksum;
            node.last_modified = entry.last_modified;
            seen.insert(id);
            report.merged += 1;
            return;
        }

        let conflict_name = format!("{}.{}.conflict", node.name, slave.name());
        let dir = inner.path_of(parent);
        warn!(
            "Size mismatch for {} on {} ({} != {}), moving it to {}",
            entry.path,
            slave.name(),
            entry.size,
            inner[id].size,
            conflict_name
        );
        pending.push(PendingRpc::Conflict {
            path: entry.path.clone(),
            dir,
            name: conflict_name.clone(),
        });
        let conflict_id = match inner.child(parent, &conflict_name) {
            Some(existing) if inner[existing].is_file() && !inner[existing].deleted => {
                inner[existing].replicas.insert(slave.clone());
                existing
            }
            Some(_) => {
                report.conflicts.push(entry.path.clone());
                return;
            }
            None => {
                let mut node = Node::file(&conflict_name, entry);
                node.replicas.insert(slave.clone());
                report.added += 1;
                inner.attach(parent, node)
            }
        };
        seen.insert(conflict_id);
    }

    /// Remove `slave` from every replica set after it disconnects
    ///
    /// Files left without replicas are detached; directories that become
    /// empty because of it are pruned. Tombstones keep the slave so the
    /// pending delete is retried when it comes back.
    #[instrument(skip(self, slave), fields(slave = %slave))]
    pub fn unmerge(&self, slave: &SlaveRef) -> usize {
        let detached = self.inner.write().unmerge_dir(TreeInner::ROOT, slave);
        info!("Unmerged {}: {} files detached", slave.name(), detached);
        detached
    }

    /// Delete a file, or every file beneath a directory, from all replicas
    ///
    /// Replicas that acknowledge are dropped. Files with unreachable replicas
    /// stay behind as tombstones listing only those replicas.
    #[instrument(skip(self))]
    pub fn delete(&self, path: &str) -> Result<DeleteReport> {
        let (targets, is_dir) = {
            let inner = self.inner.read();
            let id = match inner.resolve(path)? {
                Some(id) => id,
                None => return Err(StowageError::ObjectNotFound(path.to_string())),
            };
            if id == TreeInner::ROOT {
                return Err(StowageError::InvalidPath("cannot delete the root directory".to_string()));
            }
            let mut files = Vec::new();
            inner.files_beneath(id, &mut files);
            let targets: Vec<(String, Vec<SlaveRef>)> = files
                .into_iter()
                .map(|f| (inner.path_of(f), inner[f].replicas.iter().cloned().collect()))
                .collect();
            (targets, inner[id].is_dir())
        };

        let mut acked: Vec<(String, Vec<SlaveRef>)> = Vec::with_capacity(targets.len());
        for (file, replicas) in targets {
            let mut ok = Vec::new();
            for slave in replicas {
                match slave.delete(&file) {
                    Ok(()) => {
                        debug!("DELETE {} on {}", file, slave.name());
                        ok.push(slave);
                    }
                    Err(e) => warn!("Delete of {} on {} failed, keeping tombstone: {}", file, slave.name(), e),
                }
            }
            acked.push((file, ok));
        }

        let mut report = DeleteReport::default();
        let mut inner = self.inner.write();
        if is_dir {
            if let Some(id) = inner.resolve(path)? {
                inner.mark_delete_pending(id);
            }
        }
        for (file, ok) in acked {
            let id = match inner.resolve(&file)? {
                Some(id) if inner[id].is_file() => id,
                _ => continue,
            };
            let node = &mut inner[id];
            for slave in &ok {
                node.replicas.remove(slave);
            }
            if node.replicas.is_empty() {
                let parent = node.parent;
                inner.remove(id);
                if let Some(parent) = parent {
                    inner.prune_deleted_upwards(parent);
                }
                report.removed.push(file);
            } else {
                node.deleted = true;
                report.tombstoned.push(file);
            }
        }
        if is_dir {
            if let Some(id) = inner.resolve(path)? {
                inner.prune_empty_subtree(id);
            }
        }
        info!(
            "Deleted {}: {} removed, {} tombstoned",
            path,
            report.removed.len(),
            report.tombstoned.len()
        );
        Ok(report)
    }

    /// Move a node to `to_dir/to_name`
    ///
    /// Every replica is asked to rename its copy first; failures are logged
    /// and the in-memory node moves regardless, keeping its identity and
    /// replica set.
    #[instrument(skip(self))]
    pub fn rename(&self, from: &str, to_dir: &str, to_name: &str) -> Result<NodeInfo> {
        validate_name(to_name)?;
        let (stored_from, stored_dir, slaves) = {
            let inner = self.inner.read();
            let (source, target_dir) = Self::check_rename(&inner, from, to_dir, to_name)?;
            let mut files = Vec::new();
            inner.files_beneath(source, &mut files);
            let slaves: BTreeSet<SlaveRef> = files
                .into_iter()
                .flat_map(|f| inner[f].replicas.iter().cloned().collect::<Vec<_>>())
                .collect();
            (inner.path_of(source), inner.path_of(target_dir), slaves)
        };

        for slave in &slaves {
            if let Err(e) = slave.rename(&stored_from, &stored_dir, to_name) {
                warn!("Rename of {} on {} failed: {}", stored_from, slave.name(), e);
            }
        }

        let mut inner = self.inner.write();
        let (source, target_dir) = Self::check_rename(&inner, from, to_dir, to_name)?;
        inner.detach(source);
        inner[source].name = to_name.to_string();
        inner[source].parent = Some(target_dir);
        inner[target_dir].children.insert(NameKey::new(to_name), source);
        debug!("Renamed {} to {}", from, inner.path_of(source));
        Ok(inner.info(source))
    }

    fn check_rename(inner: &TreeInner, from: &str, to_dir: &str, to_name: &str) -> Result<(NodeId, NodeId)> {
        let source = inner.resolve_live(from)?;
        if source == TreeInner::ROOT {
            return Err(StowageError::InvalidPath("cannot rename the root directory".to_string()));
        }
        let target_dir = match inner.resolve(to_dir)? {
            Some(id) if inner[id].is_dir() => id,
            _ => {
                return Err(StowageError::InvalidTarget(format!(
                    "{} is not an existing directory",
                    to_dir
                )))
            }
        };
        if let Some(existing) = inner.child(target_dir, to_name) {
            if existing != source {
                return Err(StowageError::AlreadyExists(join_path(to_dir, to_name)));
            }
        }
        if inner.is_ancestor(source, target_dir) {
            return Err(StowageError::InvalidTarget(format!(
                "cannot move {} into its own subtree {}",
                from, to_dir
            )));
        }
        Ok((source, target_dir))
    }

    /// Checksum of a file, asking a replica when none is cached
    ///
    /// Available replicas are tried in turn; the first answer is cached.
    /// Returns 0 with a warning when no replica can answer.
    #[instrument(skip(self))]
    pub fn checksum(&self, path: &str) -> Result<u64> {
        let (stored, candidates): (String, Vec<SlaveRef>) = {
            let inner = self.inner.read();
            let id = inner.resolve_live(path)?;
            let node = &inner[id];
            if !node.is_file() {
                return Err(StowageError::NotAFile(path.to_string()));
            }
            if node.checksum != 0 || node.size == 0 {
                return Ok(node.checksum);
            }
            let candidates = node.replicas.iter().filter(|s| s.is_available()).cloned().collect();
            (inner.path_of(id), candidates)
        };

        for slave in candidates {
            match slave.checksum(&stored) {
                Ok(checksum) => {
                    let mut inner = self.inner.write();
                    if let Some(id) = inner.resolve(&stored)? {
                        inner[id].checksum = checksum;
                    }
                    return Ok(checksum);
                }
                Err(e) => debug!("Checksum of {} from {} failed: {}", path, slave.name(), e),
            }
        }
        warn!("No replica could checksum {}", path);
        Ok(0)
    }

    /// Live files beneath `path` (or the file itself)
    pub fn files_under(&self, path: &str) -> Result<Vec<NodeInfo>> {
        let inner = self.inner.read();
        let id = inner.resolve_live(path)?;
        let mut files = Vec::new();
        inner.files_beneath(id, &mut files);
        Ok(files
            .into_iter()
            .filter(|&f| !inner[f].deleted)
            .map(|f| inner.info(f))
            .collect())
    }

    /// Replicas of a live file that are currently online
    pub fn available_slaves(&self, path: &str) -> Result<Vec<SlaveRef>> {
        let inner = self.inner.read();
        let id = inner.resolve_live(path)?;
        if !inner[id].is_file() {
            return Err(StowageError::NotAFile(path.to_string()));
        }
        Ok(inner[id].replicas.iter().filter(|s| s.is_available()).cloned().collect())
    }

    /// Aggregate counters over the whole tree
    pub fn stats(&self) -> TreeStats {
        self.inner.read().stats()
    }
}
