//! MLST-style tree snapshots
//!
//! A snapshot is plain text, one block per directory:
//!
//! ```text
//! /:
//! type=dir;size=30;modify=20240101120000.000;unix.owner=nobody;unix.group=nogroup; mp3
//!
//! /mp3:
//! type=file;size=30;modify=20240101120000.000;x.crc32=0000ABCD;unix.owner=nobody;unix.group=nogroup;x.slaves=slave1,slave2; a.mp3
//!
//! ```
//!
//! The header names the directory, each fact line describes one child and a
//! blank line closes the block. Blocks are written parent first, so every
//! header refers to a directory already declared by an earlier fact line.
//!
//! Slaves are stored by name and resolved against a [`SlaveRegistry`] when
//! loading; names the registry does not know are dropped with a warning.

use crate::error::{Result, StowageError};
use crate::slave::SlaveRegistry;
use crate::tree::{Node, NodeId, ReplicaTree, TreeInner};
use crate::types::{ListingEntry, NodeKind};
use crate::utils::{atomic_write, format_mlst_time, parse_mlst_time};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Render the whole tree
pub(crate) fn serialize(inner: &TreeInner) -> String {
    let mut out = String::new();
    let mut stack = vec![TreeInner::ROOT];
    while let Some(dir) = stack.pop() {
        let _ = writeln!(out, "{}:", inner.path_of(dir));
        let mut subdirs = Vec::new();
        for child in inner.children(dir) {
            let node = &inner[child];
            out.push_str(&fact_line(inner, child, node));
            out.push('\n');
            if node.is_dir() {
                subdirs.push(child);
            }
        }
        out.push('\n');
        // reversed so the stack pops them in name order
        stack.extend(subdirs.into_iter().rev());
    }
    out
}

fn fact_line(inner: &TreeInner, id: NodeId, node: &Node) -> String {
    let size = if node.is_dir() { inner.dir_size(id) } else { node.size };
    let mut line = format!(
        "type={};size={};modify={};",
        node.kind.as_fact(),
        size,
        format_mlst_time(node.last_modified)
    );
    if node.checksum != 0 {
        let _ = write!(line, "x.crc32={:08X};", node.checksum);
    }
    let _ = write!(line, "unix.owner={};unix.group={};", node.owner, node.group);
    if !node.replicas.is_empty() {
        let names: Vec<&str> = node.replicas.iter().map(|s| s.name()).collect();
        let _ = write!(line, "x.slaves={};", names.join(","));
    }
    if node.xfertime != 0 {
        let _ = write!(line, "x.xfertime={};", node.xfertime);
    }
    if node.deleted || node.delete_pending {
        line.push_str("x.deleted=1;");
    }
    line.push(' ');
    line.push_str(&node.name);
    line
}

struct Facts<'a> {
    name: &'a str,
    values: BTreeMap<&'a str, &'a str>,
}

fn split_facts(line: &str, lineno: usize) -> Result<Facts<'_>> {
    let (facts, name) = line
        .split_once("; ")
        .ok_or_else(|| StowageError::corrupt(lineno, "fact line has no entry name"))?;
    if name.is_empty() || name.contains('/') {
        return Err(StowageError::corrupt(lineno, format!("invalid entry name {:?}", name)));
    }
    let mut values = BTreeMap::new();
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = fact
            .split_once('=')
            .ok_or_else(|| StowageError::corrupt(lineno, format!("malformed fact {:?}", fact)))?;
        values.insert(key, value);
    }
    Ok(Facts { name, values })
}

fn required<'a>(facts: &Facts<'a>, key: &str, lineno: usize) -> Result<&'a str> {
    facts
        .values
        .get(key)
        .copied()
        .ok_or_else(|| StowageError::corrupt(lineno, format!("missing {} fact", key)))
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str, lineno: usize) -> Result<T> {
    value
        .parse()
        .map_err(|_| StowageError::corrupt(lineno, format!("invalid {} value {:?}", key, value)))
}

/// Rebuild an arena from snapshot text
pub(crate) fn parse(text: &str, registry: &SlaveRegistry) -> Result<TreeInner> {
    let mut inner = TreeInner::new();
    let mut current: Option<NodeId> = None;
    let mut declared: BTreeSet<NodeId> = BTreeSet::new();

    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        if line.trim().is_empty() {
            current = None;
            continue;
        }

        if current.is_none() {
            let path = line
                .strip_suffix(':')
                .filter(|p| p.starts_with('/'))
                .ok_or_else(|| StowageError::corrupt(lineno, "expected a directory header"))?;
            let id = match inner.resolve(path) {
                Ok(Some(id)) if inner[id].is_dir() => id,
                _ => {
                    return Err(StowageError::corrupt(
                        lineno,
                        format!("header {} names no declared directory", path),
                    ))
                }
            };
            if !declared.insert(id) {
                return Err(StowageError::corrupt(lineno, format!("duplicate block for {}", path)));
            }
            current = Some(id);
            continue;
        }

        let Some(dir) = current else { continue };
        let facts = split_facts(line, lineno)?;
        if inner.child(dir, facts.name).is_some() {
            return Err(StowageError::corrupt(
                lineno,
                format!("duplicate entry {}", facts.name),
            ));
        }

        let modify = required(&facts, "modify", lineno)?;
        let last_modified = parse_mlst_time(modify)
            .ok_or_else(|| StowageError::corrupt(lineno, format!("invalid modify value {:?}", modify)))?;
        let owner = facts.values.get("unix.owner").copied().unwrap_or("nobody");
        let group = facts.values.get("unix.group").copied().unwrap_or("nogroup");
        let deleted = facts.values.get("x.deleted").is_some_and(|v| *v == "1");

        match required(&facts, "type", lineno)? {
            "dir" => {
                let mut node = Node::directory(facts.name, owner, group, last_modified);
                node.delete_pending = deleted;
                inner.attach(dir, node);
            }
            "file" => {
                let size: u64 = parse_number(required(&facts, "size", lineno)?, "size", lineno)?;
                let checksum = match facts.values.get("x.crc32") {
                    Some(hex) => u64::from_str_radix(hex, 16).map_err(|_| {
                        StowageError::corrupt(lineno, format!("invalid x.crc32 value {:?}", hex))
                    })?,
                    None => 0,
                };
                let xfertime: i64 = match facts.values.get("x.xfertime") {
                    Some(v) => parse_number(v, "x.xfertime", lineno)?,
                    None => 0,
                };
                let mut replicas = BTreeSet::new();
                if let Some(list) = facts.values.get("x.slaves") {
                    for name in list.split(',').filter(|n| !n.is_empty()) {
                        match registry.get(name) {
                            Ok(slave) => {
                                replicas.insert(slave);
                            }
                            Err(_) => warn!("Line {}: dropping unknown slave {}", lineno, name),
                        }
                    }
                }
                if replicas.is_empty() {
                    warn!("Line {}: {} has no known replica, skipping", lineno, facts.name);
                    continue;
                }

                let entry = ListingEntry {
                    path: String::new(),
                    kind: NodeKind::File,
                    size,
                    last_modified,
                    checksum,
                    owner: owner.to_string(),
                    group: group.to_string(),
                };
                let mut node = Node::file(facts.name, &entry);
                node.xfertime = xfertime;
                node.deleted = deleted;
                node.replicas = replicas;
                inner.attach(dir, node);
            }
            other => {
                return Err(StowageError::corrupt(lineno, format!("unknown type {:?}", other)));
            }
        }
    }

    debug!("Parsed snapshot into {} directory blocks", declared.len());
    Ok(inner)
}

/// Slave names mentioned anywhere in a snapshot
///
/// Lets a caller register placeholder handles before loading a snapshot
/// written by another coordinator.
pub fn snapshot_slave_names(text: &str) -> BTreeSet<String> {
    text.lines()
        .filter_map(|line| line.split_once("; ").map(|(facts, _)| facts))
        .flat_map(|facts| facts.split(';'))
        .filter_map(|fact| fact.strip_prefix("x.slaves="))
        .flat_map(|list| list.split(','))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

impl ReplicaTree {
    /// Render the tree in snapshot form
    pub fn to_snapshot(&self) -> String {
        serialize(&self.read_inner())
    }

    /// Build a new tree from snapshot text
    pub fn from_snapshot(text: &str, registry: &SlaveRegistry) -> Result<Self> {
        Ok(Self::from_inner(parse(text, registry)?))
    }

    /// Replace this tree's contents with a parsed snapshot
    ///
    /// On error the current contents are left untouched.
    pub fn restore_snapshot(&self, text: &str, registry: &SlaveRegistry) -> Result<()> {
        let parsed = parse(text, registry)?;
        self.replace_inner(parsed);
        Ok(())
    }

    /// Write the tree to `path` atomically
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let text = self.to_snapshot();
        atomic_write(path, text.as_bytes())?;
        info!("Saved tree snapshot ({} bytes)", text.len());
        Ok(())
    }

    /// Load a snapshot file, keeping the current tree if it is corrupt
    #[instrument(skip(self, registry), fields(path = %path.display()))]
    pub fn load_snapshot(&self, path: &Path, registry: &SlaveRegistry) -> Result<()> {
        let text = fs::read_to_string(path)?;
        match self.restore_snapshot(&text, registry) {
            Ok(()) => {
                info!("Loaded tree snapshot");
                Ok(())
            }
            Err(e) => {
                warn!("Keeping current tree, snapshot rejected: {}", e);
                Err(e)
            }
        }
    }
}
