//! Core data types used throughout the stowage library
//!
//! ## Overview
//!
//! - **Transfers**: [`Direction`], [`TransferInfo`], [`TransferRequest`]
//! - **Slave state**: [`SlaveStatus`]
//! - **Namespace**: [`NodeKind`], [`ListingEntry`] (the remerge payload),
//!   [`TreeStats`]
//!
//! Timestamps are milliseconds since the Unix epoch, matching what slaves
//! report in their listings.

use crate::slave::SlaveRef;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Transfer flow as seen from the slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The slave receives bytes
    Upload,
    /// The slave sends bytes
    Download,
}

impl Direction {
    /// Short name used in logs and configuration file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "up",
            Direction::Download => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a replica-tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Directory holding children
    Directory,
    /// Regular file held by one or more slaves
    File,
}

impl NodeKind {
    /// MLST `type` fact value
    pub fn as_fact(&self) -> &'static str {
        match self {
            NodeKind::Directory => "dir",
            NodeKind::File => "file",
        }
    }
}

/// Live status of one slave
///
/// Throughput is in bytes per second, space in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveStatus {
    /// Free disk space
    pub free_space: u64,
    /// Total disk space
    pub total_space: u64,
    /// Aggregate receive throughput
    pub throughput_up: u64,
    /// Aggregate send throughput
    pub throughput_down: u64,
    /// Number of active receiving transfers
    pub transfers_up: u32,
    /// Number of active sending transfers
    pub transfers_down: u32,
}

impl SlaveStatus {
    /// Throughput for a direction
    pub fn throughput(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Upload => self.throughput_up,
            Direction::Download => self.throughput_down,
        }
    }

    /// Active transfer count for a direction
    pub fn transfers(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Upload => self.transfers_up,
            Direction::Download => self.transfers_down,
        }
    }
}

/// One active transfer on a slave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    /// Flow direction
    pub direction: Direction,
    /// User the transfer belongs to, if any
    pub user: Option<String>,
    /// Path being transferred
    pub path: String,
}

/// One entry of a slave's reported listing
///
/// `path` is absolute (`/dir/file`). A `checksum` of `0` means the slave has
/// not computed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// Absolute path of the entry
    pub path: String,
    /// File or directory
    pub kind: NodeKind,
    /// Size in bytes
    pub size: u64,
    /// Last modification, ms since epoch
    pub last_modified: i64,
    /// CRC32 or 0
    pub checksum: u64,
    /// Owning user
    pub owner: String,
    /// Owning group
    pub group: String,
}

impl ListingEntry {
    /// A file entry owned by `nobody:nogroup`
    pub fn file(path: impl Into<String>, size: u64, last_modified: i64) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::File,
            size,
            last_modified,
            checksum: 0,
            owner: "nobody".to_string(),
            group: "nogroup".to_string(),
        }
    }

    /// A directory entry owned by `nobody:nogroup`
    pub fn directory(path: impl Into<String>, last_modified: i64) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Directory,
            size: 0,
            last_modified,
            checksum: 0,
            owner: "nobody".to_string(),
            group: "nogroup".to_string(),
        }
    }

    /// Set the checksum
    pub fn with_checksum(mut self, checksum: u64) -> Self {
        self.checksum = checksum;
        self
    }

    /// Set owner and group
    pub fn with_owner(mut self, owner: impl Into<String>, group: impl Into<String>) -> Self {
        self.owner = owner.into();
        self.group = group.into();
        self
    }
}

/// Everything a filter may look at when scoring a transfer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// User requesting the transfer, `None` for internal transfers
    pub user: Option<String>,
    /// Address of the connected client
    pub peer: Option<IpAddr>,
    /// Flow direction evaluated by the chain
    pub direction: Direction,
    /// Absolute path of the target file
    pub path: String,
    /// Source slave of a background replication job
    pub source_slave: Option<SlaveRef>,
    /// Time the selection started, ms since epoch
    pub now: i64,
}

impl TransferRequest {
    /// A request for `path` in `direction`, stamped with the current time
    pub fn new(direction: Direction, path: impl Into<String>) -> Self {
        Self {
            user: None,
            peer: None,
            direction,
            path: path.into(),
            source_slave: None,
            now: now_millis(),
        }
    }

    /// Set the requesting user
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the client address
    pub fn peer(mut self, peer: IpAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Set the job source slave
    pub fn source_slave(mut self, slave: SlaveRef) -> Self {
        self.source_slave = Some(slave);
        self
    }

    /// Override the evaluation time
    pub fn at(mut self, now: i64) -> Self {
        self.now = now;
        self
    }
}

/// Aggregate counters over the replica tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    /// Number of directories, root included
    pub directories: usize,
    /// Number of live files
    pub files: usize,
    /// Number of tombstoned files
    pub tombstones: usize,
    /// Bytes across live files
    pub total_bytes: u64,
    /// Live files held per slave name
    pub files_per_slave: BTreeMap<String, usize>,
}
