//! # Stowage - replica tree and slave selection for a storage cluster
//!
//! Stowage is the core of a coordinator that sits in front of many
//! independent storage nodes ("slaves"). Each slave holds part of a shared
//! namespace; the coordinator keeps one merged view of it and decides which
//! slave serves every upload, download and background replication.
//!
//! ## Overview
//!
//! Two subsystems do the work:
//!
//! - The **replica tree** ([`ReplicaTree`]) reconciles per-slave listings into
//!   one directory tree, tracks which slaves hold which files, survives slaves
//!   disconnecting and reconnecting, and handles delete and rename while some
//!   replicas are offline.
//! - The **selection pipeline** ([`SlaveSelectionEngine`]) scores candidate
//!   slaves through a configurable chain of filters (bandwidth, free space,
//!   transfer counts, fairness, path overrides, release consolidation) and
//!   picks the winner.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use stowage::{Direction, MemorySlave, ReplicaTree, SlaveRegistry, SlaveSelectionEngine, TransferRequest};
//!
//! # fn main() -> stowage::Result<()> {
//! // Two slaves; s2 already holds a release
//! let (_, s1) = MemorySlave::shared("s1");
//! let (m2, s2) = MemorySlave::shared("s2");
//! m2.add_file("/mp3/release/01.mp3", 4_000_000, 0xCAFE, 1_700_000_000_000);
//!
//! // Merge what s2 reports into the tree
//! let tree = Arc::new(ReplicaTree::new());
//! let report = tree.remerge(&m2.listing(), &s2)?;
//! assert_eq!(report.added, 3);
//!
//! let engine = SlaveSelectionEngine::builder()
//!     .registry(Arc::new(SlaveRegistry::with_slaves([s1, s2])?))
//!     .tree(Arc::clone(&tree))
//!     .build()?;
//!
//! let source = engine.select_download(&TransferRequest::new(Direction::Download, "/mp3/release/01.mp3"))?;
//! assert_eq!(source.name(), "s2");
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Replicas and tombstones
//!
//! A file node lists the slaves that hold a copy. Deleting a file asks every
//! replica to remove it; replicas that cannot be reached keep the node alive
//! as a tombstone until they reconnect and the delete is retried during
//! [`ReplicaTree::remerge`].
//!
//! ### Score charts and filters
//!
//! Every selection builds a fresh [`ScoreChart`] with all candidates at score
//! 0. Filters adjust scores or drop slaves; the highest remaining score wins
//! and ties go to the earliest candidate. A slave that fails a status query
//! is removed rather than failing the selection.
//!
//! ### Filter chains
//!
//! The four chains (`up`, `down`, `jobup`, `jobdown`) are read from
//! `slaveselection-<kind>.conf` files and can be reloaded at runtime; a broken
//! file is rejected and the running chains stay in place.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] with [`StowageError`] as the error
//! type. Per-slave problems during selection never surface; only an empty
//! chart becomes [`StowageError::NoAvailableSlave`].
//!
//! ## Module Organization
//!
//! - [`tree`]: the merged namespace and its structural operations
//! - [`snapshot`]: text persistence of the tree
//! - [`scorechart`]: per-selection scoreboard
//! - [`filters`]: the filter trait and every built-in filter
//! - [`chain`]: filter chains and the filter registry
//! - [`engine`]: candidate derivation and selection
//! - [`slave`]: the slave handle abstraction and an in-memory slave
//! - [`config`]: coordinator settings and chain-file parsing
//! - [`types`]: common types and data structures
//! - [`error`]: error types and handling

// Public API modules
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod filters;
pub mod jobs;
pub mod scorechart;
pub mod sections;
pub mod slave;
pub mod snapshot;
pub mod tree;
pub mod types;

// Internal modules (not part of public API)
mod collections;
mod utils;

// Re-export main types for convenience
pub use chain::{FilterChain, FilterFactory, FilterRegistry};
pub use config::{ChainKind, Properties, StowageConfig};
pub use engine::{SlaveSelectionEngine, SlaveSelectionEngineBuilder};
pub use error::{Result, StowageError};
pub use filters::{Filter, FilterConfig, FilterContext};
pub use jobs::{Job, JobBoard};
pub use scorechart::{ScoreChart, SlaveScore};
pub use sections::Sections;
pub use slave::{MemorySlave, SlaveHandle, SlaveRef, SlaveRegistry, TransferClock};
pub use snapshot::snapshot_slave_names;
pub use tree::{DeleteReport, NodeInfo, RemergeReport, ReplicaTree};
pub use types::*;
pub use utils::{format_bytes, parse_bytes, parse_duration_ms};
