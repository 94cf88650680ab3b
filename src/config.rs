//! Coordinator configuration
//!
//! Two layers:
//!
//! - [`StowageConfig`]: the coordinator's own settings, stored as JSON.
//! - [`Properties`]: the `key=value` files that describe the filter chains,
//!   one per [`ChainKind`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use stowage::{ChainKind, StowageConfig};
//! use std::path::Path;
//!
//! # fn main() -> stowage::Result<()> {
//! let config = StowageConfig::load(Path::new("stowage.json"))?;
//! let upload_chain = config.chain_path(ChainKind::Up);
//! println!("upload chain lives in {}", upload_chain.display());
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, StowageError};
use crate::types::Direction;
use crate::utils::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// One of the four filter chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    /// Client uploads
    Up,
    /// Client downloads
    Down,
    /// Destination of a replication job
    JobUp,
    /// Source of a replication job
    JobDown,
}

impl ChainKind {
    /// Every chain, in load order
    pub const ALL: [ChainKind; 4] = [ChainKind::Up, ChainKind::Down, ChainKind::JobUp, ChainKind::JobDown];

    /// Short name, also used in the chain file name
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Up => "up",
            ChainKind::Down => "down",
            ChainKind::JobUp => "jobup",
            ChainKind::JobDown => "jobdown",
        }
    }

    /// File holding this chain inside the configuration directory
    pub fn file_name(&self) -> String {
        format!("slaveselection-{}.conf", self.as_str())
    }

    /// Direction the chain's filters evaluate
    pub fn direction(&self) -> Direction {
        match self {
            ChainKind::Up | ChainKind::JobUp => Direction::Upload,
            ChainKind::Down | ChainKind::JobDown => Direction::Download,
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StowageConfig {
    /// Directory holding the four `slaveselection-*.conf` files
    pub conf_dir: PathBuf,
    /// Bound on every slave status query (humantime, e.g. `5s`)
    pub status_timeout: String,
    /// Section roots, e.g. `/mp3`
    pub sections: Vec<String>,
    /// Where the replica tree is persisted, if anywhere
    pub snapshot_path: Option<PathBuf>,
}

impl Default for StowageConfig {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from("conf"),
            status_timeout: "5s".to_string(),
            sections: Vec::new(),
            snapshot_path: None,
        }
    }
}

impl StowageConfig {
    /// Read a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let config: StowageConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON, atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &data)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        self.status_timeout()?;
        if let Some(bad) = self.sections.iter().find(|s| !s.starts_with('/')) {
            return Err(StowageError::config(format!("section root {} is not absolute", bad)));
        }
        Ok(())
    }

    /// Parsed status timeout
    pub fn status_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.status_timeout).map_err(|e| {
            StowageError::config(format!("invalid status_timeout {:?}: {}", self.status_timeout, e))
        })
    }

    /// Path of one chain file
    pub fn chain_path(&self, kind: ChainKind) -> PathBuf {
        self.conf_dir.join(kind.file_name())
    }
}

/// Flat `key=value` configuration as used by the chain files
///
/// Accepts `key=value` and `key: value`, skips blank lines and lines starting
/// with `#` or `!`, and trims whitespace around keys and values. A line with
/// no separator is a key with an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    /// Empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse property text
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = match line.find(&['=', ':'][..]) {
                Some(idx) => (&line[..idx], &line[idx + 1..]),
                None => (line, ""),
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self { entries }
    }

    /// Read and parse a property file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| StowageError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(Self::parse(&text))
    }

    /// Value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Value for `key`, or a [`StowageError::FatalConfig`] naming it
    pub fn get_required(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| StowageError::config(format!("missing required property {}", key)))
    }

    /// Set a value, replacing any previous one
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Entries whose key starts with `prefix`, with the prefix stripped
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(move |(k, v)| (&k[prefix.len()..], v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
