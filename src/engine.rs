//! Slave selection
//!
//! [`SlaveSelectionEngine`] owns the four filter chains and decides which
//! slave serves a transfer:
//!
//! 1. Derive the candidates (all online slaves for uploads, online replicas
//!    for downloads, eligible slaves for replication jobs).
//! 2. Run the chain for the transfer kind over a fresh [`ScoreChart`].
//! 3. Stamp the winner's last-transfer time for that direction.
//!
//! Chains are swapped atomically on [`SlaveSelectionEngine::reload`]: a
//! broken chain file leaves the running chains untouched.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use stowage::{
//!     ChainKind, Direction, ListingEntry, MemorySlave, Properties, ReplicaTree, SlaveRegistry,
//!     SlaveSelectionEngine, TransferRequest,
//! };
//!
//! # fn main() -> stowage::Result<()> {
//! let (_, fast) = MemorySlave::shared("fast");
//! let (_, slow) = MemorySlave::shared("slow");
//! let registry = Arc::new(SlaveRegistry::with_slaves([fast.clone(), slow.clone()])?);
//! let tree = Arc::new(ReplicaTree::new());
//! tree.put_file(&ListingEntry::file("/mp3/a.mp3", 10, 0), &slow)?;
//!
//! let engine = SlaveSelectionEngine::builder()
//!     .registry(registry)
//!     .tree(tree)
//!     .chain_properties(ChainKind::Up, Properties::parse("1.filter=matchdir\n1.match=/mp3/*\n1.assign=fast+10\n"))
//!     .build()?;
//!
//! let up = engine.select_upload(&TransferRequest::new(Direction::Upload, "/mp3/b.mp3"))?;
//! assert_eq!(up.name(), "fast");
//! let down = engine.select_download(&TransferRequest::new(Direction::Download, "/mp3/a.mp3"))?;
//! assert_eq!(down.name(), "slow");
//! # Ok(())
//! # }
//! ```

use crate::chain::{FilterChain, FilterRegistry};
use crate::config::{ChainKind, Properties, StowageConfig};
use crate::error::{Result, StowageError};
use crate::filters::FilterContext;
use crate::jobs::JobBoard;
use crate::scorechart::ScoreChart;
use crate::sections::Sections;
use crate::slave::{SlaveRef, SlaveRegistry};
use crate::tree::ReplicaTree;
use crate::types::TransferRequest;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

type Chains = BTreeMap<ChainKind, Arc<FilterChain>>;

/// Picks the slave for every upload, download and replication transfer
#[derive(Debug)]
pub struct SlaveSelectionEngine {
    ctx: FilterContext,
    filters: FilterRegistry,
    conf_dir: Option<PathBuf>,
    chains: RwLock<Chains>,
}

fn load_chains(conf_dir: &Path, filters: &FilterRegistry, ctx: &FilterContext) -> Result<Chains> {
    let mut chains = Chains::new();
    for kind in ChainKind::ALL {
        let path = conf_dir.join(kind.file_name());
        let chain = FilterChain::load(&path, filters, ctx)
            .map_err(|e| StowageError::config(format!("{} chain: {}", kind, e)))?;
        chains.insert(kind, Arc::new(chain));
    }
    Ok(chains)
}

impl SlaveSelectionEngine {
    /// Start configuring an engine
    pub fn builder() -> SlaveSelectionEngineBuilder {
        SlaveSelectionEngineBuilder::new()
    }

    /// Re-read all four chain files and swap them in together
    ///
    /// On any error the running chains stay in place and the error is
    /// returned.
    #[instrument(skip(self))]
    pub fn reload(&self) -> Result<()> {
        let conf_dir = self
            .conf_dir
            .as_deref()
            .ok_or_else(|| StowageError::config("engine was built without a configuration directory"))?;
        match load_chains(conf_dir, &self.filters, &self.ctx) {
            Ok(chains) => {
                *self.chains.write() = chains;
                info!("Reloaded filter chains from {}", conf_dir.display());
                Ok(())
            }
            Err(e) => {
                warn!("Reload rejected, keeping previous chains: {}", e);
                Err(e)
            }
        }
    }

    /// Chain currently in use for `kind`
    pub fn chain(&self, kind: ChainKind) -> Arc<FilterChain> {
        self.chains
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(FilterChain::empty()))
    }

    /// Shared filter context
    pub fn context(&self) -> &FilterContext {
        &self.ctx
    }

    /// Replica tree candidates are drawn from
    pub fn tree(&self) -> &Arc<ReplicaTree> {
        &self.ctx.tree
    }

    /// Registered slaves
    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.ctx.registry
    }

    /// Running replication jobs
    pub fn jobs(&self) -> &Arc<JobBoard> {
        &self.ctx.jobs
    }

    fn select(&self, kind: ChainKind, candidates: Vec<SlaveRef>, request: &TransferRequest) -> Result<SlaveRef> {
        let chain = self.chain(kind);
        let mut request = request.clone();
        request.direction = kind.direction();

        let mut chart = ScoreChart::new(candidates);
        debug!("{} {}: candidates {}", kind, request.path, chart);
        let winner = chain.get_best_slave(&mut chart, &request)?;
        winner.set_last_transfer(request.direction, request.now);
        debug!("{} {}: selected {}", kind, request.path, winner);
        Ok(winner)
    }

    /// Slave to receive a client upload
    pub fn select_upload(&self, request: &TransferRequest) -> Result<SlaveRef> {
        let candidates = self.ctx.registry.available();
        self.select(ChainKind::Up, candidates, request)
    }

    /// Slave to send a file to a client, chosen among its online replicas
    pub fn select_download(&self, request: &TransferRequest) -> Result<SlaveRef> {
        let candidates = self.ctx.tree.available_slaves(&request.path)?;
        self.select(ChainKind::Down, candidates, request)
    }

    /// Slave to receive a replica of `request.path`
    ///
    /// Candidates are the online `destinations` that do not already hold the
    /// file.
    pub fn select_job_destination(&self, request: &TransferRequest, destinations: &[SlaveRef]) -> Result<SlaveRef> {
        let holders = self.ctx.tree.lookup(&request.path)?.replicas;
        let candidates: Vec<SlaveRef> = destinations
            .iter()
            .filter(|s| !holders.contains(*s) && s.is_available())
            .cloned()
            .collect();
        self.select(ChainKind::JobUp, candidates, request)
    }

    /// Slave to send a replica of `request.path`
    ///
    /// Candidates are the file's online replicas that are not themselves
    /// among the job's `destinations`.
    pub fn select_job_source(&self, request: &TransferRequest, destinations: &[SlaveRef]) -> Result<SlaveRef> {
        let candidates: Vec<SlaveRef> = self
            .ctx
            .tree
            .available_slaves(&request.path)?
            .into_iter()
            .filter(|s| !destinations.contains(s))
            .collect();
        self.select(ChainKind::JobDown, candidates, request)
    }
}

/// Builder for [`SlaveSelectionEngine`]
///
/// Chains come from, in order of preference: properties handed to
/// [`chain_properties`](Self::chain_properties), the chain file in
/// [`conf_dir`](Self::conf_dir), or an empty chain.
#[derive(Debug)]
pub struct SlaveSelectionEngineBuilder {
    registry: Option<Arc<SlaveRegistry>>,
    tree: Option<Arc<ReplicaTree>>,
    sections: Sections,
    jobs: Option<Arc<JobBoard>>,
    status_timeout: Duration,
    conf_dir: Option<PathBuf>,
    filters: FilterRegistry,
    properties: BTreeMap<ChainKind, Properties>,
}

impl Default for SlaveSelectionEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveSelectionEngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            tree: None,
            sections: Sections::new(),
            jobs: None,
            status_timeout: Duration::from_secs(5),
            conf_dir: None,
            filters: FilterRegistry::with_builtins(),
            properties: BTreeMap::new(),
        }
    }

    /// Seed from a coordinator configuration
    pub fn from_config(config: &StowageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new()
            .conf_dir(&config.conf_dir)
            .status_timeout(config.status_timeout()?)
            .sections(Sections::with_roots(&config.sections)?))
    }

    pub fn registry(mut self, registry: Arc<SlaveRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn tree(mut self, tree: Arc<ReplicaTree>) -> Self {
        self.tree = Some(tree);
        self
    }

    pub fn sections(mut self, sections: Sections) -> Self {
        self.sections = sections;
        self
    }

    pub fn jobs(mut self, jobs: Arc<JobBoard>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Directory holding the `slaveselection-*.conf` files
    pub fn conf_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.conf_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Replace the set of known filter types
    pub fn filter_registry(mut self, filters: FilterRegistry) -> Self {
        self.filters = filters;
        self
    }

    /// Use in-memory chain properties for `kind` instead of its file
    pub fn chain_properties(mut self, kind: ChainKind, props: Properties) -> Self {
        self.properties.insert(kind, props);
        self
    }

    pub fn build(self) -> Result<SlaveSelectionEngine> {
        let registry = self.registry.unwrap_or_default();
        let tree = self.tree.unwrap_or_default();
        let jobs = self.jobs.unwrap_or_default();
        let ctx = FilterContext::new(registry, tree)
            .with_sections(self.sections)
            .with_jobs(jobs)
            .with_status_timeout(self.status_timeout);

        let mut chains = Chains::new();
        for kind in ChainKind::ALL {
            let chain = match (self.properties.get(&kind), &self.conf_dir) {
                (Some(props), _) => FilterChain::from_properties(props, &self.filters, &ctx)
                    .map_err(|e| StowageError::config(format!("{} chain: {}", kind, e)))?,
                (None, Some(dir)) => {
                    let path = dir.join(kind.file_name());
                    FilterChain::load(&path, &self.filters, &ctx)
                        .map_err(|e| StowageError::config(format!("{} chain: {}", kind, e)))?
                }
                (None, None) => FilterChain::empty(),
            };
            debug!("{} chain: {:?}", kind, chain.filter_names());
            chains.insert(kind, Arc::new(chain));
        }

        Ok(SlaveSelectionEngine {
            ctx,
            filters: self.filters,
            conf_dir: self.conf_dir,
            chains: RwLock::new(chains),
        })
    }
}
