//! Filter chains
//!
//! A chain file lists numbered stanzas:
//!
//! ```text
//! 1.filter=bandwidth
//! 1.multiplier=*100
//! 2.filter=matchdir
//! 2.match=/mp3/*
//! 2.assign=slave1+1000
//! ```
//!
//! Stanzas are read from `1` upward and stop at the first missing
//! `<n>.filter`. Each stanza is turned into a [`Filter`] through the
//! [`FilterRegistry`], so new filter types can be plugged in without touching
//! the chain code.

use crate::collections::HashMap;
use crate::config::Properties;
use crate::error::{Result, StowageError};
use crate::filters::{
    BandwidthFilter, CycleFilter, Filter, FilterConfig, FilterContext, MatchdirFilter, MaxTransfersPerUserFilter,
    MaxUploadsPerSlaveJobFilter, MaxbandwidthFilter, MaxtransfersFilter, MinfreespaceFilter, MintimeonlineFilter,
    SlavetopFilter,
};
use crate::scorechart::ScoreChart;
use crate::slave::SlaveRef;
use crate::types::TransferRequest;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// Builds one filter from its stanza
pub type FilterFactory = Arc<dyn Fn(&FilterConfig, &FilterContext) -> Result<Box<dyn Filter>> + Send + Sync>;

fn boxed<F, C>(ctor: C) -> FilterFactory
where
    F: Filter + 'static,
    C: Fn(&FilterConfig, &FilterContext) -> Result<F> + Send + Sync + 'static,
{
    Arc::new(
        move |config: &FilterConfig, ctx: &FilterContext| -> Result<Box<dyn Filter>> {
            Ok(Box::new(ctor(config, ctx)?))
        },
    )
}

/// Filter names mapped to their factories
///
/// Names are matched case-insensitively.
#[derive(Clone)]
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    /// Registry with no filters at all
    pub fn empty() -> Self {
        Self {
            factories: HashMap::default(),
        }
    }

    /// Registry with every built-in filter
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("bandwidth", boxed(BandwidthFilter::new));
        registry.register("cycle", boxed(CycleFilter::new));
        registry.register("matchdir", boxed(MatchdirFilter::glob));
        registry.register("matchdirregex", boxed(MatchdirFilter::regex));
        registry.register("maxbandwidth", boxed(MaxbandwidthFilter::new));
        registry.register("maxtransfers", boxed(MaxtransfersFilter::new));
        registry.register("maxtransfersperuser", boxed(MaxTransfersPerUserFilter::new));
        registry.register("maxuploadsperslavejob", boxed(MaxUploadsPerSlaveJobFilter::new));
        registry.register("minfreespace", boxed(MinfreespaceFilter::new));
        registry.register("mintimeonline", boxed(MintimeonlineFilter::new));
        registry.register("slavetop", boxed(SlavetopFilter::new));
        registry
    }

    /// Add or replace a factory
    pub fn register(&mut self, name: &str, factory: FilterFactory) {
        if self.factories.insert(name.to_ascii_lowercase(), factory).is_some() {
            debug!("Replaced filter factory {}", name);
        }
    }

    /// Build the filter a stanza names
    pub fn create(&self, config: &FilterConfig, ctx: &FilterContext) -> Result<Box<dyn Filter>> {
        let factory = self
            .factories
            .get(&config.name().to_ascii_lowercase())
            .ok_or_else(|| {
                StowageError::config(format!(
                    "unknown filter {:?} in stanza {}",
                    config.name(),
                    config.index()
                ))
            })?;
        (**factory)(config, ctx)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry").field("names", &self.names()).finish()
    }
}

/// Ordered list of filters applied to one score chart
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    /// Chain running `filters` in order
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    /// Chain with no filters; the first candidate wins
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a chain from parsed chain properties
    pub fn from_properties(props: &Properties, registry: &FilterRegistry, ctx: &FilterContext) -> Result<Self> {
        let mut filters = Vec::new();
        let mut index = 1;
        while let Some(config) = FilterConfig::from_properties(props, index) {
            filters.push(registry.create(&config, ctx)?);
            index += 1;
        }

        // later stanzas after a gap are never reached
        let stranded: Vec<&str> = props
            .with_prefix("")
            .filter_map(|(key, _)| key.strip_suffix(".filter"))
            .filter(|n| n.parse::<usize>().map(|n| n > index).unwrap_or(false))
            .collect();
        if !stranded.is_empty() {
            warn!("Ignoring filter stanzas {:?} after missing stanza {}", stranded, index);
        }

        Ok(Self { filters })
    }

    /// Load a chain file
    #[instrument(skip(registry, ctx))]
    pub fn load(path: &Path, registry: &FilterRegistry, ctx: &FilterContext) -> Result<Self> {
        let props = Properties::load(path)?;
        let chain = Self::from_properties(&props, registry, ctx)?;
        info!("Loaded {} filters from {}", chain.len(), path.display());
        Ok(chain)
    }

    /// Names of the filters, in order
    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Number of filters
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain has no filters
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every filter over `chart` and return the winner
    pub fn get_best_slave(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<SlaveRef> {
        for filter in &self.filters {
            if chart.is_empty() {
                break;
            }
            filter.process(chart, request)?;
            trace!("after {}: {}", filter.name(), chart);
        }
        chart.best_slave().map_err(|_| {
            StowageError::NoAvailableSlave(format!("{} {}", request.direction, request.path))
        })
    }
}
