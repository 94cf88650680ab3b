//! Slave-selection filters
//!
//! A filter looks at one [`ScoreChart`] and either lowers or raises scores
//! ("soft bias") or removes slaves ("hard exclusion"). Filters never fail a
//! selection because one slave misbehaves: a slave whose status cannot be
//! read is removed from the chart and the chain moves on.
//!
//! ## Built-in filters
//!
//! | Name | Keys | Effect |
//! |---|---|---|
//! | `bandwidth` | `multiplier` | `score -= throughput * multiplier` |
//! | `maxbandwidth` | `maxbandwidth` | remove when throughput exceeds it |
//! | `maxtransfers` | `maxtransfers` | remove when active transfers exceed it |
//! | `minfreespace` | `minfreespace`, `multiplier` | penalize or remove low-space slaves |
//! | `cycle` | | `+1` to the least recently used slave of each tie |
//! | `mintimeonline` | `mintime`, `multiplier` | penalize recently used slaves |
//! | `matchdir` | `match`, `assign`, `assume.remove` | glob path overrides |
//! | `matchdirregex` | `match`, `assign`, `assume.remove` | regex path overrides |
//! | `slavetop` | `topslaves`, `assign` | favour slaves holding most of a release |
//! | `maxtransfersperuser` | `maxtransfers` | one user per slave and direction |
//! | `maxuploadsperslavejob` | `maxuploads` | bound replication fan-in per source |
//!
//! Keys are written `<n>.<key>` in the chain file, where `<n>` is the
//! filter's stanza number.
//!
//! ## Dependencies
//!
//! Filters receive everything they need through [`FilterContext`] when they
//! are built; there is no global state to reach into.

mod bandwidth;
mod cycle;
mod matchdir;
mod maxbandwidth;
mod maxtransfers;
mod maxtransfersperuser;
mod maxuploadsperslavejob;
mod minfreespace;
mod mintimeonline;
mod slavetop;

pub use bandwidth::BandwidthFilter;
pub use cycle::CycleFilter;
pub use matchdir::{Assignment, MatchdirFilter};
pub use maxbandwidth::MaxbandwidthFilter;
pub use maxtransfers::MaxtransfersFilter;
pub use maxtransfersperuser::MaxTransfersPerUserFilter;
pub use maxuploadsperslavejob::MaxUploadsPerSlaveJobFilter;
pub use minfreespace::MinfreespaceFilter;
pub use mintimeonline::MintimeonlineFilter;
pub use slavetop::SlavetopFilter;

use crate::config::Properties;
use crate::error::{Result, StowageError};
use crate::jobs::JobBoard;
use crate::scorechart::ScoreChart;
use crate::sections::Sections;
use crate::slave::{SlaveRef, SlaveRegistry};
use crate::tree::ReplicaTree;
use crate::types::{SlaveStatus, TransferRequest};
use crate::utils::{parse_bytes, parse_duration_ms};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One scoring or exclusion rule
pub trait Filter: Send + Sync + fmt::Debug {
    /// Registry name of the filter
    fn name(&self) -> &'static str;

    /// Adjust `chart` for `request`
    ///
    /// Per-slave failures must be turned into removals; an `Err` aborts the
    /// whole selection.
    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()>;
}

/// Shared state handed to filters at construction
#[derive(Debug, Clone)]
pub struct FilterContext {
    /// Every configured slave
    pub registry: Arc<SlaveRegistry>,
    /// Merged namespace
    pub tree: Arc<ReplicaTree>,
    /// Section roots
    pub sections: Arc<Sections>,
    /// Running replication jobs
    pub jobs: Arc<JobBoard>,
    /// Bound on each status query
    pub status_timeout: Duration,
}

impl FilterContext {
    /// Context with no sections, an empty job board and a 5s status timeout
    pub fn new(registry: Arc<SlaveRegistry>, tree: Arc<ReplicaTree>) -> Self {
        Self {
            registry,
            tree,
            sections: Arc::new(Sections::new()),
            jobs: Arc::new(JobBoard::new()),
            status_timeout: Duration::from_secs(5),
        }
    }

    /// Replace the section roots
    pub fn with_sections(mut self, sections: Sections) -> Self {
        self.sections = Arc::new(sections);
        self
    }

    /// Share an existing job board
    pub fn with_jobs(mut self, jobs: Arc<JobBoard>) -> Self {
        self.jobs = jobs;
        self
    }

    /// Replace the status timeout
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }
}

/// Parameters of one numbered stanza
///
/// Built once when a chain is loaded; keys are stored without the `<n>.`
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    index: usize,
    name: String,
    values: BTreeMap<String, String>,
}

impl FilterConfig {
    /// Stanza `index` for filter `name` with no keys
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    /// Add a key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Extract stanza `index` from a chain file, if it declares a filter
    pub fn from_properties(props: &Properties, index: usize) -> Option<Self> {
        let prefix = format!("{}.", index);
        let name = props.get(&format!("{}filter", prefix))?;
        let values = props
            .with_prefix(&prefix)
            .filter(|(key, _)| *key != "filter")
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some(Self {
            index,
            name: name.to_string(),
            values,
        })
    }

    /// Stanza number
    pub fn index(&self) -> usize {
        self.index
    }

    /// Declared filter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Raw value of `key`, failing when absent
    pub fn required(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            StowageError::config(format!(
                "missing {}.{} for filter {}",
                self.index, key, self.name
            ))
        })
    }

    fn invalid(&self, key: &str, value: &str, why: impl fmt::Display) -> StowageError {
        StowageError::config(format!(
            "invalid {}.{}={:?} for filter {}: {}",
            self.index, key, value, self.name, why
        ))
    }

    /// Required value parsed with `FromStr`
    pub fn parse<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let value = self.required(key)?;
        value.trim().parse().map_err(|e| self.invalid(key, value, e))
    }

    /// Optional value parsed with `FromStr`
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(value) => value.trim().parse().map_err(|e| self.invalid(key, value, e)),
            None => Ok(default),
        }
    }

    /// Required multiplier expression
    pub fn multiplier(&self, key: &str) -> Result<f64> {
        let value = self.required(key)?;
        parse_multiplier(value).map_err(|e| self.invalid(key, value, e))
    }

    /// Required byte count
    pub fn bytes(&self, key: &str) -> Result<u64> {
        let value = self.required(key)?;
        parse_bytes(value).map_err(|e| self.invalid(key, value, e))
    }

    /// Required duration in milliseconds
    pub fn duration_ms(&self, key: &str) -> Result<i64> {
        let value = self.required(key)?;
        parse_duration_ms(value).map_err(|e| self.invalid(key, value, e))
    }

    /// Optional boolean (`true`/`false`/`yes`/`no`/`1`/`0`)
    pub fn flag(&self, key: &str) -> Result<bool> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "true" | "yes" | "1") => Ok(true),
            Some(v) if matches!(v.as_str(), "false" | "no" | "0" | "") => Ok(false),
            Some(v) => Err(self.invalid(key, &v, "expected a boolean")),
        }
    }
}

/// Parse a multiplier expression
///
/// The expression is folded left to right over `*N` and `/N` terms starting
/// from 1; a leading bare number sets the starting value. `remove` is 0.
///
/// ```rust
/// use stowage::filters::parse_multiplier;
///
/// assert_eq!(parse_multiplier("*100").unwrap(), 100.0);
/// assert_eq!(parse_multiplier("/10*10").unwrap(), 1.0);
/// assert_eq!(parse_multiplier("10*10/10").unwrap(), 10.0);
/// assert_eq!(parse_multiplier("remove").unwrap(), 0.0);
/// ```
pub fn parse_multiplier(expr: &str) -> Result<f64> {
    let expr = expr.trim();
    if expr.eq_ignore_ascii_case("remove") {
        return Ok(0.0);
    }
    if expr.is_empty() {
        return Err(StowageError::config("empty multiplier"));
    }

    fn apply(acc: f64, op: char, term: &str, expr: &str) -> Result<f64> {
        let value: f64 = term
            .parse()
            .map_err(|_| StowageError::config(format!("invalid multiplier term {:?} in {:?}", term, expr)))?;
        match op {
            '/' if value == 0.0 => Err(StowageError::config(format!("division by zero in {:?}", expr))),
            '/' => Ok(acc / value),
            _ => Ok(acc * value),
        }
    }

    let mut acc = 1.0;
    let mut op: Option<char> = None;
    let mut term = String::new();
    for c in expr.chars() {
        match c {
            '*' | '/' => {
                if !term.is_empty() {
                    acc = apply(acc, op.unwrap_or('*'), &term, expr)?;
                    term.clear();
                } else if op.is_some() {
                    return Err(StowageError::config(format!("missing term in {:?}", expr)));
                }
                op = Some(c);
            }
            c if c.is_whitespace() => {}
            c => term.push(c),
        }
    }
    if term.is_empty() {
        return Err(StowageError::config(format!("trailing operator in {:?}", expr)));
    }
    apply(acc, op.unwrap_or('*'), &term, expr)
}

/// Live status of every chart entry, removing those that cannot answer
pub(crate) fn collect_statuses(
    chart: &mut ScoreChart,
    timeout: Duration,
    filter: &str,
) -> Vec<(SlaveRef, SlaveStatus)> {
    let mut statuses = Vec::with_capacity(chart.len());
    for slave in chart.slaves() {
        match slave.status_available(timeout) {
            Ok(status) => statuses.push((slave, status)),
            Err(e) => {
                debug!("{}: removing {}: {}", filter, slave, e);
                chart.remove_slave(&slave);
            }
        }
    }
    statuses
}

/// Scale a measured quantity by a multiplier into a score delta
pub(crate) fn scaled(value: u64, multiplier: f64) -> i64 {
    (value as f64 * multiplier) as i64
}
