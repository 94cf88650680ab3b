//! Path-based score overrides
//!
//! ```text
//! 1.filter=matchdir
//! 1.match=/mp3/*
//! 1.assign=slave1+1000, slave2-remove
//! ```
//!
//! When the transfer path matches, every assignment is applied in order.
//! `ALL+N` applies to every slave still in the chart and ends the stanza.
//! A delta of 0 (or `-remove`) takes the slave out of the chart.

use super::{Filter, FilterConfig, FilterContext};
use crate::error::{Result, StowageError};
use crate::scorechart::ScoreChart;
use crate::slave::{SlaveRef, SlaveRegistry};
use crate::types::TransferRequest;
use globset::{GlobBuilder, GlobMatcher};
use regex::{Regex, RegexBuilder};
use tracing::{debug, trace};

/// One entry of an `assign` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Delta for every slave in the chart
    All(i64),
    /// Delta for one slave
    Slave(SlaveRef, i64),
}

impl Assignment {
    /// Parse `name+N`, `name-N` or `name-remove`
    pub fn parse(token: &str, registry: &SlaveRegistry) -> Result<Self> {
        let invalid = || StowageError::config(format!("{:?} is not a valid assign expression", token));
        let (name, value, negative) = match token.rfind('+') {
            Some(pos) => (&token[..pos], &token[pos + 1..], false),
            None => {
                let pos = token.rfind('-').ok_or_else(invalid)?;
                (&token[..pos], &token[pos + 1..], true)
            }
        };
        if name.is_empty() {
            return Err(invalid());
        }

        let delta = if negative && value.eq_ignore_ascii_case("remove") {
            0
        } else {
            let n: i64 = value.parse().map_err(|_| invalid())?;
            if negative {
                -n
            } else {
                n
            }
        };

        if name.eq_ignore_ascii_case("all") {
            return Ok(Assignment::All(delta));
        }
        let slave = registry
            .get(name)
            .map_err(|_| StowageError::config(format!("assign names unknown slave {}", name)))?;
        Ok(Assignment::Slave(slave, delta))
    }

    /// Parse a comma and/or space separated list
    pub fn parse_list(list: &str, registry: &SlaveRegistry) -> Result<Vec<Self>> {
        list.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .map(|t| Self::parse(t, registry))
            .collect()
    }
}

/// Apply assignments to a chart; `ALL` ends processing
fn apply(assignments: &[Assignment], chart: &mut ScoreChart) {
    for assignment in assignments {
        match assignment {
            Assignment::All(0) => {
                chart.retain(|_| false);
                return;
            }
            Assignment::All(delta) => {
                for entry in chart.scores_mut() {
                    entry.add_score(*delta);
                }
                return;
            }
            Assignment::Slave(slave, 0) => {
                chart.remove_slave(slave);
            }
            Assignment::Slave(slave, delta) => {
                // slaves outside the chart are simply not candidates
                if chart.add_score(slave, *delta).is_err() {
                    trace!("matchdir: {} not in chart", slave);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum PathMatcher {
    Glob(GlobMatcher),
    Regex(Regex),
}

impl PathMatcher {
    fn is_match(&self, path: &str) -> bool {
        match self {
            PathMatcher::Glob(glob) => glob.is_match(path),
            PathMatcher::Regex(re) => re.is_match(path),
        }
    }
}

/// `matchdir` (glob) and `matchdirregex` (regex) filters
#[derive(Debug, Clone)]
pub struct MatchdirFilter {
    name: &'static str,
    matcher: PathMatcher,
    assignments: Vec<Assignment>,
    assume_remove: bool,
}

impl MatchdirFilter {
    /// Glob flavour: `*` may cross `/`, matching ignores case
    pub fn glob(config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        let pattern = config.required("match")?;
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(false)
            .build()
            .map_err(|e| StowageError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        Self::build("matchdir", PathMatcher::Glob(glob.compile_matcher()), config, ctx)
    }

    /// Regex flavour, case-insensitive
    pub fn regex(config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        let pattern = config.required("match")?;
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| StowageError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        Self::build("matchdirregex", PathMatcher::Regex(re), config, ctx)
    }

    fn build(name: &'static str, matcher: PathMatcher, config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        let assignments = Assignment::parse_list(config.required("assign")?, &ctx.registry)?;
        Ok(Self {
            name,
            matcher,
            assignments,
            assume_remove: config.flag("assume.remove")?,
        })
    }

    /// Parsed assignments in order
    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }
}

impl Filter for MatchdirFilter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        if !self.matcher.is_match(&request.path) {
            return Ok(());
        }
        debug!("{}: {} matched", self.name, request.path);
        apply(&self.assignments, chart);
        if self.assume_remove {
            let named: Vec<&SlaveRef> = self
                .assignments
                .iter()
                .filter_map(|a| match a {
                    Assignment::Slave(slave, _) => Some(slave),
                    Assignment::All(_) => None,
                })
                .collect();
            chart.retain(|entry| named.contains(&entry.slave()));
        }
        Ok(())
    }
}
