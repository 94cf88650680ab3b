//! Per-request scoreboard over candidate slaves
//!
//! A [`ScoreChart`] lives for exactly one selection. Filters lower or raise
//! scores and remove slaves; the chain then picks the highest score. Entries
//! keep their insertion order, which is what breaks ties.

use crate::error::{Result, StowageError};
use crate::slave::SlaveRef;
use std::fmt;
use tracing::trace;

/// One chart entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveScore {
    slave: SlaveRef,
    score: i64,
}

impl SlaveScore {
    /// The scored slave
    pub fn slave(&self) -> &SlaveRef {
        &self.slave
    }

    /// Current score
    pub fn score(&self) -> i64 {
        self.score
    }

    /// Adjust the score, saturating at the `i64` bounds
    pub fn add_score(&mut self, delta: i64) {
        self.score = self.score.saturating_add(delta);
    }
}

/// Scores of the candidate slaves for one transfer
#[derive(Debug, Clone, Default)]
pub struct ScoreChart {
    scores: Vec<SlaveScore>,
}

impl ScoreChart {
    /// Chart with one zero-score entry per distinct candidate
    pub fn new(candidates: impl IntoIterator<Item = SlaveRef>) -> Self {
        let mut scores: Vec<SlaveScore> = Vec::new();
        for slave in candidates {
            if scores.iter().all(|s| s.slave != slave) {
                scores.push(SlaveScore { slave, score: 0 });
            }
        }
        Self { scores }
    }

    /// Entry for `slave`
    pub fn get(&self, slave: &SlaveRef) -> Result<&SlaveScore> {
        self.scores
            .iter()
            .find(|s| &s.slave == slave)
            .ok_or_else(|| StowageError::ObjectNotFound(format!("{} is not in the chart", slave)))
    }

    /// Entry for the slave named `name`, compared case-insensitively
    pub fn get_by_name(&self, name: &str) -> Result<&SlaveScore> {
        self.scores
            .iter()
            .find(|s| s.slave.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| StowageError::ObjectNotFound(format!("{} is not in the chart", name)))
    }

    /// Current score of `slave`
    pub fn get_score(&self, slave: &SlaveRef) -> Result<i64> {
        self.get(slave).map(SlaveScore::score)
    }

    /// Add `delta` to the score of `slave`
    pub fn add_score(&mut self, slave: &SlaveRef, delta: i64) -> Result<()> {
        let entry = self
            .scores
            .iter_mut()
            .find(|s| &s.slave == slave)
            .ok_or_else(|| StowageError::ObjectNotFound(format!("{} is not in the chart", slave)))?;
        entry.add_score(delta);
        trace!("{} {:+} -> {}", slave, delta, entry.score);
        Ok(())
    }

    /// Drop `slave` from the chart; returns whether it was present
    pub fn remove_slave(&mut self, slave: &SlaveRef) -> bool {
        let before = self.scores.len();
        self.scores.retain(|s| &s.slave != slave);
        let removed = self.scores.len() != before;
        if removed {
            trace!("Removed {} from chart", slave);
        }
        removed
    }

    /// Keep only entries for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&SlaveScore) -> bool) {
        self.scores.retain(|s| keep(s));
    }

    /// Entries in insertion order
    pub fn scores(&self) -> &[SlaveScore] {
        &self.scores
    }

    /// Mutable entries in insertion order
    pub fn scores_mut(&mut self) -> &mut [SlaveScore] {
        &mut self.scores
    }

    /// Slaves still in the chart, in insertion order
    pub fn slaves(&self) -> Vec<SlaveRef> {
        self.scores.iter().map(|s| s.slave.clone()).collect()
    }

    /// Highest-scoring entry; the first one wins ties
    pub fn best(&self) -> Result<&SlaveScore> {
        let mut best: Option<&SlaveScore> = None;
        for entry in &self.scores {
            match best {
                Some(current) if current.score >= entry.score => {}
                _ => best = Some(entry),
            }
        }
        best.ok_or_else(|| StowageError::NoAvailableSlave("score chart is empty".to_string()))
    }

    /// Slave with the highest score
    pub fn best_slave(&self) -> Result<SlaveRef> {
        self.best().map(|s| s.slave.clone())
    }

    /// Whether every candidate has been removed
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Number of remaining candidates
    pub fn len(&self) -> usize {
        self.scores.len()
    }
}

impl fmt::Display for ScoreChart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .scores
            .iter()
            .map(|s| format!("{}={}", s.slave.name(), s.score))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
