//! Round-robin tie breaking

use super::{Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::scorechart::ScoreChart;
use crate::slave::SlaveRef;
use crate::types::TransferRequest;
use tracing::trace;

/// Gives `+1` to the least recently used slave of every group of equal scores
///
/// A slave alone at its score forms a group of one and is raised too, so the
/// ranking between groups never changes. Groups are formed in chart order and the first slave wins when last
/// transfer times are equal too, so the outcome is deterministic for a given
/// chart.
#[derive(Debug, Clone, Default)]
pub struct CycleFilter;

impl CycleFilter {
    /// Cycle takes no keys
    pub fn new(_config: &FilterConfig, _ctx: &FilterContext) -> Result<Self> {
        Ok(Self)
    }
}

impl Filter for CycleFilter {
    fn name(&self) -> &'static str {
        "cycle"
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        let mut buckets: Vec<(i64, Vec<SlaveRef>)> = Vec::new();
        for entry in chart.scores() {
            match buckets.iter_mut().find(|(score, _)| *score == entry.score()) {
                Some((_, members)) => members.push(entry.slave().clone()),
                None => buckets.push((entry.score(), vec![entry.slave().clone()])),
            }
        }

        for (score, members) in buckets {
            let mut oldest: Option<(&SlaveRef, i64)> = None;
            for slave in &members {
                let last = slave.last_transfer(request.direction);
                match oldest {
                    Some((_, best)) if best <= last => {}
                    _ => oldest = Some((slave, last)),
                }
            }
            if let Some((slave, last)) = oldest {
                trace!("cycle: {} wins bucket {} (last transfer {})", slave, score, last);
                chart.add_score(slave, 1)?;
            }
        }
        Ok(())
    }
}
