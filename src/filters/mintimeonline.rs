//! Recent-use penalty

use super::{Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::scorechart::ScoreChart;
use crate::types::TransferRequest;
use tracing::trace;

/// Penalizes slaves whose last transfer in the direction is younger than
/// `mintime`, by `elapsed * multiplier`
#[derive(Debug, Clone)]
pub struct MintimeonlineFilter {
    min_time: i64,
    multiplier: f64,
}

impl MintimeonlineFilter {
    /// Build from `<n>.mintime` (ms or humantime) and `<n>.multiplier`
    pub fn new(config: &FilterConfig, _ctx: &FilterContext) -> Result<Self> {
        Ok(Self {
            min_time: config.duration_ms("mintime")?,
            multiplier: config.multiplier("multiplier")?,
        })
    }
}

impl Filter for MintimeonlineFilter {
    fn name(&self) -> &'static str {
        "mintimeonline"
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        for entry in chart.scores_mut() {
            let last = entry.slave().last_transfer(request.direction);
            let elapsed = request.now - last;
            if elapsed < self.min_time {
                let penalty = (elapsed.max(0) as f64 * self.multiplier) as i64;
                trace!("mintimeonline: {} used {}ms ago, -{}", entry.slave(), elapsed, penalty);
                entry.add_score(-penalty);
            }
        }
        Ok(())
    }
}
