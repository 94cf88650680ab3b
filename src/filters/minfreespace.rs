//! Free space threshold

use super::{collect_statuses, scaled, Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::scorechart::ScoreChart;
use crate::types::TransferRequest;
use std::time::Duration;
use tracing::debug;

/// Penalizes or removes slaves with less than `minfreespace` bytes free
///
/// The penalty is `(minfreespace - free) * multiplier`; a multiplier of 0
/// removes the slave instead.
#[derive(Debug, Clone)]
pub struct MinfreespaceFilter {
    min_free: u64,
    multiplier: f64,
    timeout: Duration,
}

impl MinfreespaceFilter {
    /// Build from `<n>.minfreespace` and `<n>.multiplier`
    pub fn new(config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        Ok(Self {
            min_free: config.bytes("minfreespace")?,
            multiplier: config.multiplier("multiplier")?,
            timeout: ctx.status_timeout,
        })
    }
}

impl Filter for MinfreespaceFilter {
    fn name(&self) -> &'static str {
        "minfreespace"
    }

    fn process(&self, chart: &mut ScoreChart, _request: &TransferRequest) -> Result<()> {
        for (slave, status) in collect_statuses(chart, self.timeout, self.name()) {
            if status.free_space >= self.min_free {
                continue;
            }
            if self.multiplier == 0.0 {
                debug!("minfreespace: removing {} ({} bytes free)", slave, status.free_space);
                chart.remove_slave(&slave);
            } else {
                let missing = self.min_free - status.free_space;
                chart.add_score(&slave, -scaled(missing, self.multiplier))?;
            }
        }
        Ok(())
    }
}
