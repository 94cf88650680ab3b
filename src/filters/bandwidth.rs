//! Throughput penalty

use super::{collect_statuses, scaled, Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::scorechart::ScoreChart;
use crate::types::TransferRequest;
use std::time::Duration;

/// Subtracts `throughput(direction) * multiplier` from every slave
///
/// Slaves whose status cannot be read are removed.
#[derive(Debug, Clone)]
pub struct BandwidthFilter {
    multiplier: f64,
    timeout: Duration,
}

impl BandwidthFilter {
    /// Build from `<n>.multiplier`
    pub fn new(config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        Ok(Self {
            multiplier: config.multiplier("multiplier")?,
            timeout: ctx.status_timeout,
        })
    }

    /// Parsed multiplier
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Filter for BandwidthFilter {
    fn name(&self) -> &'static str {
        "bandwidth"
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        for (slave, status) in collect_statuses(chart, self.timeout, self.name()) {
            let delta = scaled(status.throughput(request.direction), self.multiplier);
            chart.add_score(&slave, -delta)?;
        }
        Ok(())
    }
}
