//! Throughput ceiling

use super::{collect_statuses, Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::scorechart::ScoreChart;
use crate::types::TransferRequest;
use std::time::Duration;
use tracing::debug;

/// Removes slaves whose throughput in the transfer direction exceeds a ceiling
#[derive(Debug, Clone)]
pub struct MaxbandwidthFilter {
    ceiling: u64,
    timeout: Duration,
}

impl MaxbandwidthFilter {
    /// Build from `<n>.maxbandwidth` (bytes per second, units allowed)
    pub fn new(config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        Ok(Self {
            ceiling: config.bytes("maxbandwidth")?,
            timeout: ctx.status_timeout,
        })
    }
}

impl Filter for MaxbandwidthFilter {
    fn name(&self) -> &'static str {
        "maxbandwidth"
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        for (slave, status) in collect_statuses(chart, self.timeout, self.name()) {
            let throughput = status.throughput(request.direction);
            if throughput > self.ceiling {
                debug!("maxbandwidth: removing {} ({} > {})", slave, throughput, self.ceiling);
                chart.remove_slave(&slave);
            }
        }
        Ok(())
    }
}
