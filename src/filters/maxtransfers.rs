//! Active transfer ceiling

use super::{collect_statuses, Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::scorechart::ScoreChart;
use crate::types::TransferRequest;
use std::time::Duration;
use tracing::debug;

/// Removes slaves running more than `maxtransfers` transfers in the direction
#[derive(Debug, Clone)]
pub struct MaxtransfersFilter {
    max: u32,
    timeout: Duration,
}

impl MaxtransfersFilter {
    /// Build from `<n>.maxtransfers`
    pub fn new(config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        Ok(Self {
            max: config.parse("maxtransfers")?,
            timeout: ctx.status_timeout,
        })
    }
}

impl Filter for MaxtransfersFilter {
    fn name(&self) -> &'static str {
        "maxtransfers"
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        for (slave, status) in collect_statuses(chart, self.timeout, self.name()) {
            let active = status.transfers(request.direction);
            if active > self.max {
                debug!("maxtransfers: removing {} ({} active)", slave, active);
                chart.remove_slave(&slave);
            }
        }
        Ok(())
    }
}
