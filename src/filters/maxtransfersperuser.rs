//! Per-user transfer limit

use super::{Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::scorechart::ScoreChart;
use crate::types::TransferRequest;
use tracing::debug;

/// Removes slaves already serving `maxtransfers` transfers of the requesting
/// user in the same direction
///
/// Requests without a user pass through untouched. Unavailable slaves are
/// removed since their transfer list cannot be trusted.
#[derive(Debug, Clone)]
pub struct MaxTransfersPerUserFilter {
    max: usize,
}

impl MaxTransfersPerUserFilter {
    /// Build from `<n>.maxtransfers` (default 1)
    pub fn new(config: &FilterConfig, _ctx: &FilterContext) -> Result<Self> {
        Ok(Self {
            max: config.parse_or("maxtransfers", 1)?,
        })
    }
}

impl Filter for MaxTransfersPerUserFilter {
    fn name(&self) -> &'static str {
        "maxtransfersperuser"
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        let Some(user) = request.user.as_deref() else {
            return Ok(());
        };
        for slave in chart.slaves() {
            if !slave.is_available() {
                chart.remove_slave(&slave);
                continue;
            }
            let running = slave
                .active_transfers()
                .iter()
                .filter(|t| t.direction == request.direction && t.user.as_deref() == Some(user))
                .count();
            if running >= self.max {
                debug!("maxtransfersperuser: {} already serves {} for {}", slave, running, user);
                chart.remove_slave(&slave);
            }
        }
        Ok(())
    }
}
