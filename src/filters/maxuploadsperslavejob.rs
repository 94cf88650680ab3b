//! Replication fan-in limit

use super::{Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::jobs::JobBoard;
use crate::scorechart::ScoreChart;
use crate::types::TransferRequest;
use std::sync::Arc;
use tracing::debug;

/// Removes destinations already receiving `maxuploads` job transfers from the
/// request's source slave
///
/// Requests without a source slave pass through untouched.
#[derive(Debug, Clone)]
pub struct MaxUploadsPerSlaveJobFilter {
    max: usize,
    jobs: Arc<JobBoard>,
}

impl MaxUploadsPerSlaveJobFilter {
    /// Build from `<n>.maxuploads` (default 1)
    pub fn new(config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        Ok(Self {
            max: config.parse_or("maxuploads", 1)?,
            jobs: ctx.jobs.clone(),
        })
    }
}

impl Filter for MaxUploadsPerSlaveJobFilter {
    fn name(&self) -> &'static str {
        "maxuploadsperslavejob"
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        let Some(source) = request.source_slave.as_ref() else {
            return Ok(());
        };
        for slave in chart.slaves() {
            let running = self.jobs.count_between(source, &slave);
            if running >= self.max {
                debug!("maxuploadsperslavejob: {} -> {} has {} jobs", source, slave, running);
                chart.remove_slave(&slave);
            }
        }
        Ok(())
    }
}
