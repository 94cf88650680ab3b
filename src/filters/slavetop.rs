//! Keep a release together on the slaves that already hold most of it

use super::{Filter, FilterConfig, FilterContext};
use crate::error::Result;
use crate::scorechart::ScoreChart;
use crate::sections::Sections;
use crate::tree::ReplicaTree;
use crate::types::TransferRequest;
use std::sync::Arc;
use tracing::{debug, trace};

/// Rewards the `topslaves` chart entries holding the most files of the
/// release the transfer belongs to
///
/// With `assign=0` every other entry is removed instead.
#[derive(Debug, Clone)]
pub struct SlavetopFilter {
    top_slaves: usize,
    assign: i64,
    tree: Arc<ReplicaTree>,
    sections: Arc<Sections>,
}

impl SlavetopFilter {
    pub fn new(config: &FilterConfig, ctx: &FilterContext) -> Result<Self> {
        Ok(Self {
            top_slaves: config.parse("topslaves")?,
            assign: config.parse("assign")?,
            tree: Arc::clone(&ctx.tree),
            sections: Arc::clone(&ctx.sections),
        })
    }
}

impl Filter for SlavetopFilter {
    fn name(&self) -> &'static str {
        "slavetop"
    }

    fn process(&self, chart: &mut ScoreChart, request: &TransferRequest) -> Result<()> {
        let Some(release) = self.sections.release_of(&request.path) else {
            return Ok(());
        };
        match self.tree.lookup(&release) {
            Ok(info) if info.is_directory() => {}
            _ => {
                trace!("slavetop: no release directory {}", release);
                return Ok(());
            }
        }

        let files = self.tree.files_under(&release)?;
        let mut tally: Vec<(usize, u64)> = chart
            .scores()
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let held = files.iter().filter(|f| f.replicas.contains(entry.slave())).count();
                (idx, held as u64)
            })
            .collect();
        if tally.iter().all(|(_, held)| *held == 0) {
            return Ok(());
        }

        // stable: equal tallies keep chart order
        tally.sort_by(|a, b| b.1.cmp(&a.1));
        let winners: Vec<usize> = tally.iter().take(self.top_slaves).map(|(idx, _)| *idx).collect();
        let top: Vec<_> = winners.iter().map(|&idx| chart.scores()[idx].slave().clone()).collect();
        debug!("slavetop: {} top slaves {:?}", release, top);

        if self.assign == 0 {
            chart.retain(|entry| top.contains(entry.slave()));
        } else {
            for entry in chart.scores_mut() {
                if top.contains(entry.slave()) {
                    entry.add_score(self.assign);
                }
            }
        }
        Ok(())
    }
}
