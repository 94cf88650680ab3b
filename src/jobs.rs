//! In-flight replication jobs
//!
//! The job scheduler copies files between slaves in the background. Each copy
//! is recorded on the [`JobBoard`] between [`JobBoard::begin`] and
//! [`JobBoard::finish`] so the selection filters can see which destinations
//! are already busy receiving from a given source.

use crate::slave::SlaveRef;
use crate::types::now_millis;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// One file being copied from `source` to `destination`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Job identifier
    pub id: Uuid,
    /// File being replicated
    pub path: String,
    /// Slave sending the file
    pub source: SlaveRef,
    /// Slave receiving the file
    pub destination: SlaveRef,
    /// Start time, ms since epoch
    pub started: i64,
}

/// Registry of running replication transfers
#[derive(Debug, Default)]
pub struct JobBoard {
    jobs: RwLock<BTreeMap<Uuid, Job>>,
}

impl JobBoard {
    /// Empty board
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transfer that is about to start
    pub fn begin(&self, path: impl Into<String>, source: SlaveRef, destination: SlaveRef) -> Uuid {
        let job = Job {
            id: Uuid::new_v4(),
            path: path.into(),
            source,
            destination,
            started: now_millis(),
        };
        let id = job.id;
        debug!("Job {} started: {} {} -> {}", id, job.path, job.source, job.destination);
        self.jobs.write().insert(id, job);
        id
    }

    /// Remove a finished (or failed) transfer
    pub fn finish(&self, id: Uuid) -> Option<Job> {
        let job = self.jobs.write().remove(&id);
        match &job {
            Some(job) => debug!("Job {} finished after {}ms", id, now_millis() - job.started),
            None => warn!("Finishing unknown job {}", id),
        }
        job
    }

    /// All running jobs
    pub fn active(&self) -> Vec<Job> {
        self.jobs.read().values().cloned().collect()
    }

    /// Running jobs copying from `source` to `destination`
    pub fn count_between(&self, source: &SlaveRef, destination: &SlaveRef) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|j| &j.source == source && &j.destination == destination)
            .count()
    }

    /// Running jobs sending to `destination`
    pub fn count_to(&self, destination: &SlaveRef) -> usize {
        self.jobs.read().values().filter(|j| &j.destination == destination).count()
    }

    /// Number of running jobs
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    /// Whether no job is running
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}
