//! Chaos testing for Stowage
//!
//! Slaves drop out in the middle of deletes, renames, checksums and status
//! queries, configuration and snapshots get corrupted, and a seeded engine
//! flaps the whole cluster. The tree must stay consistent with what the
//! slaves actually hold.

use crate::integration::ClusterHarness;
use ::stowage::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{info, warn};

/// Seeded source of cluster faults
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Give every slave a random subset of a shared file set
    ///
    /// Sizes depend only on the path so replicas never conflict.
    pub fn populate(&mut self, cluster: &ClusterHarness, files: usize) {
        for slave in &cluster.slaves {
            for i in 0..files {
                if self.rng.random_bool(0.5) {
                    let lm = self.rng.random_range(1_000..2_000);
                    slave.add_file(format!("/sec/rel{}/f{}", i % 4, i), 100 + i as u64, 0, lm);
                }
            }
        }
    }

    /// Apply one random fault or recovery; returns what happened
    pub fn step(&mut self, cluster: &ClusterHarness, report: &mut ChaosReport) {
        let i = self.rng.random_range(0..cluster.slaves.len());
        let name = cluster.refs[i].name().to_string();
        match self.rng.random_range(0..4) {
            0 => {
                cluster.connect(&name);
                report.reconnects += 1;
            }
            1 => {
                cluster.disconnect(&name);
                report.disconnects += 1;
            }
            2 => {
                // dropped without the coordinator noticing yet
                cluster.slaves[i].set_online(false);
                report.silent_drops += 1;
            }
            _ => {
                let files = cluster.tree.files_under("/").unwrap_or_default();
                if files.is_empty() {
                    return;
                }
                let victim = &files[self.rng.random_range(0..files.len())];
                match cluster.tree.delete(&victim.path) {
                    Ok(outcome) => {
                        report.deletes += 1;
                        report.tombstones_created += outcome.tombstoned.len();
                    }
                    Err(e) => warn!("delete of {} failed: {}", victim.path, e),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ChaosReport {
    pub reconnects: usize,
    pub disconnects: usize,
    pub silent_drops: usize,
    pub deletes: usize,
    pub tombstones_created: usize,
}

/// Every live replica that is online really holds the file
fn assert_online_replicas_hold_files(cluster: &ClusterHarness) {
    for file in cluster.tree.files_under("/").unwrap() {
        assert!(!file.replicas.is_empty(), "{} has no replicas", file.path);
        for replica in &file.replicas {
            let i = cluster.idx(replica.name());
            if cluster.slaves[i].is_available() {
                assert!(
                    cluster.slaves[i].has_file(&file.path),
                    "{} lists {} but the slave lost it",
                    file.path,
                    replica
                );
            }
        }
    }
}

/// Slave not reachable for status although it claims to be connected
struct StatuslessSlave {
    name: String,
    clock: TransferClock,
}

impl SlaveHandle for StatuslessSlave {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        true
    }

    fn status(&self, timeout: Duration) -> Result<SlaveStatus> {
        Err(StowageError::unavailable(
            &self.name,
            format!("no answer within {:?}", timeout),
        ))
    }

    fn delete(&self, _path: &str) -> Result<()> {
        Err(StowageError::unavailable(&self.name, "timed out"))
    }

    fn rename(&self, _from: &str, _to_dir: &str, _to_name: &str) -> Result<()> {
        Err(StowageError::unavailable(&self.name, "timed out"))
    }

    fn checksum(&self, _path: &str) -> Result<u64> {
        Err(StowageError::unavailable(&self.name, "timed out"))
    }

    fn active_transfers(&self) -> Vec<TransferInfo> {
        Vec::new()
    }

    fn last_transfer(&self, direction: Direction) -> i64 {
        self.clock.get(direction)
    }

    fn set_last_transfer(&self, direction: Direction, timestamp: i64) {
        self.clock.set(direction, timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_flapping_cluster_converges() {
        let cluster = ClusterHarness::new(&["s1", "s2", "s3", "s4"]);
        let mut chaos = ChaosEngine::new(42);
        chaos.populate(&cluster, 40);
        for slave in &cluster.refs {
            cluster.connect(slave.name());
        }

        let mut report = ChaosReport::default();
        for _ in 0..300 {
            chaos.step(&cluster, &mut report);
            assert_online_replicas_hold_files(&cluster);
        }
        info!("chaos run: {:?}", report);
        assert!(report.deletes > 0);

        // everyone comes back; the tree must mirror the slaves exactly
        for slave in &cluster.refs {
            cluster.connect(slave.name());
        }
        let stats = cluster.tree.stats();
        assert_eq!(stats.tombstones, 0, "pending deletes were not retried");
        for (i, slave) in cluster.slaves.iter().enumerate() {
            for path in slave.files() {
                let info = cluster.tree.lookup(&path).unwrap();
                assert!(info.has_replica(cluster.refs[i].name()), "{} missing {}", path, slave.name());
            }
            assert_eq!(stats.files_per_slave.get(slave.name()).copied().unwrap_or(0), slave.files().len());
        }
    }

    #[test]
    #[traced_test]
    fn test_delete_while_replicas_drop_out() {
        let cluster = ClusterHarness::new(&["a", "b", "c"]);
        for slave in &cluster.slaves {
            slave.add_file("/rel/1", 10, 0, 1);
            slave.add_file("/rel/2", 20, 0, 1);
        }
        for name in ["a", "b", "c"] {
            cluster.connect(name);
        }
        cluster.slaves[1].set_online(false);
        cluster.slaves[2].set_online(false);

        let report = cluster.tree.delete("/rel").unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.tombstoned.len(), 2);
        assert!(!cluster.tree.exists("/rel/1"));

        // b returns first; c still holds its copies
        let merged = cluster.connect("b");
        assert_eq!(merged.deletes_completed, 2);
        assert_eq!(cluster.tree.inspect("/rel/1").unwrap().replica_names(), vec!["c"]);

        // c finishes the delete
        cluster.connect("c");
        assert!(cluster.tree.inspect("/rel/1").is_err());
        assert!(cluster.tree.inspect("/rel").is_err());
        assert!(cluster.slaves.iter().all(|s| s.files().is_empty()));
    }

    #[test]
    fn test_rename_with_offline_replica() {
        let cluster = ClusterHarness::new(&["a", "b"]);
        for slave in &cluster.slaves {
            slave.add_file("/old/f", 10, 0, 1);
        }
        cluster.connect("a");
        cluster.connect("b");
        cluster.slaves[1].set_online(false);

        cluster.tree.rename("/old", "/", "new").unwrap();
        assert!(cluster.slaves[0].has_file("/new/f"));
        assert!(cluster.slaves[1].has_file("/old/f"));

        // b comes back still holding the old name
        let report = cluster.connect("b");
        assert_eq!(report.vanished, 1);
        assert_eq!(cluster.tree.lookup("/new/f").unwrap().replica_names(), vec!["a"]);
        assert_eq!(cluster.tree.lookup("/old/f").unwrap().replica_names(), vec!["b"]);
    }

    #[test]
    fn test_checksum_with_all_replicas_offline() {
        let cluster = ClusterHarness::new(&["a"]);
        cluster.slaves[0].add_file("/f", 10, 0xBEEF, 1);
        cluster.connect("a");
        // the coordinator forgot the checksum, e.g. after an old snapshot
        let registry = SlaveRegistry::with_slaves(cluster.refs.clone()).unwrap();
        let stale = cluster.tree.to_snapshot().replace("x.crc32=0000BEEF;", "");
        cluster.tree.restore_snapshot(&stale, &registry).unwrap();
        assert_eq!(cluster.tree.lookup("/f").unwrap().checksum, 0);

        cluster.slaves[0].set_online(false);
        assert_eq!(cluster.tree.checksum("/f").unwrap(), 0);

        cluster.slaves[0].set_online(true);
        assert_eq!(cluster.tree.checksum("/f").unwrap(), 0xBEEF);
        assert_eq!(cluster.tree.lookup("/f").unwrap().checksum, 0xBEEF);
    }

    #[test]
    #[traced_test]
    fn test_status_failures_remove_slaves() {
        let cluster = ClusterHarness::new(&["good"]);
        let flaky = SlaveRef::new(StatuslessSlave {
            name: "flaky".to_string(),
            clock: TransferClock::new(),
        });
        cluster.registry.register(flaky.clone()).unwrap();
        let engine = cluster.engine(&[(ChainKind::Up, "1.filter=bandwidth\n1.multiplier=1\n")]);

        let request = TransferRequest::new(Direction::Upload, "/x");
        assert_eq!(engine.select_upload(&request).unwrap().name(), "good");

        cluster.slaves[0].set_online(false);
        let err = engine.select_upload(&request).unwrap_err();
        assert!(matches!(err, StowageError::NoAvailableSlave(_)));
    }

    #[test]
    fn test_corrupt_reload_keeps_chains() {
        let cluster = ClusterHarness::new(&["a", "b"]);
        let dir = TempDir::new().unwrap();
        let config = StowageConfig {
            conf_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        for kind in ChainKind::ALL {
            fs::write(config.chain_path(kind), "1.filter=cycle\n").unwrap();
        }
        let engine = SlaveSelectionEngineBuilder::from_config(&config)
            .unwrap()
            .registry(Arc::clone(&cluster.registry))
            .tree(Arc::clone(&cluster.tree))
            .build()
            .unwrap();

        for broken in [
            "1.filter=bandwidth\n1.multiplier=*abc\n",
            "1.filter=nosuchfilter\n",
            "1.filter=matchdir\n1.match=[unclosed\n1.assign=a+1\n",
            "1.filter=minfreespace\n",
        ] {
            fs::write(config.chain_path(ChainKind::Down), broken).unwrap();
            let err = engine.reload().unwrap_err();
            assert!(err.is_config_error(), "{:?} gave {}", broken, err);
            assert_eq!(engine.chain(ChainKind::Down).filter_names(), vec!["cycle"]);
        }
    }

    #[test]
    fn test_corrupt_snapshot_keeps_tree() {
        let cluster = ClusterHarness::new(&["a"]);
        cluster.slaves[0].add_file("/rel/f", 100, 1, 1);
        cluster.connect("a");
        let before = cluster.tree.to_snapshot();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.snapshot");
        let corrupted = before.replacen("type=file;size=", "type=file;size=x", 1);
        fs::write(&path, &corrupted).unwrap();

        let err = cluster.tree.load_snapshot(&path, &cluster.registry).unwrap_err();
        assert!(matches!(err, StowageError::CorruptSnapshot { .. }), "{}", err);
        assert_eq!(cluster.tree.to_snapshot(), before);
        assert!(cluster.tree.exists("/rel/f"));
    }
}
