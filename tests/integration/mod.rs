//! Integration tests for Stowage
//!
//! End-to-end coordinator scenarios: slaves joining and leaving, deletes and
//! renames across replicas, and selections through configured chains.

use ::stowage::*;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// A coordinator with in-memory slaves
pub struct ClusterHarness {
    pub slaves: Vec<Arc<MemorySlave>>,
    pub refs: Vec<SlaveRef>,
    pub registry: Arc<SlaveRegistry>,
    pub tree: Arc<ReplicaTree>,
    pub jobs: Arc<JobBoard>,
}

impl ClusterHarness {
    pub fn new(names: &[&str]) -> Self {
        let (slaves, refs): (Vec<_>, Vec<_>) = names.iter().map(|n| MemorySlave::shared(*n)).unzip();
        let registry = Arc::new(SlaveRegistry::with_slaves(refs.clone()).unwrap());
        Self {
            slaves,
            refs,
            registry,
            tree: Arc::new(ReplicaTree::new()),
            jobs: Arc::new(JobBoard::new()),
        }
    }

    /// Index of a slave by name
    pub fn idx(&self, name: &str) -> usize {
        self.refs
            .iter()
            .position(|r| r.name() == name)
            .unwrap_or_else(|| panic!("no slave {}", name))
    }

    /// Merge the full listing of one slave
    pub fn connect(&self, name: &str) -> RemergeReport {
        let i = self.idx(name);
        self.slaves[i].set_online(true);
        let report = self.tree.remerge(&self.slaves[i].listing(), &self.refs[i]).unwrap();
        info!("{} connected: {:?}", name, report);
        report
    }

    /// Take a slave offline and detach it
    pub fn disconnect(&self, name: &str) -> usize {
        let i = self.idx(name);
        self.slaves[i].set_online(false);
        self.tree.unmerge(&self.refs[i])
    }

    /// Path -> replica names for every live file
    pub fn replica_map(&self) -> BTreeMap<String, Vec<String>> {
        self.tree
            .files_under("/")
            .unwrap()
            .into_iter()
            .map(|f| (f.path.clone(), f.replica_names()))
            .collect()
    }

    /// Engine sharing this cluster's state, with the given chains
    pub fn engine(&self, chains: &[(ChainKind, &str)]) -> SlaveSelectionEngine {
        let mut builder = SlaveSelectionEngine::builder()
            .registry(Arc::clone(&self.registry))
            .tree(Arc::clone(&self.tree))
            .jobs(Arc::clone(&self.jobs));
        for (kind, text) in chains {
            builder = builder.chain_properties(*kind, Properties::parse(text));
        }
        builder.build().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_order_does_not_matter() {
        let build = |order: &[&str]| {
            let h = ClusterHarness::new(&["a", "b"]);
            h.slaves[0].add_file("/x/1", 10, 0, 1);
            h.slaves[0].add_file("/x/2", 20, 0, 1);
            h.slaves[1].add_file("/x/3", 30, 0, 1);
            h.slaves[1].add_file("/y/4", 40, 0, 1);
            for name in order {
                h.connect(name);
            }
            h.replica_map()
        };
        assert_eq!(build(&["a", "b"]), build(&["b", "a"]));
    }

    #[test]
    fn test_unmerge_then_remerge_restores_tree() {
        let h = ClusterHarness::new(&["a"]);
        h.slaves[0].add_file("/rel/one", 10, 0xAA, 1_000);
        h.slaves[0].add_file("/rel/two", 20, 0xBB, 2_000);
        h.connect("a");
        let before = h.tree.to_snapshot();

        assert_eq!(h.disconnect("a"), 2);
        assert!(!h.tree.exists("/rel"));
        h.connect("a");
        assert_eq!(h.tree.to_snapshot(), before);
    }

    #[test]
    fn test_delete_with_offline_replica_completes_on_reconnect() {
        let h = ClusterHarness::new(&["on", "off"]);
        for slave in &h.slaves {
            slave.add_file("/rel/f", 5, 0, 1);
        }
        h.connect("on");
        h.connect("off");
        h.slaves[1].set_online(false);

        let report = h.tree.delete("/rel/f").unwrap();
        assert_eq!(report.tombstoned, vec!["/rel/f"]);
        assert!(!h.slaves[0].has_file("/rel/f"));
        assert!(h.slaves[1].has_file("/rel/f"));

        let tombstone = h.tree.inspect("/rel/f").unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.replica_names(), vec!["off"]);
        assert!(matches!(h.tree.lookup("/rel/f"), Err(StowageError::ObjectNotFound(_))));

        let report = h.connect("off");
        assert_eq!(report.deletes_completed, 1);
        assert!(!h.slaves[1].has_file("/rel/f"));
        assert!(h.tree.inspect("/rel/f").is_err());
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_files() {
        let h = ClusterHarness::new(&["a", "b", "c"]);
        h.slaves[0].add_file("/d1/f1", 100, 0x1234, 1_000);
        h.slaves[1].add_file("/d1/f1", 100, 0, 1_000);
        h.slaves[1].add_file("/d2/sub/f2", 200, 0xFFFF_0000, 2_000);
        h.slaves[2].add_file("/d2/f3", 300, 0, 3_000);
        for name in ["a", "b", "c"] {
            h.connect(name);
        }
        h.tree.set_transfer_time("/d2/f3", 1_500).unwrap();

        let restored = ReplicaTree::from_snapshot(&h.tree.to_snapshot(), &h.registry).unwrap();
        let original = h.tree.files_under("/").unwrap();
        let copy = restored.files_under("/").unwrap();
        assert_eq!(original.len(), 3);
        for (a, b) in original.iter().zip(copy.iter()) {
            assert_eq!(a.path, b.path);
            assert_eq!(a.size, b.size);
            assert_eq!(a.checksum, b.checksum);
            assert_eq!(a.replica_names(), b.replica_names());
            assert_eq!(a.xfertime, b.xfertime);
        }
    }

    #[test]
    fn test_size_conflicts() {
        let h = ClusterHarness::new(&["a", "b", "c"]);
        h.slaves[0].add_file("/rel/f", 100, 0, 1);
        h.slaves[1].add_file("/rel/f", 100, 0, 1);
        h.slaves[2].add_file("/rel/f", 70, 0, 1);
        h.slaves[2].add_file("/rel/empty", 0, 0, 1);
        h.slaves[0].add_file("/rel/empty", 9, 0, 1);
        h.connect("a");
        h.connect("b");
        h.connect("c");

        // c's copy is moved aside and kept as its own file
        assert!(h.slaves[2].rpc_log().contains(&"rename /rel/f /rel/f.c.conflict".to_string()));
        assert!(h.slaves[2].has_file("/rel/f.c.conflict"));
        assert_eq!(h.tree.lookup("/rel/f").unwrap().replica_names(), vec!["a", "b"]);
        let conflict = h.tree.lookup("/rel/f.c.conflict").unwrap();
        assert_eq!(conflict.size, 70);
        assert_eq!(conflict.replica_names(), vec!["c"]);

        // the zero-byte leftover is deleted on c
        assert!(h.slaves[2].rpc_log().contains(&"delete /rel/empty".to_string()));
        assert_eq!(h.tree.lookup("/rel/empty").unwrap().replica_names(), vec!["a"]);
    }

    #[test]
    fn test_sole_replica_adopts_new_size() {
        let h = ClusterHarness::new(&["a"]);
        h.slaves[0].add_file("/f", 10, 1, 1);
        h.connect("a");
        h.slaves[0].add_file("/f", 25, 2, 5);
        h.connect("a");
        let info = h.tree.lookup("/f").unwrap();
        assert_eq!((info.size, info.checksum), (25, 2));
    }

    #[test]
    fn test_rename_directory_reaches_every_holder() {
        let h = ClusterHarness::new(&["a", "b"]);
        h.slaves[0].add_file("/incoming/rel/1", 1, 0, 1);
        h.slaves[1].add_file("/incoming/rel/sub/2", 1, 0, 1);
        h.connect("a");
        h.connect("b");
        h.tree.create_directory("/", "archive", "ftp", "ftp").unwrap();

        let info = h.tree.rename("/incoming/rel", "/archive", "rel-2024").unwrap();
        assert_eq!(info.path, "/archive/rel-2024");
        for slave in &h.slaves {
            assert!(slave
                .rpc_log()
                .contains(&"rename /incoming/rel /archive/rel-2024".to_string()));
        }
        assert!(h.slaves[1].has_file("/archive/rel-2024/sub/2"));
        assert_eq!(
            h.tree.lookup("/archive/rel-2024/sub/2").unwrap().replica_names(),
            vec!["b"]
        );
        assert!(matches!(
            h.tree.rename("/archive", "/archive/rel-2024", "loop"),
            Err(StowageError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_checksum_is_fetched_once() {
        let h = ClusterHarness::new(&["a", "b"]);
        h.slaves[0].add_file("/f", 10, 0, 1);
        h.slaves[1].add_file("/f", 10, 0, 1);
        h.connect("a");
        h.connect("b");
        h.slaves[0].set_online(false);
        // the tree knows no checksum; b's copy has one now
        h.slaves[1].add_file("/f", 10, 0xDEAD, 1);

        assert_eq!(h.tree.checksum("/f").unwrap(), 0xDEAD);
        assert_eq!(h.tree.checksum("/f").unwrap(), 0xDEAD);
        let calls = h.slaves[1].rpc_log().iter().filter(|l| l.starts_with("checksum")).count();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_empty_chain_picks_a_candidate_with_score_zero() {
        let h = ClusterHarness::new(&["a", "b", "c"]);
        let chain = FilterChain::empty();
        let mut chart = ScoreChart::new(h.refs.clone());
        let best = chain
            .get_best_slave(&mut chart, &TransferRequest::new(Direction::Upload, "/x"))
            .unwrap();
        assert!(h.refs.contains(&best));
        assert_eq!(chart.get_score(&best).unwrap(), 0);
    }

    #[test]
    fn test_upload_chain_end_to_end() {
        let h = ClusterHarness::new(&["a", "b", "c"]);
        h.slaves[0].set_status(SlaveStatus {
            free_space: 10 << 30,
            throughput_up: 1_000,
            ..Default::default()
        });
        h.slaves[1].set_status(SlaveStatus {
            free_space: 1 << 20,
            ..Default::default()
        });
        h.slaves[2].set_status(SlaveStatus {
            free_space: 10 << 30,
            throughput_up: 5_000,
            ..Default::default()
        });
        let engine = h.engine(&[(
            ChainKind::Up,
            "1.filter=minfreespace\n1.minfreespace=1GB\n1.multiplier=remove\n\
             2.filter=bandwidth\n2.multiplier=1\n\
             3.filter=matchdir\n3.match=/pre/*\n3.assign=c+10000\n",
        )]);

        let winner = engine
            .select_upload(&TransferRequest::new(Direction::Upload, "/mp3/x"))
            .unwrap();
        assert_eq!(winner.name(), "a");
        let winner = engine
            .select_upload(&TransferRequest::new(Direction::Upload, "/pre/x"))
            .unwrap();
        assert_eq!(winner.name(), "c");
    }

    #[test]
    fn test_cycle_rotates_between_equal_slaves() {
        let h = ClusterHarness::new(&["a", "b", "c"]);
        let engine = h.engine(&[(ChainKind::Up, "1.filter=cycle\n")]);
        let mut picked = Vec::new();
        for now in 1..=6 {
            let request = TransferRequest::new(Direction::Upload, "/f").at(now);
            picked.push(engine.select_upload(&request).unwrap().name().to_string());
        }
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_replication_job_flow() {
        let h = ClusterHarness::new(&["src", "d1", "d2"]);
        h.slaves[0].add_file("/rel/big", 1_000, 0, 1);
        h.connect("src");
        let engine = h.engine(&[(ChainKind::JobUp, "1.filter=maxuploadsperslavejob\n1.maxuploads=1\n")]);

        let destinations = vec![h.refs[1].clone(), h.refs[2].clone()];
        let request = TransferRequest::new(Direction::Upload, "/rel/big");
        let source = engine.select_job_source(&request, &destinations).unwrap();
        assert_eq!(source.name(), "src");

        let request = request.source_slave(source.clone());
        let first = engine.select_job_destination(&request, &destinations).unwrap();
        assert_eq!(first.name(), "d1");
        let job = engine.jobs().begin("/rel/big", source.clone(), first.clone());

        // d1 is busy receiving from src
        let second = engine.select_job_destination(&request, &destinations).unwrap();
        assert_eq!(second.name(), "d2");
        engine.jobs().begin("/rel/big", source.clone(), second);
        assert!(matches!(
            engine.select_job_destination(&request, &destinations),
            Err(StowageError::NoAvailableSlave(_))
        ));

        engine.jobs().finish(job);
        assert_eq!(engine.select_job_destination(&request, &destinations).unwrap().name(), "d1");
    }

    #[test]
    fn test_one_transfer_per_user() {
        let h = ClusterHarness::new(&["a", "b"]);
        h.slaves[0].add_transfer(TransferInfo {
            direction: Direction::Download,
            user: Some("alice".to_string()),
            path: "/rel/1".to_string(),
        });
        let engine = h.engine(&[(ChainKind::Up, "1.filter=maxtransfersperuser\n")]);

        let for_alice = TransferRequest::new(Direction::Upload, "/rel/2").user("alice");
        // her download on a does not count against uploads
        assert_eq!(engine.select_upload(&for_alice).unwrap().name(), "a");

        h.slaves[0].add_transfer(TransferInfo {
            direction: Direction::Upload,
            user: Some("alice".to_string()),
            path: "/rel/3".to_string(),
        });
        assert_eq!(engine.select_upload(&for_alice).unwrap().name(), "b");
        let for_bob = TransferRequest::new(Direction::Upload, "/rel/2").user("bob");
        assert_eq!(engine.select_upload(&for_bob).unwrap().name(), "a");
    }

    #[test]
    fn test_chains_from_disk_and_reload() {
        let h = ClusterHarness::new(&["a", "b"]);
        let dir = TempDir::new().unwrap();
        let config = StowageConfig {
            conf_dir: dir.path().to_path_buf(),
            sections: vec!["/mp3".to_string()],
            ..Default::default()
        };
        for kind in ChainKind::ALL {
            fs::write(config.chain_path(kind), "").unwrap();
        }
        fs::write(config.chain_path(ChainKind::Up), "1.filter=matchdir\n1.match=*\n1.assign=b+1\n").unwrap();

        let engine = SlaveSelectionEngineBuilder::from_config(&config)
            .unwrap()
            .registry(Arc::clone(&h.registry))
            .tree(Arc::clone(&h.tree))
            .build()
            .unwrap();
        let request = TransferRequest::new(Direction::Upload, "/mp3/x");
        assert_eq!(engine.select_upload(&request).unwrap().name(), "b");

        fs::write(config.chain_path(ChainKind::Up), "1.filter=matchdir\n1.match=*\n1.assign=a+1\n").unwrap();
        engine.reload().unwrap();
        assert_eq!(engine.select_upload(&request).unwrap().name(), "a");

        fs::write(config.chain_path(ChainKind::Up), "1.filter=matchdir\n1.match=*\n1.assign=ghost+1\n").unwrap();
        assert!(engine.reload().is_err());
        assert_eq!(engine.select_upload(&request).unwrap().name(), "a");
    }
}
