//! Main test module for Stowage
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end coordinator scenarios
//! - Chaos tests for slaves failing at the worst moment
//! - Property-based tests for merge and selection invariants
//! - Stress tests for concurrent tree mutation and selection

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::stowage::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_tree() {
        let tree = ReplicaTree::new();
        let root = tree.lookup("/").unwrap();
        assert!(root.is_directory());
        assert_eq!(root.size, 0);
        assert!(root.children.is_empty());
        assert!(tree.files_under("/").unwrap().is_empty());
        assert!(matches!(tree.delete("/"), Err(StowageError::InvalidPath(_))));

        let stats = tree.stats();
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.files, 0);
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let (_, s1) = MemorySlave::shared("s1");
        let tree = ReplicaTree::new();
        tree.put_file(&ListingEntry::file("/Music/Track.MP3", 10, 1), &s1).unwrap();

        let info = tree.lookup("/music/track.mp3").unwrap();
        assert_eq!(info.name, "Track.MP3");
        assert_eq!(info.path, "/Music/Track.MP3");
        assert!(matches!(
            tree.create_directory("/", "MUSIC", "u", "g"),
            Err(StowageError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_special_names() {
        let (_, s1) = MemorySlave::shared("s1");
        let tree = ReplicaTree::new();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "файл.txt",
            "文件.txt",
        ];
        for name in names {
            tree.put_file(&ListingEntry::file(format!("/special/{}", name), 1, 1), &s1)
                .unwrap();
        }
        assert_eq!(tree.lookup("/special").unwrap().children.len(), names.len());

        let text = tree.to_snapshot();
        let registry = SlaveRegistry::with_slaves([s1]).unwrap();
        let restored = ReplicaTree::from_snapshot(&text, &registry).unwrap();
        for name in names {
            assert!(restored.exists(&format!("/special/{}", name)), "{} lost", name);
        }
    }

    #[test]
    fn test_invalid_paths() {
        let (_, s1) = MemorySlave::shared("s1");
        let tree = ReplicaTree::new();
        for bad in ["relative/path", "/a/../b", "/a/./b"] {
            assert!(
                tree.put_file(&ListingEntry::file(bad, 1, 1), &s1).is_err(),
                "{} accepted",
                bad
            );
        }
        assert!(tree.lookup("no-slash").is_err());
    }

    #[test]
    fn test_selection_with_no_slaves() {
        let engine = SlaveSelectionEngine::builder().build().unwrap();
        let err = engine
            .select_upload(&TransferRequest::new(Direction::Upload, "/x"))
            .unwrap_err();
        assert!(matches!(err, StowageError::NoAvailableSlave(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_zero_byte_checksum_skips_rpc() {
        let (m1, s1) = MemorySlave::shared("s1");
        let tree = Arc::new(ReplicaTree::new());
        tree.put_file(&ListingEntry::file("/empty", 0, 1), &s1).unwrap();
        assert_eq!(tree.checksum("/empty").unwrap(), 0);
        assert!(m1.rpc_log().is_empty());
    }
}

#[cfg(test)]
mod stress_tests {
    use ::stowage::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_merges_and_selections() {
        let (slaves, refs): (Vec<_>, Vec<_>) = (0..4).map(|i| MemorySlave::shared(format!("s{}", i))).unzip();
        for slave in &slaves {
            for f in 0..50 {
                slave.add_file(format!("/sec/rel{}/f{}", f % 5, f), 100, 0, 1_000);
            }
        }

        let tree = Arc::new(ReplicaTree::new());
        let engine = Arc::new(
            SlaveSelectionEngine::builder()
                .registry(Arc::new(SlaveRegistry::with_slaves(refs.clone()).unwrap()))
                .tree(Arc::clone(&tree))
                .chain_properties(ChainKind::Up, Properties::parse("1.filter=cycle\n"))
                .build()
                .unwrap(),
        );

        let handles: Vec<_> = slaves
            .iter()
            .zip(refs.iter())
            .map(|(slave, handle)| {
                let tree = Arc::clone(&tree);
                let engine = Arc::clone(&engine);
                let listing = slave.listing();
                let handle = handle.clone();
                thread::spawn(move || {
                    for round in 0..10 {
                        tree.remerge(&listing, &handle).unwrap();
                        let request = TransferRequest::new(Direction::Upload, format!("/sec/new{}", round));
                        engine.select_upload(&request).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = tree.stats();
        assert_eq!(stats.files, 50);
        for slave in &refs {
            assert_eq!(stats.files_per_slave.get(slave.name()), Some(&50));
        }
    }
}
