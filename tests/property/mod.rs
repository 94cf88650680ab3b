//! Property-based testing for Stowage
//!
//! Uses proptest to check merge, snapshot and filter invariants across
//! randomly generated slave listings and statuses.

use ::stowage::filters::{parse_multiplier, BandwidthFilter, MaxbandwidthFilter};
use ::stowage::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A file as a slave would report it
#[derive(Debug, Clone)]
pub struct GeneratedFile {
    pub path: String,
    pub last_modified: i64,
}

/// Generate file paths one or two directories deep
///
/// Directory and file names never share a shape, so no path is a file on one
/// slave and a directory on another.
fn path_strategy() -> impl Strategy<Value = String> {
    (prop::collection::vec("d[0-9]", 1..=2), "f[0-9]{1,3}")
        .prop_map(|(dirs, file)| format!("/{}/{}", dirs.join("/"), file))
}

fn listing_strategy() -> impl Strategy<Value = Vec<GeneratedFile>> {
    prop::collection::vec(
        (path_strategy(), 0i64..4_000_000_000_000).prop_map(|(path, last_modified)| GeneratedFile {
            path,
            last_modified,
        }),
        0..40,
    )
}

/// Size derived from the path, so the same path never conflicts across slaves
fn size_of(path: &str) -> u64 {
    path.len() as u64 * 7
}

fn slave_with(name: &str, files: &[GeneratedFile]) -> (Arc<MemorySlave>, SlaveRef) {
    let (slave, handle) = MemorySlave::shared(name);
    for file in files {
        slave.add_file(file.path.clone(), size_of(&file.path), 0, file.last_modified);
    }
    (slave, handle)
}

fn chart_with_throughput(up: &[u64]) -> (Vec<Arc<MemorySlave>>, ScoreChart, FilterContext) {
    let (slaves, refs): (Vec<_>, Vec<_>) = (0..up.len()).map(|i| MemorySlave::shared(format!("s{}", i))).unzip();
    for (slave, throughput) in slaves.iter().zip(up) {
        slave.set_status(SlaveStatus {
            throughput_up: *throughput,
            ..Default::default()
        });
    }
    let registry = Arc::new(SlaveRegistry::with_slaves(refs.clone()).unwrap());
    let ctx = FilterContext::new(registry, Arc::new(ReplicaTree::new()));
    (slaves, ScoreChart::new(refs), ctx)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Merging two slaves gives the same tree in either order
    #[test]
    fn remerge_order_independence(
        first in listing_strategy(),
        second in listing_strategy(),
    ) {
        let (a, ra) = slave_with("a", &first);
        let (b, rb) = slave_with("b", &second);

        let forward = ReplicaTree::new();
        forward.remerge(&a.listing(), &ra).unwrap();
        forward.remerge(&b.listing(), &rb).unwrap();

        let backward = ReplicaTree::new();
        backward.remerge(&b.listing(), &rb).unwrap();
        backward.remerge(&a.listing(), &ra).unwrap();

        prop_assert_eq!(forward.to_snapshot(), backward.to_snapshot());
    }

    /// A slave that leaves and comes back with the same files restores the tree
    #[test]
    fn unmerge_remerge_identity(files in listing_strategy()) {
        let (slave, handle) = slave_with("a", &files);
        let tree = ReplicaTree::new();
        tree.remerge(&slave.listing(), &handle).unwrap();
        let before = tree.to_snapshot();

        tree.unmerge(&handle);
        prop_assert!(tree.files_under("/").unwrap().is_empty());
        tree.remerge(&slave.listing(), &handle).unwrap();
        prop_assert_eq!(tree.to_snapshot(), before);
    }

    /// Parsing a serialized tree and serializing it again is lossless
    #[test]
    fn snapshot_roundtrip(
        files in listing_strategy(),
        checksums in prop::collection::vec(0u64..=u32::MAX as u64, 40),
        holders in prop::collection::vec(0usize..3, 40),
    ) {
        let (slaves, refs): (Vec<_>, Vec<_>) = ["s1", "s2", "s3"].iter().map(|n| MemorySlave::shared(*n)).unzip();
        let registry = SlaveRegistry::with_slaves(refs.clone()).unwrap();
        let tree = ReplicaTree::new();
        for (i, file) in files.iter().enumerate() {
            let entry = ListingEntry::file(file.path.clone(), size_of(&file.path), file.last_modified)
                .with_checksum(checksums[i]);
            tree.put_file(&entry, &refs[holders[i]]).unwrap();
        }
        drop(slaves);

        let text = tree.to_snapshot();
        let restored = ReplicaTree::from_snapshot(&text, &registry).unwrap();
        prop_assert_eq!(restored.to_snapshot(), text);
        prop_assert_eq!(restored.stats(), tree.stats());
    }

    /// Bandwidth lowers each score by exactly throughput times the multiplier
    #[test]
    fn bandwidth_exact_delta(
        up in prop::collection::vec(0u64..1_000_000_000_000, 1..8),
        multiplier in 1u64..100,
    ) {
        let (_slaves, mut chart, ctx) = chart_with_throughput(&up);
        let config = FilterConfig::new(1, "bandwidth").with("multiplier", format!("*{}", multiplier));
        let filter = BandwidthFilter::new(&config, &ctx).unwrap();
        filter.process(&mut chart, &TransferRequest::new(Direction::Upload, "/f")).unwrap();

        let scores: BTreeMap<String, i64> = chart
            .scores()
            .iter()
            .map(|s| (s.slave().name().to_string(), s.score()))
            .collect();
        for (i, throughput) in up.iter().enumerate() {
            prop_assert_eq!(scores[&format!("s{}", i)], -((throughput * multiplier) as i64));
        }
    }

    /// Maxbandwidth keeps exactly the slaves at or under the ceiling
    #[test]
    fn maxbandwidth_exclusion(
        up in prop::collection::vec(0u64..2_000, 1..10),
        ceiling in 0u64..2_000,
    ) {
        let (_slaves, mut chart, ctx) = chart_with_throughput(&up);
        let config = FilterConfig::new(1, "maxbandwidth").with("maxbandwidth", ceiling.to_string());
        let filter = MaxbandwidthFilter::new(&config, &ctx).unwrap();
        filter.process(&mut chart, &TransferRequest::new(Direction::Upload, "/f")).unwrap();

        let expected = up.iter().filter(|t| **t <= ceiling).count();
        prop_assert_eq!(chart.len(), expected);
        for score in chart.scores() {
            prop_assert_eq!(score.score(), 0);
        }
    }

    /// Multiplier expressions evaluate left to right
    #[test]
    fn multiplier_expressions(a in 1u32..1_000, b in 1u32..1_000) {
        let value = parse_multiplier(&format!("*{}/{}", a, b)).unwrap();
        prop_assert_eq!(value, a as f64 / b as f64);
        prop_assert_eq!(parse_multiplier(&a.to_string()).unwrap(), a as f64);
        let bad_expr = format!("/{}*", a);
        prop_assert!(parse_multiplier(&bad_expr).is_err());
    }
}

#[cfg(test)]
mod edge_case_tests {
    use super::*;

    proptest! {
        /// Names differing only in case are the same node
        #[test]
        fn case_insensitive_lookup(name in "[a-z]{1,12}") {
            let (_slave, handle) = MemorySlave::shared("s1");
            let tree = ReplicaTree::new();
            tree.put_file(&ListingEntry::file(format!("/dir/{}", name), 1, 0), &handle).unwrap();
            let upper_path = format!("/DIR/{}", name.to_uppercase());
            prop_assert!(tree.exists(&upper_path));
        }

        /// "remove" in any case means zero
        #[test]
        fn remove_multiplier(upper in prop::collection::vec(any::<bool>(), 6)) {
            let word: String = "remove"
                .chars()
                .zip(upper)
                .map(|(c, up)| if up { c.to_ascii_uppercase() } else { c })
                .collect();
            prop_assert_eq!(parse_multiplier(&word).unwrap(), 0.0);
        }
    }
}
