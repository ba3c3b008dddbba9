use data_contracts::Partition;
use proptest::prelude::*;
use std::collections::HashMap;
use volume_dataset::{SplitRatio, StratifiedSplitter};

fn cohort(counts: &[usize]) -> Vec<(String, usize)> {
    counts
        .iter()
        .enumerate()
        .flat_map(|(class, n)| (0..*n).map(move |i| (format!("c{class}-{i}"), class)))
        .collect()
}

fn ratio_strategy() -> impl Strategy<Value = SplitRatio> {
    // Each fraction >= 0.05 so every partition's per-class target is >= 1 below.
    (5u32..=90, 5u32..=90).prop_filter_map("fractions must leave room for test", |(t, v)| {
        let test = 100i64 - t as i64 - v as i64;
        (test >= 5).then(|| SplitRatio {
            train: t as f64 / 100.0,
            val: v as f64 / 100.0,
            test: test as f64 / 100.0,
        })
    })
}

proptest! {
    #[test]
    fn partitions_are_disjoint_cover_and_track_targets(
        counts in prop::collection::vec(20usize..200, 1..4),
        ratio in ratio_strategy(),
        seed in any::<u64>(),
    ) {
        let samples = cohort(&counts);
        let split = StratifiedSplitter::new(ratio, seed).split(&samples).unwrap();

        // Cover + disjoint: every id gets exactly one partition.
        prop_assert_eq!(split.len(), samples.len());
        let total: usize = Partition::ALL.iter().map(|p| split.ids(*p).len()).sum();
        prop_assert_eq!(total, samples.len());

        let mut realized: HashMap<(usize, Partition), usize> = HashMap::new();
        for (id, class) in &samples {
            let p = split.partition_of(id).unwrap();
            *realized.entry((*class, p)).or_default() += 1;
        }
        for (class, n) in counts.iter().enumerate() {
            for p in Partition::ALL {
                let target = *n as f64 * ratio.get(p);
                let got = realized.get(&(class, p)).copied().unwrap_or(0) as f64;
                prop_assert!((got - target).abs() < 1.0, "class {} {:?}: got {} target {}", class, p, got, target);
            }
        }
    }

    #[test]
    fn split_is_deterministic(
        counts in prop::collection::vec(3usize..60, 1..4),
        seed in any::<u64>(),
    ) {
        let samples = cohort(&counts);
        let splitter = StratifiedSplitter::new(SplitRatio::default(), seed);
        let a = splitter.split(&samples).unwrap();
        let b = splitter.split(&samples).unwrap();
        prop_assert_eq!(a, b);
    }
}
