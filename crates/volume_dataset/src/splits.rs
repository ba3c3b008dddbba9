//! Deterministic, class-stratified train/val/test partitioning.

use data_contracts::Partition;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("class {class} has {available} samples, needs at least {required} (one per non-empty partition)")]
    InsufficientSamples {
        class: usize,
        available: usize,
        required: usize,
    },
    #[error("invalid split ratio: {0}")]
    InvalidRatio(String),
    #[error("duplicate sample id {0}")]
    DuplicateId(String),
    #[error("no samples to split")]
    Empty,
}

/// Target fraction of samples per partition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatio {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl SplitRatio {
    pub fn new(train: f64, val: f64, test: f64) -> Result<Self, SplitError> {
        let ratio = Self { train, val, test };
        ratio.validate()?;
        Ok(ratio)
    }

    pub fn validate(&self) -> Result<(), SplitError> {
        let parts = [self.train, self.val, self.test];
        if parts.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(SplitError::InvalidRatio(format!(
                "fractions must be finite and non-negative: {parts:?}"
            )));
        }
        if self.train <= 0.0 {
            return Err(SplitError::InvalidRatio("train fraction must be > 0".into()));
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(SplitError::InvalidRatio(format!(
                "fractions must sum to 1 (got {sum})"
            )));
        }
        Ok(())
    }

    pub fn get(&self, partition: Partition) -> f64 {
        match partition {
            Partition::Train => self.train,
            Partition::Val => self.val,
            Partition::Test => self.test,
        }
    }

    /// Partitions that must receive at least one sample of every class.
    pub fn active(&self) -> Vec<Partition> {
        Partition::ALL
            .into_iter()
            .filter(|p| self.get(*p) > 0.0)
            .collect()
    }
}

impl Default for SplitRatio {
    fn default() -> Self {
        Self {
            train: 0.7,
            val: 0.15,
            test: 0.15,
        }
    }
}

/// Partition assigned to every sample id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAssignment {
    pub seed: u64,
    pub assignments: BTreeMap<String, Partition>,
}

impl SplitAssignment {
    /// Sample ids of `partition`, sorted.
    pub fn ids(&self, partition: Partition) -> Vec<&str> {
        self.assignments
            .iter()
            .filter(|(_, p)| **p == partition)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn partition_of(&self, id: &str) -> Option<Partition> {
        self.assignments.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StratifiedSplitter {
    ratio: SplitRatio,
    seed: u64,
}

impl StratifiedSplitter {
    pub fn new(ratio: SplitRatio, seed: u64) -> Self {
        Self { ratio, seed }
    }

    /// Assign every `(id, class)` pair to a partition.
    ///
    /// Per class, the realized count of each partition is the target `n * ratio`
    /// rounded by largest remainder, so it deviates from the target by less than
    /// one sample. Every partition with a non-zero ratio gets at least one sample
    /// of every class; for classes so small that a target falls below one, that
    /// minimum takes precedence over the rounding bound.
    pub fn split(&self, samples: &[(String, usize)]) -> Result<SplitAssignment, SplitError> {
        self.ratio.validate()?;
        if samples.is_empty() {
            return Err(SplitError::Empty);
        }
        let mut by_class: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for (id, class) in samples {
            if !seen.insert(id.as_str()) {
                return Err(SplitError::DuplicateId(id.clone()));
            }
            by_class.entry(*class).or_default().push(id.as_str());
        }

        let active = self.ratio.active();
        let mut assignments = BTreeMap::new();
        for (class, mut ids) in by_class {
            if ids.len() < active.len() {
                return Err(SplitError::InsufficientSamples {
                    class,
                    available: ids.len(),
                    required: active.len(),
                });
            }
            ids.sort_unstable();
            let mut rng = rand::rngs::StdRng::seed_from_u64(class_seed(self.seed, class));
            ids.shuffle(&mut rng);

            let counts = self.allocate(ids.len(), &active);
            let mut cursor = 0usize;
            for (partition, count) in Partition::ALL.into_iter().zip(counts) {
                for id in &ids[cursor..cursor + count] {
                    assignments.insert((*id).to_string(), partition);
                }
                cursor += count;
            }
        }
        Ok(SplitAssignment {
            seed: self.seed,
            assignments,
        })
    }

    /// Largest-remainder allocation of `n` samples over train/val/test.
    fn allocate(&self, n: usize, active: &[Partition]) -> [usize; 3] {
        let targets: Vec<f64> = Partition::ALL
            .iter()
            .map(|p| n as f64 * self.ratio.get(*p))
            .collect();
        let mut counts = [0usize; 3];
        for (i, t) in targets.iter().enumerate() {
            counts[i] = t.floor() as usize;
        }
        let assigned: usize = counts.iter().sum();
        let mut order: Vec<usize> = (0..3).filter(|i| self.ratio.get(Partition::ALL[*i]) > 0.0).collect();
        order.sort_by(|a, b| {
            let ra = targets[*a] - targets[*a].floor();
            let rb = targets[*b] - targets[*b].floor();
            rb.partial_cmp(&ra)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(b))
        });
        for i in order.iter().cycle().take(n.saturating_sub(assigned)) {
            counts[*i] += 1;
        }
        // Guarantee one representative per active partition, taking from the
        // partition furthest above its target.
        for partition in active {
            let i = partition_index(*partition);
            if counts[i] > 0 {
                continue;
            }
            let donor = (0..3)
                .filter(|j| counts[*j] > 1)
                .max_by(|a, b| {
                    let sa = counts[*a] as f64 - targets[*a];
                    let sb = counts[*b] as f64 - targets[*b];
                    sa.partial_cmp(&sb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.cmp(a))
                });
            if let Some(donor) = donor {
                counts[donor] -= 1;
                counts[i] += 1;
            }
        }
        counts
    }
}

fn partition_index(partition: Partition) -> usize {
    match partition {
        Partition::Train => 0,
        Partition::Val => 1,
        Partition::Test => 2,
    }
}

fn class_seed(seed: u64, class: usize) -> u64 {
    seed ^ (class as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cohort(counts: &[usize]) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        for (class, n) in counts.iter().enumerate() {
            for i in 0..*n {
                out.push((format!("c{class}_{i:04}"), class));
            }
        }
        out
    }

    #[test]
    fn seventy_thirty_cohort_keeps_class_balance() {
        let samples = cohort(&[70, 30]);
        let split = StratifiedSplitter::new(SplitRatio::new(0.8, 0.1, 0.1).unwrap(), 42)
            .split(&samples)
            .unwrap();
        let train = split.ids(Partition::Train);
        let class0 = train.iter().filter(|id| id.starts_with("c0_")).count();
        let class1 = train.iter().filter(|id| id.starts_with("c1_")).count();
        assert!((55..=57).contains(&class0), "class0 train = {class0}");
        assert!((23..=25).contains(&class1), "class1 train = {class1}");
        assert_eq!(split.len(), 100);

        let again = StratifiedSplitter::new(SplitRatio::new(0.8, 0.1, 0.1).unwrap(), 42)
            .split(&samples)
            .unwrap();
        assert_eq!(
            serde_json::to_vec(&split).unwrap(),
            serde_json::to_vec(&again).unwrap()
        );
    }

    #[test]
    fn input_order_does_not_change_assignment() {
        let samples = cohort(&[12, 9]);
        let mut reversed = samples.clone();
        reversed.reverse();
        let splitter = StratifiedSplitter::new(SplitRatio::default(), 3);
        assert_eq!(splitter.split(&samples).unwrap(), splitter.split(&reversed).unwrap());
    }

    #[test]
    fn different_seeds_shuffle_differently() {
        let samples = cohort(&[40]);
        let a = StratifiedSplitter::new(SplitRatio::default(), 1).split(&samples).unwrap();
        let b = StratifiedSplitter::new(SplitRatio::default(), 2).split(&samples).unwrap();
        assert_ne!(a.ids(Partition::Val), b.ids(Partition::Val));
    }

    #[test]
    fn class_smaller_than_active_partitions_fails() {
        let samples = cohort(&[10, 2]);
        let err = StratifiedSplitter::new(SplitRatio::default(), 0)
            .split(&samples)
            .unwrap_err();
        assert_eq!(
            err,
            SplitError::InsufficientSamples {
                class: 1,
                available: 2,
                required: 3
            }
        );
    }

    #[test]
    fn zero_test_ratio_needs_only_two_per_class() {
        let samples = cohort(&[10, 2]);
        let split = StratifiedSplitter::new(SplitRatio::new(0.8, 0.2, 0.0).unwrap(), 0)
            .split(&samples)
            .unwrap();
        assert!(split.ids(Partition::Test).is_empty());
        let val = split.ids(Partition::Val);
        assert!(val.iter().any(|id| id.starts_with("c1_")));
    }

    #[test]
    fn tiny_class_gets_one_per_partition() {
        let samples = cohort(&[3]);
        let split = StratifiedSplitter::new(SplitRatio::new(0.8, 0.1, 0.1).unwrap(), 9)
            .split(&samples)
            .unwrap();
        for p in Partition::ALL {
            assert_eq!(split.ids(p).len(), 1);
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        let samples = vec![("a".to_string(), 0), ("a".to_string(), 1)];
        assert_eq!(
            StratifiedSplitter::new(SplitRatio::default(), 0).split(&samples),
            Err(SplitError::DuplicateId("a".into()))
        );
    }

    #[test]
    fn ratio_must_sum_to_one() {
        assert!(SplitRatio::new(0.5, 0.2, 0.2).is_err());
        assert!(SplitRatio::new(0.0, 0.5, 0.5).is_err());
        assert!(SplitRatio::new(1.0, 0.0, 0.0).is_ok());
    }
}
