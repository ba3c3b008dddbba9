//! The labeled (or unlabeled) cohort of a run, as fixed train/val/test partitions.

use crate::splits::SplitAssignment;
use crate::types::{DatasetError, DatasetResult};
use data_contracts::{Partition, PartitionManifest, ValidationError, VolumeRecord};
use std::collections::HashMap;
use std::path::Path;

/// Disjoint train/val/test partitions; membership is fixed for a run.
#[derive(Debug, Clone, Default)]
pub struct Cohort {
    train: Vec<VolumeRecord>,
    val: Vec<VolumeRecord>,
    test: Vec<VolumeRecord>,
}

impl Cohort {
    pub fn new(
        train: Vec<VolumeRecord>,
        val: Vec<VolumeRecord>,
        test: Vec<VolumeRecord>,
    ) -> DatasetResult<Self> {
        let cohort = Self { train, val, test };
        cohort.validate()?;
        Ok(cohort)
    }

    /// Partition `records` according to a split assignment.
    pub fn from_assignment(
        records: Vec<VolumeRecord>,
        assignment: &SplitAssignment,
    ) -> DatasetResult<Self> {
        let mut cohort = Self::default();
        for record in records {
            let partition = assignment.partition_of(&record.id).ok_or_else(|| {
                DatasetError::Other(format!("sample {} has no split assignment", record.id))
            })?;
            cohort.partition_mut(partition).push(record);
        }
        cohort.validate()?;
        Ok(cohort)
    }

    /// Load train and val manifests (and test, if given).
    pub fn from_manifests(
        train: &Path,
        val: &Path,
        test: Option<&Path>,
    ) -> DatasetResult<Self> {
        let load = |path: &Path, expected: Partition| -> DatasetResult<Vec<VolumeRecord>> {
            let manifest = PartitionManifest::load(path)?;
            if manifest.partition != expected {
                tracing::warn!(
                    path = %path.display(),
                    found = %manifest.partition,
                    expected = %expected,
                    "manifest partition tag differs from its data_list slot"
                );
            }
            Ok(manifest.records)
        };
        let test = match test {
            Some(path) => load(path, Partition::Test)?,
            None => Vec::new(),
        };
        Self::new(
            load(train, Partition::Train)?,
            load(val, Partition::Val)?,
            test,
        )
    }

    /// Every record validates and no id appears in two partitions.
    pub fn validate(&self) -> DatasetResult<()> {
        let mut seen: HashMap<&str, Partition> = HashMap::new();
        for partition in Partition::ALL {
            for record in self.partition(partition) {
                record.validate()?;
                if let Some(first) = seen.insert(record.id.as_str(), partition) {
                    let err = if first == partition {
                        ValidationError::DuplicateId(record.id.clone())
                    } else {
                        ValidationError::Overlap {
                            id: record.id.clone(),
                            first,
                            second: partition,
                        }
                    };
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn partition(&self, partition: Partition) -> &[VolumeRecord] {
        match partition {
            Partition::Train => &self.train,
            Partition::Val => &self.val,
            Partition::Test => &self.test,
        }
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut Vec<VolumeRecord> {
        match partition {
            Partition::Train => &mut self.train,
            Partition::Val => &mut self.val,
            Partition::Test => &mut self.test,
        }
    }

    pub fn train(&self) -> &[VolumeRecord] {
        &self.train
    }

    pub fn val(&self) -> &[VolumeRecord] {
        &self.val
    }

    pub fn test(&self) -> &[VolumeRecord] {
        &self.test
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail when a labeled run sees a record label outside `0..num_classes`.
    pub fn validate_labels(&self, num_classes: usize) -> DatasetResult<()> {
        for partition in Partition::ALL {
            for record in self.partition(partition) {
                record.validate_label(num_classes)?;
            }
        }
        Ok(())
    }

    /// Write one manifest per non-empty partition (train and val always).
    pub fn save_manifests(&self, dir: &Path, seed: Option<u64>) -> DatasetResult<Vec<std::path::PathBuf>> {
        let mut written = Vec::new();
        for partition in Partition::ALL {
            let records = self.partition(partition);
            if partition == Partition::Test && records.is_empty() {
                continue;
            }
            let path = dir.join(format!("{partition}.json"));
            PartitionManifest::new(partition, seed, records.to_vec()).save(&path)?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str) -> VolumeRecord {
        VolumeRecord::from_volume(id, format!("{id}.f32"), Some(0))
    }

    #[test]
    fn overlapping_partitions_rejected() {
        let err = Cohort::new(vec![rec("a"), rec("b")], vec![rec("b")], vec![]).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::Validation(ValidationError::Overlap { ref id, .. }) if id == "b"
        ));
    }

    #[test]
    fn from_assignment_covers_every_record() {
        let records: Vec<_> = (0..10).map(|i| rec(&format!("s{i}"))).collect();
        let pairs: Vec<_> = records.iter().map(|r| (r.id.clone(), 0usize)).collect();
        let assignment = crate::splits::StratifiedSplitter::new(
            crate::splits::SplitRatio::new(0.6, 0.2, 0.2).unwrap(),
            5,
        )
        .split(&pairs)
        .unwrap();
        let cohort = Cohort::from_assignment(records, &assignment).unwrap();
        assert_eq!(cohort.len(), 10);
        assert_eq!(cohort.train().len(), 6);
        assert_eq!(cohort.val().len(), 2);
        assert_eq!(cohort.test().len(), 2);
    }
}
