//! Tabular label source: `sample_id,label` CSV with a header row.

use crate::types::{DatasetError, DatasetResult};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct LabelRow {
    sample_id: String,
    label: String,
}

/// Sample labels mapped to dense class indices.
///
/// Class names are sorted (numerically when every label is an integer) and
/// indexed in that order, so `"0"/"1"` keep their meaning and string labels
/// get a stable mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    class_names: Vec<String>,
    entries: Vec<(String, usize)>,
}

impl LabelTable {
    pub fn from_csv(path: &Path) -> DatasetResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| DatasetError::Csv {
                path: path.to_path_buf(),
                source: e,
            })?;
        let mut rows = Vec::new();
        for row in reader.deserialize::<LabelRow>() {
            let row = row.map_err(|e| DatasetError::Csv {
                path: path.to_path_buf(),
                source: e,
            })?;
            rows.push((row.sample_id, row.label));
        }
        Self::from_pairs(rows).map_err(|e| match e {
            DatasetError::Other(msg) => DatasetError::Malformed {
                path: path.to_path_buf(),
                msg,
            },
            other => other,
        })
    }

    pub fn from_pairs(rows: Vec<(String, String)>) -> DatasetResult<Self> {
        let mut seen = HashMap::new();
        for (id, label) in &rows {
            if id.is_empty() {
                return Err(DatasetError::Other("empty sample_id".into()));
            }
            if label.is_empty() {
                return Err(DatasetError::Other(format!("sample {id} has an empty label")));
            }
            if let Some(previous) = seen.insert(id.as_str(), label.as_str()) {
                return Err(DatasetError::Other(format!(
                    "sample {id} listed twice (labels {previous:?} and {label:?})"
                )));
            }
        }
        let names: BTreeSet<&str> = rows.iter().map(|(_, l)| l.as_str()).collect();
        let mut class_names: Vec<String> = names.into_iter().map(str::to_string).collect();
        if class_names.iter().all(|n| n.parse::<i64>().is_ok()) {
            class_names.sort_by_key(|n| n.parse::<i64>().unwrap_or_default());
        }
        let index: HashMap<&str, usize> = class_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let entries = rows
            .iter()
            .map(|(id, label)| (id.clone(), index[label.as_str()]))
            .collect();
        Ok(Self {
            class_names,
            entries,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// `(sample_id, class_index)` in file order.
    pub fn entries(&self) -> &[(String, usize)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, class) in &self.entries {
            counts[*class] += 1;
        }
        counts
    }
}
