//! Held-out evaluation of a fine-tuned classifier.

use crate::trainer::TrainError;
use burn::tensor::backend::Backend;
use models::{FusionClassifier, PlaneStacks};
use serde::Serialize;
use volume_dataset::{BatchSource, DatasetError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub count: usize,
    pub correct: usize,
    pub accuracy: f64,
    /// `confusion[target][predicted]`.
    pub confusion: Vec<Vec<usize>>,
    pub skipped: usize,
}

impl EvalReport {
    /// Recall per class; `None` for classes absent from the data.
    pub fn per_class_recall(&self) -> Vec<Option<f64>> {
        self.confusion
            .iter()
            .enumerate()
            .map(|(class, row)| {
                let total: usize = row.iter().sum();
                (total > 0).then(|| row[class] as f64 / total as f64)
            })
            .collect()
    }
}

/// Predicted class per sample (argmax of the logits).
pub fn predict<B: Backend>(model: &FusionClassifier<B>, stacks: PlaneStacks<B>) -> Vec<usize> {
    let logits = model.forward(stacks);
    let [n, _] = logits.dims();
    logits
        .argmax(1)
        .reshape([n])
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .unwrap_or_default()
        .into_iter()
        .map(|c| c.max(0) as usize)
        .collect()
}

pub fn evaluate_classifier<B: Backend>(
    model: &FusionClassifier<B>,
    batches: &mut dyn BatchSource,
    device: &B::Device,
) -> Result<EvalReport, TrainError> {
    let classes = model.num_classes();
    let mut confusion = vec![vec![0usize; classes]; classes];
    let mut count = 0;
    let mut correct = 0;
    batches.start_epoch(0);
    while let Some(batch) = batches.next_batch()? {
        let predicted = predict(model, PlaneStacks::from_samples(&batch, device)?);
        for (sample, pred) in batch.iter().zip(predicted) {
            let target = sample.label.ok_or_else(|| {
                DatasetError::Other(format!("sample {} has no label", sample.id))
            })?;
            if target >= classes || pred >= classes {
                return Err(DatasetError::Other(format!(
                    "sample {} has label {target}, model has {classes} classes",
                    sample.id
                ))
                .into());
            }
            confusion[target][pred] += 1;
            count += 1;
            if target == pred {
                correct += 1;
            }
        }
    }
    let accuracy = if count == 0 {
        0.0
    } else {
        correct as f64 / count as f64
    };
    Ok(EvalReport {
        count,
        correct,
        accuracy,
        confusion,
        skipped: batches.skipped(),
    })
}
