use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use data_contracts::{IntensityStats, VolumeRecord, VolumeSource};
use models::{ClassificationHeadConfig, FusionClassifier, FusionEncoderConfig, FusionModel};
use saliency::{
    Attribution, GradientSaliency, SaliencyError, SaliencyRecord, SaliencyRunner, TargetClass,
};
use std::path::{Path, PathBuf};
use training::checkpoint::CHECKPOINT_FORMAT_VERSION;
use training::{Checkpoint, CheckpointMeta, CheckpointStore, CheckpointTag, TrainStage};
use volume_dataset::{read_raw_volume, write_raw_volume, RawVolumeLoader, Volume};

type B = NdArray<f32>;
type AD = Autodiff<B>;

const SHAPE: [usize; 3] = [4, 6, 5];

fn save_classifier(root: &Path, stats: Option<IntensityStats>) -> anyhow::Result<PathBuf> {
    let model = FusionClassifier::<B>::new(
        FusionEncoderConfig::tiny(),
        ClassificationHeadConfig {
            num_classes: 2,
            ..Default::default()
        },
        &Default::default(),
    );
    let meta = CheckpointMeta {
        format_version: CHECKPOINT_FORMAT_VERSION,
        run_id: "sal".into(),
        stage: TrainStage::Finetune,
        tag: CheckpointTag::Best,
        epoch: 1,
        step: 5,
        steps_per_epoch: 5,
        score: Some(0.5),
        encoder_config: model.encoder_config().clone(),
        head: Some(model.head_spec()),
        intensity_stats: stats,
        created_unix_ms: 0,
    };
    let ckpt = Checkpoint::from_model::<B, _>(meta, &model, Vec::new())?;
    Ok(CheckpointStore::new(root.join("ckpt")).save("sal", TrainStage::Finetune, &ckpt)?)
}

fn write_samples(dir: &Path, n: usize) -> anyhow::Result<Vec<VolumeRecord>> {
    let voxels = SHAPE.iter().product::<usize>();
    (0..n)
        .map(|i| {
            let id = format!("emb{i:02}");
            let path = dir.join(format!("{id}.f32"));
            let data = (0..voxels).map(|v| ((v * 7 + i * 13) % 97) as f32).collect();
            write_raw_volume(&path, &Volume::new(SHAPE, data)?)?;
            Ok(VolumeRecord {
                id,
                source: VolumeSource::Volume { path },
                label: Some(i % 2),
                orientation: None,
            })
        })
        .collect()
}

fn stats() -> Option<IntensityStats> {
    Some(IntensityStats::MeanStd {
        mean: 48.0,
        std: 28.0,
    })
}

#[test]
fn one_map_per_sample_matching_input_shape() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let ckpt = save_classifier(root.path(), stats())?;
    let records = write_samples(root.path(), 10)?;
    let out = root.path().join("maps");

    let runner = SaliencyRunner::new(&out);
    let summary = runner.run::<AD, _>(
        &ckpt,
        &records,
        &RawVolumeLoader,
        &mut GradientSaliency::new(),
        &Default::default(),
    )?;
    assert_eq!(summary.records.len(), 10);
    assert!(summary.skipped.is_empty());

    for record in &records {
        let map = read_raw_volume(&runner.map_path(&record.id))?;
        assert_eq!(map.shape, SHAPE);
        assert!(map.voxels.iter().all(|v| v.is_finite() && *v >= 0.0));

        let sidecar: SaliencyRecord =
            serde_json::from_slice(&std::fs::read(runner.sidecar_path(&record.id))?)?;
        assert_eq!(sidecar.sample_id, record.id);
        assert_eq!(sidecar.shape, SHAPE);
        assert_eq!(sidecar.target_class, sidecar.predicted_class);
        assert!(sidecar.predicted_class < 2);
        assert_eq!(sidecar.method, "gradient");
    }
    let files = std::fs::read_dir(&out)?.count();
    assert_eq!(files, 20);
    Ok(())
}

#[test]
fn label_target_explains_the_recorded_class() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let ckpt = save_classifier(root.path(), stats())?;
    let mut records = write_samples(root.path(), 4)?;
    records[3].label = None;

    let summary = SaliencyRunner::new(root.path().join("maps"))
        .with_target(TargetClass::Label)
        .run::<AD, _>(
            &ckpt,
            &records,
            &RawVolumeLoader,
            &mut GradientSaliency::new(),
            &Default::default(),
        )?;
    for (written, record) in summary.records.iter().zip(&records) {
        match record.label {
            Some(label) => assert_eq!(written.target_class, label),
            None => assert_eq!(written.target_class, written.predicted_class),
        }
    }
    Ok(())
}

#[test]
fn unreadable_sample_fails_strict_and_is_skipped_lenient() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let ckpt = save_classifier(root.path(), stats())?;
    let mut records = write_samples(root.path(), 3)?;
    records.push(VolumeRecord {
        id: "ghost".into(),
        source: VolumeSource::Volume {
            path: root.path().join("ghost.f32"),
        },
        label: Some(0),
        orientation: None,
    });
    let out = root.path().join("maps");

    let strict = SaliencyRunner::new(&out).run::<AD, _>(
        &ckpt,
        &records,
        &RawVolumeLoader,
        &mut GradientSaliency::new(),
        &Default::default(),
    );
    assert!(matches!(strict, Err(SaliencyError::Dataset(_))));

    let runner = SaliencyRunner::new(&out).strict(false);
    let summary = runner.run::<AD, _>(
        &ckpt,
        &records,
        &RawVolumeLoader,
        &mut GradientSaliency::new(),
        &Default::default(),
    )?;
    assert_eq!(summary.records.len(), 3);
    assert_eq!(summary.skipped, vec!["ghost".to_string()]);
    assert!(!runner.map_path("ghost").exists());
    assert!(!runner.sidecar_path("ghost").exists());
    Ok(())
}

/// Returns a fixed-size map regardless of the input.
struct WrongShape;

impl<Bk: Backend> Attribution<Bk> for WrongShape {
    fn name(&self) -> &'static str {
        "wrong_shape"
    }

    fn attribute(
        &mut self,
        model: &FusionClassifier<Bk>,
        _input: Tensor<Bk, 4>,
        _target: usize,
    ) -> Result<Tensor<Bk, 3>, SaliencyError> {
        Ok(Tensor::zeros([2, 2, 2], &model.encoder().device()))
    }
}

#[test]
fn map_with_wrong_shape_is_never_written() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let ckpt = save_classifier(root.path(), stats())?;
    let records = write_samples(root.path(), 2)?;
    let runner = SaliencyRunner::new(root.path().join("maps")).strict(false);

    match runner.run::<B, _>(&ckpt, &records, &RawVolumeLoader, &mut WrongShape, &Default::default()) {
        Err(SaliencyError::ShapeMismatch { id, expected, found }) => {
            assert_eq!(id, "emb00");
            assert_eq!(expected, SHAPE);
            assert_eq!(found, [2, 2, 2]);
        }
        other => panic!("expected shape mismatch, got {other:?}"),
    }
    assert!(!runner.map_path("emb00").exists());
    Ok(())
}

#[test]
fn checkpoint_without_stats_needs_an_override() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let ckpt = save_classifier(root.path(), None)?;
    let records = write_samples(root.path(), 1)?;
    let out = root.path().join("maps");

    let missing = SaliencyRunner::new(&out).run::<AD, _>(
        &ckpt,
        &records,
        &RawVolumeLoader,
        &mut GradientSaliency::new(),
        &Default::default(),
    );
    assert!(matches!(missing, Err(SaliencyError::MissingStats(_))));

    let summary = SaliencyRunner::new(&out)
        .with_stats(IntensityStats::MeanStd {
            mean: 0.0,
            std: 50.0,
        })
        .run::<AD, _>(
            &ckpt,
            &records,
            &RawVolumeLoader,
            &mut GradientSaliency::new(),
            &Default::default(),
        )?;
    assert_eq!(summary.records.len(), 1);
    Ok(())
}

#[test]
fn duplicate_ids_are_rejected_up_front() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let ckpt = save_classifier(root.path(), stats())?;
    let mut records = write_samples(root.path(), 2)?;
    records[1].id = records[0].id.clone();
    let out = root.path().join("maps");

    let result = SaliencyRunner::new(&out).run::<AD, _>(
        &ckpt,
        &records,
        &RawVolumeLoader,
        &mut GradientSaliency::new(),
        &Default::default(),
    );
    assert!(matches!(result, Err(SaliencyError::DuplicateSample(ref id)) if id == "emb00"));
    assert!(!out.exists());
    Ok(())
}
