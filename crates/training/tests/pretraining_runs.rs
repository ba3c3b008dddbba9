use burn::backend::Autodiff;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn_ndarray::NdArray;
use models::{FusionEncoderConfig, FusionPretext, HeadSpec, PretextHeadConfig, PretextObjective};
use std::sync::{Arc, Mutex};
use training::objective::scalar;
use training::{
    CheckpointStore, MemoryReporter, Objective, PretextLoss, RunStage, TrainStage, TrainerConfig,
    TrainingLoop,
};
use volume_dataset::{AugmentConfig, BatchConfig, Sample, SampleBatches, Volume, VolumeAugment, VolumeData};

type B = NdArray<f32>;
type AD = Autodiff<B>;

const OBJECTIVES: [PretextObjective; 4] = [
    PretextObjective::Contrastive { temperature: 0.5 },
    PretextObjective::SliceOrder,
    PretextObjective::Rotation,
    PretextObjective::Masked { mask_ratio: 0.5 },
];

/// Unlabeled volumes with a distinct slice pattern per sample.
fn volumes(n: usize) -> Vec<Sample> {
    (0..n)
        .map(|i| {
            let voxels = (0..4 * 8 * 8)
                .map(|v| {
                    let (d, h, w) = (v / 64, (v / 8) % 8, v % 8);
                    ((d * (i + 1) + h * 3 + w * (i % 3 + 1)) % 11) as f32 * 0.2 - 1.0
                })
                .collect();
            Sample {
                id: format!("u{i:02}"),
                data: VolumeData::Dense(Volume::new([4, 8, 8], voxels).unwrap()),
                label: None,
            }
        })
        .collect()
}

fn batches(n: usize) -> SampleBatches {
    SampleBatches::new(
        volumes(n),
        BatchConfig {
            batch_size: 2,
            shuffle: false,
            seed: 5,
            drop_last: false,
            strict: true,
        },
    )
}

fn pretext_model() -> FusionPretext<AD> {
    FusionPretext::new(
        FusionEncoderConfig::tiny(),
        PretextHeadConfig {
            hidden: 8,
            proj_dim: 4,
            recon_grid: 2,
        },
        &Default::default(),
    )
}

fn quiet_objective(objective: PretextObjective) -> PretextLoss {
    PretextLoss::new(objective, VolumeAugment::new(AugmentConfig::disabled()), 11)
}

#[test]
fn each_objective_fits_a_fixed_batch() -> anyhow::Result<()> {
    let batch = volumes(4);
    for pretext in OBJECTIVES {
        let objective = quiet_objective(pretext);
        let mut model = pretext_model();
        let mut optim = AdamWConfig::new().init::<AD, FusionPretext<AD>>();
        let mut losses = Vec::new();
        for _ in 0..40 {
            // Same step index every time: identical views, labels and masks.
            let loss = objective.loss(&model, &batch, 0)?;
            losses.push(scalar(loss.clone()));
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(1e-2, model, grads);
        }
        assert!(losses.iter().all(|l| l.is_finite()), "{}: {losses:?}", pretext.name());
        let tail = losses[35..].iter().sum::<f64>() / 5.0;
        assert!(tail < losses[0], "{}: first {} vs tail {tail}", pretext.name(), losses[0]);
    }
    Ok(())
}

#[test]
fn pretraining_checkpoints_land_under_ssl_runs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path());
    for pretext in OBJECTIVES {
        let run_id = format!("ssl-{}", pretext.name());
        let reporter = Arc::new(Mutex::new(MemoryReporter::default()));
        let cfg = TrainerConfig {
            warmup_epochs: 1,
            total_epochs: 2,
            base_lr: 1e-3,
            ..TrainerConfig::new(run_id.as_str(), TrainStage::Pretrain)
        };
        let mut trainer = TrainingLoop::<AD>::new(cfg, store.clone()).with_reporter(Box::new(reporter.clone()));
        let objective = PretextLoss::new(pretext, VolumeAugment::new(AugmentConfig::default()), 3);
        let summary = trainer.run(
            pretext_model(),
            AdamWConfig::new().init::<AD, FusionPretext<AD>>(),
            &objective,
            &mut batches(4),
            &mut batches(2),
        )?;

        assert_eq!(trainer.stage(), RunStage::Finished, "{run_id}");
        assert_eq!(summary.history.len(), 2);
        for epoch in &summary.history {
            assert!(epoch.train_loss.is_finite(), "{run_id}: {epoch:?}");
            assert!(epoch.validated && epoch.score.is_finite(), "{run_id}: {epoch:?}");
        }
        assert_eq!(<PretextLoss as Objective<AD>>::score_name(&objective), "neg_pretext_loss");

        let run_dir = dir.path().join("ssl_runs").join(&run_id);
        let best = store.best_path(&run_id, TrainStage::Pretrain);
        assert!(best.starts_with(&run_dir) && best.is_file(), "{}", best.display());
        let periodic: Vec<usize> = store
            .list_periodic(&run_id, TrainStage::Pretrain)
            .into_iter()
            .map(|(epoch, path)| {
                assert!(path.starts_with(&run_dir));
                epoch
            })
            .collect();
        assert_eq!(periodic, vec![0, 1]);
        assert!(!dir.path().join("runs").join(&run_id).exists());

        let saved = CheckpointStore::load(&best)?;
        assert_eq!(saved.meta.stage, TrainStage::Pretrain);
        assert!(matches!(saved.meta.head, Some(HeadSpec::Pretext(ref h)) if h.recon_grid == 2));
        assert!(reporter.lock().unwrap().warnings.is_empty());
    }
    Ok(())
}
