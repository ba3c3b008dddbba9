use data_contracts::{IntensityStats, PartitionManifest};
use std::fs;
use std::path::Path;
use training::{generate_config, ConfigError, ConfigGenError, ConfigGenRequest, RunConfig};
use volume_dataset::{
    write_raw_volume, Cohort, DatasetError, RawVolumeLoader, SplitRatio, Volume,
};

fn write_volumes(dir: &Path, ids: &[String]) -> anyhow::Result<()> {
    for (i, id) in ids.iter().enumerate() {
        let voxels = (0..2 * 4 * 4).map(|v| (i + v) as f32).collect();
        write_raw_volume(&dir.join(format!("{id}.f32")), &Volume::new([2, 4, 4], voxels)?)?;
    }
    Ok(())
}

fn write_labels(path: &Path, rows: &[(String, &str)]) -> anyhow::Result<()> {
    let mut text = String::from("sample_id,label\n");
    for (id, label) in rows {
        text.push_str(&format!("{id},{label}\n"));
    }
    fs::write(path, text)?;
    Ok(())
}

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("emb{i:03}")).collect()
}

#[test]
fn labeled_cohort_produces_loadable_config() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let volumes = root.path().join("volumes");
    let out = root.path().join("out");
    fs::create_dir_all(&volumes)?;
    let ids = ids(30);
    write_volumes(&volumes, &ids)?;
    let rows: Vec<(String, &str)> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), if i % 3 == 0 { "edema" } else { "normal" }))
        .collect();
    let labels = root.path().join("labels.csv");
    write_labels(&labels, &rows)?;

    let mut req = ConfigGenRequest::new("edema", &volumes, &out).with_labels(&labels);
    req.ratio = SplitRatio::new(0.6, 0.2, 0.2)?;
    let generated = generate_config(&req, &RawVolumeLoader)?;

    assert_eq!(generated.manifests.len(), 3);
    assert!(generated.skipped.is_empty());
    assert_eq!(generated.config.class_names, vec!["edema", "normal"]);
    assert_eq!(generated.config.num_classes, 2);
    assert_eq!(generated.config.project, "Embryo_edema_Classification");
    assert!(matches!(generated.stats, IntensityStats::MeanStd { .. }));

    let loaded = RunConfig::load(&generated.config_path)?;
    assert_eq!(loaded.data_list.train, out.join("train.json"));
    assert_eq!(loaded.data_list.test.as_deref(), Some(out.join("test.json").as_path()));
    assert_eq!(loaded.intensity_stats, generated.stats);

    let cohort = Cohort::from_manifests(
        &loaded.data_list.train,
        &loaded.data_list.val,
        loaded.data_list.test.as_deref(),
    )?;
    assert_eq!(cohort.len(), 30);
    assert_eq!(cohort.train().len(), 18);
    cohort.validate_labels(loaded.num_classes)?;
    let manifest = PartitionManifest::load(&out.join("val.json"))?;
    assert_eq!(manifest.seed, Some(42));
    Ok(())
}

#[test]
fn missing_volume_fails_unless_skipped() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let volumes = root.path().join("volumes");
    fs::create_dir_all(&volumes)?;
    let ids = ids(12);
    write_volumes(&volumes, &ids[..11])?;
    let rows: Vec<(String, &str)> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), if i % 2 == 0 { "0" } else { "1" }))
        .collect();
    let labels = root.path().join("labels.csv");
    write_labels(&labels, &rows)?;

    let out = root.path().join("out");
    let mut req = ConfigGenRequest::new("edema", &volumes, &out).with_labels(&labels);
    req.ratio = SplitRatio::new(0.5, 0.5, 0.0)?;
    match generate_config(&req, &RawVolumeLoader) {
        Err(ConfigGenError::Dataset(DatasetError::MissingVolume { id, .. })) => {
            assert_eq!(id, "emb011")
        }
        other => panic!("expected MissingVolume, got {other:?}"),
    }
    assert!(!out.join("config.json").exists());

    req.skip_missing = true;
    let generated = generate_config(&req, &RawVolumeLoader)?;
    assert_eq!(generated.skipped, vec!["emb011".to_string()]);
    assert_eq!(generated.manifests.len(), 2);
    assert!(generated.config.data_list.test.is_none());
    Ok(())
}

#[test]
fn unlabeled_mode_lists_volumes_for_pretraining() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let volumes = root.path().join("volumes");
    fs::create_dir_all(&volumes)?;
    write_volumes(&volumes, &ids(10))?;

    let out = root.path().join("ssl");
    let mut req = ConfigGenRequest::new("ssl", &volumes, &out);
    req.config_name = "config.toml".into();
    let generated = generate_config(&req, &RawVolumeLoader)?;
    assert!(generated.config_path.ends_with("config.toml"));
    assert!(generated.config.data_list.test.is_none());
    assert!(generated.config.class_names.is_empty());

    let loaded = RunConfig::load(&generated.config_path)?;
    let cohort = Cohort::from_manifests(&loaded.data_list.train, &loaded.data_list.val, None)?;
    assert_eq!(cohort.len(), 10);
    assert!(cohort.train().iter().all(|r| r.label.is_none()));
    assert!(!cohort.val().is_empty());
    Ok(())
}

#[test]
fn invalid_request_writes_nothing() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let volumes = root.path().join("volumes");
    fs::create_dir_all(&volumes)?;
    write_volumes(&volumes, &ids(10))?;

    let out = root.path().join("out");
    let mut req = ConfigGenRequest::new("ssl", &volumes, &out);
    req.base_lr = 0.0;
    match generate_config(&req, &RawVolumeLoader) {
        Err(ConfigGenError::Config(ConfigError::Invalid { field, .. })) => assert_eq!(field, "base_lr"),
        other => panic!("expected invalid base_lr, got {other:?}"),
    }
    assert!(!out.join("train.json").exists());
    assert!(!out.join("val.json").exists());
    assert!(!out.join("config.json").exists());
    Ok(())
}
