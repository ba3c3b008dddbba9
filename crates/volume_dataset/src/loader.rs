//! Volume loading seam and the raw `f32` codec used for workspace artifacts.
//!
//! Medical-imaging codecs live outside this crate; they plug in through
//! [`VolumeLoader`]. The raw codec stores voxels as contiguous `f32` values in a
//! `<stem>.f32` file with a `<stem>.json` header next to it.

use crate::types::{DatasetError, DatasetResult, Endianness, Volume, VolumeData, VoxelDType};
use data_contracts::{write_atomic, VolumeRecord, VolumeSource};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const RAW_EXTENSION: &str = "f32";

/// Loads voxel data for a record.
pub trait VolumeLoader: Send + Sync {
    fn load(&self, record: &VolumeRecord) -> DatasetResult<VolumeData>;

    /// Locate the file holding sample `id` inside `dir`, if any.
    fn resolve(&self, dir: &Path, id: &str) -> Option<PathBuf>;

    /// List sample ids with a loadable file in `dir`, sorted.
    fn list(&self, dir: &Path) -> DatasetResult<Vec<(String, PathBuf)>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawVolumeHeader {
    pub shape: [usize; 3],
    pub dtype: VoxelDType,
    pub endianness: Endianness,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawVolumeLoader;

pub fn header_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("json")
}

pub fn read_raw_volume(path: &Path) -> DatasetResult<Volume> {
    let header_path = header_path(path);
    let raw_header = fs::read(&header_path).map_err(|e| DatasetError::Io {
        path: header_path.clone(),
        source: e,
    })?;
    let header: RawVolumeHeader =
        serde_json::from_slice(&raw_header).map_err(|e| DatasetError::Json {
            path: header_path.clone(),
            source: e,
        })?;
    let bytes = fs::read(path).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let expected = header.shape.iter().product::<usize>() * 4;
    if bytes.len() != expected {
        return Err(DatasetError::Malformed {
            path: path.to_path_buf(),
            msg: format!(
                "header shape {:?} needs {expected} bytes, file has {}",
                header.shape,
                bytes.len()
            ),
        });
    }
    let voxels = bytes
        .chunks_exact(4)
        .map(|c| {
            let b = [c[0], c[1], c[2], c[3]];
            match header.endianness {
                Endianness::Little => f32::from_le_bytes(b),
                Endianness::Big => f32::from_be_bytes(b),
            }
        })
        .collect();
    Volume::new(header.shape, voxels).map_err(|e| DatasetError::Malformed {
        path: path.to_path_buf(),
        msg: e.to_string(),
    })
}

/// Write voxels and header atomically; the header is written last.
pub fn write_raw_volume(path: &Path, volume: &Volume) -> DatasetResult<()> {
    let mut bytes = Vec::with_capacity(volume.len() * 4);
    for v in &volume.voxels {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    write_atomic(path, &bytes).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let header = RawVolumeHeader {
        shape: volume.shape,
        dtype: VoxelDType::F32,
        endianness: Endianness::Little,
    };
    let header_path = header_path(path);
    let json = serde_json::to_vec_pretty(&header).map_err(|e| DatasetError::Json {
        path: header_path.clone(),
        source: e,
    })?;
    write_atomic(&header_path, &json).map_err(|e| DatasetError::Io {
        path: header_path,
        source: e,
    })
}

impl VolumeLoader for RawVolumeLoader {
    fn load(&self, record: &VolumeRecord) -> DatasetResult<VolumeData> {
        record.validate()?;
        match &record.source {
            VolumeSource::Volume { path } => Ok(VolumeData::Dense(read_raw_volume(path)?)),
            VolumeSource::Planes {
                axial,
                sagittal,
                coronal,
            } => Ok(VolumeData::Planes {
                axial: read_raw_volume(axial)?,
                sagittal: read_raw_volume(sagittal)?,
                coronal: read_raw_volume(coronal)?,
            }),
        }
    }

    fn resolve(&self, dir: &Path, id: &str) -> Option<PathBuf> {
        let candidate = dir.join(format!("{id}.{RAW_EXTENSION}"));
        (candidate.is_file() && header_path(&candidate).is_file()).then_some(candidate)
    }

    fn list(&self, dir: &Path) -> DatasetResult<Vec<(String, PathBuf)>> {
        let entries = fs::read_dir(dir).map_err(|e| DatasetError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let mut found = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(RAW_EXTENSION) {
                continue;
            }
            if !header_path(&path).is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push((stem.to_string(), path.clone()));
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_volume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e01.f32");
        let volume = Volume::new([2, 2, 3], (0..12).map(|v| v as f32 * 0.5).collect()).unwrap();
        write_raw_volume(&path, &volume).unwrap();
        assert_eq!(read_raw_volume(&path).unwrap(), volume);
        let loader = RawVolumeLoader;
        assert_eq!(loader.resolve(dir.path(), "e01"), Some(path.clone()));
        assert_eq!(loader.resolve(dir.path(), "e02"), None);
        assert_eq!(loader.list(dir.path()).unwrap(), vec![("e01".to_string(), path)]);
    }

    #[test]
    fn truncated_volume_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e01.f32");
        write_raw_volume(&path, &Volume::filled([2, 2, 2], 1.0)).unwrap();
        fs::write(&path, [0u8; 7]).unwrap();
        assert!(matches!(
            read_raw_volume(&path),
            Err(DatasetError::Malformed { .. })
        ));
    }
}
