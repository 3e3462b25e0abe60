use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::record::DetectionRecord;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read detections from {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse detections in {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Prerecorded detector output keyed by frame id.
#[derive(Debug, Clone, Default)]
pub struct DetectionDataset {
    records: HashMap<u32, DetectionRecord>,
}

impl DetectionDataset {
    /// Load a JSON array of records as written by the detector's JSON output.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let records: Vec<DetectionRecord> =
            serde_json::from_slice(&raw).map_err(|source| DatasetError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_records(records))
    }

    /// Index records by frame id. Later duplicates replace earlier ones.
    pub fn from_records(records: impl IntoIterator<Item = DetectionRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.frame_id, record))
            .collect();
        Self { records }
    }

    pub fn get(&self, frame_id: u32) -> Option<&DetectionRecord> {
        self.records.get(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
