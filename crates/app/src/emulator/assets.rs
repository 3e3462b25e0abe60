use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use actix_web::web::Bytes;
use anyhow::{Context, Result};
use detections::DetectionDataset;
use tracing::{info, warn};

use crate::supervisor::{EmulatorSettings, FrameWindow};

/// Upper bound on the preload map's initial allocation.
const PRELOAD_CAPACITY_HINT: u64 = 1024;

/// Source of the prerecorded JPEG frames.
#[derive(Clone, Debug)]
pub(crate) enum FrameStore {
    /// Read `NNN.jpg` from disk on every tick.
    Directory(PathBuf),
    /// Frames read once at initialisation.
    Preloaded(Arc<HashMap<u32, Bytes>>),
}

impl FrameStore {
    pub(crate) fn frame_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("{index:03}.jpg"))
    }

    /// Read every frame of `window` into memory. Unreadable frames are skipped with a warning.
    pub(crate) fn preload(dir: &Path, window: FrameWindow) -> Self {
        let capacity = usize::try_from(window.len().min(PRELOAD_CAPACITY_HINT)).unwrap_or(0);
        let mut frames = HashMap::with_capacity(capacity);
        for index in window.indices() {
            let path = Self::frame_path(dir, index);
            match std::fs::read(&path) {
                Ok(data) => {
                    frames.insert(index, Bytes::from(data));
                }
                Err(err) => warn!("Skipping frame {}: {err}", path.display()),
            }
        }
        info!(
            loaded = frames.len(),
            expected = window.len(),
            "Preloaded emulator frames"
        );
        FrameStore::Preloaded(Arc::new(frames))
    }

    pub(crate) async fn load(&self, index: u32) -> io::Result<Bytes> {
        match self {
            FrameStore::Directory(dir) => tokio::fs::read(Self::frame_path(dir, index))
                .await
                .map(Bytes::from),
            FrameStore::Preloaded(frames) => frames.get(&index).cloned().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("frame {index:03} was not preloaded"),
                )
            }),
        }
    }
}

/// Everything the emulator replays: frames plus the detections recorded on them.
pub(crate) struct EmulatorAssets {
    pub(crate) detections: DetectionDataset,
    pub(crate) frames: FrameStore,
}

impl EmulatorAssets {
    pub(crate) fn new(detections: DetectionDataset, frames: FrameStore) -> Self {
        Self { detections, frames }
    }

    pub(crate) fn load(settings: &EmulatorSettings) -> Result<Self> {
        let detections = DetectionDataset::from_path(&settings.detections_path)
            .context("Failed to load canned detections")?;
        if detections.is_empty() {
            warn!(
                "Canned detections at {} are empty",
                settings.detections_path.display()
            );
        }
        let frames = if settings.preload_frames {
            FrameStore::preload(&settings.frames_dir, settings.window)
        } else {
            FrameStore::Directory(settings.frames_dir.clone())
        };
        Ok(Self::new(detections, frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_paths_are_zero_padded() {
        let dir = Path::new("/frames");
        assert_eq!(FrameStore::frame_path(dir, 16), PathBuf::from("/frames/016.jpg"));
        assert_eq!(FrameStore::frame_path(dir, 451), PathBuf::from("/frames/451.jpg"));
    }

    #[tokio::test]
    async fn directory_store_reads_frames_from_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("016.jpg"), b"jpeg-16").expect("write frame");

        let store = FrameStore::Directory(dir.path().to_path_buf());
        assert_eq!(store.load(16).await.expect("frame 16"), Bytes::from_static(b"jpeg-16"));
        let missing = store.load(17).await.expect_err("frame 17 absent");
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn preloading_skips_missing_frames() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("001.jpg"), b"one").expect("write frame");
        std::fs::write(dir.path().join("003.jpg"), b"three").expect("write frame");

        let store = FrameStore::preload(dir.path(), FrameWindow { first: 1, last: 3 });
        assert_eq!(store.load(3).await.expect("frame 3"), Bytes::from_static(b"three"));
        assert!(store.load(2).await.is_err());
    }

    #[test]
    fn loading_reports_missing_detections() {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = EmulatorSettings {
            frames_dir: dir.path().to_path_buf(),
            detections_path: dir.path().join("missing.json"),
            ..EmulatorSettings::default()
        };
        let err = EmulatorAssets::load(&settings)
            .err()
            .expect("missing detections rejected");
        assert!(format!("{err:#}").contains("canned detections"));
    }
}
