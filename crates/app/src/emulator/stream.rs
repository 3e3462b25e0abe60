//! Frame-synchronised image and metadata streams.
//!
//! The image session's timer is the only thing that advances the cursor. Each
//! tick writes one MJPEG part to the image client and, when a metadata client
//! is attached, the detections recorded for that same frame.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use actix_web::web::Bytes;
use detections::{DetectionRecord, VideoSize, to_absolute};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    emulator::{assets::EmulatorAssets, cursor::FrameCursor, session::SessionSlot},
    lock,
    supervisor::EmulatorSettings,
};

pub(crate) const MJPEG_BOUNDARY: &str = "frame";
const IMAGE_QUEUE_DEPTH: usize = 8;
const METADATA_QUEUE_DEPTH: usize = 32;

/// Shared state behind both emulator endpoints for one emulator launch.
pub(crate) struct EmulatorCore {
    assets: Arc<EmulatorAssets>,
    frame_size: VideoSize,
    tick_interval: Duration,
    cursor: Mutex<FrameCursor>,
    image_session: SessionSlot,
    metadata: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl EmulatorCore {
    pub(crate) fn new(assets: Arc<EmulatorAssets>, settings: &EmulatorSettings) -> Arc<Self> {
        Arc::new(Self {
            assets,
            frame_size: settings.frame_size,
            tick_interval: settings.tick_interval,
            cursor: Mutex::new(FrameCursor::new(settings.window)),
            image_session: SessionSlot::default(),
            metadata: Mutex::new(None),
        })
    }

    /// Replace any image session with a new one and return its MJPEG part stream.
    pub(crate) fn attach_image_client(self: &Arc<Self>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(IMAGE_QUEUE_DEPTH);
        let core = self.clone();
        let id = self
            .image_session
            .replace_with(move |id| tokio::spawn(run_image_session(core, id, tx)));
        metrics::counter!("emulator_image_sessions_total").increment(1);
        info!(session = id, "Image client attached");
        rx
    }

    /// Replace any metadata client and send it the current frame right away.
    pub(crate) fn attach_metadata_client(&self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(METADATA_QUEUE_DEPTH);
        let frame_id = lock(&self.cursor).current();
        if let Some(line) = self.metadata_line(frame_id) {
            // Fresh channel with spare capacity.
            let _ = tx.try_send(line);
        }
        if lock(&self.metadata).replace(tx).is_some() {
            debug!("Replacing previous metadata client");
        }
        info!(frame = frame_id, "Metadata client attached");
        rx
    }

    /// Stop the image timer and drop the metadata writer.
    pub(crate) fn close_sessions(&self) {
        self.image_session.close();
        lock(&self.metadata).take();
    }

    #[cfg(test)]
    pub(crate) fn current_frame(&self) -> u32 {
        lock(&self.cursor).current()
    }

    /// Emit one frame. Returns `false` once the image client has gone away.
    async fn tick(&self, writer: &mpsc::Sender<Bytes>) -> bool {
        let frame_id = lock(&self.cursor).advance();

        match self.assets.frames.load(frame_id).await {
            Ok(jpeg) => {
                if writer.send(mjpeg_part(&jpeg)).await.is_err() {
                    return false;
                }
                metrics::counter!("emulator_frames_emitted_total").increment(1);
            }
            Err(err) => {
                warn!(frame = frame_id, "Failed to load emulator frame: {err}");
                metrics::counter!("emulator_asset_errors_total").increment(1);
            }
        }

        self.push_metadata(frame_id);
        true
    }

    fn push_metadata(&self, frame_id: u32) {
        let mut slot = lock(&self.metadata);
        let Some(tx) = slot.as_ref() else {
            debug!(frame = frame_id, "Metadata stream not connected yet");
            return;
        };
        let Some(line) = self.metadata_line(frame_id) else {
            return;
        };
        match tx.try_send(line) {
            Ok(()) => metrics::counter!("emulator_metadata_records_total").increment(1),
            Err(TrySendError::Full(_)) => {
                debug!(frame = frame_id, "Metadata client lagging; dropping record")
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Metadata client disconnected");
                *slot = None;
            }
        }
    }

    /// Newline-terminated JSON for `frame_id`; frames without canned detections get an empty list.
    fn metadata_line(&self, frame_id: u32) -> Option<Bytes> {
        let record = match self.assets.detections.get(frame_id) {
            Some(record) => to_absolute(record, self.frame_size),
            None => {
                debug!(frame = frame_id, "No canned detections for frame");
                to_absolute(&DetectionRecord::empty(frame_id), self.frame_size)
            }
        };
        match serde_json::to_vec(&record) {
            Ok(mut json) => {
                json.push(b'\n');
                Some(Bytes::from(json))
            }
            Err(err) => {
                error!(frame = frame_id, "Failed to encode detections: {err}");
                None
            }
        }
    }
}

async fn run_image_session(core: Arc<EmulatorCore>, id: u64, writer: mpsc::Sender<Bytes>) {
    let mut interval = tokio::time::interval(core.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !core.tick(&writer).await {
            info!(session = id, "Image client disconnected");
            break;
        }
    }
}

/// One `multipart/x-mixed-replace` part carrying a JPEG.
pub(crate) fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 96);
    payload.extend_from_slice(format!("--{MJPEG_BOUNDARY}\r\n").as_bytes());
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
    payload.extend_from_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use detections::{DetectedObject, DetectionDataset, RelativeBox};
    use tokio::time::sleep;

    use super::*;
    use crate::{emulator::assets::FrameStore, supervisor::FrameWindow};

    const TICK: Duration = Duration::from_millis(34);

    /// Frames 16..=451 whose JPEG payload is `jpeg-<index>`, with one car per frame.
    pub(crate) fn fixture_assets(window: FrameWindow) -> Arc<EmulatorAssets> {
        let frames: HashMap<u32, Bytes> = window
            .indices()
            .map(|index| (index, Bytes::from(format!("jpeg-{index}"))))
            .collect();
        let records = window.indices().map(|index| DetectionRecord {
            frame_id: index,
            objects: vec![DetectedObject {
                class_id: 2,
                name: "car".into(),
                relative_coordinates: RelativeBox {
                    center_x: 0.5,
                    center_y: 0.5,
                    width: 0.2,
                    height: 0.1,
                },
                confidence: 0.9,
            }],
        });
        Arc::new(EmulatorAssets::new(
            DetectionDataset::from_records(records),
            FrameStore::Preloaded(Arc::new(frames)),
        ))
    }

    fn settings() -> EmulatorSettings {
        EmulatorSettings {
            tick_interval: TICK,
            ..EmulatorSettings::default()
        }
    }

    fn core() -> Arc<EmulatorCore> {
        let settings = settings();
        EmulatorCore::new(fixture_assets(settings.window), &settings)
    }

    /// Frame index encoded in an MJPEG part produced from the fixture.
    fn part_frame(part: &Bytes) -> u32 {
        let text = std::str::from_utf8(part).expect("fixture parts are text");
        let body = text
            .split("\r\n\r\n")
            .nth(1)
            .expect("part has a body")
            .trim_end_matches("\r\n");
        body.strip_prefix("jpeg-")
            .expect("fixture body")
            .parse()
            .expect("frame index")
    }

    fn line_frame(line: &Bytes) -> u32 {
        let value: serde_json::Value = serde_json::from_slice(line).expect("metadata is JSON");
        value["frame_id"].as_u64().expect("frame_id present") as u32
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Bytes> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[test]
    fn mjpeg_part_is_framed_with_boundary_and_length() {
        let part = mjpeg_part(b"abc");
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\nabc\r\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn image_client_receives_consecutive_frames() {
        let core = core();
        let mut frames = core.attach_image_client();

        sleep(TICK * 3 + Duration::from_millis(1)).await;
        let received: Vec<u32> = drain(&mut frames).iter().map(part_frame).collect();
        assert_eq!(received, vec![16, 17, 18, 19]);
        assert_eq!(core.current_frame(), 19);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_stops_the_previous_session_exactly_once() {
        let core = core();
        let mut first = core.attach_image_client();
        sleep(Duration::from_millis(100)).await;

        let mut second = core.attach_image_client();
        sleep(Duration::from_millis(100)).await;

        let first_frames: Vec<u32> = drain(&mut first).iter().map(part_frame).collect();
        assert_eq!(first_frames, vec![16, 17, 18]);
        assert!(first.recv().await.is_none(), "first session writer dropped");

        let second_frames: Vec<u32> = drain(&mut second).iter().map(part_frame).collect();
        assert_eq!(second_frames, vec![19, 20, 21]);
        assert_eq!(core.current_frame(), 21);
        assert_eq!(core.image_session.closed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_metadata_client_gets_the_current_frame_first() {
        let core = core();
        let _frames = core.attach_image_client();
        sleep(Duration::from_millis(100)).await;

        let mut metadata = core.attach_metadata_client();
        let joined: Vec<u32> = drain(&mut metadata).iter().map(line_frame).collect();
        assert_eq!(joined, vec![18]);

        sleep(Duration::from_millis(40)).await;
        let pushed: Vec<u32> = drain(&mut metadata).iter().map(line_frame).collect();
        assert_eq!(pushed, vec![19]);
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_lines_carry_absolute_boxes() {
        let core = core();
        let mut metadata = core.attach_metadata_client();
        let line = metadata.recv().await.expect("initial record");
        assert_eq!(line.last(), Some(&b'\n'));

        let value: serde_json::Value = serde_json::from_slice(&line).expect("metadata is JSON");
        assert_eq!(value["frame_id"], 16);
        assert_eq!(value["video_size"], serde_json::json!({"width": 640, "height": 360}));
        let coords = &value["objects"][0]["absolute_coordinates"];
        assert!((coords["center_x"].as_f64().expect("x") - 256.0).abs() < 1e-9);
        assert!((coords["center_y"].as_f64().expect("y") - 162.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_without_metadata_client_only_write_images() {
        let core = core();
        let mut frames = core.attach_image_client();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(drain(&mut frames).len(), 2);
        assert!(lock(&core.metadata).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn newest_metadata_client_wins() {
        let core = core();
        let mut first = core.attach_metadata_client();
        let mut second = core.attach_metadata_client();

        assert_eq!(drain(&mut first).len(), 1);
        assert!(first.recv().await.is_none(), "first metadata writer dropped");
        assert_eq!(drain(&mut second).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_frame_skips_image_but_keeps_metadata_in_step() {
        let settings = settings();
        let assets = fixture_assets(settings.window);
        let mut frames = match &assets.frames {
            FrameStore::Preloaded(frames) => (**frames).clone(),
            FrameStore::Directory(_) => unreachable!("fixture is preloaded"),
        };
        frames.remove(&17);
        let assets = Arc::new(EmulatorAssets::new(
            DetectionDataset::from_records(
                settings
                    .window
                    .indices()
                    .map(DetectionRecord::empty)
                    .collect::<Vec<_>>(),
            ),
            FrameStore::Preloaded(Arc::new(frames)),
        ));
        let core = EmulatorCore::new(assets, &settings);

        let mut metadata = core.attach_metadata_client();
        let mut images = core.attach_image_client();
        sleep(TICK * 2 + Duration::from_millis(1)).await;

        let image_frames: Vec<u32> = drain(&mut images).iter().map(part_frame).collect();
        assert_eq!(image_frames, vec![16, 18]);
        let metadata_frames: Vec<u32> = drain(&mut metadata).iter().map(line_frame).collect();
        assert_eq!(metadata_frames, vec![16, 16, 17, 18]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_image_client_ends_its_session() {
        let core = core();
        let frames = core.attach_image_client();
        sleep(Duration::from_millis(10)).await;
        assert!(core.image_session.active().is_some());

        drop(frames);
        sleep(TICK * 2).await;
        assert_eq!(core.image_session.active(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn close_sessions_stops_timer_and_metadata() {
        let core = core();
        let mut frames = core.attach_image_client();
        let mut metadata = core.attach_metadata_client();
        sleep(Duration::from_millis(10)).await;

        core.close_sessions();
        drain(&mut frames);
        drain(&mut metadata);
        assert!(frames.recv().await.is_none());
        assert!(metadata.recv().await.is_none());
    }
}
