//! Video capture through a GStreamer pipeline ending in an appsink.
//!
//! A source identifier is either a capture device index (`0` is
//! `/dev/video0`), a URI such as `rtsp://camera:554/stream`, or a local file
//! path. Frames are pulled on demand and handed out as packed RGB.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a single pull waits before the stop flag is checked again
pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Frames buffered between the capture thread and the publisher
const FRAME_CHANNEL_CAPACITY: usize = 4;

pub type FrameReceiver = mpsc::Receiver<Result<RawFrame, CaptureError>>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("GStreamer initialization failed: {0}")]
    GstreamerInit(String),

    #[error("Failed to open video source {source_id}: {reason}")]
    OpenFailed { source_id: String, reason: String },

    #[error("Video stream failed: {0}")]
    Stream(String),

    #[error("Frame extraction failed: {0}")]
    FrameExtraction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Device(u32),
    Uri(String),
    File(PathBuf),
}

impl SourceKind {
    pub fn parse(source: &str) -> Self {
        let source = source.trim();
        if let Ok(index) = source.parse::<u32>() {
            SourceKind::Device(index)
        } else if source.contains("://") {
            SourceKind::Uri(source.to_string())
        } else {
            SourceKind::File(PathBuf::from(source))
        }
    }

    /// gst-launch description feeding RGB frames into an appsink named `sink`
    pub fn pipeline_description(&self) -> String {
        let head = match self {
            SourceKind::Device(index) => format!("v4l2src device=/dev/video{}", index),
            SourceKind::Uri(uri) => format!("uridecodebin uri=\"{}\"", escape(uri)),
            SourceKind::File(path) => format!(
                "filesrc location=\"{}\" ! decodebin",
                escape(&path.to_string_lossy())
            ),
        };

        format!(
            "{head} ! videoconvert ! video/x-raw,format=RGB \
             ! appsink name=sink sync=false max-buffers=4 drop=false"
        )
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One decoded frame, tightly packed RGB8
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Outcome of one bounded pull from the capture pipeline
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(RawFrame),
    /// No frame arrived within the poll interval
    Idle,
    EndOfStream,
}

/// A running capture pipeline
pub struct VideoCapture {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    source_id: String,
}

impl VideoCapture {
    /// Build and start the pipeline, failing if it cannot reach PLAYING within `timeout`.
    pub fn open(source: &str, timeout: Duration) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::GstreamerInit(e.to_string()))?;

        let open_error = |reason: String| CaptureError::OpenFailed {
            source_id: source.to_string(),
            reason,
        };

        let kind = SourceKind::parse(source);
        let description = kind.pipeline_description();
        debug!(pipeline = %description, "Creating capture pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| open_error(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_error("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_error("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_error("Could not cast to AppSink".to_string()))?;

        let capture = Self {
            pipeline,
            appsink,
            source_id: source.to_string(),
        };

        if let Err(e) = capture.pipeline.set_state(gst::State::Playing) {
            return Err(open_error(capture.bus_error().unwrap_or_else(|| e.to_string())));
        }

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let (result, _state, _pending) =
            capture.pipeline.state(gst::ClockTime::from_mseconds(timeout_ms));
        if result.is_err() {
            return Err(open_error(
                capture
                    .bus_error()
                    .unwrap_or_else(|| "Timeout waiting for pipeline to start".to_string()),
            ));
        }

        info!(source = %capture.source_id, kind = ?kind, "Video source opened");
        Ok(capture)
    }

    /// Wait up to `timeout` for the next frame.
    pub fn pull(&self, timeout: Duration) -> Result<CaptureEvent, CaptureError> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        match self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(timeout_ms))
        {
            Some(sample) => self.read_frame(&sample).map(CaptureEvent::Frame),
            None if self.appsink.is_eos() => {
                info!(source = %self.source_id, "End of stream");
                Ok(CaptureEvent::EndOfStream)
            }
            None => match self.bus_error() {
                Some(reason) => Err(CaptureError::Stream(reason)),
                None => Ok(CaptureEvent::Idle),
            },
        }
    }

    /// Move the capture onto a blocking thread that forwards frames until the
    /// stream ends, a capture error occurs, `stop` is raised or the receiver
    /// is dropped. The pipeline is torn down when the thread exits.
    pub fn spawn_reader(self, stop: Arc<AtomicBool>) -> (FrameReceiver, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let handle = tokio::task::spawn_blocking(move || {
            forward_frames(|timeout| self.pull(timeout), CAPTURE_POLL_INTERVAL, &stop, &tx);
            debug!(source = %self.source_id, "Capture thread exiting");
        });
        (rx, handle)
    }

    /// First error message waiting on the pipeline bus
    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Some(match err.debug() {
                    Some(debug) => format!("{} ({})", err.error(), debug),
                    None => err.error().to_string(),
                });
            }
        }
        None
    }

    fn read_frame(&self, sample: &gst::Sample) -> Result<RawFrame, CaptureError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::FrameExtraction("sample without buffer".to_string()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::FrameExtraction("sample without caps".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::FrameExtraction(e.to_string()))?;

        let map = buffer
            .map_readable()
            .map_err(|e| CaptureError::FrameExtraction(e.to_string()))?;

        let stride = usize::try_from(info.stride()[0])
            .map_err(|_| CaptureError::FrameExtraction("negative stride".to_string()))?;
        let data = pack_rows(
            map.as_slice(),
            info.width() as usize * 3,
            info.height() as usize,
            stride,
        )?;

        Ok(RawFrame {
            data,
            width: info.width(),
            height: info.height(),
        })
    }
}

/// Copy `height` rows of `row_bytes` out of a buffer whose rows are `stride` apart
fn pack_rows(
    src: &[u8],
    row_bytes: usize,
    height: usize,
    stride: usize,
) -> Result<Vec<u8>, CaptureError> {
    if stride < row_bytes || height == 0 || src.len() < stride * (height - 1) + row_bytes {
        return Err(CaptureError::FrameExtraction(format!(
            "buffer of {} bytes too small for {} rows of {} bytes (stride {})",
            src.len(),
            height,
            row_bytes,
            stride
        )));
    }

    let mut data = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        data.extend_from_slice(&src[start..start + row_bytes]);
    }
    Ok(data)
}

/// Pump frames from `pull` into `tx`, re-checking `stop` after every pull.
fn forward_frames<F>(
    mut pull: F,
    poll_interval: Duration,
    stop: &AtomicBool,
    tx: &mpsc::Sender<Result<RawFrame, CaptureError>>,
) where
    F: FnMut(Duration) -> Result<CaptureEvent, CaptureError>,
{
    while !stop.load(Ordering::SeqCst) {
        match pull(poll_interval) {
            Ok(CaptureEvent::Frame(frame)) => {
                if tx.blocking_send(Ok(frame)).is_err() {
                    break;
                }
            }
            Ok(CaptureEvent::Idle) => {}
            Ok(CaptureEvent::EndOfStream) => break,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
}

impl Drop for VideoCapture {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(source = %self.source_id, error = %e, "Failed to stop capture pipeline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parsing() {
        assert_eq!(SourceKind::parse("0"), SourceKind::Device(0));
        assert_eq!(SourceKind::parse(" 2 "), SourceKind::Device(2));
        assert_eq!(
            SourceKind::parse("rtsp://camera:554/stream"),
            SourceKind::Uri("rtsp://camera:554/stream".to_string())
        );
        assert_eq!(
            SourceKind::parse("/data/clip.mp4"),
            SourceKind::File(PathBuf::from("/data/clip.mp4"))
        );
    }

    #[test]
    fn test_pipeline_descriptions() {
        let device = SourceKind::Device(1).pipeline_description();
        assert!(device.starts_with("v4l2src device=/dev/video1 !"));
        assert!(device.contains("appsink name=sink"));

        let file = SourceKind::File(PathBuf::from("/data/my \"clip\".mp4")).pipeline_description();
        assert!(file.starts_with("filesrc location=\"/data/my \\\"clip\\\".mp4\" ! decodebin"));

        let uri = SourceKind::Uri("http://host/video.mp4".to_string()).pipeline_description();
        assert!(uri.starts_with("uridecodebin uri=\"http://host/video.mp4\""));
    }

    #[test]
    fn test_pack_rows_strips_padding() {
        // 2x2 RGB frame with 2 bytes of padding per row
        let src = [1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12, 0, 0];
        let packed = pack_rows(&src, 6, 2, 8).unwrap();
        assert_eq!(packed, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_pack_rows_rejects_short_buffer() {
        assert!(pack_rows(&[0; 10], 6, 2, 8).is_err());
        assert!(pack_rows(&[0; 16], 6, 2, 4).is_err());
    }

    fn frame() -> RawFrame {
        RawFrame {
            data: vec![0; 12],
            width: 2,
            height: 2,
        }
    }

    #[test]
    fn test_idle_source_still_honors_stop() {
        let stop = AtomicBool::new(false);
        let (tx, mut rx) = mpsc::channel(1);
        let mut pulls = 0;

        forward_frames(
            |_| {
                pulls += 1;
                if pulls == 3 {
                    stop.store(true, Ordering::SeqCst);
                }
                Ok(CaptureEvent::Idle)
            },
            Duration::from_millis(1),
            &stop,
            &tx,
        );

        assert_eq!(pulls, 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_frames_are_forwarded_until_end_of_stream() {
        let stop = AtomicBool::new(false);
        let (tx, mut rx) = mpsc::channel(4);
        let mut events = vec![
            CaptureEvent::EndOfStream,
            CaptureEvent::Frame(frame()),
            CaptureEvent::Idle,
            CaptureEvent::Frame(frame()),
        ];

        forward_frames(
            |_| Ok(events.pop().unwrap()),
            Duration::from_millis(1),
            &stop,
            &tx,
        );
        drop(tx);

        assert!(events.is_empty());
        assert!(matches!(rx.blocking_recv(), Some(Ok(_))));
        assert!(matches!(rx.blocking_recv(), Some(Ok(_))));
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn test_capture_error_is_forwarded_and_ends_reader() {
        let stop = AtomicBool::new(false);
        let (tx, mut rx) = mpsc::channel(4);
        let mut pulls = 0;

        forward_frames(
            |_| {
                pulls += 1;
                Err(CaptureError::Stream("device unplugged".to_string()))
            },
            Duration::from_millis(1),
            &stop,
            &tx,
        );
        drop(tx);

        assert_eq!(pulls, 1);
        assert!(matches!(rx.blocking_recv(), Some(Err(CaptureError::Stream(_)))));
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn test_dropped_receiver_ends_reader() {
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut pulls = 0;

        forward_frames(
            |_| {
                pulls += 1;
                Ok(CaptureEvent::Frame(frame()))
            },
            Duration::from_millis(1),
            &stop,
            &tx,
        );

        assert_eq!(pulls, 1);
    }
}
