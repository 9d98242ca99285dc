//! Argus ingest: capture video, encode frames as JPEG and publish them to
//! the frames topic with per-frame delivery confirmation.

pub mod config;
pub mod encoder;
pub mod frame_producer;
pub mod video_source;

pub use config::IngestSettings;
pub use encoder::{EncodeError, FrameEncoder};
pub use frame_producer::{FrameError, FrameProducer, FrameSequence, ProducerStats};
pub use video_source::{
    CaptureError, CaptureEvent, FrameReceiver, RawFrame, SourceKind, VideoCapture,
};
