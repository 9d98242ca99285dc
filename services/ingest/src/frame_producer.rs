//! Sequenced publishing of captured frames.
//!
//! Each successfully encoded frame takes the next id from the producer's
//! [`FrameSequence`] and is published keyed by that id. Publishing waits for
//! the broker acknowledgement before the next frame is read.

use crate::encoder::{EncodeError, FrameEncoder};
use crate::video_source::{FrameReceiver, RawFrame};
use argus_pipeline::telemetry::{self, FRAMES_PUBLISHED};
use argus_pipeline::{FrameMessage, MessagePublisher, OutgoingMessage, ProducerError};
use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Publish(#[from] ProducerError),
}

impl FrameError {
    fn reason(&self) -> &'static str {
        match self {
            FrameError::Encode(_) => "encode",
            FrameError::Publish(_) => "publish",
        }
    }
}

/// Per-instance frame id counter, starting at 0. Not persisted across restarts.
#[derive(Debug, Default)]
pub struct FrameSequence {
    next: u64,
}

impl FrameSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next frame will receive
    pub fn peek(&self) -> u64 {
        self.next
    }

    fn advance(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProducerStats {
    pub frames_read: u64,
    pub frames_published: u64,
    pub dropped_encode: u64,
    pub dropped_publish: u64,
    pub capture_errors: u64,
}

pub struct FrameProducer<P> {
    publisher: P,
    encoder: FrameEncoder,
    topic: String,
    sequence: FrameSequence,
    stats: ProducerStats,
}

impl<P: MessagePublisher> FrameProducer<P> {
    pub fn new(publisher: P, encoder: FrameEncoder, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            encoder,
            topic: topic.into(),
            sequence: FrameSequence::new(),
            stats: ProducerStats::default(),
        }
    }

    pub fn sequence(&self) -> &FrameSequence {
        &self.sequence
    }

    pub fn stats(&self) -> &ProducerStats {
        &self.stats
    }

    /// Publish every frame from `frames` until the channel closes, a capture
    /// error arrives, or `stop` is raised.
    pub async fn process_video(
        &mut self,
        mut frames: FrameReceiver,
        prompt: &str,
        stop: &AtomicBool,
    ) -> ProducerStats {
        info!(topic = %self.topic, prompt, "Publishing frames");

        while let Some(captured) = frames.recv().await {
            if stop.load(Ordering::SeqCst) {
                info!(next_frame_id = self.sequence.peek(), "Stop requested");
                break;
            }

            let frame = match captured {
                Ok(frame) => frame,
                Err(e) => {
                    self.stats.capture_errors += 1;
                    error!(error = %e, "Capture failed, ending stream");
                    break;
                }
            };
            self.stats.frames_read += 1;

            match self.process_frame(&frame, prompt).await {
                Ok(frame_id) => {
                    self.stats.frames_published += 1;
                    counter!(FRAMES_PUBLISHED).increment(1);
                    debug!(frame_id, "Frame published");
                }
                Err(e) => {
                    match e {
                        FrameError::Encode(_) => self.stats.dropped_encode += 1,
                        FrameError::Publish(_) => self.stats.dropped_publish += 1,
                    }
                    telemetry::record_frame_dropped(e.reason());
                    error!(
                        reason = e.reason(),
                        width = frame.width,
                        height = frame.height,
                        error = %e,
                        "Dropping frame"
                    );
                }
            }
        }

        self.stats.clone()
    }

    /// Encode one frame and publish it, waiting for the acknowledgement.
    ///
    /// The id is consumed once encoding succeeds, so a failed publish leaves
    /// a gap rather than reusing it.
    pub async fn process_frame(
        &mut self,
        frame: &RawFrame,
        prompt: &str,
    ) -> Result<u64, FrameError> {
        let jpeg = self.encoder.encode(frame)?;
        let frame_id = self.sequence.advance();

        let message = FrameMessage::new(frame_id, jpeg, prompt);
        let outgoing = OutgoingMessage::new_json(&self.topic, &message)?.with_key(message.key());
        let delivery = self.publisher.send(outgoing).await?;

        debug!(
            frame_id,
            partition = delivery.partition,
            offset = delivery.offset,
            "Frame delivered"
        );
        Ok(frame_id)
    }
}
