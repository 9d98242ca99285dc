//! Detection worker: poll a frame, run the detector, publish the result.
//!
//! Every per-message failure is logged, counted and dropped; the loop only
//! ends when the shutdown future resolves.

use crate::detector::Detector;
use argus_pipeline::telemetry::{
    self, CONSUMER_ERRORS, DETECTIONS_PUBLISHED, INFERENCE_DURATION, MESSAGES_RECEIVED,
};
use argus_pipeline::{
    DetectionMessage, ErrorKind, FrameMessage, IncomingMessage, MessagePublisher, MessageSource,
    OutgoingMessage, PipelineError,
};
use metrics::{counter, histogram};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Polling,
    Processing,
    Publishing,
    Shutdown,
}

impl WorkerState {
    fn stage(&self) -> &'static str {
        match self {
            WorkerState::Init => "init",
            WorkerState::Polling => "polling",
            WorkerState::Processing => "processing",
            WorkerState::Publishing => "publishing",
            WorkerState::Shutdown => "shutdown",
        }
    }
}

/// Counters reported when the worker stops
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub messages_received: u64,
    pub detections_published: u64,
    pub dropped_deserialization: u64,
    pub dropped_inference: u64,
    pub dropped_publish: u64,
    pub dropped_other: u64,
    pub poll_errors: u64,
}

impl WorkerStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_deserialization
            + self.dropped_inference
            + self.dropped_publish
            + self.dropped_other
    }

    fn record_drop(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::Deserialization => self.dropped_deserialization += 1,
            ErrorKind::Inference => self.dropped_inference += 1,
            ErrorKind::Publish => self.dropped_publish += 1,
            ErrorKind::Configuration
            | ErrorKind::Connection
            | ErrorKind::Decryption
            | ErrorKind::ModelLoad => self.dropped_other += 1,
        }
    }
}

pub struct DetectionWorker<D, P> {
    detector: D,
    publisher: P,
    detections_topic: String,
    poll_timeout: Duration,
    state: WorkerState,
    stats: WorkerStats,
}

impl<D, P> DetectionWorker<D, P>
where
    D: Detector,
    P: MessagePublisher,
{
    pub fn new(
        detector: D,
        publisher: P,
        detections_topic: impl Into<String>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            detector,
            publisher,
            detections_topic: detections_topic.into(),
            poll_timeout,
            state: WorkerState::Init,
            stats: WorkerStats::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Consume the worker, handing back the publisher for a final flush
    pub fn into_publisher(self) -> P {
        self.publisher
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            trace!(from = self.state.stage(), to = next.stage(), "Worker state change");
            self.state = next;
        }
    }

    /// Poll `source` until `shutdown` resolves, then close the source.
    pub async fn run<S, F>(&mut self, source: &mut S, shutdown: F) -> WorkerStats
    where
        S: MessageSource,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            topic = %self.detections_topic,
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            "Detection worker started"
        );

        loop {
            self.transition(WorkerState::Polling);
            let poll_timeout = self.poll_timeout;

            let polled = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                polled = source.poll(poll_timeout) => polled,
            };

            match polled {
                Ok(Some(message)) => self.handle(message),
                Ok(None) => {}
                Err(e) => {
                    self.stats.poll_errors += 1;
                    counter!(CONSUMER_ERRORS).increment(1);
                    warn!(error = %e, "Poll failed");
                }
            }
        }

        self.transition(WorkerState::Shutdown);
        info!("Shutdown requested, closing consumer");
        source.close();

        self.stats.clone()
    }

    /// Process one message and publish its detections.
    pub fn handle(&mut self, message: IncomingMessage) {
        self.stats.messages_received += 1;
        counter!(MESSAGES_RECEIVED).increment(1);

        let Some(detections) = self.process_frame(&message) else {
            return;
        };

        self.transition(WorkerState::Publishing);
        match self.publish(&detections) {
            Ok(()) => {
                self.stats.detections_published += 1;
                counter!(DETECTIONS_PUBLISHED).increment(1);
                debug!(
                    frame_id = detections.frame_id(),
                    detections = detections.len(),
                    "Detections queued"
                );
            }
            Err(e) => self.drop_message(&message, e),
        }
    }

    /// Decode the frame and run the detector. `None` means the message was dropped.
    pub fn process_frame(&mut self, message: &IncomingMessage) -> Option<DetectionMessage> {
        self.transition(WorkerState::Processing);
        match self.detect(message) {
            Ok(detections) => Some(detections),
            Err(e) => {
                self.drop_message(message, e);
                None
            }
        }
    }

    fn detect(&self, message: &IncomingMessage) -> Result<DetectionMessage, PipelineError> {
        let frame = FrameMessage::from_slice(&message.payload)?;

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.detector.infer(&frame.frame, &frame.prompt)
        }));
        let elapsed = started.elapsed();
        histogram!(INFERENCE_DURATION).record(elapsed.as_secs_f64());

        let detections = match outcome {
            Ok(result) => result.map_err(|e| match e {
                PipelineError::Inference(_) => e,
                other => PipelineError::Inference(other.to_string()),
            })?,
            Err(_) => {
                return Err(PipelineError::Inference("detector panicked".to_string()));
            }
        };

        if let Some(invalid) = detections.iter().find(|d| !d.is_finite()) {
            return Err(PipelineError::Inference(format!(
                "detector returned non-finite values for frame {}: {:?}",
                frame.frame_id, invalid
            )));
        }

        debug!(
            frame_id = frame.frame_id,
            detections = detections.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Inference complete"
        );

        Ok(DetectionMessage::new(frame.frame_id, detections))
    }

    fn publish(&self, detections: &DetectionMessage) -> Result<(), PipelineError> {
        let message = OutgoingMessage::new_json(&self.detections_topic, detections)?
            .with_key(detections.key());
        self.publisher.enqueue(message)?;
        Ok(())
    }

    fn drop_message(&mut self, message: &IncomingMessage, error: PipelineError) {
        let kind = error.kind();
        self.stats.record_drop(kind);
        telemetry::record_dropped(self.state.stage(), kind);

        error!(
            key = message.key_str().as_deref().unwrap_or(""),
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            stage = self.state.stage(),
            error_kind = kind.as_str(),
            error = %error,
            "Dropping message"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::MockDetector;
    use argus_pipeline::{
        async_trait, ConsumerError, DeliveryResult, Detection, MessageMetadata, ProducerError,
    };
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Default, Clone)]
    struct RecordingPublisher {
        sent: Arc<Mutex<Vec<OutgoingMessage>>>,
        fail: bool,
    }

    impl RecordingPublisher {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<OutgoingMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
            let result = DeliveryResult {
                topic: message.topic.clone(),
                partition: 0,
                offset: 0,
                key: message.key.clone(),
            };
            self.enqueue(message)?;
            Ok(result)
        }

        fn enqueue(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
            if self.fail {
                return Err(ProducerError::SendError {
                    topic: message.topic,
                    message: "queue full".to_string(),
                });
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    /// Replays queued poll results, then requests shutdown
    struct ScriptedSource {
        polls: VecDeque<Result<Option<IncomingMessage>, ConsumerError>>,
        drained: Arc<Notify>,
        closed: bool,
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn poll(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<IncomingMessage>, ConsumerError> {
            match self.polls.pop_front() {
                Some(polled) => polled,
                None => {
                    self.drained.notify_one();
                    Ok(None)
                }
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn incoming(key: &str, payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            payload: payload.to_vec(),
            metadata: MessageMetadata {
                topic: "frames".to_string(),
                partition: 0,
                offset: 0,
                key: Some(key.as_bytes().to_vec()),
            },
        }
    }

    /// A real 2x2 RGB image encoded as JPEG
    fn jpeg_2x2() -> Vec<u8> {
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode(
                &[255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255],
                2,
                2,
                image::ExtendedColorType::Rgb8,
            )
            .unwrap();
        jpeg
    }

    fn frame(frame_id: u64, prompt: &str) -> IncomingMessage {
        let message = FrameMessage::new(frame_id, jpeg_2x2(), prompt);
        incoming(&message.key(), &serde_json::to_vec(&message).unwrap())
    }

    fn one_box_detector() -> MockDetector {
        let mut detector = MockDetector::new();
        detector.expect_infer().returning(|_, _| {
            Ok(vec![Detection {
                bbox: [0.0, 0.0, 1.0, 1.0],
                label: 2.0,
                confidence: 0.9,
            }])
        });
        detector
    }

    #[test]
    fn test_frame_is_published_with_matching_key() {
        let publisher = RecordingPublisher::default();
        let mut detector = MockDetector::new();
        detector
            .expect_infer()
            .withf(|frame, prompt| frame == &jpeg_2x2()[..] && prompt == "detect car")
            .times(1)
            .returning(|_, _| {
                Ok(vec![Detection {
                    bbox: [0.0, 0.0, 1.0, 1.0],
                    label: 2.0,
                    confidence: 0.9,
                }])
            });

        let mut worker =
            DetectionWorker::new(detector, publisher.clone(), "detections", Duration::from_millis(10));
        worker.handle(frame(7, "detect car"));

        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "detections");
        assert_eq!(sent[0].key.as_deref(), Some("7"));

        let payload: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "frame_id": 7,
                "boxes": [[0.0, 0.0, 1.0, 1.0]],
                "labels": [2.0],
                "confidences": [0.9]
            })
        );
        assert_eq!(worker.stats().detections_published, 1);
    }

    #[test]
    fn test_empty_detections_are_still_published() {
        let publisher = RecordingPublisher::default();
        let mut detector = MockDetector::new();
        detector.expect_infer().returning(|_, _| Ok(Vec::new()));

        let mut worker =
            DetectionWorker::new(detector, publisher.clone(), "detections", Duration::from_millis(10));
        worker.handle(frame(3, "detect person"));

        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        let message = DetectionMessage::from_slice(&sent[0].payload).unwrap();
        assert_eq!(message.frame_id(), 3);
        assert!(message.is_empty());
    }

    #[test]
    fn test_malformed_payload_is_dropped_without_inference() {
        let publisher = RecordingPublisher::default();
        let mut detector = MockDetector::new();
        detector.expect_infer().never();

        let mut worker =
            DetectionWorker::new(detector, publisher.clone(), "detections", Duration::from_millis(10));
        worker.handle(incoming("9", b"{\"frame_id\": 9"));
        worker.handle(incoming("10", b"{\"frame_id\": 10, \"prompt\": \"x\"}"));

        assert!(publisher.sent().is_empty());
        assert_eq!(worker.stats().messages_received, 2);
        assert_eq!(worker.stats().dropped_deserialization, 2);
    }

    #[test]
    fn test_inference_failure_is_dropped() {
        let publisher = RecordingPublisher::default();
        let mut detector = MockDetector::new();
        detector
            .expect_infer()
            .returning(|_, _| Err(PipelineError::ModelLoad("session poisoned".to_string())));

        let mut worker =
            DetectionWorker::new(detector, publisher.clone(), "detections", Duration::from_millis(10));
        assert!(worker.process_frame(&frame(1, "detect car")).is_none());

        assert!(publisher.sent().is_empty());
        assert_eq!(worker.stats().dropped_inference, 1);
    }

    #[test]
    fn test_frame_fixture_is_a_decodable_image() {
        let decoded = image::load_from_memory(&jpeg_2x2()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (2, 2));
    }

    #[test]
    fn test_non_finite_detections_are_dropped() {
        let publisher = RecordingPublisher::default();
        let mut detector = MockDetector::new();
        detector.expect_infer().returning(|_, _| {
            Ok(vec![Detection {
                bbox: [0.0, 0.0, f32::NAN, 1.0],
                label: 0.0,
                confidence: f32::NAN,
            }])
        });

        let mut worker =
            DetectionWorker::new(detector, publisher.clone(), "detections", Duration::from_millis(10));
        worker.handle(frame(4, "detect car"));

        assert!(publisher.sent().is_empty());
        assert_eq!(worker.stats().detections_published, 0);
        assert_eq!(worker.stats().dropped_inference, 1);
    }

    #[test]
    fn test_drops_are_counted_by_kind() {
        let mut stats = WorkerStats::default();
        stats.record_drop(ErrorKind::Deserialization);
        stats.record_drop(ErrorKind::Inference);
        stats.record_drop(ErrorKind::Publish);
        stats.record_drop(ErrorKind::Connection);

        assert_eq!(stats.dropped_deserialization, 1);
        assert_eq!(stats.dropped_inference, 1);
        assert_eq!(stats.dropped_publish, 1);
        assert_eq!(stats.dropped_other, 1);
        assert_eq!(stats.dropped(), 4);
    }

    struct PanickingDetector;

    impl Detector for PanickingDetector {
        fn infer(&self, _frame: &[u8], _prompt: &str) -> Result<Vec<Detection>, PipelineError> {
            panic!("backend crashed")
        }
    }

    #[test]
    fn test_detector_panic_is_dropped() {
        let mut worker = DetectionWorker::new(
            PanickingDetector,
            RecordingPublisher::default(),
            "detections",
            Duration::from_millis(10),
        );
        worker.handle(frame(1, "detect car"));

        assert_eq!(worker.stats().dropped_inference, 1);
    }

    #[test]
    fn test_publish_failure_is_dropped() {
        let mut worker = DetectionWorker::new(
            one_box_detector(),
            RecordingPublisher::failing(),
            "detections",
            Duration::from_millis(10),
        );
        worker.handle(frame(5, "detect car"));

        assert_eq!(worker.stats().dropped_publish, 1);
        assert_eq!(worker.stats().detections_published, 0);
    }

    #[tokio::test]
    async fn test_run_survives_bad_messages_and_closes_source() {
        let publisher = RecordingPublisher::default();
        let drained = Arc::new(Notify::new());
        let mut source = ScriptedSource {
            polls: VecDeque::from(vec![
                Ok(Some(incoming("0", b"not json"))),
                Err(ConsumerError::PollError("broker transport failure".to_string())),
                Ok(None),
                Ok(Some(frame(1, "detect car"))),
            ]),
            drained: drained.clone(),
            closed: false,
        };

        let mut worker = DetectionWorker::new(
            one_box_detector(),
            publisher.clone(),
            "detections",
            Duration::from_millis(10),
        );

        let shutdown = async move { drained.notified().await };
        let stats = worker.run(&mut source, shutdown).await;

        assert!(source.closed);
        assert_eq!(worker.state(), WorkerState::Shutdown);
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.dropped_deserialization, 1);
        assert_eq!(stats.poll_errors, 1);
        assert_eq!(stats.detections_published, 1);

        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_run_stops_immediately_when_shutdown_already_requested() {
        let mut source = ScriptedSource {
            polls: VecDeque::from(vec![Ok(Some(frame(1, "detect car")))]),
            drained: Arc::new(Notify::new()),
            closed: false,
        };
        let mut detector = MockDetector::new();
        detector.expect_infer().never();

        let mut worker = DetectionWorker::new(
            detector,
            RecordingPublisher::default(),
            "detections",
            Duration::from_millis(10),
        );
        let stats = worker.run(&mut source, std::future::ready(())).await;

        assert!(source.closed);
        assert_eq!(stats, WorkerStats::default());
    }
}
