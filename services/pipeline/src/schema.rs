//! Wire schemas for the frames and detections topics.
//!
//! Both messages are JSON objects keyed by the decimal frame id. Payloads are
//! validated when they cross the channel boundary; anything that fails becomes
//! a [`PipelineError::Deserialization`].

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// An encoded frame and the prompt the detector should apply to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    /// Encoded image (JPEG), base64 on the wire
    #[serde(with = "base64_serde")]
    pub frame: Vec<u8>,
    /// Detection prompt text
    pub prompt: String,
    /// Per-producer sequence number
    pub frame_id: u64,
}

impl FrameMessage {
    pub fn new(frame_id: u64, frame: Vec<u8>, prompt: impl Into<String>) -> Self {
        Self {
            frame,
            prompt: prompt.into(),
            frame_id,
        }
    }

    /// Message key used on the frames topic
    pub fn key(&self) -> String {
        self.frame_id.to_string()
    }

    /// Decode and validate a frames-topic payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, PipelineError> {
        let message: FrameMessage = serde_json::from_slice(payload)?;
        if message.frame.is_empty() {
            return Err(PipelineError::Deserialization(format!(
                "frame {} has an empty image payload",
                message.frame_id
            )));
        }
        Ok(message)
    }
}

/// A single detection as produced by a detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Axis-aligned box as [x1, y1, x2, y2]
    pub bbox: [f32; 4],
    /// Class index, float-encoded on the wire
    pub label: f32,
    /// Confidence in [0, 1]
    pub confidence: f32,
}

impl Detection {
    /// JSON has no NaN or infinity, so only finite detections can be published.
    pub fn is_finite(&self) -> bool {
        self.bbox.iter().all(|v| v.is_finite())
            && self.label.is_finite()
            && self.confidence.is_finite()
    }
}

/// Detections for one frame, stored as parallel sequences.
///
/// Only constructible from a list of [`Detection`]s or through validated
/// deserialization, so the three sequences always have equal length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DetectionWire")]
pub struct DetectionMessage {
    frame_id: u64,
    boxes: Vec<[f32; 4]>,
    labels: Vec<f32>,
    confidences: Vec<f32>,
}

#[derive(Deserialize)]
struct DetectionWire {
    frame_id: u64,
    boxes: Vec<[f32; 4]>,
    labels: Vec<f32>,
    confidences: Vec<f32>,
}

impl TryFrom<DetectionWire> for DetectionMessage {
    type Error = String;

    fn try_from(wire: DetectionWire) -> Result<Self, Self::Error> {
        if wire.boxes.len() != wire.labels.len() || wire.boxes.len() != wire.confidences.len() {
            return Err(format!(
                "mismatched detection lengths: boxes={}, labels={}, confidences={}",
                wire.boxes.len(),
                wire.labels.len(),
                wire.confidences.len()
            ));
        }
        if let Some(c) = wire
            .confidences
            .iter()
            .find(|c| !(0.0..=1.0).contains(*c))
        {
            return Err(format!("confidence {} outside [0, 1]", c));
        }
        Ok(Self {
            frame_id: wire.frame_id,
            boxes: wire.boxes,
            labels: wire.labels,
            confidences: wire.confidences,
        })
    }
}

impl DetectionMessage {
    /// Build the message for `frame_id`, preserving detection order.
    ///
    /// Confidences are clamped into [0, 1].
    pub fn new(frame_id: u64, detections: impl IntoIterator<Item = Detection>) -> Self {
        let mut message = Self {
            frame_id,
            boxes: Vec::new(),
            labels: Vec::new(),
            confidences: Vec::new(),
        };
        for detection in detections {
            message.boxes.push(detection.bbox);
            message.labels.push(detection.label);
            message.confidences.push(detection.confidence.clamp(0.0, 1.0));
        }
        message
    }

    /// Decode and validate a detections-topic payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, PipelineError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Message key used on the detections topic
    pub fn key(&self) -> String {
        self.frame_id.to_string()
    }

    pub fn boxes(&self) -> &[[f32; 4]] {
        &self.boxes
    }

    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    pub fn confidences(&self) -> &[f32] {
        &self.confidences
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn detections(&self) -> impl Iterator<Item = Detection> + '_ {
        self.boxes
            .iter()
            .zip(&self.labels)
            .zip(&self.confidences)
            .map(|((bbox, label), confidence)| Detection {
                bbox: *bbox,
                label: *label,
                confidence: *confidence,
            })
    }
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn detection(i: usize) -> Detection {
        let f = i as f32;
        Detection {
            bbox: [f, f, f + 1.0, f + 1.0],
            label: f,
            confidence: 0.5,
        }
    }

    #[test]
    fn test_frame_message_wire_shape() {
        let message = FrameMessage::new(7, b"Hello World".to_vec(), "detect car");
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["frame_id"], 7);
        assert_eq!(value["prompt"], "detect car");
        assert_eq!(value["frame"], "SGVsbG8gV29ybGQ=");
        assert_eq!(message.key(), "7");
    }

    #[test]
    fn test_frame_message_rejects_malformed_payloads() {
        let cases: [&[u8]; 4] = [
            b"not json at all",
            br#"{"prompt": "detect car", "frame_id": 1}"#,
            br#"{"frame": "!!not base64!!", "prompt": "p", "frame_id": 1}"#,
            br#"{"frame": "", "prompt": "p", "frame_id": 1}"#,
        ];

        for payload in cases {
            let err = FrameMessage::from_slice(payload).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Deserialization);
        }
    }

    #[test]
    fn test_detection_lengths_match_for_zero_one_and_five() {
        for count in [0usize, 1, 5] {
            let message = DetectionMessage::new(3, (0..count).map(detection));
            assert_eq!(message.len(), count);
            assert_eq!(message.boxes().len(), count);
            assert_eq!(message.labels().len(), count);
            assert_eq!(message.confidences().len(), count);
            assert_eq!(message.detections().count(), count);
        }
    }

    #[test]
    fn test_detection_message_wire_shape() {
        let message = DetectionMessage::new(
            7,
            [Detection {
                bbox: [0.0, 0.0, 1.0, 1.0],
                label: 2.0,
                confidence: 0.9,
            }],
        );

        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"frame_id":7,"boxes":[[0.0,0.0,1.0,1.0]],"labels":[2.0],"confidences":[0.9]}"#
        );
    }

    #[test]
    fn test_detection_message_accepts_integer_labels() {
        let payload = br#"{"frame_id": 7, "boxes": [[0,0,1,1]], "labels": [2], "confidences": [0.9]}"#;
        let message = DetectionMessage::from_slice(payload).unwrap();
        assert_eq!(message.labels(), &[2.0]);
        assert_eq!(message.boxes(), &[[0.0, 0.0, 1.0, 1.0]]);
    }

    #[test]
    fn test_detection_message_rejects_mismatched_lengths() {
        let payload = br#"{"frame_id": 1, "boxes": [[0,0,1,1]], "labels": [], "confidences": [0.4]}"#;
        let err = DetectionMessage::from_slice(payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deserialization);
    }

    #[test]
    fn test_detection_message_rejects_out_of_range_confidence() {
        let payload = br#"{"frame_id": 1, "boxes": [[0,0,1,1]], "labels": [0], "confidences": [1.5]}"#;
        assert!(DetectionMessage::from_slice(payload).is_err());
    }

    #[test]
    fn test_confidence_is_clamped_on_construction() {
        let message = DetectionMessage::new(
            1,
            [Detection {
                bbox: [0.0; 4],
                label: 0.0,
                confidence: 1.2,
            }],
        );
        assert_eq!(message.confidences(), &[1.0]);
    }

    #[test]
    fn test_non_finite_detections_are_detected() {
        let finite = Detection {
            bbox: [0.0, 0.0, 1.0, 1.0],
            label: 0.0,
            confidence: 0.5,
        };
        assert!(finite.is_finite());
        assert!(!Detection {
            confidence: f32::NAN,
            ..finite
        }
        .is_finite());
        assert!(!Detection {
            bbox: [0.0, 0.0, f32::INFINITY, 1.0],
            ..finite
        }
        .is_finite());
    }
}
