//! Detector abstraction and backend-independent post-processing.

use argus_pipeline::{Detection, PipelineError};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;

/// Object detector invoked once per frame.
///
/// `frame` holds encoded image bytes (JPEG or PNG). The prompt describes
/// which classes the caller is interested in; backends that cannot honour it
/// may ignore it.
#[cfg_attr(test, mockall::automock)]
pub trait Detector {
    fn infer(&self, frame: &[u8], prompt: &str) -> Result<Vec<Detection>, PipelineError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn infer(&self, frame: &[u8], prompt: &str) -> Result<Vec<Detection>, PipelineError> {
        (**self).infer(frame, prompt)
    }
}

/// Class names requested by a prompt such as `"detect person, car, bike"`.
pub fn prompt_classes(prompt: &str) -> Vec<String> {
    let prompt = prompt.trim();
    let body = match prompt.get(..6) {
        Some(head)
            if head.eq_ignore_ascii_case("detect")
                && prompt[6..].chars().next().map_or(true, char::is_whitespace) =>
        {
            &prompt[6..]
        }
        _ => prompt,
    };

    body.split(',')
        .map(|class| class.trim().to_lowercase())
        .filter(|class| !class.is_empty())
        .collect()
}

/// Label indices the prompt asks for, or `None` when every class should be reported.
///
/// Falls back to `None` when none of the requested names is a known label.
pub fn class_filter(labels: &[String], prompt: &str) -> Option<HashSet<usize>> {
    let requested = prompt_classes(prompt);
    if requested.is_empty() {
        return None;
    }

    let allowed: HashSet<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, label)| requested.iter().any(|r| label.eq_ignore_ascii_case(r)))
        .map(|(idx, _)| idx)
        .collect();

    if allowed.is_empty() {
        None
    } else {
        Some(allowed)
    }
}

/// Read class names, one per line.
pub fn load_labels(path: &Path) -> Result<Vec<String>, PipelineError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::ModelLoad(format!("failed to read labels {}: {}", path.display(), e))
    })?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Intersection over union of two `[x1, y1, x2, y2]` boxes
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);

    let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy per-class non-maximum suppression, highest confidence first.
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.label == candidate.label && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], label: f32, confidence: f32) -> Detection {
        Detection {
            bbox,
            label,
            confidence,
        }
    }

    fn labels() -> Vec<String> {
        ["person", "bicycle", "car", "bike"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_prompt_classes() {
        assert_eq!(
            prompt_classes("detect person, car, bike"),
            vec!["person", "car", "bike"]
        );
        assert_eq!(prompt_classes("Detect Car"), vec!["car"]);
        assert_eq!(prompt_classes("person,,  dog "), vec!["person", "dog"]);
        assert!(prompt_classes("").is_empty());
        assert!(prompt_classes("detect").is_empty());
        assert_eq!(prompt_classes("detective"), vec!["detective"]);
    }

    #[test]
    fn test_class_filter_matches_known_labels() {
        let allowed = class_filter(&labels(), "detect person, car").unwrap();
        assert_eq!(allowed, HashSet::from([0, 2]));
    }

    #[test]
    fn test_class_filter_falls_back_to_all_classes() {
        assert!(class_filter(&labels(), "detect unicorn").is_none());
        assert!(class_filter(&labels(), "").is_none());
        assert!(class_filter(&[], "detect person").is_none());
    }

    #[test]
    fn test_load_labels_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "person\n\n car \nbike\n").unwrap();

        assert_eq!(load_labels(&path).unwrap(), vec!["person", "car", "bike"]);
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert!((iou(&a, &[5.0, 0.0, 15.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping_boxes_of_same_class() {
        let kept = non_max_suppression(
            vec![
                det([0.0, 0.0, 10.0, 10.0], 0.0, 0.6),
                det([1.0, 1.0, 10.0, 10.0], 0.0, 0.9),
                det([1.0, 1.0, 10.0, 10.0], 2.0, 0.5),
                det([50.0, 50.0, 60.0, 60.0], 0.0, 0.4),
            ],
            0.45,
            100,
        );

        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].label, 2.0);
        assert_eq!(kept[2].confidence, 0.4);
    }

    #[test]
    fn test_nms_respects_max_detections() {
        let candidates = (0..10)
            .map(|i| det([i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0], 0.0, 0.5))
            .collect();

        assert_eq!(non_max_suppression(candidates, 0.45, 3).len(), 3);
    }
}
