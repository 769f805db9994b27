//! Frame analysis sink.
//!
//! Decodes each delivered frame, downscales it for the detector and publishes
//! the resulting boxes, in frame coordinates, for the preview overlay. The
//! frame itself is never modified.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::capture::decoder::{self, DecodeError};
use crate::capture::SharedFrame;
use crate::error::{PipelineError, Result};
use crate::sink::FrameSink;
use crate::DetectionConfig;

/// Overlay colour, RGB
const BOX_COLOR: [u8; 3] = [0, 255, 0];
const BOX_THICKNESS: u32 = 3;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("detector failed: {0}")]
    Backend(String),
}

/// One box in pixel coordinates of the image it was found in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: (self.x as f32 * sx) as u32,
            y: (self.y as f32 * sy) as u32,
            w: (self.w as f32 * sx) as u32,
            h: (self.h as f32 * sy) as u32,
            confidence: self.confidence,
            label: self.label.clone(),
        }
    }

    fn area(&self) -> f32 {
        self.w as f32 * self.h as f32
    }

    /// Intersection over union
    pub fn iou(&self, other: &Detection) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        if right <= left || bottom <= top {
            return 0.0;
        }
        let inter = (right - left) as f32 * (bottom - top) as f32;
        inter / (self.area() + other.area() - inter)
    }
}

/// Object detector run by a [`DetectionSink`].
///
/// Called on the sink's dispatcher thread, one frame at a time.
pub trait Detector: Send {
    fn name(&self) -> &str;

    /// Find objects in a packed RGB24 image of `width` x `height`
    fn detect(&mut self, rgb: &[u8], width: u32, height: u32) -> std::result::Result<Vec<Detection>, DetectError>;
}

/// Places one to three random boxes per frame. Exercises the overlay path
/// without a model.
pub struct RandomBoxes {
    rng: StdRng,
}

impl RandomBoxes {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomBoxes {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for RandomBoxes {
    fn name(&self) -> &str {
        "random-boxes"
    }

    fn detect(&mut self, _rgb: &[u8], width: u32, height: u32) -> std::result::Result<Vec<Detection>, DetectError> {
        let count = self.rng.gen_range(1..=3);
        let x_max = width.saturating_sub(80).max(20);
        let y_max = height.saturating_sub(80).max(20);
        Ok((1..=count)
            .map(|i| Detection {
                x: self.rng.gen_range(20..=x_max),
                y: self.rng.gen_range(20..=y_max),
                w: self.rng.gen_range(40..=80),
                h: self.rng.gen_range(40..=80),
                confidence: self.rng.gen_range(0.7..0.99),
                label: format!("Box{i}"),
            })
            .collect())
    }
}

/// Drop boxes at or below `confidence`, then greedy non-maximum suppression:
/// a box overlapping a more confident one by more than `iou` is dropped.
pub fn suppress(mut detections: Vec<Detection>, confidence: f32, iou: f32) -> Vec<Detection> {
    detections.retain(|d| d.confidence > confidence);
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept.iter().all(|k| k.iou(&candidate) <= iou) {
            kept.push(candidate);
        }
    }
    kept
}

/// Outline every detection on a packed RGB24 image, clipped to its bounds
pub fn draw_boxes(rgb: &mut [u8], width: u32, height: u32, detections: &[Detection]) {
    if decoder::check_rgb(rgb, width, height).is_err() {
        return;
    }
    let mut fill = |x0: u32, y0: u32, x1: u32, y1: u32| {
        for y in y0..y1.min(height) {
            let row = (y * width) as usize * 3;
            for x in x0..x1.min(width) {
                let at = row + x as usize * 3;
                rgb[at..at + 3].copy_from_slice(&BOX_COLOR);
            }
        }
    };
    for d in detections {
        let (right, bottom) = (d.x + d.w, d.y + d.h);
        let t = BOX_THICKNESS.min(d.w).min(d.h);
        fill(d.x, d.y, right, d.y + t);
        fill(d.x, bottom.saturating_sub(t), right, bottom);
        fill(d.x, d.y, d.x + t, bottom);
        fill(right.saturating_sub(t), d.y, right, bottom);
    }
}

#[derive(Default)]
struct Shared {
    latest: ArcSwap<Vec<Detection>>,
    analyzed: AtomicU64,
}

/// Read side of a [`DetectionSink`], for the preview
#[derive(Clone)]
pub struct Overlay {
    shared: Arc<Shared>,
}

impl Overlay {
    /// Boxes from the most recently analysed frame
    pub fn detections(&self) -> Arc<Vec<Detection>> {
        self.shared.latest.load_full()
    }

    pub fn frames_analyzed(&self) -> u64 {
        self.shared.analyzed.load(Ordering::Acquire)
    }
}

pub struct DetectionSink {
    name: String,
    detector: Mutex<Box<dyn Detector>>,
    analysis_size: (u32, u32),
    confidence: f32,
    iou: f32,
    shared: Arc<Shared>,
}

impl DetectionSink {
    pub fn new(name: impl Into<String>, detector: Box<dyn Detector>, config: &DetectionConfig) -> Self {
        Self {
            name: name.into(),
            detector: Mutex::new(detector),
            analysis_size: (config.width.max(1), config.height.max(1)),
            confidence: config.confidence_threshold,
            iou: config.nms_threshold,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn overlay(&self) -> Overlay {
        Overlay {
            shared: self.shared.clone(),
        }
    }

    fn analyze(&self, frame: &SharedFrame) -> std::result::Result<Vec<Detection>, DetectError> {
        let (width, height) = (frame.meta.format.width, frame.meta.format.height);
        let rgb = decoder::decode_frame(frame)?;
        decoder::check_rgb(&rgb, width, height)?;

        let (aw, ah) = self.analysis_size;
        let small = if (aw, ah) == (width, height) {
            rgb
        } else {
            decoder::resize_nearest(&rgb, width, height, aw, ah)
        };

        let found = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(&small, aw, ah)?;

        let (sx, sy) = (width as f32 / aw as f32, height as f32 / ah as f32);
        Ok(suppress(found, self.confidence, self.iou)
            .iter()
            .map(|d| d.scaled(sx, sy))
            .collect())
    }
}

impl FrameSink for DetectionSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, frame: SharedFrame) -> Result<()> {
        let detections = self.analyze(&frame).map_err(|e| PipelineError::StreamInterrupted {
            sink: self.name.clone(),
            reason: e.to_string(),
        })?;
        trace!(sink = %self.name, sequence = frame.sequence(), boxes = detections.len(), "Frame analysed");
        self.shared.latest.store(Arc::new(detections));
        self.shared.analyzed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn detached(&self) {
        debug!(sink = %self.name, "Detection detached");
        self.shared.latest.store(Arc::new(Vec::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FormatSpec, Frame, FrameMetadata, PixelFormat};
    use bytes::Bytes;

    fn det(x: u32, y: u32, w: u32, h: u32, confidence: f32) -> Detection {
        Detection {
            x,
            y,
            w,
            h,
            confidence,
            label: "obj".into(),
        }
    }

    fn rgb_frame(width: u32, height: u32) -> SharedFrame {
        Arc::new(Frame::new(
            Bytes::from(vec![0u8; (width * height * 3) as usize]),
            FrameMetadata {
                sequence: 1,
                format: FormatSpec::new(PixelFormat::Rgb24, width, height, 30),
                stride: width * 3,
                missed_before: 0,
                device_timestamp: None,
            },
        ))
    }

    /// Reports one fixed box and the size it was asked to look at
    struct Fixed {
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl Detector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn detect(&mut self, rgb: &[u8], width: u32, height: u32) -> std::result::Result<Vec<Detection>, DetectError> {
            assert_eq!(rgb.len(), (width * height * 3) as usize);
            self.seen.lock().unwrap().push((width, height));
            Ok(vec![det(10, 20, 30, 40, 0.9), det(0, 0, 5, 5, 0.3)])
        }
    }

    #[test]
    fn boxes_are_scaled_back_to_frame_size() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = DetectionSink::new(
            "detect",
            Box::new(Fixed { seen: seen.clone() }),
            &DetectionConfig::default(),
        );
        let overlay = sink.overlay();

        sink.accept(rgb_frame(640, 480)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(320, 240)]);
        let boxes = overlay.detections();
        assert_eq!(boxes.len(), 1, "low-confidence box kept: {boxes:?}");
        assert_eq!((boxes[0].x, boxes[0].y, boxes[0].w, boxes[0].h), (20, 40, 60, 80));
        assert_eq!(overlay.frames_analyzed(), 1);

        sink.detached();
        assert!(overlay.detections().is_empty());
    }

    #[test]
    fn undecodable_frame_interrupts_the_sink() {
        let sink = DetectionSink::new("detect", Box::new(RandomBoxes::seeded(1)), &DetectionConfig::default());
        let broken = Arc::new(Frame::new(
            Bytes::from_static(&[0; 8]),
            FrameMetadata {
                sequence: 1,
                format: FormatSpec::new(PixelFormat::Yuyv, 64, 64, 30),
                stride: 128,
                missed_before: 0,
                device_timestamp: None,
            },
        ));
        let err = sink.accept(broken).unwrap_err();
        assert!(matches!(err, PipelineError::StreamInterrupted { sink, .. } if sink == "detect"));
        assert_eq!(sink.overlay().frames_analyzed(), 0);
    }

    struct Broken;

    impl Detector for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn detect(&mut self, _rgb: &[u8], _width: u32, _height: u32) -> std::result::Result<Vec<Detection>, DetectError> {
            Err(DetectError::Backend("model not loaded".into()))
        }
    }

    #[test]
    fn detector_failure_is_reported() {
        let config = DetectionConfig {
            width: 64,
            height: 48,
            ..DetectionConfig::default()
        };
        let sink = DetectionSink::new("detect", Box::new(Broken), &config);
        let err = sink.accept(rgb_frame(64, 48)).unwrap_err();
        assert!(err.to_string().contains("model not loaded"), "{err}");
        assert!(sink.overlay().detections().is_empty());
    }

    #[test]
    fn random_boxes_stay_in_range() {
        let mut detector = RandomBoxes::seeded(42);
        for _ in 0..100 {
            let boxes = detector.detect(&[], 320, 240).unwrap();
            assert!((1..=3).contains(&boxes.len()));
            for b in &boxes {
                assert!((20..=240).contains(&b.x) && (20..=160).contains(&b.y));
                assert!((40..=80).contains(&b.w) && (40..=80).contains(&b.h));
                assert!((0.7..0.99).contains(&b.confidence));
            }
        }
        let again = RandomBoxes::seeded(42).detect(&[], 320, 240).unwrap();
        assert_eq!(again, RandomBoxes::seeded(42).detect(&[], 320, 240).unwrap());
    }

    #[test]
    fn overlapping_boxes_keep_the_most_confident() {
        let kept = suppress(
            vec![
                det(0, 0, 100, 100, 0.7),
                det(5, 5, 100, 100, 0.9),
                det(300, 300, 50, 50, 0.8),
                det(0, 0, 10, 10, 0.65),
            ],
            0.65,
            0.45,
        );
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8]);
    }

    #[test]
    fn outlines_are_drawn_and_clipped() {
        let (w, h) = (10u32, 10u32);
        let mut rgb = vec![0u8; (w * h * 3) as usize];
        draw_boxes(&mut rgb, w, h, &[det(1, 1, 8, 8, 0.9), det(8, 8, 10, 10, 0.9)]);

        let px = |x: u32, y: u32| {
            let at = ((y * w + x) * 3) as usize;
            [rgb[at], rgb[at + 1], rgb[at + 2]]
        };
        assert_eq!(px(1, 1), BOX_COLOR);
        assert_eq!(px(8, 4), BOX_COLOR);
        assert_eq!(px(5, 5), [0, 0, 0]);
        assert_eq!(px(9, 9), BOX_COLOR);
        assert_eq!(px(0, 0), [0, 0, 0]);
    }
}
