use crate::common::config::{CaptureConfig, DetectorConfig};
use crate::common::{AttendanceError, Result};
use crate::core::cascade::{intensity_stats, DetectParams, HaarCascade};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    Cascade,
    Heuristic,
}

impl fmt::Display for DetectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorMode::Cascade => f.write_str("cascade"),
            DetectorMode::Heuristic => f.write_str("heuristic"),
        }
    }
}

/// Face region in frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Raw result for a single frame, before temporal smoothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameDetection {
    pub detected: bool,
    pub boxes: Vec<FaceBox>,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
}

pub trait FrameDetector: Send {
    fn mode(&self) -> DetectorMode;
    fn detect_frame(&mut self, frame: &DynamicImage) -> Result<FrameDetection>;
}

pub struct CascadeDetector {
    cascade: HaarCascade,
    downscale: f32,
    params: DetectParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, config: &DetectorConfig) -> Self {
        Self {
            cascade,
            downscale: config.downscale,
            params: DetectParams {
                scale_factor: config.scale_factor as f64,
                min_neighbors: config.min_neighbors,
                min_size: (0, 0),
            },
        }
    }
}

impl FrameDetector for CascadeDetector {
    fn mode(&self) -> DetectorMode {
        DetectorMode::Cascade
    }

    fn detect_frame(&mut self, frame: &DynamicImage) -> Result<FrameDetection> {
        let (width, height) = (frame.width(), frame.height());
        let small_w = ((width as f32) * self.downscale).round() as u32;
        let small_h = ((height as f32) * self.downscale).round() as u32;
        let (win_w, win_h) = self.cascade.window_size();
        if small_w < win_w || small_h < win_h {
            return Err(AttendanceError::Detector(format!(
                "Frame {}x{} is smaller than the {}x{} cascade window", width, height, win_w, win_h
            )));
        }

        let gray = frame.to_luma8();
        let small = if small_w == width && small_h == height {
            gray
        } else {
            imageops::resize(&gray, small_w, small_h, FilterType::Triangle)
        };

        let inv = 1.0 / self.downscale;
        let boxes: Vec<FaceBox> = self.cascade.detect_multi_scale(&small, &self.params)
            .into_iter()
            .map(|r| FaceBox {
                x1: r.left() as f32 * inv,
                y1: r.top() as f32 * inv,
                x2: (r.left() + r.width() as i32) as f32 * inv,
                y2: (r.top() + r.height() as i32) as f32 * inv,
            })
            .collect();

        Ok(FrameDetection { detected: !boxes.is_empty(), boxes, mean: None, stddev: None })
    }
}

/// "Something lit is in frame": mean intensity above a fixed threshold.
pub struct HeuristicDetector {
    mean_threshold: f64,
}

impl HeuristicDetector {
    pub fn new(mean_threshold: f32) -> Self {
        Self { mean_threshold: mean_threshold as f64 }
    }
}

impl FrameDetector for HeuristicDetector {
    fn mode(&self) -> DetectorMode {
        DetectorMode::Heuristic
    }

    fn detect_frame(&mut self, frame: &DynamicImage) -> Result<FrameDetection> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(AttendanceError::Detector("Empty frame".into()));
        }

        let (mean, stddev) = intensity_stats(&channel_average(frame));
        Ok(FrameDetection {
            detected: mean > self.mean_threshold,
            boxes: Vec::new(),
            mean: Some(mean),
            stddev: Some(stddev),
        })
    }
}

/// Unweighted (r + g + b) / 3 greyscale.
fn channel_average(frame: &DynamicImage) -> GrayImage {
    let rgb = frame.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y);
        Luma([((p[0] as u16 + p[1] as u16 + p[2] as u16) / 3) as u8])
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionState {
    pub face_present: bool,
    pub last_seen_at: Option<Instant>,
    pub mode: DetectorMode,
    pub boxes: Vec<FaceBox>,
}

/// Smoothed presence for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSignal {
    pub present: bool,
    /// Whether this tick itself saw a face, as opposed to presence carried by the grace window.
    pub detected_now: bool,
    pub mode: DetectorMode,
    pub boxes: Vec<FaceBox>,
    pub mean: Option<f64>,
}

pub struct FaceDetector {
    inner: Box<dyn FrameDetector>,
    grace: Duration,
    state: DetectionState,
}

impl FaceDetector {
    /// Picks cascade mode when the cascade asset loads, heuristic mode otherwise.
    pub fn load(detector: &DetectorConfig, capture: &CaptureConfig) -> Self {
        match HaarCascade::load(&detector.cascade_path) {
            Ok(cascade) => Self::with_detector(
                Box::new(CascadeDetector::new(cascade, detector)),
                Duration::from_millis(capture.cascade_grace_ms),
            ),
            Err(e) => {
                tracing::warn!("Cascade unavailable ({}), using brightness heuristic", e);
                Self::with_detector(
                    Box::new(HeuristicDetector::new(detector.heuristic_mean_threshold)),
                    Duration::from_millis(capture.heuristic_grace_ms),
                )
            }
        }
    }

    pub fn with_detector(inner: Box<dyn FrameDetector>, grace: Duration) -> Self {
        let mode = inner.mode();
        Self {
            inner,
            grace,
            state: DetectionState { face_present: false, last_seen_at: None, mode, boxes: Vec::new() },
        }
    }

    pub fn mode(&self) -> DetectorMode {
        self.state.mode
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    /// Never fails: a detector error leaves the last sighting in place, so presence
    /// decays through the grace window as if the frame were empty.
    pub fn detect(&mut self, frame: &DynamicImage, now: Instant) -> PresenceSignal {
        let (detected_now, mean) = match self.inner.detect_frame(frame) {
            Ok(detection) => {
                if detection.detected {
                    self.state.last_seen_at = Some(now);
                }
                self.state.boxes = detection.boxes;
                (detection.detected, detection.mean)
            }
            Err(e) => {
                tracing::debug!("Detector error, keeping last known presence: {}", e);
                (false, None)
            }
        };

        self.state.face_present = self.is_present_at(now);
        PresenceSignal {
            present: self.state.face_present,
            detected_now,
            mode: self.state.mode,
            boxes: self.state.boxes.clone(),
            mean,
        }
    }

    pub fn is_present_at(&self, now: Instant) -> bool {
        self.state.last_seen_at
            .map(|seen| now.saturating_duration_since(seen) < self.grace)
            .unwrap_or(false)
    }
}
