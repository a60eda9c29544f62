use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{AttendanceError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String { "http://localhost:8000/api".to_string() }
fn default_timeout_seconds() -> u64 { 120 }

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    /// Replay still images from this directory instead of opening a device.
    #[serde(default)]
    pub frames_dir: Option<PathBuf>,
}

fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 3 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_width(),
            height: default_height(),
            warmup_frames: default_warmup_frames(),
            frames_dir: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_cascade_path")]
    pub cascade_path: PathBuf,
    #[serde(default = "default_downscale")]
    pub downscale: f32,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,
    #[serde(default = "default_min_neighbors")]
    pub min_neighbors: u32,
    #[serde(default = "default_mean_threshold")]
    pub heuristic_mean_threshold: f32,
}

fn default_cascade_path() -> PathBuf { PathBuf::from("models/haarcascade_frontalface_default.xml") }
fn default_downscale() -> f32 { 0.5 }
fn default_scale_factor() -> f32 { 1.1 }
fn default_min_neighbors() -> u32 { 3 }
fn default_mean_threshold() -> f32 { 10.0 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cascade_path: default_cascade_path(),
            downscale: default_downscale(),
            scale_factor: default_scale_factor(),
            min_neighbors: default_min_neighbors(),
            heuristic_mean_threshold: default_mean_threshold(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_true")]
    pub auto_capture: bool,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_ms: u64,
    #[serde(default = "default_cascade_cooldown")]
    pub cascade_cooldown_ms: u64,
    #[serde(default = "default_heuristic_cooldown")]
    pub heuristic_cooldown_ms: u64,
    #[serde(default = "default_cascade_grace")]
    pub cascade_grace_ms: u64,
    #[serde(default = "default_heuristic_grace")]
    pub heuristic_grace_ms: u64,
    #[serde(default = "default_success_overlay")]
    pub success_overlay_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_true() -> bool { true }
fn default_tick_interval() -> u64 { 33 }
fn default_evaluation_interval() -> u64 { 500 }
fn default_cascade_cooldown() -> u64 { 800 }
fn default_heuristic_cooldown() -> u64 { 3000 }
fn default_cascade_grace() -> u64 { 500 }
fn default_heuristic_grace() -> u64 { 1000 }
fn default_success_overlay() -> u64 { 2000 }
fn default_jpeg_quality() -> u8 { 95 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            auto_capture: true,
            tick_interval_ms: default_tick_interval(),
            evaluation_interval_ms: default_evaluation_interval(),
            cascade_cooldown_ms: default_cascade_cooldown(),
            heuristic_cooldown_ms: default_heuristic_cooldown(),
            cascade_grace_ms: default_cascade_grace(),
            heuristic_grace_ms: default_heuristic_grace(),
            success_overlay_ms: default_success_overlay(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl CaptureConfig {
    pub fn tick_interval(&self) -> Duration { Duration::from_millis(self.tick_interval_ms) }
    pub fn evaluation_interval(&self) -> Duration { Duration::from_millis(self.evaluation_interval_ms) }
    pub fn success_overlay(&self) -> Duration { Duration::from_millis(self.success_overlay_ms) }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 { 500 }

impl Default for UploadConfig {
    fn default() -> Self {
        Self { poll_interval_ms: default_poll_interval() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SessionConfig {
    /// Where the token pair is persisted. Defaults to the per-user data directory.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

impl Config {
    /// Like [`Config::load_from_path`] but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AttendanceError::Config(format!(
                "Config file not found: {}. Please create it from configs/rollcall.toml.", path.display()
            )));
        }

        tracing::debug!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| AttendanceError::Config(format!("Config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backend.base_url.starts_with("http://") && !self.backend.base_url.starts_with("https://") {
            return Err(AttendanceError::Config(format!(
                "Backend base_url must be an http(s) URL, got {}", self.backend.base_url
            )));
        }

        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(AttendanceError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(AttendanceError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if self.detector.downscale <= 0.0 || self.detector.downscale > 1.0 {
            return Err(AttendanceError::Config(format!(
                "Detector downscale must be in (0, 1], got {}", self.detector.downscale
            )));
        }
        if self.detector.scale_factor <= 1.0 {
            return Err(AttendanceError::Config(format!(
                "Detector scale_factor must be greater than 1.0, got {}", self.detector.scale_factor
            )));
        }

        if self.capture.tick_interval_ms == 0 || self.capture.evaluation_interval_ms == 0 {
            return Err(AttendanceError::Config(
                "Capture tick and evaluation intervals must be non-zero".to_string()
            ));
        }
        if self.capture.jpeg_quality == 0 || self.capture.jpeg_quality > 100 {
            return Err(AttendanceError::Config(format!(
                "JPEG quality must be between 1 and 100, got {}", self.capture.jpeg_quality
            )));
        }

        if self.upload.poll_interval_ms == 0 {
            return Err(AttendanceError::Config("Upload poll interval must be non-zero".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_documented_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.backend.base_url, "http://localhost:8000/api");
        assert_eq!(config.capture.cascade_cooldown_ms, 800);
        assert_eq!(config.capture.heuristic_cooldown_ms, 3000);
        assert_eq!(config.capture.cascade_grace_ms, 500);
        assert_eq!(config.capture.heuristic_grace_ms, 1000);
        assert_eq!(config.detector.min_neighbors, 3);
        assert_eq!(config.upload.poll_interval_ms, 500);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [backend]
            base_url = "https://school.example/api"

            [capture]
            auto_capture = false
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.base_url, "https://school.example/api");
        assert_eq!(config.backend.timeout_seconds, 120);
        assert!(!config.capture.auto_capture);
        assert_eq!(config.capture.success_overlay_ms, 2000);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(Config::from_toml("[camera]\nwidth = 0").is_err());
        assert!(Config::from_toml("[detector]\nscale_factor = 1.0").is_err());
        assert!(Config::from_toml("[backend]\nbase_url = \"ftp://nope\"").is_err());
        assert!(Config::from_toml("[capture]\njpeg_quality = 0").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.camera.width, 640);
        assert!(Config::load_from_path(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn shipped_example_config_parses() {
        let config = Config::from_toml(include_str!("../../configs/rollcall.toml")).unwrap();
        assert_eq!(config.capture.evaluation_interval_ms, 500);
        assert_eq!(config.detector.heuristic_mean_threshold, 10.0);
        assert!(config.camera.frames_dir.is_none());
    }

    #[test]
    fn shipped_config_says_where_the_cascade_comes_from() {
        let text = include_str!("../../configs/rollcall.toml");
        let config = Config::from_toml(text).unwrap();
        let file = config.detector.cascade_path.file_name().unwrap().to_str().unwrap();

        assert_eq!(config.detector.cascade_path, DetectorConfig::default().cascade_path);
        assert!(text.lines().any(|l| l.starts_with('#') && l.contains("https://") && l.contains(file)));
    }
}
