//! Camera access behind two small traits.
//!
//! A [`CameraProvider`] grants (or denies) a stream for a set of [`CameraConstraints`];
//! the granted [`FrameSource`] is then owned by exactly one [`CameraSession`], which
//! guarantees the tracks are stopped once, whichever way the session ends.

pub mod replay;
#[cfg(feature = "v4l-camera")]
pub mod v4l2;

pub use replay::{ReplayProvider, ReplaySource};

use crate::common::config::CameraConfig;
use crate::common::{AttendanceError, Result};
use image::DynamicImage;

/// Stream request for the kiosk's user-facing camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl CameraConstraints {
    pub fn front_facing(config: &CameraConfig) -> Self {
        Self {
            ideal_width: config.width,
            ideal_height: config.height,
        }
    }
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self { ideal_width: 640, ideal_height: 480 }
    }
}

pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<DynamicImage>;

    /// Stops every track of the underlying stream. Called at most once by [`CameraSession`].
    fn stop_tracks(&mut self);

    fn describe(&self) -> String {
        "camera".to_string()
    }
}

pub trait CameraProvider: Send + Sync {
    fn acquire(&self, constraints: &CameraConstraints) -> Result<Box<dyn FrameSource>>;
}

pub struct CameraSession {
    source: Option<Box<dyn FrameSource>>,
}

impl CameraSession {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        tracing::debug!("Camera session opened on {}", source.describe());
        Self { source: Some(source) }
    }

    pub fn is_ready(&self) -> bool {
        self.source.is_some()
    }

    pub fn current_frame(&mut self) -> Result<DynamicImage> {
        match self.source.as_mut() {
            Some(source) => source.next_frame(),
            None => Err(AttendanceError::Camera("Camera session is closed".into())),
        }
    }

    /// Releases the stream. Returns `true` only for the call that actually released it.
    pub fn close(&mut self) -> bool {
        match self.source.take() {
            Some(mut source) => {
                source.stop_tracks();
                tracing::debug!("Camera tracks stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens the device configured in `[camera]`, or the replay directory when one is set.
pub struct DeviceProvider {
    config: CameraConfig,
}

impl DeviceProvider {
    pub fn new(config: &CameraConfig) -> Self {
        Self { config: config.clone() }
    }
}

impl CameraProvider for DeviceProvider {
    fn acquire(&self, constraints: &CameraConstraints) -> Result<Box<dyn FrameSource>> {
        if let Some(dir) = &self.config.frames_dir {
            return ReplayProvider::new(dir).acquire(constraints);
        }
        open_device(&self.config, constraints)
    }
}

#[cfg(feature = "v4l-camera")]
fn open_device(config: &CameraConfig, constraints: &CameraConstraints) -> Result<Box<dyn FrameSource>> {
    let camera = v4l2::V4l2Source::open(config.device_index, constraints, config.warmup_frames)?;
    Ok(Box::new(camera))
}

#[cfg(not(feature = "v4l-camera"))]
fn open_device(config: &CameraConfig, _constraints: &CameraConstraints) -> Result<Box<dyn FrameSource>> {
    Err(AttendanceError::Camera(format!(
        "Cannot open /dev/video{}: built without the v4l-camera feature (set camera.frames_dir to replay images)",
        config.device_index
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        stops: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingSource {
        fn next_frame(&mut self) -> Result<DynamicImage> {
            Ok(DynamicImage::new_luma8(4, 4))
        }

        fn stop_tracks(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tracks_are_stopped_exactly_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut session = CameraSession::new(Box::new(CountingSource { stops: stops.clone() }));
        assert!(session.current_frame().is_ok());

        assert!(session.close());
        assert!(!session.close());
        drop(session);

        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_session_refuses_frames() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut session = CameraSession::new(Box::new(CountingSource { stops }));
        session.close();
        assert!(!session.is_ready());
        assert!(matches!(session.current_frame(), Err(AttendanceError::Camera(_))));
    }

    #[test]
    fn drop_releases_unclosed_session() {
        let stops = Arc::new(AtomicUsize::new(0));
        drop(CameraSession::new(Box::new(CountingSource { stops: stops.clone() })));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[cfg(not(feature = "v4l-camera"))]
    #[test]
    fn device_without_backend_is_a_camera_error() {
        let provider = DeviceProvider::new(&CameraConfig::default());
        let err = provider.acquire(&CameraConstraints::default()).err().unwrap();
        assert!(matches!(err, AttendanceError::Camera(_)));
    }
}
