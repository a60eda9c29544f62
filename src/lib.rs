pub mod camera;
pub mod cli;
pub mod common;
pub mod core;
pub mod service;
pub mod session;

// Re-export commonly used types
pub use common::{AttendanceError, Config, DevMode, Result};
pub use core::{CaptureController, DatasetUploader, FaceDetector, RecognitionOutcome};
pub use service::{protocol, ApiClient};
pub use session::Session;
