pub mod capture;
pub mod cascade;
pub mod detector;
pub mod outcome;
pub mod overlay;
pub mod upload;

pub use capture::{CaptureController, CaptureEvent, CaptureHandle, CapturePhase, RecognitionBackend};
pub use detector::{DetectorMode, FaceBox, FaceDetector, PresenceSignal};
pub use outcome::RecognitionOutcome;
pub use upload::{DatasetUploader, ProgressReducer, UploadProgress};
