use crate::common::AttendanceError;
use crate::service::protocol::RecognitionResponse;

/// Phrases the backend uses when a face was found but matched nobody.
const UNMATCHED_MARKERS: [&str; 2] = ["not recognized", "no matching"];

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutcome {
    Matched { student_id: String, student_name: String },
    Unmatched { message: String },
    Failed(String),
}

impl RecognitionOutcome {
    pub fn from_response(response: RecognitionResponse) -> Self {
        if response.success {
            return RecognitionOutcome::Matched {
                student_id: response.student_id.unwrap_or_default(),
                student_name: response.student_name.unwrap_or_default(),
            };
        }

        let message = response.error
            .or(response.message)
            .unwrap_or_else(|| "Recognition failed".to_string());
        Self::from_failure_message(message)
    }

    /// Backend rejections (often HTTP 400) carry the same wording as a `success: false` body.
    pub fn from_error(error: &AttendanceError) -> Self {
        match error {
            AttendanceError::Api { .. } => Self::from_failure_message(error.user_message()),
            other => RecognitionOutcome::Failed(other.user_message()),
        }
    }

    fn from_failure_message(message: String) -> Self {
        if is_unmatched_message(&message) {
            RecognitionOutcome::Unmatched { message }
        } else {
            RecognitionOutcome::Failed(message)
        }
    }
}

pub fn is_unmatched_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    UNMATCHED_MARKERS.iter().any(|m| lower.contains(m))
}
