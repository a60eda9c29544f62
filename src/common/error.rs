use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Session expired, please log in again")]
    SessionExpired,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AttendanceError {
    /// Message shown to the operator, mirroring what the backend said when it said anything.
    pub fn user_message(&self) -> String {
        match self {
            AttendanceError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AttendanceError::Api { status: 401, .. } | AttendanceError::SessionExpired)
    }
}

pub type Result<T> = std::result::Result<T, AttendanceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_surface_backend_message() {
        let err = AttendanceError::Api { status: 400, message: "Face not recognized".into() };
        assert_eq!(err.user_message(), "Face not recognized");
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn session_expiry_counts_as_unauthorized() {
        assert!(AttendanceError::SessionExpired.is_unauthorized());
        assert!(AttendanceError::Api { status: 401, message: String::new() }.is_unauthorized());
    }
}
