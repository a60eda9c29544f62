use serde::{Deserialize, Serialize};
use std::fmt;

// Auth

#[derive(Serialize, Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    pub user: UserProfile,
}

#[derive(Serialize, Debug, Clone)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RefreshResponse {
    pub access: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Auxiliary,
    Student,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::Admin => "Administrator",
            Role::Teacher => "Teacher",
            Role::Auxiliary => "Auxiliary Staff",
            Role::Student => "Student",
        };
        f.write_str(label)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub role: Role,
    #[serde(default)]
    pub school_name: Option<String>,
    #[serde(default)]
    pub phone_number: String,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

/// Fields accepted by the profile update endpoint; absent fields are left unchanged.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

// Error bodies. DRF answers with `error`, `detail` or `message` depending on the view.

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn best_message(&self) -> Option<String> {
        self.error.clone()
            .or_else(|| self.detail.clone())
            .or_else(|| self.message.clone())
    }
}

// Face recognition

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RecognitionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub already_recorded: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct StudentRegistration {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub grade: String,
    pub gender: Option<String>,
    pub parent_email: Option<String>,
}

impl StudentRegistration {
    /// Multipart text fields in the order the backend serializer reads them.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("student_id", self.student_id.clone()),
            ("first_name", self.first_name.clone()),
            ("last_name", self.last_name.clone()),
            ("grade", self.grade.clone()),
        ];
        if let Some(gender) = &self.gender {
            fields.push(("gender", gender.clone()));
        }
        if let Some(email) = &self.parent_email {
            fields.push(("parent_email", email.clone()));
        }
        fields
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RegistrationResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub student_name: Option<String>,
}

// Dataset upload

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AutoTraining {
    #[serde(default)]
    pub triggered: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub processed: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DatasetUploadResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub total_images: u64,
    #[serde(default)]
    pub valid_images: u64,
    #[serde(default)]
    pub mapped_students: u64,
    #[serde(default)]
    pub unmapped_students: u64,
    #[serde(default)]
    pub auto_training: Option<AutoTraining>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UploadProgressReport {
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

// Model

#[derive(Deserialize, Debug, Clone)]
pub struct TrainingSummary {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub dataset_size: u64,
    #[serde(default)]
    pub unique_students: u64,
    #[serde(default)]
    pub training_duration_seconds: f64,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LatestModel {
    pub version: String,
    #[serde(default)]
    pub training_date: Option<String>,
    #[serde(default)]
    pub dataset_size: u64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub training_duration_seconds: Option<f64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ModelStatus {
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub enrolled_students: u64,
    #[serde(default)]
    pub total_face_images: u64,
    #[serde(default)]
    pub encoding_count: u64,
    #[serde(default)]
    pub latest_model: Option<LatestModel>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EnrolledStudent {
    pub student_id: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub face_images_count: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EnrolledStudents {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub students: Vec<EnrolledStudent>,
}

// Reports

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportKind {
    Daily { date: String },
    Monthly { year: i32, month: u32 },
    Student { student_id: String },
}

impl ReportKind {
    pub fn path(&self) -> String {
        match self {
            ReportKind::Daily { date } => format!("/reports/daily/{}/", date),
            ReportKind::Monthly { year, month } => format!("/reports/monthly/{}/{}/", year, month),
            ReportKind::Student { student_id } => format!("/reports/student/{}/", student_id),
        }
    }

    /// File name the backend suggests in its Content-Disposition header.
    pub fn file_name(&self) -> String {
        match self {
            ReportKind::Daily { date } => format!("daily_report_{}.pdf", date),
            ReportKind::Monthly { year, month } => format!("monthly_report_{}_{}.pdf", year, month),
            ReportKind::Student { student_id } => format!("student_report_{}.pdf", student_id),
        }
    }
}
