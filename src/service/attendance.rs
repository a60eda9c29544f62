use crate::common::{AttendanceError, Result};
use crate::core::capture::RecognitionBackend;
use crate::core::outcome::RecognitionOutcome;
use crate::service::client::{decode, ApiClient};
use crate::service::protocol::{
    DatasetUploadResponse, EnrolledStudents, ModelStatus, RecognitionResponse, RegistrationResponse,
    ReportKind, StudentRegistration, TrainingSummary, UploadProgressReport,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::io::ReaderStream;

/// Archive extraction and training run inside the request on the backend.
const LONG_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn jpeg_part(image: &[u8], file_name: &str) -> Result<Part> {
    Ok(Part::bytes(image.to_vec())
        .file_name(file_name.to_string())
        .mime_str("image/jpeg")?)
}

pub(crate) fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

impl ApiClient {
    pub async fn mark_attendance_face(&self, image: &[u8]) -> Result<RecognitionResponse> {
        let url = self.url("/attendance/face/record/");
        let response = self.send(|http| {
            let form = Form::new().part("image", jpeg_part(image, "capture.jpg")?);
            Ok(http.post(&url).multipart(form))
        }).await?;
        decode(response).await
    }

    pub async fn register_student_with_face(
        &self,
        student: &StudentRegistration,
        image: &[u8],
    ) -> Result<RegistrationResponse> {
        let url = self.url("/attendance/face/student/register/");
        let response = self.send(|http| {
            let mut form = Form::new();
            for (name, value) in student.form_fields() {
                form = form.text(name, value);
            }
            form = form.part("image", jpeg_part(image, &format!("{}.jpg", student.student_id))?);
            Ok(http.post(&url).multipart(form))
        }).await?;
        decode(response).await
    }

    /// Streams `archive` as the `dataset` field, reporting transfer percent on `progress`.
    pub async fn upload_dataset(
        &self,
        archive: &Path,
        task_id: &str,
        progress: UnboundedSender<u8>,
    ) -> Result<DatasetUploadResponse> {
        let url = self.url("/attendance/face/dataset/upload/");
        let file_name = archive.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset.zip".to_string());

        let response = self.send(|http| {
            let file = std::fs::File::open(archive)?;
            let total = file.metadata()?.len();
            let sent = Arc::new(AtomicU64::new(0));
            let progress = progress.clone();

            let stream = ReaderStream::new(tokio::fs::File::from_std(file)).inspect_ok(move |chunk| {
                let done = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
                let _ = progress.send(percent_of(done, total));
            });

            let part = Part::stream_with_length(Body::wrap_stream(stream), total)
                .file_name(file_name.clone())
                .mime_str("application/zip")?;
            let form = Form::new()
                .part("dataset", part)
                .text("task_id", task_id.to_string());

            Ok(http.post(&url).multipart(form).timeout(LONG_REQUEST_TIMEOUT))
        }).await?;

        decode(response).await
    }

    pub async fn upload_progress(&self, task_id: &str) -> Result<UploadProgressReport> {
        let url = self.url("/attendance/face/dataset/progress/");
        let response = self.send(|http| Ok(http.get(&url).query(&[("task_id", task_id)]))).await?;
        decode(response).await
    }

    pub async fn train_model(&self) -> Result<TrainingSummary> {
        let url = self.url("/attendance/face/model/train/");
        let response = self.send(|http| Ok(http.post(&url).timeout(LONG_REQUEST_TIMEOUT))).await?;
        decode(response).await
    }

    pub async fn model_status(&self) -> Result<ModelStatus> {
        self.get_json("/attendance/face/model/status/").await
    }

    pub async fn enrolled_students(&self) -> Result<EnrolledStudents> {
        self.get_json("/attendance/face/enrolled-students/").await
    }

    /// Reports are rendered server-side; the blob is returned untouched.
    pub async fn download_report(&self, kind: &ReportKind) -> Result<Vec<u8>> {
        self.get_bytes(&kind.path()).await
    }
}

#[async_trait]
impl RecognitionBackend for ApiClient {
    async fn recognize(&self, image: Vec<u8>) -> RecognitionOutcome {
        match self.mark_attendance_face(&image).await {
            Ok(response) => RecognitionOutcome::from_response(response),
            Err(e) => {
                tracing::debug!("Recognition request failed: {}", e);
                RecognitionOutcome::from_error(&e)
            }
        }
    }

    async fn register(&self, student: &StudentRegistration, image: Vec<u8>) -> Result<RegistrationResponse> {
        let response = self.register_student_with_face(student, &image).await?;
        if !response.success {
            return Err(AttendanceError::Api { status: 200, message: response.message });
        }
        Ok(response)
    }
}
