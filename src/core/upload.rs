//! Dataset upload with combined client/server progress.

use crate::common::config::UploadConfig;
use crate::common::{AttendanceError, Result};
use crate::service::protocol::{DatasetUploadResponse, UploadProgressReport};
use crate::service::ApiClient;
use futures::future::{BoxFuture, FutureExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

const UPLOADING: &str = "Uploading...";
const COMPLETE: &str = "Complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Transfer,
    Server,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub percent: u8,
    pub message: String,
    pub phase: UploadPhase,
}

/// Folds byte progress and server reports into one display value.
///
/// Until the transfer hits 100% or the server reports something above zero, the
/// client percent is shown with "Uploading...". After that the server's messages
/// take over for good. The shown percent is a running maximum.
#[derive(Debug, Clone)]
pub struct ProgressReducer {
    client_percent: u8,
    server_percent: Option<u8>,
    phase: UploadPhase,
    displayed: u8,
    message: String,
}

impl Default for ProgressReducer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReducer {
    pub fn new() -> Self {
        Self {
            client_percent: 0,
            server_percent: None,
            phase: UploadPhase::Transfer,
            displayed: 0,
            message: UPLOADING.to_string(),
        }
    }

    pub fn current(&self) -> UploadProgress {
        UploadProgress { percent: self.displayed, message: self.message.clone(), phase: self.phase }
    }

    /// Highest percent the server has reported so far.
    pub fn server_percent(&self) -> Option<u8> {
        self.server_percent
    }

    pub fn client(&mut self, percent: u8) -> UploadProgress {
        self.client_percent = self.client_percent.max(percent.min(100));
        if self.phase == UploadPhase::Transfer {
            self.displayed = self.displayed.max(self.client_percent);
            if self.client_percent >= 100 {
                self.phase = UploadPhase::Server;
            }
        }
        self.current()
    }

    pub fn server(&mut self, report: &UploadProgressReport) -> UploadProgress {
        if self.phase == UploadPhase::Complete {
            return self.current();
        }

        let percent = report.percent.unwrap_or(0.0).clamp(0.0, 100.0).round() as u8;
        self.server_percent = Some(self.server_percent.unwrap_or(0).max(percent));
        if percent > 0 {
            self.phase = UploadPhase::Server;
        }

        if self.phase == UploadPhase::Server {
            self.displayed = self.displayed.max(percent);
            if let Some(message) = report.message.as_deref().filter(|m| !m.is_empty()) {
                self.message = message.to_string();
            }
        }
        self.current()
    }

    pub fn finish(&mut self) -> UploadProgress {
        self.phase = UploadPhase::Complete;
        self.displayed = 100;
        self.message = COMPLETE.to_string();
        self.current()
    }
}

/// Base-36 millisecond timestamp followed by a random lowercase alphanumeric suffix.
pub fn generate_task_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}{}", to_base36(millis), suffix)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

pub fn validate_archive(archive: &Path) -> Result<()> {
    let is_zip = archive.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("zip"));
    if !is_zip {
        return Err(AttendanceError::InvalidInput("Please select a ZIP file".into()));
    }
    if !archive.is_file() {
        return Err(AttendanceError::InvalidInput(format!("{} not found", archive.display())));
    }
    Ok(())
}

async fn next_report(request: &mut Option<BoxFuture<'_, Result<UploadProgressReport>>>) -> Result<UploadProgressReport> {
    match request {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

pub struct DatasetUploader<'a> {
    client: &'a ApiClient,
    poll_interval: Duration,
}

impl<'a> DatasetUploader<'a> {
    pub fn new(client: &'a ApiClient, config: &UploadConfig) -> Self {
        Self { client, poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)) }
    }

    /// Uploads `archive` while polling server progress. The result comes from the transfer
    /// alone; polling stops as soon as it settles and poll failures are ignored.
    pub async fn upload(
        &self,
        archive: &Path,
        progress: mpsc::UnboundedSender<UploadProgress>,
    ) -> Result<DatasetUploadResponse> {
        validate_archive(archive)?;

        let task_id = generate_task_id();
        tracing::info!("Uploading dataset {} as task {}", archive.display(), task_id);

        let emit = |update: UploadProgress| {
            let _ = progress.send(update);
        };
        let mut reducer = ProgressReducer::new();
        emit(reducer.current());

        let (bytes_tx, mut bytes_rx) = mpsc::unbounded_channel();
        let transfer = self.client.upload_dataset(archive, &task_id, bytes_tx);
        tokio::pin!(transfer);

        let mut poll = time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report: Option<BoxFuture<'_, Result<UploadProgressReport>>> = None;

        let result = loop {
            tokio::select! {
                result = &mut transfer => break result,
                Some(percent) = bytes_rx.recv() => emit(reducer.client(percent)),
                _ = poll.tick(), if report.is_none() => {
                    report = Some(self.client.upload_progress(&task_id).boxed());
                }
                polled = next_report(&mut report), if report.is_some() => {
                    report = None;
                    match polled {
                        Ok(server) => emit(reducer.server(&server)),
                        Err(e) => tracing::debug!("Progress poll for {} failed: {}", task_id, e),
                    }
                }
            }
        };
        drop(report);

        while let Ok(percent) = bytes_rx.try_recv() {
            emit(reducer.client(percent));
        }
        emit(reducer.finish());

        match &result {
            Ok(summary) => tracing::info!(
                "Dataset processed: {}/{} valid images, {} students mapped",
                summary.valid_images, summary.total_images, summary.mapped_students
            ),
            Err(e) => tracing::warn!("Dataset upload failed: {}", e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::BackendConfig;
    use crate::service::client::test_server;
    use crate::session::{MemoryTokenStore, Session, TokenPair};
    use axum::extract::{Multipart, Query};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn report(percent: f64, message: &str) -> UploadProgressReport {
        UploadProgressReport { percent: Some(percent), message: Some(message.into()), status: None }
    }

    #[test]
    fn transfer_phase_shows_client_percent() {
        let mut reducer = ProgressReducer::new();
        assert_eq!(reducer.client(40).percent, 40);

        // Server still idle: its zero report doesn't change the display.
        let shown = reducer.server(&report(0.0, "Initializing..."));
        assert_eq!(shown, UploadProgress { percent: 40, message: UPLOADING.into(), phase: UploadPhase::Transfer });
    }

    #[test]
    fn completed_transfer_then_server_messages_never_regress() {
        let mut reducer = ProgressReducer::new();
        reducer.client(60);
        let done = reducer.client(100);
        assert_eq!((done.percent, done.message.as_str()), (100, UPLOADING));

        let first = reducer.server(&report(10.0, "Extracting images..."));
        assert_eq!(first.percent, 100);
        assert_eq!(first.message, "Extracting images...");
        assert_eq!(first.phase, UploadPhase::Server);

        let second = reducer.server(&report(55.0, "Encoding faces (55/100)"));
        assert_eq!(second.percent, 100);
        assert_eq!(second.message, "Encoding faces (55/100)");
    }

    #[test]
    fn server_progress_switches_modes_permanently() {
        let mut reducer = ProgressReducer::new();
        reducer.client(20);
        let server = reducer.server(&report(35.0, "Validating archive"));
        assert_eq!((server.percent, server.phase), (35, UploadPhase::Server));

        // Late byte progress no longer drives the display.
        let later = reducer.client(30);
        assert_eq!((later.percent, later.message.as_str()), (35, "Validating archive"));

        let lower = reducer.server(&report(5.0, "Restarting"));
        assert_eq!(lower.percent, 35);
    }

    #[test]
    fn finish_reports_complete() {
        let mut reducer = ProgressReducer::new();
        reducer.client(12);
        assert_eq!(
            reducer.finish(),
            UploadProgress { percent: 100, message: COMPLETE.into(), phase: UploadPhase::Complete }
        );
        assert_eq!(reducer.server(&report(40.0, "stale")).message, COMPLETE);
    }

    #[test]
    fn task_ids_are_lowercase_and_unique() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36 * 36), "100");
    }

    #[test]
    fn non_zip_archives_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.tar");
        std::fs::write(&path, b"data").unwrap();
        assert!(matches!(validate_archive(&path), Err(AttendanceError::InvalidInput(_))));
        assert!(matches!(validate_archive(&dir.path().join("missing.zip")), Err(AttendanceError::InvalidInput(_))));
    }

    fn archive(size: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        file.write_all(&vec![7u8; size]).unwrap();
        file.flush().unwrap();
        file
    }

    async fn client_for(app: Router) -> ApiClient {
        let base_url = test_server::spawn(app).await;
        let tokens = TokenPair { access: "a".into(), refresh: "r".into() };
        let session = Arc::new(Session::init(Box::new(MemoryTokenStore::with_tokens(tokens))).unwrap());
        ApiClient::new(&BackendConfig { base_url, timeout_seconds: 5 }, session).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadProgress>) -> Vec<UploadProgress> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    #[tokio::test]
    async fn upload_combines_transfer_and_server_progress() {
        let uploaded_task = Arc::new(Mutex::new(None::<String>));
        let polled_tasks = Arc::new(Mutex::new(Vec::<String>::new()));
        let polls = Arc::new(AtomicU32::new(0));

        let upload_seen = uploaded_task.clone();
        let poll_seen = polled_tasks.clone();
        let poll_count = polls.clone();
        let app = Router::new()
            .route("/api/attendance/face/dataset/upload/", post(move |mut multipart: Multipart| {
                let seen = upload_seen.clone();
                async move {
                    let mut dataset_len = 0;
                    while let Some(field) = multipart.next_field().await.unwrap() {
                        let name = field.name().map(str::to_owned);
                        match name.as_deref() {
                            Some("dataset") => dataset_len = field.bytes().await.unwrap().len(),
                            Some("task_id") => {
                                let task = field.text().await.unwrap();
                                *seen.lock().unwrap() = Some(task);
                            }
                            _ => {}
                        }
                    }
                    assert_eq!(dataset_len, 64 * 1024);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Json(json!({
                        "message": "Dataset processed",
                        "total_images": 40,
                        "valid_images": 38,
                        "mapped_students": 12,
                        "unmapped_students": 2,
                        "auto_training": {"triggered": true, "success": true, "processed": 38}
                    }))
                }
            }))
            .route("/api/attendance/face/dataset/progress/", get(
                move |Query(q): Query<HashMap<String, String>>| {
                    let seen = poll_seen.clone();
                    let count = poll_count.clone();
                    async move {
                        seen.lock().unwrap().push(q.get("task_id").cloned().unwrap_or_default());
                        let n = count.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"percent": (n * 10).min(90), "message": format!("Processing step {}", n)}))
                    }
                },
            ));
        let client = client_for(app).await;
        let uploader = DatasetUploader::new(&client, &UploadConfig { poll_interval_ms: 20 });
        let file = archive(64 * 1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = uploader.upload(file.path(), tx).await.unwrap();
        assert_eq!(summary.valid_images, 38);
        assert_eq!(summary.unmapped_students, 2);
        assert!(summary.auto_training.map_or(false, |a| a.triggered));

        let task = uploaded_task.lock().unwrap().clone().unwrap();
        let polled = polled_tasks.lock().unwrap().clone();
        assert!(!polled.is_empty());
        assert!(polled.iter().all(|t| *t == task));

        let updates = drain(&mut rx);
        assert!(updates.windows(2).all(|w| w[1].percent >= w[0].percent));
        assert!(updates.iter().any(|u| u.message == UPLOADING && u.percent == 100));
        assert!(updates.iter().any(|u| u.message.starts_with("Processing step")));
        assert_eq!(updates.last().map(|u| (u.percent, u.message.as_str())), Some((100, COMPLETE)));

        // No polling once the transfer settled.
        let after = polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(polls.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn failing_progress_endpoint_does_not_fail_upload() {
        let app = Router::new()
            .route("/api/attendance/face/dataset/upload/", post(|mut multipart: Multipart| async move {
                while let Some(field) = multipart.next_field().await.unwrap() {
                    let _ = field.bytes().await.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(80)).await;
                Json(json!({
                    "message": "ok", "total_images": 1, "valid_images": 1,
                    "mapped_students": 1, "unmapped_students": 0
                }))
            }))
            .route("/api/attendance/face/dataset/progress/", get(|| async {
                (StatusCode::INTERNAL_SERVER_ERROR, "boom")
            }));
        let client = client_for(app).await;
        let uploader = DatasetUploader::new(&client, &UploadConfig { poll_interval_ms: 10 });
        let file = archive(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = uploader.upload(file.path(), tx).await.unwrap();
        assert_eq!(summary.total_images, 1);
        assert!(summary.auto_training.is_none());
        assert_eq!(drain(&mut rx).last().map(|u| u.phase), Some(UploadPhase::Complete));
    }

    #[tokio::test]
    async fn rejected_transfer_still_completes_display() {
        let app = Router::new().route("/api/attendance/face/dataset/upload/", post(|mut multipart: Multipart| async move {
            while let Some(field) = multipart.next_field().await.unwrap() {
                let _ = field.bytes().await.unwrap();
            }
            (StatusCode::BAD_REQUEST, Json(json!({"error": "No valid images found in archive"})))
        }));
        let client = client_for(app).await;
        let uploader = DatasetUploader::new(&client, &UploadConfig::default());
        let file = archive(512);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = uploader.upload(file.path(), tx).await.unwrap_err();
        assert_eq!(err.user_message(), "No valid images found in archive");
        assert_eq!(drain(&mut rx).last().map(|u| u.message.clone()), Some(COMPLETE.to_string()));
    }
}
