use rollcall::camera::{CameraConstraints, DeviceProvider};
use rollcall::cli::{self, progress_line};
use rollcall::common::{default_config_file, default_reports_dir, default_token_file, AttendanceError, Config, DevMode};
use rollcall::core::capture::{CaptureController, RecognitionBackend};
use rollcall::core::detector::FaceDetector;
use rollcall::core::overlay;
use rollcall::core::upload::DatasetUploader;
use rollcall::service::protocol::{ProfileUpdate, ReportKind, StudentRegistration};
use rollcall::service::ApiClient;
use rollcall::session::{FileTokenStore, Session, SessionStatus};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "School attendance kiosk: face recognition check-in and dataset management")]
struct Cli {
    /// Enable development mode (keeps captures and debug frames under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file (default: configs/rollcall.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the attendance backend
    Login {
        #[arg(short, long)]
        username: String,
        /// Prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Log out and forget stored tokens
    Logout,
    /// Show the logged-in user
    Whoami,
    /// Update the logged-in user's profile
    UpdateProfile {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        phone_number: Option<String>,
    },
    /// Mark attendance from the camera
    Scan {
        /// Disable auto-capture; press space to capture
        #[arg(long)]
        manual: bool,
        /// Replay images from a directory instead of opening the camera
        #[arg(long)]
        frames_dir: Option<PathBuf>,
        /// Draw the camera feed as ASCII art
        #[arg(long)]
        preview: bool,
    },
    /// Upload a ZIP of labelled face images
    UploadDataset {
        archive: PathBuf,
    },
    /// Retrain the recognition model
    Train,
    /// Show recognition model status
    ModelStatus,
    /// List students with enrolled faces
    Enrolled,
    /// Register a student from a face photo
    Register {
        #[arg(long)]
        student_id: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        grade: String,
        #[arg(long)]
        gender: Option<String>,
        #[arg(long)]
        parent_email: Option<String>,
        image: PathBuf,
    },
    /// Download an attendance report
    Report {
        #[command(subcommand)]
        kind: ReportCommands,
        /// Output file (default: reports directory, backend file name)
        #[arg(long, global = true)]
        out: Option<PathBuf>,
    },
    /// Run the local face detector on a still image
    Detect {
        image: PathBuf,
        /// Save an annotated copy here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List video devices
    ListCameras,
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Daily report (default: today)
    Daily {
        date: Option<String>,
    },
    Monthly {
        year: i32,
        month: u32,
    },
    Student {
        student_id: String,
    },
}

impl ReportCommands {
    fn into_kind(self) -> ReportKind {
        match self {
            ReportCommands::Daily { date } => ReportKind::Daily {
                date: date.unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string()),
            },
            ReportCommands::Monthly { year, month } => ReportKind::Monthly { year, month },
            ReportCommands::Student { student_id } => ReportKind::Student { student_id },
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    let dev_mode = DevMode::new(cli.dev)?;
    let config_path = cli.config.unwrap_or_else(default_config_file);
    let config = Config::load_or_default(&config_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    // A 401 on login means bad credentials, not an expired session.
    let logging_in = matches!(cli.command, Commands::Login { .. });
    let result = runtime.block_on(run(cli.command, config, dev_mode));
    if let Err(e) = &result {
        let unauthorized = e.downcast_ref::<AttendanceError>().map_or(false, AttendanceError::is_unauthorized);
        if unauthorized && !logging_in {
            eprintln!("Session expired. Run `rollcall login` again.");
        }
    }
    result
}

async fn run(command: Commands, config: Config, dev_mode: DevMode) -> Result<()> {
    let token_file = dev_mode.token_file()
        .or_else(|| config.session.token_file.clone())
        .unwrap_or_else(default_token_file);
    let session = Arc::new(Session::init(Box::new(FileTokenStore::new(token_file)))?);
    let client = ApiClient::new(&config.backend, session.clone())?;

    match command {
        Commands::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => cli::read_secret("Password").context("Failed to read password")?,
            };
            let user = client.login(&username, &password).await?;
            println!("✅ Logged in as {} ({:?})", user.username, user.role);
        }
        Commands::Logout => {
            client.logout().await?;
            println!("Logged out");
        }
        Commands::Whoami => {
            require_login(&session)?;
            let user = client.profile().await?;
            println!("{} {} <{}>", user.first_name, user.last_name, user.email);
            println!("  username: {}", user.username);
            println!("  role:     {:?}", user.role);
            if let Some(school) = &user.school_name {
                println!("  school:   {}", school);
            }
        }
        Commands::UpdateProfile { email, first_name, last_name, phone_number } => {
            require_login(&session)?;
            let update = ProfileUpdate { email, first_name, last_name, phone_number };
            let user = client.update_profile(&update).await?;
            println!("✅ Profile updated for {}", user.username);
        }
        Commands::Scan { manual, frames_dir, preview } => {
            require_login(&session)?;

            let mut camera_config = config.camera.clone();
            if frames_dir.is_some() {
                camera_config.frames_dir = frames_dir;
            }
            let mut capture_config = config.capture.clone();
            if manual {
                capture_config.auto_capture = false;
            }

            let detector = FaceDetector::load(&config.detector, &capture_config);
            println!("Face detector: {}", detector.mode());

            let backend: Arc<dyn RecognitionBackend> = Arc::new(client);
            let (controller, handle, events) = CaptureController::new(
                &capture_config,
                CameraConstraints::front_facing(&camera_config),
                detector,
                Box::new(DeviceProvider::new(&camera_config)),
                backend,
                dev_mode.clone(),
            );
            let result = cli::run_scan(controller, handle, events, preview, capture_config.auto_capture).await;

            if session.status() == SessionStatus::LoginRequired {
                println!("Session expired. Run `rollcall login` again.");
            }
            result?;
        }
        Commands::UploadDataset { archive } => {
            require_login(&session)?;
            let uploader = DatasetUploader::new(&client, &config.upload);

            let (tx, mut rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    print!("\r{:<80}", progress_line(&progress));
                    let _ = std::io::stdout().flush();
                }
                println!();
            });
            let result = uploader.upload(&archive, tx).await;
            printer.await?;

            let summary = result?;
            println!("✅ {}", summary.message);
            println!("  images:   {} valid of {}", summary.valid_images, summary.total_images);
            println!("  students: {} mapped, {} unmapped", summary.mapped_students, summary.unmapped_students);
            if let Some(training) = summary.auto_training.filter(|t| t.triggered) {
                let outcome = if training.success { "succeeded" } else { "failed" };
                println!("  auto-training {} ({} images processed)", outcome, training.processed);
            }
        }
        Commands::Train => {
            require_login(&session)?;
            println!("Training model, this can take several minutes...");
            let summary = client.train_model().await?;
            if !summary.success {
                bail!("Training failed: {}", summary.message);
            }
            println!("✅ {}", summary.message);
            if let Some(version) = &summary.model_version {
                println!("  version:  {}", version);
            }
            println!("  dataset:  {} images, {} students", summary.dataset_size, summary.unique_students);
            println!("  duration: {:.1}s", summary.training_duration_seconds);
            for error in &summary.errors {
                println!("  ⚠️  {}", error);
            }
        }
        Commands::ModelStatus => {
            require_login(&session)?;
            let status = client.model_status().await?;
            println!("Model loaded:      {}", if status.model_loaded { "yes" } else { "no" });
            println!("Enrolled students: {}", status.enrolled_students);
            println!("Face images:       {}", status.total_face_images);
            println!("Encodings:         {}", status.encoding_count);
            if let Some(model) = &status.latest_model {
                println!("Latest model:      {} ({} images)", model.version, model.dataset_size);
                if let Some(accuracy) = model.accuracy {
                    println!("  accuracy:        {:.1}%", accuracy * 100.0);
                }
            }
        }
        Commands::Enrolled => {
            require_login(&session)?;
            let enrolled = client.enrolled_students().await?;
            println!("{} enrolled students", enrolled.count);
            for student in &enrolled.students {
                println!(
                    "  {:<12} {:<30} grade {:<4} {} images",
                    student.student_id,
                    student.full_name,
                    student.grade.as_deref().unwrap_or("-"),
                    student.face_images_count
                );
            }
        }
        Commands::Register { student_id, first_name, last_name, grade, gender, parent_email, image } => {
            require_login(&session)?;
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let form = StudentRegistration { student_id, first_name, last_name, grade, gender, parent_email };
            let response = client.register_student_with_face(&form, &bytes).await?;
            if !response.success {
                bail!("Registration failed: {}", response.message);
            }
            println!("✅ {}", response.message);
        }
        Commands::Report { kind, out } => {
            require_login(&session)?;
            let kind = kind.into_kind();
            let out = out.unwrap_or_else(|| default_reports_dir().join(kind.file_name()));
            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }

            let bytes = client.download_report(&kind).await?;
            std::fs::write(&out, &bytes)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("✅ Saved {} ({} bytes)", out.display(), bytes.len());
        }
        Commands::Detect { image, out } => detect_still(&image, out.as_deref(), &config)?,
        Commands::ListCameras => list_cameras()?,
    }

    Ok(())
}

fn require_login(session: &Session) -> Result<()> {
    if !session.is_authenticated() {
        bail!("Not logged in. Run `rollcall login --username <USER>` first.");
    }
    Ok(())
}

fn detect_still(image: &Path, out: Option<&Path>, config: &Config) -> Result<()> {
    let frame = image::open(image).with_context(|| format!("Failed to open {}", image.display()))?;
    let mut detector = FaceDetector::load(&config.detector, &config.capture);
    let signal = detector.detect(&frame, tokio::time::Instant::now());

    println!("Detector: {}", signal.mode);
    println!("Face present: {}", if signal.detected_now { "yes" } else { "no" });
    if let Some(mean) = signal.mean {
        println!("Mean brightness: {:.1}", mean);
    }
    for (i, face) in signal.boxes.iter().enumerate() {
        println!(
            "  face {}: ({:.0}, {:.0}) {:.0}x{:.0}",
            i + 1, face.x1, face.y1, face.width(), face.height()
        );
    }

    if let Some(out) = out {
        overlay::annotate(&frame, &signal).save(out)
            .with_context(|| format!("Failed to save {}", out.display()))?;
        println!("Annotated frame saved to {}", out.display());
    }
    Ok(())
}

#[cfg(feature = "v4l-camera")]
fn list_cameras() -> Result<()> {
    let cameras = rollcall::camera::v4l2::list_cameras()?;
    if cameras.is_empty() {
        println!("❌ No cameras found!");
        println!("\nTroubleshooting:");
        println!("  1. Check if cameras are connected");
        println!("  2. Ensure you have permission to access /dev/video*");
        return Ok(());
    }

    for camera in &cameras {
        let capture = if camera.can_capture { "" } else { " (no capture)" };
        println!("📷 /dev/video{}: {}{}", camera.index, camera.name, capture);
        println!("   formats: {}", camera.formats.join(", "));
    }
    println!("\nSet [camera] device_index in the config to pick one.");
    Ok(())
}

#[cfg(not(feature = "v4l-camera"))]
fn list_cameras() -> Result<()> {
    bail!("Built without the v4l-camera feature; rebuild with --features v4l-camera")
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
