//! Interactive operator console for a scan session.
//!
//! Keys: space/enter capture, `a` toggles auto-capture, `r`/`d` register or dismiss an
//! unknown face, `q`/Esc (or Ctrl-C) ends the session.

use crate::cli::ascii_preview::{clear_screen, poll_key, AsciiRenderer};
use crate::common::{AttendanceError, Result};
use crate::core::capture::{CaptureController, CaptureEvent, CaptureHandle, CapturePhase, CaptureSource};
use crate::service::protocol::StudentRegistration;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

const KEY_POLL: Duration = Duration::from_millis(100);

/// Status text for an event, or `None` for events the console doesn't print.
pub fn describe_event(event: &CaptureEvent) -> Option<String> {
    let line = match event {
        CaptureEvent::PhaseChanged(CapturePhase::AutoScanning) => "Scanning for faces...".to_string(),
        CaptureEvent::PhaseChanged(CapturePhase::ManualReady) => "Ready: press space to capture".to_string(),
        CaptureEvent::PhaseChanged(_) | CaptureEvent::Frame { .. } | CaptureEvent::Closed => return None,
        CaptureEvent::Submitted { source: CaptureSource::Auto } => "Face detected, recognizing...".to_string(),
        CaptureEvent::Submitted { source: CaptureSource::Manual } => "Recognizing...".to_string(),
        CaptureEvent::Recognized { student_id, student_name } => {
            format!("✅ Attendance marked: {} ({})", student_name, student_id)
        }
        CaptureEvent::RegistrationOffered { message } => {
            format!("❓ {}. Press R to register this student or D to dismiss", message)
        }
        CaptureEvent::Registered { student_id, message } => format!("✅ {} ({})", message, student_id),
        CaptureEvent::Notification(message) => format!("⚠️  {}", message),
        CaptureEvent::Fatal(message) => format!("❌ {}", message),
    };
    Some(line)
}

fn say(line: &str) {
    // Raw mode needs the explicit carriage return.
    print!("{}\r\n", line);
    let _ = io::stdout().flush();
}

struct RawMode {
    enabled: bool,
}

impl RawMode {
    fn enable() -> Self {
        match terminal::enable_raw_mode() {
            Ok(()) => Self { enabled: true },
            Err(e) => {
                tracing::warn!("Terminal raw mode unavailable, keys need Enter: {}", e);
                Self { enabled: false }
            }
        }
    }

    fn suspend(&self) {
        if self.enabled {
            let _ = terminal::disable_raw_mode();
        }
    }

    fn resume(&self) {
        if self.enabled {
            let _ = terminal::enable_raw_mode();
        }
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        self.suspend();
    }
}

/// Blocking crossterm reader on its own thread, pausable while a prompt owns stdin.
struct KeyReader {
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl KeyReader {
    fn spawn(tx: mpsc::UnboundedSender<KeyEvent>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let (thread_stop, thread_paused) = (stop.clone(), paused.clone());

        let thread = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                if thread_paused.load(Ordering::Relaxed) {
                    std::thread::sleep(KEY_POLL);
                    continue;
                }
                match poll_key(KEY_POLL) {
                    Ok(Some(key)) => {
                        if tx.send(key).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("Key reader stopped: {}", e);
                        break;
                    }
                }
            }
        });

        Self { stop, paused, thread: Some(thread) }
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        // Let an in-progress poll finish before the prompt takes stdin.
        tokio::time::sleep(KEY_POLL * 2).await;
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }
}

impl Drop for KeyReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn prompt(input: &mut impl BufRead, label: &str) -> io::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input closed"));
    }
    Ok(line.trim().to_string())
}

/// Reads a line without echoing it.
pub fn read_secret(label: &str) -> io::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    terminal::enable_raw_mode()?;
    let mut secret = String::new();
    let result = loop {
        match poll_key(Duration::from_secs(3600)) {
            Ok(Some(key)) => match key.code {
                KeyCode::Enter => break Ok(()),
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    break Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
                }
                KeyCode::Backspace => {
                    secret.pop();
                }
                KeyCode::Char(c) => secret.push(c),
                _ => {}
            },
            Ok(None) => {}
            Err(e) => break Err(e),
        }
    };
    terminal::disable_raw_mode()?;
    print!("\r\n");
    result.map(|_| secret)
}

/// Reads a registration form; an empty student ID cancels.
pub fn read_registration(input: &mut impl BufRead) -> io::Result<Option<StudentRegistration>> {
    let student_id = prompt(input, "Student ID (empty to cancel)")?;
    if student_id.is_empty() {
        return Ok(None);
    }

    let mut form = StudentRegistration { student_id, ..Default::default() };
    for (label, field) in [
        ("First name", &mut form.first_name),
        ("Last name", &mut form.last_name),
        ("Grade", &mut form.grade),
    ] {
        while field.is_empty() {
            *field = prompt(input, label)?;
        }
    }

    let optional = |value: String| (!value.is_empty()).then_some(value);
    form.gender = optional(prompt(input, "Gender (optional)")?);
    form.parent_email = optional(prompt(input, "Parent email (optional)")?);
    Ok(Some(form))
}

/// Runs `controller` until the operator quits or the camera fails.
pub async fn run_scan(
    controller: CaptureController,
    handle: CaptureHandle,
    mut events: mpsc::UnboundedReceiver<CaptureEvent>,
    preview: bool,
    auto_capture: bool,
) -> Result<()> {
    let controller = tokio::spawn(controller.with_preview(preview).run());
    let renderer = AsciiRenderer::new(None, None);

    let raw = RawMode::enable();
    let (key_tx, mut key_rx) = mpsc::unbounded_channel();
    let keys = KeyReader::spawn(key_tx);

    say("SPACE capture | A auto on/off | R register | D dismiss | Q quit");

    let mut auto = auto_capture;
    let mut offer_open = false;
    let mut status = String::from("Starting camera...");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                // Sender lives in the controller; closed channel means it finished.
                None => break,
                Some(CaptureEvent::Frame { frame, signal }) => {
                    if preview {
                        let _ = clear_screen();
                        say(&renderer.render(&frame, &signal, &status));
                    }
                }
                Some(event) => {
                    match &event {
                        CaptureEvent::RegistrationOffered { .. } => offer_open = true,
                        CaptureEvent::Registered { .. } | CaptureEvent::Closed => offer_open = false,
                        _ => {}
                    }
                    if let Some(line) = describe_event(&event) {
                        if !preview {
                            say(&line);
                        }
                        status = line;
                    }
                }
            },
            Some(key) = key_rx.recv() => match key.code {
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => handle.close(),
                KeyCode::Char(' ') | KeyCode::Enter => handle.capture(),
                KeyCode::Char('a') | KeyCode::Char('A') => {
                    auto = !auto;
                    handle.set_auto_capture(auto);
                    say(if auto { "Auto-capture on" } else { "Auto-capture off" });
                }
                KeyCode::Char('r') | KeyCode::Char('R') if offer_open => {
                    keys.pause().await;
                    raw.suspend();
                    let form = tokio::task::spawn_blocking(|| read_registration(&mut io::stdin().lock()))
                        .await
                        .map_err(|e| AttendanceError::Other(e.into()))??;
                    raw.resume();
                    keys.resume();
                    if let Some(form) = form {
                        handle.register_pending(form);
                    }
                }
                KeyCode::Char('d') | KeyCode::Char('D') if offer_open => {
                    offer_open = false;
                    handle.dismiss_registration();
                }
                KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => handle.close(),
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => handle.close(),
        }
    }

    drop(keys);
    drop(raw);
    controller.await.map_err(|e| AttendanceError::Other(e.into()))?
}
