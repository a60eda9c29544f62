use std::path::PathBuf;
use std::fs;
use crate::common::error::Result;

/// Development mode keeps every capture and annotated detection frame under `./dev_data`.
#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        Self::with_base_dir(enabled, PathBuf::from("./dev_data"))
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        if enabled {
            fs::create_dir_all(base_dir.join("captures"))?;
            fs::create_dir_all(base_dir.join("debug"))?;
            fs::create_dir_all(base_dir.join("tokens"))?;

            tracing::info!("Development mode enabled - data will be saved to: {}", base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn disabled() -> Self {
        Self { enabled: false, base_dir: PathBuf::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn captures_dir(&self) -> Option<PathBuf> {
        self.enabled.then(|| self.base_dir.join("captures"))
    }

    pub fn debug_dir(&self) -> Option<PathBuf> {
        self.enabled.then(|| self.base_dir.join("debug"))
    }

    /// Token file override so dev sessions never touch the real login.
    pub fn token_file(&self) -> Option<PathBuf> {
        self.enabled.then(|| self.base_dir.join("tokens").join("tokens.json"))
    }

    pub fn capture_path(&self, prefix: &str) -> Option<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        self.captures_dir().map(|dir| dir.join(format!("{}_{}.jpg", prefix, timestamp)))
    }

    pub fn debug_path(&self, prefix: &str) -> Option<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        self.debug_dir().map(|dir| dir.join(format!("{}_{}.png", prefix, timestamp)))
    }

    /// Best effort: dev artefacts must never interrupt a scan.
    pub fn save_capture(&self, prefix: &str, jpeg: &[u8]) {
        if let Some(path) = self.capture_path(prefix) {
            if let Err(e) = fs::write(&path, jpeg) {
                tracing::warn!("Failed to save dev capture {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_mode_produces_no_paths() {
        let dev = DevMode::disabled();
        assert!(dev.capture_path("auto").is_none());
        assert!(dev.token_file().is_none());
        dev.save_capture("auto", b"ignored");
    }

    #[test]
    fn enabled_mode_writes_under_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let dev = DevMode::with_base_dir(true, dir.path().to_path_buf()).unwrap();
        dev.save_capture("manual", b"\xff\xd8jpeg");

        let saved: Vec<_> = fs::read_dir(dir.path().join("captures")).unwrap().collect();
        assert_eq!(saved.len(), 1);
        assert!(dev.token_file().unwrap().starts_with(dir.path()));
    }
}
