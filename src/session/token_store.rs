use crate::common::{AttendanceError, Result};
use crate::service::protocol::UserProfile;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const STORAGE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistedSession {
    pub version: u32,
    pub tokens: TokenPair,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

impl PersistedSession {
    pub fn new(tokens: TokenPair, user: Option<UserProfile>) -> Self {
        Self { version: STORAGE_VERSION, tokens, user }
    }
}

/// Backing storage for the token pair; the session itself never touches the filesystem.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSession>>;
    fn save(&self, session: &PersistedSession) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path)?;
        match serde_json::from_slice::<PersistedSession>(&data) {
            Ok(session) if session.version == STORAGE_VERSION => Ok(Some(session)),
            Ok(session) => {
                tracing::warn!("Ignoring token file with unsupported version {}", session.version);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable token file {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(session)?;
        fs::write(&self.path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AttendanceError::Io(e)),
        }
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<PersistedSession>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self { slot: Mutex::new(Some(PersistedSession::new(tokens, None))) }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
