use directories::ProjectDirs;
use std::path::PathBuf;

// Fallbacks are used when the platform has no home directory (service accounts, containers).

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "edurfid", "rollcall")
}

pub fn default_config_file() -> PathBuf {
    PathBuf::from("configs/rollcall.toml")
}

pub fn default_token_file() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("tokens.json"))
        .unwrap_or_else(|| PathBuf::from(".rollcall/tokens.json"))
}

pub fn default_reports_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("reports"))
        .unwrap_or_else(|| PathBuf::from("reports"))
}
