pub mod config;
pub mod dev_mode;
pub mod error;
pub mod paths;

pub use config::Config;
pub use dev_mode::DevMode;
pub use error::{AttendanceError, Result};
pub use paths::{default_config_file, default_reports_dir, default_token_file};
