pub mod ascii_preview;
pub mod console;
pub mod progress;

pub use ascii_preview::{clear_screen, AsciiRenderer};
pub use console::{describe_event, read_registration, read_secret, run_scan};
pub use progress::progress_line;
