use crate::core::upload::UploadProgress;

const BAR_WIDTH: usize = 30;

pub fn progress_bar(percent: u8) -> String {
    let filled = (percent.min(100) as usize * BAR_WIDTH) / 100;
    format!("[{}{}]", "■".repeat(filled), "□".repeat(BAR_WIDTH - filled))
}

/// One status line; printed with a leading `\r` so updates overwrite each other.
pub fn progress_line(progress: &UploadProgress) -> String {
    format!("{} {:>3}% {}", progress_bar(progress.percent), progress.percent, progress.message)
}
