//! Transfer progress display.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Progress bar for one transfer
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a bar for `total_bytes` of `file_name`
    #[must_use]
    pub fn new(total_bytes: u64, file_name: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(format!("Receiving: {file_name}"));
        Self { bar }
    }

    /// Move the bar to `transferred_bytes`
    pub fn update(&self, transferred_bytes: u64) {
        self.bar.set_position(transferred_bytes);
    }

    /// Finish with `message`
    pub fn finish_with_message(&self, message: String) {
        self.bar.finish_with_message(message);
    }

    /// Leave the bar where it stopped
    pub fn abandon_with_message(&self, message: String) {
        self.bar.abandon_with_message(message);
    }
}

/// Format bytes in human-readable form
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{size:.2} {}", UNITS[unit])
}

/// Format a duration as `1m 30s`
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 1 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
