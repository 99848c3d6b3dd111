#![forbid(unsafe_code)]

//! Per-job progress record and the two hooks that drive it.
//!
//! yt-dlp reports progress through two channels: the downloader hook, fired
//! repeatedly while bytes arrive, and the post-processor hook, fired while
//! streams are merged and moved into place. Only the latter marks a job as
//! finished because merging may still run after the last byte lands.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Idle,
    Downloading,
    Finished,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Snapshot pushed to progress stream clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub status: ProgressStatus,
    pub percent: f64,
    pub message: String,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            status: ProgressStatus::Idle,
            percent: 0.0,
            message: "Waiting...".to_string(),
        }
    }
}

/// Subset of yt-dlp's downloader progress dictionary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadProgress {
    pub status: String,
    #[serde(default)]
    pub downloaded_bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes_estimate: Option<f64>,
}

/// Subset of yt-dlp's post-processor progress dictionary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostprocessProgress {
    pub status: String,
    #[serde(default)]
    pub postprocessor: Option<String>,
}

impl ProgressState {
    /// Downloader hook.
    pub fn apply_download(&mut self, event: &DownloadProgress) {
        match event.status.as_str() {
            "downloading" => {
                self.status = ProgressStatus::Downloading;
                self.percent = download_percent(event);
                self.message = "Downloading...".to_string();
            }
            "finished" => {
                // Merging and moving may still follow; the post-processor hook
                // owns the terminal transition.
                self.percent = 100.0;
                self.message = "Download completed, Finishing".to_string();
            }
            _ => {}
        }
    }

    /// Post-processor hook.
    pub fn apply_postprocess(&mut self, event: &PostprocessProgress) {
        if event.status == "finished" {
            self.mark_finished();
        }
    }

    pub fn mark_finished(&mut self) {
        self.status = ProgressStatus::Finished;
        self.percent = 100.0;
        self.message = "Download completed".to_string();
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.status = ProgressStatus::Failed;
        self.message = format!("Download failed: {reason}");
    }
}

/// `100 * downloaded / total`, rounded to two decimals. The exact total wins
/// over the estimate; without either the percentage is zero.
pub fn download_percent(event: &DownloadProgress) -> f64 {
    let total = event
        .total_bytes
        .filter(|value| *value > 0.0)
        .or(event.total_bytes_estimate.filter(|value| *value > 0.0));
    let Some(total) = total else {
        return 0.0;
    };
    let downloaded = event.downloaded_bytes.unwrap_or(0.0);
    let percent = (downloaded / total * 100.0).clamp(0.0, 100.0);
    (percent * 100.0).round() / 100.0
}
