#![forbid(unsafe_code)]

//! Background download jobs.
//!
//! Every call to [`DownloadManager::start_download`] registers a job with its
//! own progress record and spawns a task that drives yt-dlp against the info
//! JSON cached by the fetcher. The task is the only writer of that record and
//! publishes each update through a `watch` channel, so readers (the SSE stream
//! and the status endpoint) always see a consistent snapshot.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::metadata::info_json_path;
use crate::progress::{ProgressState, ProgressStatus};
use crate::sanitize::sanitize;
use crate::security::is_safe_path_segment;
use crate::ytdlp::{DownloadSpec, EngineEvent, YtDlp, merge_container_for};

const DEFAULT_EXTENSION: &str = "mp4";

/// Body of `POST /download`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
}

/// Returned as soon as a job has been accepted.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReceipt {
    pub status: &'static str,
    pub message: String,
    pub job_id: String,
    pub file_name: String,
    pub file_path: String,
}

/// Public view of a job for `GET /jobs/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub unique_id: String,
    pub format_id: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: ProgressState,
}

#[derive(Clone)]
struct DownloadJob {
    unique_id: String,
    format_id: String,
    file_path: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    progress: watch::Receiver<ProgressState>,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<DownloadManagerInner>,
}

struct DownloadManagerInner {
    jobs: Mutex<HashMap<String, DownloadJob>>,
    latest: Mutex<Option<String>>,
    engine: YtDlp,
    cache_dir: PathBuf,
    downloads_dir: PathBuf,
}

impl DownloadManager {
    pub fn new(engine: YtDlp, cache_dir: PathBuf, downloads_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(DownloadManagerInner {
                jobs: Mutex::new(HashMap::new()),
                latest: Mutex::new(None),
                engine,
                cache_dir,
                downloads_dir,
            }),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.inner.downloads_dir
    }

    /// Validates the request, registers a job and starts yt-dlp in the
    /// background. Nothing is spawned when validation fails.
    pub async fn start_download(
        &self,
        request: DownloadRequest,
    ) -> Result<DownloadReceipt, ServiceError> {
        let format_id = non_empty(request.format_id.as_deref())
            .ok_or_else(|| ServiceError::invalid_input("Video ID and format are required"))?
            .to_string();
        let unique_id = non_empty(request.unique_id.as_deref())
            .or_else(|| non_empty(request.video_id.as_deref()))
            .ok_or_else(|| ServiceError::invalid_input("Video ID and format are required"))?
            .to_string();
        if !is_safe_path_segment(&unique_id) {
            return Err(ServiceError::invalid_input(format!(
                "invalid unique id: {unique_id}"
            )));
        }

        let info_json = info_json_path(&self.inner.cache_dir, &unique_id);
        if !tokio::fs::try_exists(&info_json).await? {
            return Err(ServiceError::DescriptorMissing(unique_id));
        }

        let file_name = output_file_name(
            request.title.as_deref(),
            request.extension.as_deref(),
            &unique_id,
        );
        tokio::fs::create_dir_all(&self.inner.downloads_dir).await?;
        let output = self.inner.downloads_dir.join(&file_name);
        let file_path = output.to_string_lossy().into_owned();
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or(DEFAULT_EXTENSION);
        let spec = DownloadSpec {
            info_json,
            format_id: format_id.clone(),
            output,
            merge_container: merge_container_for(extension),
        };

        let job_id = Uuid::new_v4().to_string();
        let (progress_tx, progress_rx) = watch::channel(ProgressState::default());
        {
            let mut jobs = self.inner.jobs.lock();
            if jobs
                .values()
                .any(|job| job.finished_at.is_none() && job.file_path == file_path)
            {
                return Err(ServiceError::OutputInUse(file_name));
            }
            jobs.insert(
                job_id.clone(),
                DownloadJob {
                    unique_id: unique_id.clone(),
                    format_id: format_id.clone(),
                    file_path: file_path.clone(),
                    created_at: Utc::now(),
                    finished_at: None,
                    progress: progress_rx,
                },
            );
        }
        *self.inner.latest.lock() = Some(job_id.clone());

        info!(job_id = %job_id, unique_id = %unique_id, format_id = %format_id, file = %file_path, "download queued");
        let inner = self.inner.clone();
        let job_id_for_task = job_id.clone();
        tokio::spawn(async move {
            run_job(inner, job_id_for_task, spec, progress_tx).await;
        });

        Ok(DownloadReceipt {
            status: "started",
            message: "Download is in progress".to_string(),
            job_id,
            file_name,
            file_path,
        })
    }

    /// Receiver for one job's progress.
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<ProgressState>> {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .map(|job| job.progress.clone())
    }

    /// Receiver for the most recently started job. When no job exists yet
    /// the receiver yields the idle default forever.
    pub fn subscribe_latest(&self) -> watch::Receiver<ProgressState> {
        let latest = self.inner.latest.lock().clone();
        latest
            .and_then(|job_id| self.subscribe(&job_id))
            .unwrap_or_else(|| watch::channel(ProgressState::default()).1)
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        let job = self.inner.jobs.lock().get(job_id).cloned()?;
        let progress = job.progress.borrow().clone();
        Some(JobStatus {
            job_id: job_id.to_string(),
            unique_id: job.unique_id,
            format_id: job.format_id,
            file_path: job.file_path,
            created_at: job.created_at,
            finished_at: job.finished_at,
            progress,
        })
    }

    /// Drops finished jobs older than `retention`. Running jobs are kept.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut jobs = self.inner.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished_at {
            Some(finished) => now.signed_duration_since(finished) < retention,
            None => true,
        });
        let removed = before - jobs.len();
        drop(jobs);

        let mut latest = self.inner.latest.lock();
        if let Some(id) = latest.as_deref()
            && !self.inner.jobs.lock().contains_key(id)
        {
            *latest = None;
        }
        removed
    }
}

async fn run_job(
    inner: Arc<DownloadManagerInner>,
    job_id: String,
    spec: DownloadSpec,
    progress_tx: watch::Sender<ProgressState>,
) {
    let mut state = ProgressState::default();
    let result = inner
        .engine
        .download(&spec, |event| {
            match &event {
                EngineEvent::Download(progress) => state.apply_download(progress),
                EngineEvent::Postprocess(progress) => state.apply_postprocess(progress),
            }
            progress_tx.send_replace(state.clone());
        })
        .await;

    match result {
        Ok(()) => {
            if state.status != ProgressStatus::Finished {
                state.mark_finished();
            }
            info!(job_id = %job_id, file = %spec.output.display(), "download completed");
        }
        Err(err) => {
            let err = ServiceError::DownloadFailed(err.to_string());
            warn!(job_id = %job_id, "download failed: {err}");
            state.mark_failed(&err.to_string());
        }
    }
    progress_tx.send_replace(state);

    if let Some(job) = inner.jobs.lock().get_mut(&job_id) {
        job.finished_at = Some(Utc::now());
    }
}

/// `<sanitized title>.<container>`, falling back to the unique id and `mp4`
/// when sanitizing leaves nothing behind. The extension is the container
/// yt-dlp merges into, so `mp3` is named `.mp4` like the file yt-dlp writes.
pub fn output_file_name(title: Option<&str>, extension: Option<&str>, unique_id: &str) -> String {
    let title = title
        .map(sanitize)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| sanitize(unique_id));
    let extension = extension
        .map(sanitize)
        .filter(|value| !value.is_empty())
        .map(|value| merge_container_for(&value))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    format!("{title}.{extension}")
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
