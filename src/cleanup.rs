#![forbid(unsafe_code)]

//! Periodic janitor for cached info JSON files and finished job records.
//! Downloaded media is never touched.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};

use crate::downloads::DownloadManager;
use crate::metadata::INFO_JSON_SUFFIX;

#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    pub cache_dir: PathBuf,
    /// Zero disables descriptor cleanup.
    pub descriptor_ttl: Duration,
    pub job_retention: Duration,
    pub interval: Duration,
}

/// Removes `*.info.json` files in `cache_dir` whose modification time is
/// older than `ttl`. Returns how many were deleted.
pub async fn sweep_stale_descriptors(cache_dir: &Path, ttl: Duration) -> usize {
    if ttl.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(cache_dir).await {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!("could not open {} for cleanup: {err}", cache_dir.display());
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("could not iterate {}: {err}", cache_dir.display());
                break;
            }
        };

        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(INFO_JSON_SUFFIX) {
            continue;
        }
        let path = entry.path();
        let modified = match entry.metadata().await.and_then(|meta| {
            if meta.is_file() {
                meta.modified()
            } else {
                Err(std::io::Error::other("not a file"))
            }
        }) {
            Ok(modified) => modified,
            Err(err) => {
                debug!("skipping {}: {err}", path.display());
                continue;
            }
        };

        let age = now.duration_since(modified).unwrap_or_default();
        if age < ttl {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove {}: {err}", path.display()),
        }
    }
    removed
}

/// Spawns the janitor loop. The first sweep runs immediately.
pub fn spawn_janitor(manager: DownloadManager, policy: CleanupPolicy) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.interval);
        loop {
            ticker.tick().await;
            let descriptors =
                sweep_stale_descriptors(&policy.cache_dir, policy.descriptor_ttl).await;
            let jobs = manager.prune_finished(policy.job_retention);
            if descriptors > 0 || jobs > 0 {
                info!(descriptors, jobs, "cleanup removed stale entries");
            }
        }
    })
}
