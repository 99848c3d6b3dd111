#![forbid(unsafe_code)]

//! Thin process-level adapter around the `yt-dlp` executable.
//!
//! The engine is treated as a black box: we only build command lines, wait
//! for the child with a timeout, read its machine-readable progress lines and
//! condense stderr into something a user can read.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::Command,
    time::timeout,
};
use tracing::debug;

use crate::error::EngineError;
use crate::progress::{DownloadProgress, PostprocessProgress};

const DOWNLOAD_MARKER: &str = "[tubefetch:download]";
const POSTPROCESS_MARKER: &str = "[tubefetch:postprocess]";

/// Containers yt-dlp can merge separate video and audio streams into.
const MERGE_CONTAINERS: &[&str] = &["mp4", "mkv", "webm", "mov", "avi", "flv"];
const DEFAULT_MERGE_CONTAINER: &str = "mp4";

/// Progress emitted by a running download.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Download(DownloadProgress),
    Postprocess(PostprocessProgress),
}

/// Everything the engine needs to download one format from a cached
/// descriptor.
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub info_json: PathBuf,
    pub format_id: String,
    pub output: PathBuf,
    pub merge_container: String,
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    fetch_timeout: Duration,
    download_timeout: Duration,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, fetch_timeout: Duration, download_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            fetch_timeout,
            download_timeout,
        }
    }

    /// Runs a metadata-only extraction that writes `<output_stem>.info.json`.
    pub async fn write_info_json(&self, url: &str, output_stem: &Path) -> Result<(), EngineError> {
        let template = format!("{}.%(ext)s", literal_template(output_stem));
        let mut command = Command::new(&self.program);
        command
            .arg("--skip-download")
            .arg("--write-info-json")
            .arg("--force-overwrites")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--output")
            .arg(template)
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(url, program = %self.program.display(), "fetching video info");
        let output = match timeout(self.fetch_timeout, command.output()).await {
            Ok(result) => result.map_err(|err| self.spawn_error(err))?,
            Err(_) => return Err(EngineError::TimedOut(self.fetch_timeout)),
        };

        if !output.status.success() {
            return Err(EngineError::Failed(error_message(&output.stderr)));
        }
        Ok(())
    }

    /// Downloads a single format, forwarding every progress line to
    /// `on_event` as it arrives.
    pub async fn download(
        &self,
        spec: &DownloadSpec,
        mut on_event: impl FnMut(EngineEvent),
    ) -> Result<(), EngineError> {
        let mut command = Command::new(&self.program);
        command
            .arg("--load-info-json")
            .arg(&spec.info_json)
            .arg("--format")
            .arg(format_selector(&spec.format_id))
            .arg("--output")
            .arg(literal_template(&spec.output))
            .arg("--merge-output-format")
            .arg(&spec.merge_container)
            .arg("--newline")
            .arg("--no-warnings")
            .arg("--progress-template")
            .arg(format!("download:{DOWNLOAD_MARKER}%(progress)j"))
            .arg("--progress-template")
            .arg(format!("postprocess:{POSTPROCESS_MARKER}%(progress)j"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            format = %spec.format_id,
            output = %spec.output.display(),
            "starting yt-dlp download"
        );
        let mut child = command.spawn().map_err(|err| self.spawn_error(err))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Failed("yt-dlp stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Failed("yt-dlp stderr unavailable".to_string()))?;
        let stderr_task = tokio::spawn(read_to_end(stderr));

        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(event) = parse_progress_line(&line) {
                    on_event(event);
                }
            }
            child.wait().await
        };

        let status = match timeout(self.download_timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                stderr_task.abort();
                return Err(EngineError::TimedOut(self.download_timeout));
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed(error_message(&stderr)))
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> EngineError {
        if err.kind() == ErrorKind::NotFound {
            EngineError::NotInstalled(self.program.to_string_lossy().into_owned())
        } else {
            EngineError::Io(err)
        }
    }
}

async fn read_to_end(mut reader: impl AsyncRead + Unpin) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Err(err) = reader.read_to_end(&mut buffer).await {
        debug!("reading yt-dlp stderr failed: {err}");
    }
    buffer
}

/// Prefer the chosen video stream merged with the best audio, then the chosen
/// stream with any audio-bearing format, then whatever yt-dlp considers best.
pub fn format_selector(format_id: &str) -> String {
    format!("{format_id}+bestaudio/{format_id}+best[acodec!=none]/best")
}

/// `--output` is an output template; `%` is doubled so a literal path
/// comes back out unchanged.
pub fn literal_template(path: &Path) -> String {
    path.to_string_lossy().replace('%', "%%")
}

/// Picks the container yt-dlp should merge into for a requested extension.
pub fn merge_container_for(extension: &str) -> String {
    let lower = extension.to_ascii_lowercase();
    if MERGE_CONTAINERS.contains(&lower.as_str()) {
        lower
    } else {
        DEFAULT_MERGE_CONTAINER.to_string()
    }
}

/// Recognises the JSON progress lines emitted by our `--progress-template`s.
pub fn parse_progress_line(line: &str) -> Option<EngineEvent> {
    let line = line.trim();
    if let Some(payload) = line.strip_prefix(DOWNLOAD_MARKER) {
        return serde_json::from_str(payload).ok().map(EngineEvent::Download);
    }
    if let Some(payload) = line.strip_prefix(POSTPROCESS_MARKER) {
        return serde_json::from_str(payload).ok().map(EngineEvent::Postprocess);
    }
    None
}

/// Condenses yt-dlp's stderr into its last meaningful line.
pub fn error_message(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let line = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp exited without an error message");
    line.strip_prefix("ERROR:")
        .map(str::trim)
        .unwrap_or(line)
        .to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes an executable bash script that stands in for yt-dlp.
    pub fn install_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp");
        std::fs::write(&path, format!("#!/usr/bin/env bash\nset -eu\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Argument loop shared by the stubs: exposes `$output`, `$info` and `$url`.
    pub const PARSE_ARGS: &str = r#"
output=""
info=""
url=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output) shift; output="$1" ;;
    --load-info-json) shift; info="$1" ;;
    --format|--merge-output-format|--progress-template) shift ;;
    --) shift; url="$1" ;;
    *) ;;
  esac
  shift
done
"#;
}
