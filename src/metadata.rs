#![forbid(unsafe_code)]

//! Metadata discovery: asks yt-dlp for a video's info JSON, caches it on disk
//! under a fresh unique id, and projects the format list into something a
//! user can pick from.
//!
//! The cached `<unique_id>.info.json` is the only link between a fetch and a
//! later download, so it is left in place for the download manager.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::ytdlp::YtDlp;

pub const INFO_JSON_SUFFIX: &str = ".info.json";

/// One selectable quality/codec combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatOption {
    pub format_id: String,
    pub text: String,
    pub height: Option<i64>,
}

/// Reduced view of the info JSON returned to API callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub extension: String,
    pub formats: Vec<FormatOption>,
}

/// Result of a fetch: the descriptor plus the key of its cached info JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedVideo {
    #[serde(flatten)]
    pub descriptor: VideoDescriptor,
    pub unique_id: String,
}

/// Minimal version of yt-dlp's `info.json`. Everything is optional because
/// extractors differ wildly in what they fill in.
#[derive(Debug, Default, Deserialize)]
pub struct InfoJson {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub formats: Option<Vec<FormatInfo>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
}

/// Location of the cached info JSON for a unique id.
pub fn info_json_path(cache_dir: &Path, unique_id: &str) -> PathBuf {
    cache_dir.join(format!("{unique_id}{INFO_JSON_SUFFIX}"))
}

#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    engine: YtDlp,
    cache_dir: PathBuf,
}

impl MetadataFetcher {
    pub fn new(engine: YtDlp, cache_dir: PathBuf) -> Self {
        Self { engine, cache_dir }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedVideo, ServiceError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ServiceError::invalid_input("URL is required"));
        }

        let unique_id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        self.engine
            .write_info_json(url, &self.cache_dir.join(&unique_id))
            .await
            .map_err(|err| {
                warn!(url, "metadata fetch failed: {err}");
                ServiceError::FetchFailed(err.to_string())
            })?;

        let path = info_json_path(&self.cache_dir, &unique_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::DescriptorMissing(path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let info: InfoJson = serde_json::from_slice(&raw).map_err(|err| {
            ServiceError::FetchFailed(format!("parsing {}: {err}", path.display()))
        })?;

        let descriptor = build_descriptor(info)?;
        info!(
            unique_id = %unique_id,
            title = %descriptor.title,
            formats = descriptor.formats.len(),
            "fetched video info"
        );
        Ok(FetchedVideo {
            descriptor,
            unique_id,
        })
    }
}

/// Projects a parsed info JSON into the API descriptor.
pub fn build_descriptor(info: InfoJson) -> Result<VideoDescriptor, ServiceError> {
    let formats = info.formats.ok_or(ServiceError::NoFormatsAvailable)?;
    Ok(VideoDescriptor {
        id: info.id.unwrap_or_default(),
        title: info.title.unwrap_or_default(),
        thumbnail: info.thumbnail.unwrap_or_default(),
        extension: info.ext.unwrap_or_default(),
        formats: select_formats(&formats),
    })
}

/// Keeps video-bearing formats with a known height. Non-mp4 streams are
/// preferred since they get merged with the best audio later; mp4 entries
/// only show up when nothing else qualifies.
pub fn select_formats(formats: &[FormatInfo]) -> Vec<FormatOption> {
    let preferred: Vec<FormatOption> = formats
        .iter()
        .filter(|format| has_video_height(format) && format.ext.as_deref() != Some("mp4"))
        .map(format_option)
        .collect();
    if !preferred.is_empty() {
        return preferred;
    }
    formats
        .iter()
        .filter(|format| has_video_height(format))
        .map(format_option)
        .collect()
}

fn has_video_height(format: &FormatInfo) -> bool {
    format.height.is_some_and(|height| height > 0) && format.vcodec.as_deref() != Some("none")
}

fn format_option(format: &FormatInfo) -> FormatOption {
    FormatOption {
        format_id: format.format_id.clone().unwrap_or_default(),
        text: format_label(format),
        height: format.height,
    }
}

/// `"720p60 | 60 fps | Resolution: 1280x720 | Extension: webm"`.
pub fn format_label(format: &FormatInfo) -> String {
    let note = format
        .format_note
        .as_deref()
        .map(str::trim)
        .filter(|note| !note.is_empty())
        .map(str::to_string)
        .or_else(|| format.height.map(|height| format!("{height}p")))
        .unwrap_or_else(|| "N/A".to_string());
    let fps = format
        .fps
        .map(format_fps)
        .unwrap_or_else(|| "N/A".to_string());
    let resolution = format.resolution.as_deref().unwrap_or("N/A");
    let ext = format.ext.as_deref().unwrap_or("N/A");
    format!("{note} | {fps} fps | Resolution: {resolution} | Extension: {ext}")
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as i64)
    } else {
        format!("{fps}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ytdlp::testing::{PARSE_ARGS, install_stub};
    use std::time::Duration;
    use tempfile::tempdir;

    fn format(id: &str, height: Option<i64>, vcodec: &str, ext: &str) -> FormatInfo {
        FormatInfo {
            format_id: Some(id.into()),
            format_note: None,
            height,
            fps: Some(30.0),
            resolution: height.map(|h| format!("{}x{h}", h * 16 / 9)),
            ext: Some(ext.into()),
            vcodec: Some(vcodec.into()),
        }
    }

    fn fetcher(program: PathBuf, cache_dir: &Path) -> MetadataFetcher {
        MetadataFetcher::new(
            YtDlp::new(program, Duration::from_secs(10), Duration::from_secs(10)),
            cache_dir.to_path_buf(),
        )
    }

    /// Stub that writes `payload` wherever the output template points.
    fn info_stub(dir: &Path, payload: &str) -> PathBuf {
        install_stub(
            dir,
            &format!(
                "{PARSE_ARGS}\ntarget=\"$(printf '%s' \"$output\" | sed 's/%(ext)s$/info.json/')\"\ncat > \"$target\" <<'JSON'\n{payload}\nJSON"
            ),
        )
    }

    #[test]
    fn first_pass_excludes_mp4_and_audio_only() {
        let formats = vec![
            format("247", Some(720), "vp9", "webm"),
            format("251", Some(1080), "none", "webm"),
            format("135", Some(480), "avc1", "mp4"),
        ];
        let selected = select_formats(&formats);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].format_id, "247");
        assert_eq!(selected[0].height, Some(720));
    }

    #[test]
    fn second_pass_allows_mp4() {
        let formats = vec![
            format("251", Some(1080), "none", "webm"),
            format("135", Some(480), "avc1", "mp4"),
            format("sb0", None, "none", "mhtml"),
        ];
        let selected = select_formats(&formats);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].format_id, "135");
    }

    #[test]
    fn zero_height_is_not_a_video_format() {
        let formats = vec![
            format("sb1", Some(0), "vp9", "webm"),
            format("18", Some(360), "avc1", "mp4"),
        ];
        let selected = select_formats(&formats);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].format_id, "18");
    }

    #[test]
    fn selection_preserves_engine_order() {
        let formats = vec![
            format("248", Some(1080), "vp9", "webm"),
            format("244", Some(480), "vp9", "webm"),
            format("247", Some(720), "vp9", "webm"),
        ];
        let ids: Vec<_> = select_formats(&formats)
            .into_iter()
            .map(|option| option.format_id)
            .collect();
        assert_eq!(ids, ["248", "244", "247"]);
    }

    #[test]
    fn missing_vcodec_counts_as_video() {
        let mut entry = format("hls-720", Some(720), "vp9", "webm");
        entry.vcodec = None;
        assert_eq!(select_formats(&[entry]).len(), 1);
    }

    #[test]
    fn label_uses_note_and_placeholders() {
        let mut entry = format("247", Some(720), "vp9", "webm");
        entry.format_note = Some("720p".into());
        assert_eq!(
            format_label(&entry),
            "720p | 30 fps | Resolution: 1280x720 | Extension: webm"
        );

        let bare = FormatInfo {
            height: Some(360),
            ..FormatInfo::default()
        };
        assert_eq!(
            format_label(&bare),
            "360p | N/A fps | Resolution: N/A | Extension: N/A"
        );

        entry.fps = Some(29.97);
        assert!(format_label(&entry).contains("29.97 fps"));
    }

    #[test]
    fn descriptor_without_formats_is_rejected() {
        let err = build_descriptor(InfoJson {
            title: Some("x".into()),
            ..InfoJson::default()
        })
        .unwrap_err();
        assert!(matches!(err, ServiceError::NoFormatsAvailable));
    }

    #[tokio::test]
    async fn empty_url_never_invokes_engine() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("invoked");
        let stub = install_stub(dir.path(), &format!("touch \"{}\"", marker.display()));
        let err = fetcher(stub, dir.path()).fetch("   ").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn fetch_reads_cached_info_json() {
        let dir = tempdir().unwrap();
        let stub = info_stub(
            dir.path(),
            r#"{
  "id": "alpha",
  "title": "Alpha Title",
  "thumbnail": "https://img.example.test/alpha.jpg",
  "ext": "webm",
  "formats": [
    {"format_id": "251", "ext": "webm", "vcodec": "none", "acodec": "opus"},
    {"format_id": "247", "ext": "webm", "vcodec": "vp9", "height": 720, "fps": 30, "resolution": "1280x720", "format_note": "720p"},
    {"format_id": "136", "ext": "mp4", "vcodec": "avc1", "height": 720, "fps": 30, "resolution": "1280x720"}
  ]
}"#,
        );
        let cache = dir.path().join("cache");
        let fetched = fetcher(stub, &cache)
            .fetch("https://example.test/watch?v=alpha")
            .await
            .unwrap();

        assert!(Uuid::parse_str(&fetched.unique_id).is_ok());
        assert!(info_json_path(&cache, &fetched.unique_id).exists());
        assert_eq!(fetched.descriptor.id, "alpha");
        assert_eq!(fetched.descriptor.title, "Alpha Title");
        assert_eq!(fetched.descriptor.extension, "webm");
        assert_eq!(fetched.descriptor.formats.len(), 1);
        assert_eq!(fetched.descriptor.formats[0].format_id, "247");

        let value = serde_json::to_value(&fetched).unwrap();
        assert_eq!(value["unique_id"], fetched.unique_id.as_str());
        assert_eq!(value["formats"][0]["text"], "720p | 30 fps | Resolution: 1280x720 | Extension: webm");
    }

    #[tokio::test]
    async fn fetch_without_formats_fails() {
        let dir = tempdir().unwrap();
        let stub = info_stub(dir.path(), r#"{"id": "alpha", "title": "No formats"}"#);
        let err = fetcher(stub, dir.path())
            .fetch("https://example.test/v")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoFormatsAvailable));
    }

    #[tokio::test]
    async fn fetch_reports_missing_descriptor() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "exit 0");
        let err = fetcher(stub, dir.path())
            .fetch("https://example.test/v")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DescriptorMissing(_)));
    }

    #[tokio::test]
    async fn fetch_wraps_engine_errors() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo 'ERROR: Unsupported URL: https://example.test/v' >&2\nexit 1",
        );
        let err = fetcher(stub, dir.path())
            .fetch("https://example.test/v")
            .await
            .unwrap_err();
        match err {
            ServiceError::FetchFailed(message) => {
                assert_eq!(message, "Unsupported URL: https://example.test/v")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
