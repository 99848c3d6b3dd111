#![forbid(unsafe_code)]

//! HTTP backend for tubefetch.
//!
//! `/fetch` asks yt-dlp for a video's info JSON and returns the selectable
//! formats. `/download` starts a background job against that cached info and
//! answers right away with a job id; progress is then pushed over SSE from
//! `/progress` or `/progress/{job_id}`. Finished files are served read-only
//! from `/downloads/{name}`.

use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
    sync::watch,
    time::MissedTickBehavior,
};
use tokio_stream::{Stream, StreamExt, wrappers::IntervalStream};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tubefetch::{
    cleanup::{CleanupPolicy, spawn_janitor},
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    downloads::{DownloadManager, DownloadReceipt, DownloadRequest, JobStatus},
    error::ServiceError,
    metadata::{FetchedVideo, MetadataFetcher},
    progress::ProgressState,
    security::{ensure_not_root, is_safe_path_segment},
    ytdlp::YtDlp,
};

const DEFAULT_LOG_FILTER: &str = "tubefetch=info,backend=info,tower_http=info";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Command line flags. Each one overrides the matching `TUBEFETCH_*` key.
#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "HTTP front for yt-dlp downloads")]
struct BackendArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// dotenv-style file read for `TUBEFETCH_*` settings.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Where `<unique_id>.info.json` files are cached.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
    #[arg(long)]
    cors_origin: Option<String>,
    /// yt-dlp executable to run.
    #[arg(long)]
    ytdlp: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            cache_dir: self.cache_dir,
            downloads_dir: self.downloads_dir,
            cors_origin: self.cors_origin,
            ytdlp: self.ytdlp,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    fetcher: Arc<MetadataFetcher>,
    downloads: DownloadManager,
    progress_interval: Duration,
}

impl AppState {
    fn from_settings(settings: &RuntimeSettings) -> Self {
        let engine = YtDlp::new(
            settings.ytdlp.clone(),
            settings.fetch_timeout,
            settings.download_timeout,
        );
        Self {
            fetcher: Arc::new(MetadataFetcher::new(
                engine.clone(),
                settings.cache_dir.clone(),
            )),
            downloads: DownloadManager::new(
                engine,
                settings.cache_dir.clone(),
                settings.downloads_dir.clone(),
            ),
            progress_interval: settings.progress_interval,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::DescriptorMissing(_) | ServiceError::JobNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::OutputInUse(_) => StatusCode::CONFLICT,
            ServiceError::FetchFailed(_)
            | ServiceError::DownloadFailed(_)
            | ServiceError::NoFormatsAvailable => StatusCode::BAD_GATEWAY,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {err}");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct FetchRequest {
    #[serde(default)]
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let settings = resolve_runtime_settings(BackendArgs::parse().into_overrides())?;
    ensure_not_root("backend")?;

    let state = AppState::from_settings(&settings);
    spawn_janitor(
        state.downloads.clone(),
        CleanupPolicy {
            cache_dir: settings.cache_dir.clone(),
            descriptor_ttl: settings.descriptor_ttl,
            job_retention: settings.job_retention,
            interval: CLEANUP_INTERVAL,
        },
    );

    let app = build_router(state, build_cors_layer(&settings.cors_origin)?);

    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("binding to {}:{}", settings.host, settings.port))?;
    let addr = listener
        .local_addr()
        .context("reading listener address")?;
    info!(
        %addr,
        ytdlp = %settings.ytdlp.display(),
        downloads = %settings.downloads_dir.display(),
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
    info!("shutting down");
}

fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/fetch", post(fetch_video))
        .route("/download", post(start_download))
        .route("/jobs/{job_id}", get(get_job))
        .route("/progress", get(latest_progress))
        .route("/progress/{job_id}", get(job_progress))
        .route("/downloads/{name}", get(serve_download))
        .route("/health", get(health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// One allowed origin with credentials. Credentials forbid wildcard methods
/// and headers, so both are mirrored from the preflight request instead.
fn build_cors_layer(origin: &str) -> Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin.trim())
        .with_context(|| format!("invalid CORS origin {origin:?}"))?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::exact(origin))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

async fn fetch_video(
    State(state): State<AppState>,
    Json(request): Json<FetchRequest>,
) -> ApiResult<Json<FetchedVideo>> {
    let fetched = state.fetcher.fetch(&request.url).await?;
    Ok(Json(fetched))
}

async fn start_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<(StatusCode, Json<DownloadReceipt>)> {
    let receipt = state.downloads.start_download(request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<JobStatus>> {
    state
        .downloads
        .job_status(&job_id)
        .map(Json)
        .ok_or_else(|| ServiceError::JobNotFound(job_id).into())
}

async fn latest_progress(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    progress_sse(state.downloads.subscribe_latest(), state.progress_interval)
}

async fn job_progress(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let receiver = state
        .downloads
        .subscribe(&job_id)
        .ok_or(ServiceError::JobNotFound(job_id))?;
    Ok(progress_sse(receiver, state.progress_interval))
}

/// Pushes the current snapshot as a `progress` event every `interval`,
/// starting immediately. The stream lives until the client goes away.
fn progress_sse(
    receiver: watch::Receiver<ProgressState>,
    interval: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let stream = IntervalStream::new(ticker).map(move |_| {
        let snapshot = receiver.borrow().clone();
        Ok(progress_event(&snapshot))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn progress_event(snapshot: &ProgressState) -> Event {
    let event = Event::default().event("progress");
    match serde_json::to_string(snapshot) {
        Ok(data) => event.data(data),
        Err(err) => {
            warn!("serializing progress failed: {err}");
            event.data("{}")
        }
    }
}

async fn serve_download(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_safe_path_segment(&name) {
        return Err(ApiError::not_found("file not found"));
    }
    stream_file(state.downloads.downloads_dir().join(name), &headers).await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(format!("seeking {}: {err}", path.display())))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        response
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    // Multi-range requests fall back to a full response.
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        // "-N" is the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 || size == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size - 1));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
