#![forbid(unsafe_code)]

//! Runtime settings resolved from CLI overrides, the process environment and
//! a dotenv-style file, in that order of precedence.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_CACHE_DIR: &str = ".";
pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_DESCRIPTOR_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_JOB_RETENTION_SECS: u64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub host: String,
    pub port: u16,
    pub cache_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub cors_origin: String,
    pub ytdlp: PathBuf,
    pub progress_interval: Duration,
    pub fetch_timeout: Duration,
    pub download_timeout: Duration,
    pub descriptor_ttl: Duration,
    pub job_retention: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cache_dir: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
    pub cors_origin: Option<String>,
    pub ytdlp: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_settings(&file_vars, env_var_string, overrides))
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let path_or = |value: Option<PathBuf>, key: &str, default: &str| {
        value
            .filter(|path| !path.as_os_str().is_empty())
            .or_else(|| lookup(key).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default))
    };
    let text_or = |value: Option<String>, key: &str, default: &str| {
        value
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| lookup(key))
            .unwrap_or_else(|| default.to_string())
    };
    let seconds = |key: &str, default: u64| Duration::from_secs(parse_or(lookup(key), default));

    RuntimeSettings {
        host: text_or(overrides.host, "TUBEFETCH_HOST", DEFAULT_HOST),
        port: overrides
            .port
            .unwrap_or_else(|| parse_or(lookup("TUBEFETCH_PORT"), DEFAULT_PORT)),
        cache_dir: path_or(overrides.cache_dir, "TUBEFETCH_CACHE_DIR", DEFAULT_CACHE_DIR),
        downloads_dir: path_or(
            overrides.downloads_dir,
            "TUBEFETCH_DOWNLOADS_DIR",
            DEFAULT_DOWNLOADS_DIR,
        ),
        cors_origin: text_or(
            overrides.cors_origin,
            "TUBEFETCH_CORS_ORIGIN",
            DEFAULT_CORS_ORIGIN,
        ),
        ytdlp: path_or(overrides.ytdlp, "TUBEFETCH_YTDLP", DEFAULT_YTDLP),
        progress_interval: Duration::from_millis(
            parse_or::<u64>(
                lookup("TUBEFETCH_PROGRESS_INTERVAL_MS"),
                DEFAULT_PROGRESS_INTERVAL_MS,
            )
            .max(1),
        ),
        fetch_timeout: seconds("TUBEFETCH_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS),
        download_timeout: seconds(
            "TUBEFETCH_DOWNLOAD_TIMEOUT_SECS",
            DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        ),
        descriptor_ttl: seconds("TUBEFETCH_DESCRIPTOR_TTL_SECS", DEFAULT_DESCRIPTOR_TTL_SECS),
        job_retention: seconds("TUBEFETCH_JOB_RETENTION_SECS", DEFAULT_JOB_RETENTION_SECS),
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
