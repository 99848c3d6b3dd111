#![forbid(unsafe_code)]

//! tubefetch: an HTTP front for yt-dlp. Fetch video metadata once, then
//! download a chosen format in the background while clients follow progress.

pub mod cleanup;
pub mod config;
pub mod downloads;
pub mod error;
pub mod metadata;
pub mod progress;
pub mod sanitize;
pub mod security;
pub mod ytdlp;
