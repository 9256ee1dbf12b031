#![forbid(unsafe_code)]

//! Shared pieces of the grabtube binaries: progress tracking, the yt-dlp
//! bridge, and the download job manager.

pub mod config;
pub mod extractor;
pub mod history;
pub mod logging;
pub mod progress;
pub mod registry;
pub mod security;
pub mod settings;
pub mod transfer;
pub mod units;
pub mod ytdlp;
