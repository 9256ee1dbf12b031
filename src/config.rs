#![forbid(unsafe_code)]

//! Runtime configuration.
//!
//! Values are layered: explicit overrides (CLI flags) win over the process
//! environment, which wins over the `.env` file, which wins over defaults.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::progress::DEFAULT_CHUNK_COUNT;
use crate::settings::{DownloadSettings, QualityPreference};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_YTDLP: &str = "yt-dlp";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub download_dir: PathBuf,
    /// Optional dashboard build served for non-API paths.
    pub www_root: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub ytdlp_bin: PathBuf,
    pub chunk_count: usize,
    pub settings_defaults: DownloadSettings,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_dir: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_config(&file_vars, env_var_string, overrides))
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let download_dir = overrides
        .download_dir
        .or_else(|| lookup("GRABTUBE_DOWNLOAD_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("GRABTUBE_WWW_ROOT").map(PathBuf::from));
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("GRABTUBE_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("GRABTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup("GRABTUBE_YTDLP").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));
    let chunk_count = lookup("GRABTUBE_CHUNKS")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|count| *count > 0)
        .unwrap_or(DEFAULT_CHUNK_COUNT);

    let settings_defaults = DownloadSettings {
        preferred_quality: lookup("GRABTUBE_PREFERRED_QUALITY")
            .as_deref()
            .and_then(QualityPreference::parse)
            .unwrap_or_default(),
        preferred_format: lookup("GRABTUBE_PREFERRED_FORMAT")
            .map(|value| value.to_ascii_lowercase()),
    };

    RuntimeConfig {
        download_dir,
        www_root,
        host,
        port,
        ytdlp_bin,
        chunk_count,
        settings_defaults,
    }
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
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(raw.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|inner| inner.strip_suffix(*quote))
        })
        .unwrap_or(value)
}
