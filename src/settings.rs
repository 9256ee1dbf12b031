//! Download preferences persisted next to the downloads.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

use crate::extractor::Rendition;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreference {
    #[default]
    Highest,
    Medium,
    Lowest,
}

impl QualityPreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "highest" | "high" | "best" => Some(Self::Highest),
            "medium" | "mid" => Some(Self::Medium),
            "lowest" | "low" | "worst" => Some(Self::Lowest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSettings {
    #[serde(default)]
    pub preferred_quality: QualityPreference,
    /// Container extension such as `mp4` or `webm`.
    #[serde(default)]
    pub preferred_format: Option<String>,
}

impl DownloadSettings {
    fn normalized(mut self) -> Self {
        self.preferred_format = self
            .preferred_format
            .map(|value| value.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|value| !value.is_empty());
        self
    }
}

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<DownloadSettings>,
}

impl SettingsStore {
    /// Reads `settings.json` from `dir`, falling back to `defaults` when the
    /// file is missing or unreadable.
    pub fn load(dir: &Path, defaults: DownloadSettings) -> Self {
        let path = dir.join(SETTINGS_FILE);
        let current = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<DownloadSettings>(&raw).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "ignoring malformed settings file");
                defaults
            }),
            Err(_) => defaults,
        };

        Self {
            path,
            current: RwLock::new(current.normalized()),
        }
    }

    pub fn get(&self) -> DownloadSettings {
        self.current.read().clone()
    }

    pub fn update(&self, settings: DownloadSettings) -> Result<DownloadSettings> {
        let settings = settings.normalized();
        write_json_atomic(&self.path, &settings)?;
        *self.current.write() = settings.clone();
        Ok(settings)
    }
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Picks the rendition matching the stored preferences.
///
/// Renditions carrying video win over audio-only ones, the preferred
/// extension narrows the pool only when something matches, and the remaining
/// entries are ranked by height and then bitrate.
pub fn choose_rendition<'a>(
    renditions: &'a [Rendition],
    settings: &DownloadSettings,
) -> Option<&'a Rendition> {
    let mut pool: Vec<&Rendition> = renditions.iter().filter(|r| !r.audio_only).collect();
    if pool.is_empty() {
        pool = renditions.iter().collect();
    }

    if let Some(ext) = settings.preferred_format.as_deref() {
        let matching: Vec<&Rendition> = pool
            .iter()
            .copied()
            .filter(|r| r.extension.eq_ignore_ascii_case(ext))
            .collect();
        if !matching.is_empty() {
            pool = matching;
        }
    }

    pool.sort_by(|a, b| {
        a.height
            .unwrap_or(0)
            .cmp(&b.height.unwrap_or(0))
            .then_with(|| a.bitrate.unwrap_or(0.0).total_cmp(&b.bitrate.unwrap_or(0.0)))
    });

    let index = match settings.preferred_quality {
        QualityPreference::Highest => pool.len().checked_sub(1)?,
        QualityPreference::Medium => pool.len().checked_sub(1)? / 2,
        QualityPreference::Lowest => 0,
    };
    pool.get(index).copied()
}
