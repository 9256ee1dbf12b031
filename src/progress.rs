//! Download progress model.
//!
//! Turns a stream of cumulative byte counts into the snapshot every renderer
//! consumes: percentage, instantaneous speed, ETA and the synthetic chunk bars.
//! Every function here is pure. Keyed storage and sample baselines live in
//! [`crate::registry`]; this module only maps "previous snapshot + sample" to
//! the next snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of synthetic segments drawn for a download unless configured.
pub const DEFAULT_CHUNK_COUNT: usize = 8;

/// Samples that arrive closer together than this keep the previous speed.
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 500;

/// Lifecycle of a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal records are frozen until they are removed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Encodes the state machine. Only `paused -> downloading` moves
    /// "backwards"; everything else is monotonic.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Queued, Downloading | Failed | Canceled)
                | (Downloading, Paused | Completed | Failed | Canceled)
                | (Paused, Downloading | Failed | Canceled)
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// One cosmetic progress-bar segment. It does not map to a byte range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: usize,
    pub progress: u8,
    pub status: ChunkStatus,
}

/// Timestamped observation of cumulative bytes transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub at_ms: u64,
    pub bytes: u64,
}

impl Sample {
    pub fn new(at_ms: u64, bytes: u64) -> Self {
        Self { at_ms, bytes }
    }
}

/// Immutable snapshot of one download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub subject_id: String,
    pub format_id: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: u8,
    /// Bytes per second.
    pub instantaneous_speed: u64,
    pub estimated_seconds_remaining: u64,
    pub status: DownloadStatus,
    pub chunks: Vec<Chunk>,
}

impl DownloadProgress {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {action} a download that is {from}")]
pub struct TransitionError {
    pub from: DownloadStatus,
    pub action: &'static str,
}

/// Record for a download that is registered but has not received bytes yet.
pub fn queued(
    subject_id: &str,
    format_id: &str,
    total_hint: u64,
    chunk_count: usize,
) -> DownloadProgress {
    let count = normalize_chunk_count(chunk_count);
    DownloadProgress {
        subject_id: subject_id.to_owned(),
        format_id: format_id.to_owned(),
        downloaded_bytes: 0,
        total_bytes: total_hint,
        percentage: 0,
        instantaneous_speed: 0,
        estimated_seconds_remaining: 0,
        status: DownloadStatus::Queued,
        chunks: (0..count)
            .map(|index| Chunk {
                index,
                progress: 0,
                status: ChunkStatus::Pending,
            })
            .collect(),
    }
}

/// Fresh `downloading` record. `total_hint` is kept verbatim until a caller
/// passes a more authoritative total to [`update`].
pub fn initialize(
    subject_id: &str,
    format_id: &str,
    total_hint: u64,
    chunk_count: usize,
) -> DownloadProgress {
    DownloadProgress {
        subject_id: subject_id.to_owned(),
        format_id: format_id.to_owned(),
        downloaded_bytes: 0,
        total_bytes: total_hint,
        percentage: 0,
        instantaneous_speed: 0,
        estimated_seconds_remaining: 0,
        status: DownloadStatus::Downloading,
        chunks: chunk_states(0, chunk_count),
    }
}

/// Moves a queued record into `downloading` once the transfer has opened.
pub fn begin(
    previous: &DownloadProgress,
    total_bytes: u64,
) -> Result<DownloadProgress, TransitionError> {
    if previous.status != DownloadStatus::Queued {
        return Err(TransitionError {
            from: previous.status,
            action: "start",
        });
    }
    Ok(initialize(
        &previous.subject_id,
        &previous.format_id,
        total_bytes,
        previous.chunk_count(),
    ))
}

/// Derives the next snapshot from a new cumulative byte count.
///
/// `last_sample` is the speed baseline and `now_ms` the time of the current
/// observation. When less than [`MIN_SAMPLE_INTERVAL_MS`] separates the two,
/// the previous speed is carried over unchanged. Status is never altered.
pub fn update(
    previous: &DownloadProgress,
    downloaded_bytes: u64,
    total_bytes: u64,
    last_sample: Sample,
    now_ms: u64,
) -> DownloadProgress {
    let percentage = percentage_of(downloaded_bytes, total_bytes);

    let elapsed_ms = now_ms.saturating_sub(last_sample.at_ms);
    let instantaneous_speed = if elapsed_ms > MIN_SAMPLE_INTERVAL_MS {
        let delta = downloaded_bytes.saturating_sub(last_sample.bytes);
        rounded_div(u128::from(delta) * 1000, u128::from(elapsed_ms))
    } else {
        previous.instantaneous_speed
    };

    DownloadProgress {
        subject_id: previous.subject_id.clone(),
        format_id: previous.format_id.clone(),
        downloaded_bytes,
        total_bytes,
        percentage,
        instantaneous_speed,
        estimated_seconds_remaining: eta_seconds(
            total_bytes.saturating_sub(downloaded_bytes),
            instantaneous_speed,
        ),
        status: previous.status,
        chunks: chunk_states(percentage, previous.chunk_count()),
    }
}

/// Final record for a finished transfer.
pub fn complete(
    subject_id: &str,
    format_id: &str,
    total_bytes: u64,
    chunk_count: usize,
) -> DownloadProgress {
    DownloadProgress {
        subject_id: subject_id.to_owned(),
        format_id: format_id.to_owned(),
        downloaded_bytes: total_bytes,
        total_bytes,
        percentage: 100,
        instantaneous_speed: 0,
        estimated_seconds_remaining: 0,
        status: DownloadStatus::Completed,
        chunks: chunk_states(100, chunk_count),
    }
}

/// Failed record for a download that never produced a snapshot worth keeping.
pub fn fail(
    subject_id: &str,
    format_id: &str,
    total_known: u64,
    chunk_count: usize,
) -> DownloadProgress {
    let mut chunks = chunk_states(0, chunk_count);
    chunks[0].status = ChunkStatus::Failed;
    DownloadProgress {
        subject_id: subject_id.to_owned(),
        format_id: format_id.to_owned(),
        downloaded_bytes: 0,
        total_bytes: total_known,
        percentage: 0,
        instantaneous_speed: 0,
        estimated_seconds_remaining: 0,
        status: DownloadStatus::Failed,
        chunks,
    }
}

/// Transfer error after initialization. Counters stay as last observed.
pub fn fail_from(previous: &DownloadProgress) -> Result<DownloadProgress, TransitionError> {
    let mut next = transition(previous, DownloadStatus::Failed, "fail")?;
    if let Some(chunk) = next
        .chunks
        .iter_mut()
        .find(|chunk| chunk.status == ChunkStatus::Downloading)
    {
        chunk.status = ChunkStatus::Failed;
    }
    Ok(next)
}

pub fn pause(previous: &DownloadProgress) -> Result<DownloadProgress, TransitionError> {
    transition(previous, DownloadStatus::Paused, "pause")
}

/// Re-enters `downloading` with a zero speed; the caller must reset its
/// sampling baseline so the first post-resume update starts from scratch.
pub fn resume(previous: &DownloadProgress) -> Result<DownloadProgress, TransitionError> {
    if previous.status != DownloadStatus::Paused {
        return Err(TransitionError {
            from: previous.status,
            action: "resume",
        });
    }
    transition(previous, DownloadStatus::Downloading, "resume")
}

pub fn cancel(previous: &DownloadProgress) -> Result<DownloadProgress, TransitionError> {
    transition(previous, DownloadStatus::Canceled, "cancel")
}

fn transition(
    previous: &DownloadProgress,
    next: DownloadStatus,
    action: &'static str,
) -> Result<DownloadProgress, TransitionError> {
    if !previous.status.can_transition_to(next) {
        return Err(TransitionError {
            from: previous.status,
            action,
        });
    }
    Ok(DownloadProgress {
        instantaneous_speed: 0,
        estimated_seconds_remaining: 0,
        status: next,
        ..previous.clone()
    })
}

/// `round(downloaded / total * 100)` with halves rounded up, clamped to 100.
/// An unknown (zero) total reports 0.
pub fn percentage_of(downloaded_bytes: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 0;
    }
    let value = rounded_div(u128::from(downloaded_bytes) * 100, u128::from(total_bytes));
    value.min(100) as u8
}

/// Synthetic chunk bars for a percentage.
///
/// The active chunk is `ceil(p / 100 * n) - 1` (chunk 0 at 0%). Chunks before
/// it are complete and chunks after it pending. The active chunk's own
/// progress is `(p mod (100 / n)) * n`, which reduces to `(p * n) mod 100`.
/// At 100% every chunk is complete.
pub fn chunk_states(percentage: u8, chunk_count: usize) -> Vec<Chunk> {
    let count = normalize_chunk_count(chunk_count);
    let percentage = usize::from(percentage.min(100));

    if percentage == 100 {
        return (0..count)
            .map(|index| Chunk {
                index,
                progress: 100,
                status: ChunkStatus::Completed,
            })
            .collect();
    }

    let scaled = percentage * count;
    let active = scaled.div_ceil(100).saturating_sub(1);
    let active_progress = (scaled % 100) as u8;

    (0..count)
        .map(|index| match index.cmp(&active) {
            std::cmp::Ordering::Less => Chunk {
                index,
                progress: 100,
                status: ChunkStatus::Completed,
            },
            std::cmp::Ordering::Equal => Chunk {
                index,
                progress: active_progress,
                status: ChunkStatus::Downloading,
            },
            std::cmp::Ordering::Greater => Chunk {
                index,
                progress: 0,
                status: ChunkStatus::Pending,
            },
        })
        .collect()
}

fn eta_seconds(remaining_bytes: u64, speed: u64) -> u64 {
    if speed == 0 {
        return 0;
    }
    rounded_div(u128::from(remaining_bytes), u128::from(speed))
}

fn normalize_chunk_count(chunk_count: usize) -> usize {
    chunk_count.max(1)
}

/// Integer division rounding halves up. `denominator` must be non-zero.
fn rounded_div(numerator: u128, denominator: u128) -> u64 {
    let value = (numerator * 2 + denominator) / (denominator * 2);
    u64::try_from(value).unwrap_or(u64::MAX)
}
