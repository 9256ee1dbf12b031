//! Session-scoped store of download snapshots keyed by subject id.
//!
//! The registry is the single owner of mutable progress state. Each operation
//! takes the lock, feeds the current snapshot through a pure function from
//! [`crate::progress`] and stores the result, so concurrent downloads never
//! observe each other's records.

use std::{collections::HashMap, sync::OnceLock, time::Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::progress::{
    self, DownloadProgress, DownloadStatus, MIN_SAMPLE_INTERVAL_MS, Sample, TransitionError,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("download {0} not found")]
    NotFound(String),
    #[error("download {0} is already active")]
    AlreadyActive(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

struct Entry {
    progress: DownloadProgress,
    /// Speed baseline. `None` until the first sample after a (re)start.
    baseline: Option<Sample>,
    seq: u64,
}

#[derive(Default)]
struct Entries {
    by_subject: HashMap<String, Entry>,
    next_seq: u64,
}

pub struct ProgressRegistry {
    entries: Mutex<Entries>,
    chunk_count: usize,
}

impl ProgressRegistry {
    pub fn new(chunk_count: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            chunk_count: chunk_count.max(1),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Registers a download. A terminal record for the same subject is
    /// replaced, which is how a retry re-enters the lifecycle.
    pub fn queue(
        &self,
        subject_id: &str,
        format_id: &str,
        total_hint: u64,
    ) -> Result<DownloadProgress, RegistryError> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.by_subject.get(subject_id)
            && !existing.progress.status.is_terminal()
        {
            return Err(RegistryError::AlreadyActive(subject_id.to_owned()));
        }

        let record = progress::queued(subject_id, format_id, total_hint, self.chunk_count);
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.by_subject.insert(
            subject_id.to_owned(),
            Entry {
                progress: record.clone(),
                baseline: None,
                seq,
            },
        );
        Ok(record)
    }

    /// Transfer opened: `queued -> downloading`, baseline at zero bytes.
    pub fn start(
        &self,
        subject_id: &str,
        total_bytes: u64,
        now_ms: u64,
    ) -> Result<DownloadProgress, RegistryError> {
        self.with_entry(subject_id, |entry| {
            let next = progress::begin(&entry.progress, total_bytes)?;
            entry.baseline = Some(Sample::new(now_ms, 0));
            Ok(next)
        })
    }

    /// Applies one observation of cumulative bytes. Only `downloading`
    /// records accept samples.
    pub fn record_sample(
        &self,
        subject_id: &str,
        downloaded_bytes: u64,
        total_bytes: u64,
        now_ms: u64,
    ) -> Result<DownloadProgress, RegistryError> {
        self.with_entry(subject_id, |entry| {
            if entry.progress.status != DownloadStatus::Downloading {
                return Err(TransitionError {
                    from: entry.progress.status,
                    action: "update",
                });
            }
            let baseline = entry
                .baseline
                .unwrap_or_else(|| Sample::new(now_ms, downloaded_bytes));
            let next =
                progress::update(&entry.progress, downloaded_bytes, total_bytes, baseline, now_ms);
            entry.baseline = if now_ms.saturating_sub(baseline.at_ms) > MIN_SAMPLE_INTERVAL_MS {
                Some(Sample::new(now_ms, downloaded_bytes))
            } else {
                Some(baseline)
            };
            Ok(next)
        })
    }

    pub fn pause(&self, subject_id: &str) -> Result<DownloadProgress, RegistryError> {
        self.with_entry(subject_id, |entry| progress::pause(&entry.progress))
    }

    pub fn resume(&self, subject_id: &str) -> Result<DownloadProgress, RegistryError> {
        self.with_entry(subject_id, |entry| {
            let next = progress::resume(&entry.progress)?;
            entry.baseline = None;
            Ok(next)
        })
    }

    pub fn cancel(&self, subject_id: &str) -> Result<DownloadProgress, RegistryError> {
        self.with_entry(subject_id, |entry| progress::cancel(&entry.progress))
    }

    /// Marks a transfer error. Existing records keep their counters; a subject
    /// with no record yet gets a zeroed failed record.
    pub fn fail(
        &self,
        subject_id: &str,
        format_id: &str,
        total_known: u64,
    ) -> Result<DownloadProgress, RegistryError> {
        {
            let mut entries = self.entries.lock();
            if !entries.by_subject.contains_key(subject_id) {
                let record = progress::fail(subject_id, format_id, total_known, self.chunk_count);
                let seq = entries.next_seq;
                entries.next_seq += 1;
                entries.by_subject.insert(
                    subject_id.to_owned(),
                    Entry {
                        progress: record.clone(),
                        baseline: None,
                        seq,
                    },
                );
                return Ok(record);
            }
        }
        self.with_entry(subject_id, |entry| progress::fail_from(&entry.progress))
    }

    pub fn complete(
        &self,
        subject_id: &str,
        total_bytes: u64,
    ) -> Result<DownloadProgress, RegistryError> {
        self.with_entry(subject_id, |entry| {
            let current = &entry.progress;
            if !current.status.can_transition_to(DownloadStatus::Completed) {
                return Err(TransitionError {
                    from: current.status,
                    action: "complete",
                });
            }
            Ok(progress::complete(
                &current.subject_id,
                &current.format_id,
                total_bytes,
                current.chunk_count(),
            ))
        })
    }

    pub fn remove(&self, subject_id: &str) -> Result<DownloadProgress, RegistryError> {
        self.entries
            .lock()
            .by_subject
            .remove(subject_id)
            .map(|entry| entry.progress)
            .ok_or_else(|| RegistryError::NotFound(subject_id.to_owned()))
    }

    pub fn get(&self, subject_id: &str) -> Option<DownloadProgress> {
        self.entries
            .lock()
            .by_subject
            .get(subject_id)
            .map(|entry| entry.progress.clone())
    }

    /// Every record, oldest registration first.
    pub fn list(&self) -> Vec<DownloadProgress> {
        let entries = self.entries.lock();
        let mut records: Vec<(u64, DownloadProgress)> = entries
            .by_subject
            .values()
            .map(|entry| (entry.seq, entry.progress.clone()))
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        records.into_iter().map(|(_, progress)| progress).collect()
    }

    fn with_entry(
        &self,
        subject_id: &str,
        apply: impl FnOnce(&mut Entry) -> Result<DownloadProgress, TransitionError>,
    ) -> Result<DownloadProgress, RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .by_subject
            .get_mut(subject_id)
            .ok_or_else(|| RegistryError::NotFound(subject_id.to_owned()))?;
        let next = apply(entry)?;
        entry.progress = next.clone();
        Ok(next)
    }
}

/// Milliseconds since the first call in this process. Monotonic, so sample
/// timestamps never run backwards.
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let elapsed = EPOCH.get_or_init(Instant::now).elapsed().as_millis();
    u64::try_from(elapsed).unwrap_or(u64::MAX)
}
