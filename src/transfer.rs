//! Tracked download jobs.
//!
//! Every accepted request becomes one tokio task that copies the provider's
//! byte stream into `<dir>/<subject>.<generation>.<ext>.part`, feeding each
//! read into the [`ProgressRegistry`]. A finished transfer is renamed to
//! `<title>.<ext>` and logged to [`HistoryStore`] before its record turns
//! completed. Pause and cancel reach the task through a
//! `watch` channel: a paused task simply stops reading, and a canceled one
//! drops the stream, which releases the provider.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::extractor::{
    ExtractorError, MetadataProvider, Rendition, SubjectInfo, TransferProvider, TransferStream,
};
use crate::history::{HistoryRecord, HistoryStore};
use crate::progress::{DownloadProgress, DownloadStatus, TransitionError};
use crate::registry::{ProgressRegistry, RegistryError, monotonic_ms};
use crate::settings::{SettingsStore, choose_rendition};
use crate::units::{format_bytes, format_eta, format_speed};

/// Used as the total when neither the stream nor the metadata knows a size.
pub const DEFAULT_TOTAL_ESTIMATE: u64 = 1_000_000;
const READ_BUFFER_SIZE: usize = 64 * 1024;
const PART_SUFFIX: &str = "part";
const MAX_FILE_STEM: usize = 120;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub format_id: Option<String>,
}

/// Snapshot plus the pre-rendered strings the dashboard shows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadView {
    #[serde(flatten)]
    pub progress: DownloadProgress,
    pub title: String,
    pub speed_text: String,
    pub eta_text: String,
    pub downloaded_text: String,
    pub total_text: String,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no downloadable rendition for {0}")]
    NoRendition(String),
    #[error("download {0} has no completed file")]
    NotReady(String),
    #[error("transfer ended after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("transfer sent {received} bytes but declared {expected}")]
    Oversized { received: u64, expected: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Canceled,
}

/// What the dashboard needs about a download beyond its snapshot.
#[derive(Debug, Clone)]
struct JobDetails {
    title: String,
    quality: String,
    file: Option<PathBuf>,
}

struct LiveJob {
    generation: u64,
    control: watch::Sender<Control>,
}

struct JobTicket {
    generation: u64,
    subject_id: String,
    title: String,
    source_url: String,
    rendition: Rendition,
}

enum Outcome {
    Completed { path: PathBuf, bytes: u64, elapsed_ms: u64 },
    Canceled,
}

/// How a registry rejection observed by the job should be read.
enum Interruption {
    Paused,
    Canceled,
}

fn interruption(err: &RegistryError) -> Option<Interruption> {
    match err {
        RegistryError::NotFound(_) => Some(Interruption::Canceled),
        RegistryError::Transition(TransitionError { from, .. }) => match from {
            DownloadStatus::Paused => Some(Interruption::Paused),
            DownloadStatus::Canceled => Some(Interruption::Canceled),
            _ => None,
        },
        RegistryError::AlreadyActive(_) => None,
    }
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: ProgressRegistry,
    metadata: Arc<dyn MetadataProvider>,
    transfer: Arc<dyn TransferProvider>,
    download_dir: PathBuf,
    history: Arc<HistoryStore>,
    settings: Arc<SettingsStore>,
    details: Mutex<HashMap<String, JobDetails>>,
    live: Mutex<HashMap<String, LiveJob>>,
    generation: AtomicU64,
}

impl DownloadManager {
    pub fn new(
        download_dir: PathBuf,
        registry: ProgressRegistry,
        metadata: Arc<dyn MetadataProvider>,
        transfer: Arc<dyn TransferProvider>,
        history: Arc<HistoryStore>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                metadata,
                transfer,
                download_dir,
                history,
                settings,
                details: Mutex::new(HashMap::new()),
                live: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.inner.history
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub async fn resolve(&self, url: &str) -> Result<SubjectInfo, DownloadError> {
        Ok(self.inner.metadata.resolve(url).await?)
    }

    /// Opens an untracked transfer of `rendition_id`, checked against the
    /// subject's metadata first.
    pub async fn open_stream(
        &self,
        url: &str,
        rendition_id: &str,
    ) -> Result<(SubjectInfo, Rendition, Box<dyn TransferStream>), DownloadError> {
        let info = self.resolve(url).await?;
        let rendition = info
            .rendition(rendition_id)
            .cloned()
            .ok_or_else(|| ExtractorError::UnknownRendition(rendition_id.to_owned()))?;
        let stream = self.inner.transfer.open(url, rendition_id).await?;
        Ok((info, rendition, stream))
    }

    /// Resolves the URL, picks a rendition and spawns the job. The returned
    /// view is the queued record.
    pub async fn start(&self, request: DownloadRequest) -> Result<DownloadView, DownloadError> {
        let info = self.resolve(&request.url).await?;
        let rendition = match request.format_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => info
                .rendition(id)
                .cloned()
                .ok_or_else(|| ExtractorError::UnknownRendition(id.to_owned()))?,
            None => choose_rendition(&info.renditions, &self.inner.settings.get())
                .cloned()
                .ok_or_else(|| DownloadError::NoRendition(info.url.clone()))?,
        };
        let subject_id = subject_key(&info);

        let queued = self.inner.registry.queue(
            &subject_id,
            &rendition.id,
            rendition.filesize.unwrap_or(0),
        )?;

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (control, receiver) = watch::channel(Control::Running);
        self.inner
            .live
            .lock()
            .insert(subject_id.clone(), LiveJob { generation, control });
        self.inner.details.lock().insert(
            subject_id.clone(),
            JobDetails {
                title: info.title.clone(),
                quality: rendition.quality.clone(),
                file: None,
            },
        );

        info!(
            subject = %subject_id,
            format = %rendition.id,
            title = %info.title,
            "download queued"
        );

        let ticket = JobTicket {
            generation,
            subject_id,
            title: info.title.clone(),
            source_url: request.url,
            rendition,
        };
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_job(ticket, receiver).await });

        Ok(self.inner.view(queued))
    }

    pub fn list(&self) -> Vec<DownloadView> {
        self.inner
            .registry
            .list()
            .into_iter()
            .map(|progress| self.inner.view(progress))
            .collect()
    }

    pub fn get(&self, subject_id: &str) -> Result<DownloadView, DownloadError> {
        let progress = self
            .inner
            .registry
            .get(subject_id)
            .ok_or_else(|| RegistryError::NotFound(subject_id.to_owned()))?;
        Ok(self.inner.view(progress))
    }

    pub fn pause(&self, subject_id: &str) -> Result<DownloadView, DownloadError> {
        let progress = self.inner.registry.pause(subject_id)?;
        self.inner.signal(subject_id, Control::Paused);
        debug!(subject = %subject_id, "download paused");
        Ok(self.inner.view(progress))
    }

    pub fn resume(&self, subject_id: &str) -> Result<DownloadView, DownloadError> {
        let progress = self.inner.registry.resume(subject_id)?;
        self.inner.signal(subject_id, Control::Running);
        debug!(subject = %subject_id, "download resumed");
        Ok(self.inner.view(progress))
    }

    pub fn cancel(&self, subject_id: &str) -> Result<DownloadView, DownloadError> {
        let progress = self.inner.registry.cancel(subject_id)?;
        self.inner.signal(subject_id, Control::Canceled);
        info!(subject = %subject_id, "download canceled");
        Ok(self.inner.view(progress))
    }

    /// Drops the record, canceling a live job first. A completed file stays
    /// on disk.
    pub fn remove(&self, subject_id: &str) -> Result<DownloadProgress, DownloadError> {
        let live = self
            .inner
            .registry
            .get(subject_id)
            .is_some_and(|progress| !progress.status.is_terminal());
        if live {
            // The job may finish between the check and the cancel.
            if let Err(err) = self.inner.registry.cancel(subject_id) {
                debug!(subject = %subject_id, %err, "cancel before remove skipped");
            }
            self.inner.signal(subject_id, Control::Canceled);
        }
        let removed = self.inner.registry.remove(subject_id)?;
        self.inner.details.lock().remove(subject_id);
        Ok(removed)
    }

    /// Location and download name of a completed download.
    pub fn completed_file(&self, subject_id: &str) -> Result<(PathBuf, String), DownloadError> {
        let progress = self
            .inner
            .registry
            .get(subject_id)
            .ok_or_else(|| RegistryError::NotFound(subject_id.to_owned()))?;
        if progress.status != DownloadStatus::Completed {
            return Err(DownloadError::NotReady(subject_id.to_owned()));
        }
        let details = self.inner.details.lock().get(subject_id).cloned();
        let path = details
            .and_then(|details| details.file)
            .ok_or_else(|| DownloadError::NotReady(subject_id.to_owned()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{subject_id}.bin"));
        Ok((path, name))
    }
}

impl ManagerInner {
    fn view(&self, progress: DownloadProgress) -> DownloadView {
        let title = self
            .details
            .lock()
            .get(&progress.subject_id)
            .map(|details| details.title.clone())
            .unwrap_or_else(|| progress.subject_id.clone());
        DownloadView {
            title,
            speed_text: format_speed(progress.instantaneous_speed),
            eta_text: format_eta(progress.estimated_seconds_remaining),
            downloaded_text: format_bytes(progress.downloaded_bytes),
            total_text: format_bytes(progress.total_bytes),
            progress,
        }
    }

    fn signal(&self, subject_id: &str, control: Control) {
        if let Some(job) = self.live.lock().get(subject_id) {
            job.control.send_replace(control);
        }
    }

    async fn run_job(self: Arc<Self>, ticket: JobTicket, mut control: watch::Receiver<Control>) {
        match self.transfer_job(&ticket, &mut control).await {
            Ok(Outcome::Completed {
                path,
                bytes,
                elapsed_ms,
            }) => {
                info!(
                    subject = %ticket.subject_id,
                    path = %path.display(),
                    bytes,
                    elapsed_ms,
                    "download completed"
                );
            }
            Ok(Outcome::Canceled) => {
                debug!(subject = %ticket.subject_id, "transfer stopped after cancel");
            }
            Err(err) => {
                warn!(subject = %ticket.subject_id, %err, "download failed");
                // A canceled job may have been replaced by a retry whose
                // record must not be touched.
                let stale = *control.borrow() == Control::Canceled || !self.owns(&ticket);
                if stale || self.registry.get(&ticket.subject_id).is_none() {
                    return self.release(&ticket);
                }
                let total = ticket.rendition.filesize.unwrap_or(0);
                if let Err(err) = self.registry.fail(&ticket.subject_id, &ticket.rendition.id, total) {
                    debug!(subject = %ticket.subject_id, %err, "failure not recorded");
                }
            }
        }

        self.release(&ticket);
    }

    fn owns(&self, ticket: &JobTicket) -> bool {
        self.live
            .lock()
            .get(&ticket.subject_id)
            .is_some_and(|job| job.generation == ticket.generation)
    }

    fn release(&self, ticket: &JobTicket) {
        let mut live = self.live.lock();
        if live
            .get(&ticket.subject_id)
            .is_some_and(|job| job.generation == ticket.generation)
        {
            live.remove(&ticket.subject_id);
        }
    }

    fn set_file(&self, subject_id: &str, file: Option<PathBuf>) {
        if let Some(details) = self.details.lock().get_mut(subject_id) {
            details.file = file;
        }
    }

    async fn discard(&self, subject_id: &str, path: &Path, history_id: Option<&str>) {
        self.set_file(subject_id, None);
        if let Err(err) = fs::remove_file(path).await {
            warn!(path = %path.display(), %err, "could not remove discarded download");
        }
        if let Some(id) = history_id
            && let Err(err) = self.history.remove(id).await
        {
            warn!(subject = %subject_id, error = %err, "could not drop history entry");
        }
    }

    async fn transfer_job(
        &self,
        ticket: &JobTicket,
        control: &mut watch::Receiver<Control>,
    ) -> Result<Outcome, DownloadError> {
        let subject = ticket.subject_id.as_str();
        let mut stream = self
            .transfer
            .open(&ticket.source_url, &ticket.rendition.id)
            .await?;
        let started_ms = monotonic_ms();
        if *control.borrow() == Control::Canceled {
            return Ok(Outcome::Canceled);
        }

        let declared = stream.declared_size().filter(|size| *size > 0);
        let mut total = declared
            .or(ticket.rendition.filesize.filter(|size| *size > 0))
            .unwrap_or(DEFAULT_TOTAL_ESTIMATE);
        match self.registry.start(subject, total, monotonic_ms()) {
            Ok(_) => {}
            Err(err) if matches!(interruption(&err), Some(Interruption::Canceled)) => {
                return Ok(Outcome::Canceled);
            }
            Err(err) => return Err(err.into()),
        }

        fs::create_dir_all(&self.download_dir).await?;
        let mut part = PartFile::create(
            &self.download_dir,
            subject,
            ticket.generation,
            &ticket.rendition.extension,
        )
        .await?;
        debug!(subject, path = %part.path.display(), total, "transfer opened");

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut downloaded = 0u64;
        loop {
            if !wait_until_running(control).await {
                return Ok(Outcome::Canceled);
            }
            let read = tokio::select! {
                read = stream.read(&mut buf) => read?,
                changed = control.changed() => {
                    if changed.is_err() {
                        return Ok(Outcome::Canceled);
                    }
                    continue;
                }
            };
            if read == 0 {
                break;
            }
            downloaded += read as u64;
            match declared {
                Some(expected) if downloaded > expected => {
                    return Err(DownloadError::Oversized {
                        received: downloaded,
                        expected,
                    });
                }
                Some(_) => {}
                None => total = total.max(downloaded),
            }
            part.file.write_all(&buf[..read]).await?;

            if let Err(err) = self
                .registry
                .record_sample(subject, downloaded, total, monotonic_ms())
            {
                match interruption(&err) {
                    // Paused between the read and the sample; the next
                    // sample after resume carries the cumulative count.
                    Some(Interruption::Paused) => {}
                    Some(Interruption::Canceled) => return Ok(Outcome::Canceled),
                    None => return Err(err.into()),
                }
            }
        }

        stream.finish().await?;
        if let Some(expected) = declared
            && downloaded < expected
        {
            return Err(DownloadError::Truncated {
                received: downloaded,
                expected,
            });
        }
        part.file.flush().await?;
        part.file.sync_all().await?;

        let destination = self
            .download_dir
            .join(final_file_name(&ticket.title, &ticket.rendition.extension));
        part.persist(&destination).await?;
        self.set_file(subject, Some(destination.clone()));

        // File and history entry are in place before the record turns
        // completed, so a watcher that stops at `completed` sees both.
        let elapsed_ms = monotonic_ms().saturating_sub(started_ms).max(1);
        let history_id = self
            .record_history(ticket, &destination, downloaded, elapsed_ms)
            .await;
        loop {
            if !wait_until_running(control).await {
                self.discard(subject, &destination, history_id.as_deref())
                    .await;
                return Ok(Outcome::Canceled);
            }
            match self.registry.complete(subject, downloaded) {
                Ok(_) => break,
                Err(err) => match interruption(&err) {
                    Some(Interruption::Paused) => tokio::task::yield_now().await,
                    Some(Interruption::Canceled) => {
                        self.discard(subject, &destination, history_id.as_deref())
                            .await;
                        return Ok(Outcome::Canceled);
                    }
                    None => {
                        self.discard(subject, &destination, history_id.as_deref())
                            .await;
                        return Err(err.into());
                    }
                },
            }
        }

        Ok(Outcome::Completed {
            path: destination,
            bytes: downloaded,
            elapsed_ms,
        })
    }

    /// Returns the id of the inserted entry, or `None` if the insert failed.
    async fn record_history(
        &self,
        ticket: &JobTicket,
        path: &Path,
        bytes: u64,
        elapsed_ms: u64,
    ) -> Option<String> {
        let downloaded_at = Utc::now();
        let record = HistoryRecord {
            id: format!("{}-{}", ticket.subject_id, downloaded_at.timestamp_millis()),
            subject_id: ticket.subject_id.clone(),
            title: ticket.title.clone(),
            source_url: ticket.source_url.clone(),
            format_id: ticket.rendition.id.clone(),
            quality: self
                .details
                .lock()
                .get(&ticket.subject_id)
                .map(|details| details.quality.clone())
                .unwrap_or_else(|| ticket.rendition.quality.clone()),
            file_size: bytes,
            file_path: path.to_string_lossy().into_owned(),
            downloaded_at,
            completion_secs: elapsed_ms as f64 / 1000.0,
            average_speed: bytes.saturating_mul(1000) / elapsed_ms,
        };
        match self.history.insert(&record).await {
            Ok(()) => Some(record.id),
            Err(err) => {
                warn!(subject = %ticket.subject_id, error = %err, "could not record history entry");
                None
            }
        }
    }
}

/// Blocks while paused. Returns `false` once the job must stop.
async fn wait_until_running(control: &mut watch::Receiver<Control>) -> bool {
    loop {
        let state = *control.borrow_and_update();
        match state {
            Control::Running => return true,
            Control::Canceled => return false,
            Control::Paused => {
                if control.changed().await.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Partial output that is deleted unless [`PartFile::persist`] succeeds.
struct PartFile {
    path: PathBuf,
    file: File,
    armed: bool,
}

impl PartFile {
    /// The generation keeps a retried job clear of an older job still
    /// unwinding on the same subject.
    async fn create(
        dir: &Path,
        subject_id: &str,
        generation: u64,
        extension: &str,
    ) -> std::io::Result<Self> {
        let path = dir.join(format!(
            "{}.{generation}.{}.{PART_SUFFIX}",
            sanitize_component(subject_id),
            sanitize_extension(extension)
        ));
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file,
            armed: true,
        })
    }

    async fn persist(mut self, destination: &Path) -> std::io::Result<()> {
        fs::rename(&self.path, destination).await?;
        self.armed = false;
        Ok(())
    }
}

// A single blocking unlink on the runtime thread.
impl Drop for PartFile {
    fn drop(&mut self) {
        if self.armed
            && let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), %err, "could not remove partial download");
        }
    }
}

fn subject_key(info: &SubjectInfo) -> String {
    if info.id.trim().is_empty() {
        sanitize_component(&info.url)
    } else {
        info.id.clone()
    }
}

/// Replaces every non-alphanumeric character with `_`.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| if ch.is_alphanumeric() { ch } else { '_' })
        .take(MAX_FILE_STEM)
        .collect();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

fn sanitize_extension(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    if cleaned.is_empty() {
        "bin".to_string()
    } else {
        cleaned
    }
}

/// `<title>.<ext>` with the title made filesystem-safe.
pub fn final_file_name(title: &str, extension: &str) -> String {
    format!(
        "{}.{}",
        sanitize_component(title.trim()),
        sanitize_extension(extension)
    )
}
