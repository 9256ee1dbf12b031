//! [`MetadataProvider`] and [`TransferProvider`] backed by the yt-dlp CLI.

use async_trait::async_trait;
use serde::Deserialize;
use std::{
    collections::VecDeque,
    io,
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf},
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::extractor::{
    ExtractorError, MetadataProvider, Rendition, SubjectInfo, TransferProvider, TransferStream,
};
use crate::security::validate_source_url;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn spawn_error(&self, err: io::Error) -> ExtractorError {
        ExtractorError::Unavailable(format!("{}: {err}", self.binary.display()))
    }
}

/// Subset of the `--dump-single-json` payload. Everything is optional since
/// extractors for different sites fill in different fields.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    upload_date: Option<String>,
    view_count: Option<u64>,
    webpage_url: Option<String>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    format_id: Option<String>,
    format_note: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    tbr: Option<f64>,
}

impl FormatInfo {
    fn is_storyboard(&self) -> bool {
        self.ext.as_deref() == Some("mhtml")
            || self
                .format_note
                .as_deref()
                .is_some_and(|note| note.eq_ignore_ascii_case("storyboard"))
    }

    fn into_rendition(self) -> Option<Rendition> {
        if self.is_storyboard() {
            return None;
        }
        let id = self.format_id.filter(|id| !id.is_empty())?;
        let vcodec = codec(self.vcodec);
        let acodec = codec(self.acodec);
        let audio_only = vcodec.is_none() && acodec.is_some();

        let quality = self
            .format_note
            .filter(|note| !note.trim().is_empty())
            .or_else(|| self.height.map(|height| format!("{height}p")))
            .unwrap_or_else(|| {
                if audio_only {
                    "audio only".to_string()
                } else {
                    "unknown".to_string()
                }
            });
        let resolution = self
            .resolution
            .filter(|value| value != "audio only")
            .or_else(|| match (self.width, self.height) {
                (Some(width), Some(height)) => Some(format!("{width}x{height}")),
                _ => None,
            });

        Some(Rendition {
            id,
            quality,
            extension: self.ext.unwrap_or_else(|| "bin".to_string()),
            resolution,
            height: self.height,
            fps: self.fps,
            filesize: self.filesize.or(self.filesize_approx),
            bitrate: self.tbr,
            vcodec,
            acodec,
            audio_only,
        })
    }
}

fn codec(value: Option<String>) -> Option<String> {
    value.filter(|codec| !codec.is_empty() && codec != "none")
}

fn parse_subject(raw: &[u8], requested_url: &str) -> Result<SubjectInfo, ExtractorError> {
    let info: VideoInfo = serde_json::from_slice(raw)?;
    let id = info.id.unwrap_or_default();
    let title = info
        .fulltitle
        .or(info.title)
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| id.clone());
    Ok(SubjectInfo {
        title,
        thumbnail: info.thumbnail,
        duration: info
            .duration
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| secs.round() as u64),
        upload_date: info.upload_date,
        view_count: info.view_count,
        url: info
            .webpage_url
            .unwrap_or_else(|| requested_url.to_owned()),
        renditions: info
            .formats
            .into_iter()
            .filter_map(FormatInfo::into_rendition)
            .collect(),
        id,
    })
}

/// Last meaningful stderr line, without yt-dlp's `ERROR:` prefix.
fn failure_message(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.strip_prefix("ERROR:").unwrap_or(line).trim().to_string())
        .unwrap_or_else(|| "yt-dlp failed without output".to_string())
}

#[async_trait]
impl MetadataProvider for YtDlp {
    async fn resolve(&self, url: &str) -> Result<SubjectInfo, ExtractorError> {
        let url = validate_source_url(url)?;
        debug!(%url, "resolving metadata");
        let output = self
            .command()
            .args([
                "--dump-single-json",
                "--skip-download",
                "--no-playlist",
                "--no-warnings",
                "--",
                url.as_str(),
            ])
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            let message = failure_message(&String::from_utf8_lossy(&output.stderr));
            warn!(%url, status = %output.status, %message, "metadata lookup failed");
            return Err(ExtractorError::Resolution {
                url: url.to_string(),
                message,
            });
        }
        parse_subject(&output.stdout, url.as_str())
    }
}

#[async_trait]
impl TransferProvider for YtDlp {
    async fn open(
        &self,
        url: &str,
        rendition_id: &str,
    ) -> Result<Box<dyn TransferStream>, ExtractorError> {
        let url = validate_source_url(url)?;
        if rendition_id.is_empty() || rendition_id.starts_with('-') {
            return Err(ExtractorError::UnknownRendition(rendition_id.to_owned()));
        }
        debug!(%url, format = rendition_id, "opening transfer");

        let mut child = self
            .command()
            .args([
                "--format",
                rendition_id,
                "--output",
                "-",
                "--no-part",
                "--no-progress",
                "--quiet",
                "--",
                url.as_str(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| self.spawn_error(err))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractorError::Transfer("stdout was not captured".into()))?;
        let stderr_tail = match child.stderr.take() {
            Some(stderr) => tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            }),
            None => tokio::spawn(async { String::new() }),
        };

        Ok(Box::new(YtDlpStream {
            child,
            stdout,
            stderr_tail,
        }))
    }
}

/// yt-dlp writing one rendition to its stdout. Dropping it kills the child.
struct YtDlpStream {
    child: Child,
    stdout: ChildStdout,
    stderr_tail: JoinHandle<String>,
}

impl AsyncRead for YtDlpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

#[async_trait]
impl TransferStream for YtDlpStream {
    fn declared_size(&self) -> Option<u64> {
        None
    }

    async fn finish(self: Box<Self>) -> Result<(), ExtractorError> {
        let YtDlpStream {
            mut child,
            stdout,
            stderr_tail,
        } = *self;
        drop(stdout);
        let status = child.wait().await?;
        let tail = stderr_tail.await.unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        Err(ExtractorError::Transfer(format!(
            "yt-dlp exited with {status}: {}",
            failure_message(&tail)
        )))
    }
}
