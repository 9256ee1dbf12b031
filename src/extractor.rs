//! Contracts for the external extraction tool.
//!
//! The backend never parses video sites itself. It asks a [`MetadataProvider`]
//! what a URL contains and a [`TransferProvider`] for the bytes of one
//! rendition. [`crate::ytdlp`] implements both on top of yt-dlp; tests use
//! in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

/// One selectable encoded variant of a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rendition {
    pub id: String,
    pub quality: String,
    pub extension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    /// Byte-size estimate reported by the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    /// Total bitrate in kbit/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(default)]
    pub audio_only: bool,
}

/// Everything the dashboard needs to offer a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInfo {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    pub url: String,
    pub renditions: Vec<Rendition>,
}

impl SubjectInfo {
    pub fn rendition(&self, id: &str) -> Option<&Rendition> {
        self.renditions.iter().find(|rendition| rendition.id == id)
    }
}

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("extraction tool unavailable: {0}")]
    Unavailable(String),
    #[error("could not resolve {url}: {message}")]
    Resolution { url: String, message: String },
    #[error("unexpected extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown rendition {0}")]
    UnknownRendition(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<SubjectInfo, ExtractorError>;
}

#[async_trait]
pub trait TransferProvider: Send + Sync {
    async fn open(
        &self,
        url: &str,
        rendition_id: &str,
    ) -> Result<Box<dyn TransferStream>, ExtractorError>;
}

/// Byte stream for one rendition. Dropping it releases the transfer.
#[async_trait]
pub trait TransferStream: AsyncRead + Send + Unpin {
    /// Authoritative size if the provider knows it up front.
    fn declared_size(&self) -> Option<u64>;

    /// Waits for the provider's verdict once the stream hit EOF.
    async fn finish(self: Box<Self>) -> Result<(), ExtractorError>;
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-memory providers shared by manager and handler tests.

    use super::*;
    use parking_lot::Mutex;
    use std::{
        collections::HashMap,
        io,
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::{DuplexStream, ReadBuf};

    pub fn rendition(id: &str, height: u32, ext: &str, filesize: Option<u64>) -> Rendition {
        Rendition {
            id: id.into(),
            quality: format!("{height}p"),
            extension: ext.into(),
            resolution: Some(format!("{}x{height}", height * 16 / 9)),
            height: Some(height),
            fps: Some(30.0),
            filesize,
            bitrate: Some(f64::from(height)),
            vcodec: Some("avc1".into()),
            acodec: Some("mp4a".into()),
            audio_only: false,
        }
    }

    pub fn subject(id: &str, renditions: Vec<Rendition>) -> SubjectInfo {
        SubjectInfo {
            id: id.into(),
            title: format!("Title {id}"),
            thumbnail: None,
            duration: Some(10),
            upload_date: None,
            view_count: None,
            url: format!("https://video.test/watch?v={id}"),
            renditions,
        }
    }

    #[derive(Default)]
    pub struct FakeProvider {
        subjects: Mutex<HashMap<String, SubjectInfo>>,
        payloads: Mutex<HashMap<String, Vec<u8>>>,
        failures: Mutex<HashMap<String, String>>,
        declared: Mutex<Option<u64>>,
        chunk_size: Mutex<Option<usize>>,
    }

    impl FakeProvider {
        pub fn with_subject(self, url: &str, info: SubjectInfo, payload: &[u8]) -> Self {
            self.subjects.lock().insert(url.to_owned(), info);
            self.payloads.lock().insert(url.to_owned(), payload.to_vec());
            self
        }

        /// Makes `finish` report an error for transfers of `url`.
        pub fn failing(self, url: &str, message: &str) -> Self {
            self.failures.lock().insert(url.to_owned(), message.to_owned());
            self
        }

        pub fn declaring(self, size: u64) -> Self {
            *self.declared.lock() = Some(size);
            self
        }

        pub fn chunked(self, size: usize) -> Self {
            *self.chunk_size.lock() = Some(size);
            self
        }
    }

    #[async_trait]
    impl MetadataProvider for FakeProvider {
        async fn resolve(&self, url: &str) -> Result<SubjectInfo, ExtractorError> {
            self.subjects
                .lock()
                .get(url)
                .cloned()
                .ok_or_else(|| ExtractorError::Resolution {
                    url: url.to_owned(),
                    message: "unsupported url".into(),
                })
        }
    }

    #[async_trait]
    impl TransferProvider for FakeProvider {
        async fn open(
            &self,
            url: &str,
            rendition_id: &str,
        ) -> Result<Box<dyn TransferStream>, ExtractorError> {
            let known = self
                .subjects
                .lock()
                .get(url)
                .is_some_and(|info| info.rendition(rendition_id).is_some());
            if !known {
                return Err(ExtractorError::UnknownRendition(rendition_id.to_owned()));
            }
            let payload = self.payloads.lock().get(url).cloned().unwrap_or_default();
            Ok(Box::new(FakeStream {
                payload,
                offset: 0,
                chunk_size: (*self.chunk_size.lock()).unwrap_or(usize::MAX),
                declared: *self.declared.lock(),
                failure: self.failures.lock().get(url).cloned(),
            }))
        }
    }

    /// Provider whose transfer is fed by the test through a pipe, so
    /// the test decides when bytes arrive and when the stream ends.
    pub struct PipeProvider {
        info: SubjectInfo,
        reader: Mutex<Option<DuplexStream>>,
    }

    impl PipeProvider {
        pub fn new(info: SubjectInfo) -> (Self, DuplexStream) {
            let (reader, writer) = tokio::io::duplex(64 * 1024);
            (
                Self {
                    info,
                    reader: Mutex::new(Some(reader)),
                },
                writer,
            )
        }

        /// Installs a fresh pipe for the next `open`.
        pub fn rearm(&self) -> DuplexStream {
            let (reader, writer) = tokio::io::duplex(64 * 1024);
            *self.reader.lock() = Some(reader);
            writer
        }
    }

    #[async_trait]
    impl MetadataProvider for PipeProvider {
        async fn resolve(&self, _url: &str) -> Result<SubjectInfo, ExtractorError> {
            Ok(self.info.clone())
        }
    }

    #[async_trait]
    impl TransferProvider for PipeProvider {
        async fn open(
            &self,
            _url: &str,
            _rendition_id: &str,
        ) -> Result<Box<dyn TransferStream>, ExtractorError> {
            let reader = self
                .reader
                .lock()
                .take()
                .ok_or_else(|| ExtractorError::Transfer("pipe already taken".into()))?;
            Ok(Box::new(PipeStream(reader)))
        }
    }

    pub struct PipeStream(DuplexStream);

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    #[async_trait]
    impl TransferStream for PipeStream {
        fn declared_size(&self) -> Option<u64> {
            None
        }

        async fn finish(self: Box<Self>) -> Result<(), ExtractorError> {
            Ok(())
        }
    }

    pub struct FakeStream {
        payload: Vec<u8>,
        offset: usize,
        chunk_size: usize,
        declared: Option<u64>,
        failure: Option<String>,
    }

    impl AsyncRead for FakeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let remaining = &self.payload[self.offset..];
            let take = remaining.len().min(buf.remaining()).min(self.chunk_size);
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl TransferStream for FakeStream {
        fn declared_size(&self) -> Option<u64> {
            self.declared
        }

        async fn finish(self: Box<Self>) -> Result<(), ExtractorError> {
            match self.failure {
                Some(message) => Err(ExtractorError::Transfer(message)),
                None => Ok(()),
            }
        }
    }
}
