#![forbid(unsafe_code)]

//! Axum backend for the grabtube dashboard.
//!
//! The API resolves video URLs through yt-dlp, streams a chosen rendition
//! straight to the caller, or runs tracked downloads into the download
//! directory whose progress the dashboard polls. Anything outside `/api`
//! falls through to the optional static dashboard build.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use clap::Parser;
use grabtube::{
    config::{RuntimeOverrides, resolve_runtime_config},
    extractor::{ExtractorError, SubjectInfo},
    history::{HISTORY_DB_FILE, HistoryRecord, HistoryStore},
    logging,
    progress::DownloadProgress,
    registry::{ProgressRegistry, RegistryError},
    security::{ensure_not_root, validate_source_url},
    settings::{DownloadSettings, SettingsStore},
    transfer::{DownloadError, DownloadManager, DownloadRequest, DownloadView, final_file_name},
    ytdlp::YtDlp,
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

const STREAM_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serve the grabtube download API")]
struct BackendArgs {
    /// Directory receiving finished downloads, history and settings.
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Built dashboard served for non-API paths.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long, value_parser = parse_host_arg)]
    host: Option<IpAddr>,
    #[arg(long)]
    port: Option<u16>,
    /// yt-dlp executable.
    #[arg(long)]
    ytdlp: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            download_dir: self.download_dir.clone(),
            www_root: self.www_root.clone(),
            host: self.host.map(|host| host.to_string()),
            port: self.port,
            ytdlp_bin: self.ytdlp.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GRABTUBE_HOST")
}

#[derive(Clone)]
struct AppState {
    downloads: DownloadManager,
    www_root: Option<Arc<PathBuf>>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

fn extractor_status(err: &ExtractorError) -> StatusCode {
    match err {
        ExtractorError::InvalidUrl(_) | ExtractorError::UnknownRendition(_) => {
            StatusCode::BAD_REQUEST
        }
        ExtractorError::Unavailable(_)
        | ExtractorError::Resolution { .. }
        | ExtractorError::Parse(_)
        | ExtractorError::Transfer(_) => StatusCode::BAD_GATEWAY,
        ExtractorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ExtractorError> for ApiError {
    fn from(err: ExtractorError) -> Self {
        Self::new(extractor_status(&err), err.to_string())
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match &err {
            DownloadError::Extractor(inner) => extractor_status(inner),
            DownloadError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            DownloadError::Registry(_) | DownloadError::NotReady(_) => StatusCode::CONFLICT,
            DownloadError::NoRendition(_) => StatusCode::BAD_REQUEST,
            DownloadError::Truncated { .. } | DownloadError::Oversized { .. } => {
                StatusCode::BAD_GATEWAY
            }
            DownloadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
struct MetadataRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    format_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = BackendArgs::parse();
    ensure_not_root("backend")?;

    let config = resolve_runtime_config(args.overrides())?;
    std::fs::create_dir_all(&config.download_dir)
        .with_context(|| format!("creating {}", config.download_dir.display()))?;

    let history = HistoryStore::open(&config.download_dir.join(HISTORY_DB_FILE))
        .await
        .context("initializing download history")?;
    let settings = SettingsStore::load(&config.download_dir, config.settings_defaults.clone());
    let ytdlp = Arc::new(YtDlp::new(config.ytdlp_bin.clone()));
    let downloads = DownloadManager::new(
        config.download_dir.clone(),
        ProgressRegistry::new(config.chunk_count),
        ytdlp.clone(),
        ytdlp,
        Arc::new(history),
        Arc::new(settings),
    );

    let state = AppState {
        downloads,
        www_root: config.www_root.clone().map(Arc::new),
    };

    let host = parse_host_arg(&config.host)?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        download_dir = %config.download_dir.display(),
        ytdlp = %config.ytdlp_bin.display(),
        "API server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/metadata", post(resolve_metadata))
        .route("/api/stream", post(stream_rendition))
        .route("/api/downloads", get(list_downloads).post(start_download))
        .route(
            "/api/downloads/{id}",
            get(get_download).delete(remove_download),
        )
        .route("/api/downloads/{id}/pause", post(pause_download))
        .route("/api/downloads/{id}/resume", post(resume_download))
        .route("/api/downloads/{id}/cancel", post(cancel_download))
        .route("/api/downloads/{id}/file", get(download_file))
        .route("/api/history", get(list_history).delete(clear_history))
        .route("/api/history/{id}", delete(remove_history))
        .route("/api/settings", get(get_settings).put(update_settings))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(%err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

async fn resolve_metadata(
    State(state): State<AppState>,
    payload: Result<Json<MetadataRequest>, JsonRejection>,
) -> ApiResult<Json<SubjectInfo>> {
    let request = json_body(payload)?;
    let url = validate_source_url(&request.url)?;
    let info = state.downloads.resolve(url.as_str()).await?;
    Ok(Json(info))
}

/// Pipes one rendition to the caller without tracking it.
async fn stream_rendition(
    State(state): State<AppState>,
    payload: Result<Json<StreamRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    let url = validate_source_url(&request.url)?;
    if request.format_id.trim().is_empty() {
        return Err(ApiError::bad_request("formatId is required"));
    }
    let (info, rendition, mut stream) = state
        .downloads
        .open_stream(url.as_str(), request.format_id.trim())
        .await?;
    info!(url = %url, format = %rendition.id, "streaming rendition");

    // The pump owns the transfer so the provider's exit verdict is still
    // checked after the last byte went out.
    let (mut writer, reader) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
    let format_id = rendition.id.clone();
    tokio::spawn(async move {
        match tokio::io::copy(&mut stream, &mut writer).await {
            Ok(bytes) => {
                drop(writer);
                if let Err(err) = stream.finish().await {
                    warn!(format = %format_id, bytes, %err, "stream ended with provider error");
                }
            }
            Err(err) => {
                info!(format = %format_id, %err, "stream closed before completion");
            }
        }
    });

    let filename = final_file_name(&info.title, &rendition.extension);
    let mime = MimeGuess::from_ext(&rendition.extension).first_or_octet_stream();
    let body = Body::from_stream(ReaderStream::new(reader));
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_DISPOSITION, attachment(&filename)),
        ],
        body,
    )
        .into_response())
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DownloadView>)> {
    let mut request = json_body(payload)?;
    request.url = validate_source_url(&request.url)?.to_string();
    let view = state.downloads.start(request).await?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

async fn list_downloads(State(state): State<AppState>) -> Json<Vec<DownloadView>> {
    Json(state.downloads.list())
}

async fn get_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadView>> {
    Ok(Json(state.downloads.get(&id)?))
}

async fn pause_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadView>> {
    Ok(Json(state.downloads.pause(&id)?))
}

async fn resume_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadView>> {
    Ok(Json(state.downloads.resume(&id)?))
}

async fn cancel_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadView>> {
    Ok(Json(state.downloads.cancel(&id)?))
}

async fn remove_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadProgress>> {
    Ok(Json(state.downloads.remove(&id)?))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (path, name) = state.downloads.completed_file(&id)?;
    let mut response = stream_file(path, Some(&headers)).await?;
    if let Ok(value) = HeaderValue::from_str(&attachment(&name)) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn list_history(State(state): State<AppState>) -> ApiResult<Json<Vec<HistoryRecord>>> {
    let records = state
        .downloads
        .history()
        .list()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(records))
}

async fn clear_history(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let removed = state
        .downloads
        .history()
        .clear()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn remove_history(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let removed = state
        .downloads
        .history()
        .remove(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("history entry not found"))
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<DownloadSettings> {
    Json(state.downloads.settings().get())
}

async fn update_settings(
    State(state): State<AppState>,
    payload: Result<Json<DownloadSettings>, JsonRejection>,
) -> ApiResult<Json<DownloadSettings>> {
    let settings = json_body(payload)?;
    let updated = state
        .downloads
        .settings()
        .update(settings)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(updated))
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("file not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html"), None).await,
        Ok(_) => stream_file(target, None).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html"), None).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension; assets that are missing do.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

fn attachment(filename: &str) -> String {
    let escaped: String = filename
        .chars()
        .filter(|ch| !ch.is_control())
        .map(|ch| if ch == '"' || ch == '\\' { '_' } else { ch })
        .collect();
    format!("attachment; filename=\"{escaped}\"")
}

async fn stream_file(path: PathBuf, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let content_type = MimeGuess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let response = match range {
        Some((start, _)) if start >= size => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{size}"))],
        )
            .into_response(),
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}")),
                    (header::CONTENT_LENGTH, length.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_TYPE, content_type),
                ],
                body,
            )
                .into_response()
        }
        None => (
            [
                (header::CONTENT_LENGTH, size.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_TYPE, content_type),
            ],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
    };

    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // "-N" is the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use grabtube::{
        extractor::{MetadataProvider, Rendition, TransferProvider, TransferStream},
        progress::DownloadStatus,
        settings::QualityPreference,
    };
    use serde_json::Value;
    use std::{
        io::Cursor,
        pin::Pin,
        task::{Context as TaskContext, Poll},
        time::Duration,
    };
    use tempfile::TempDir;
    use tokio::io::{AsyncRead, ReadBuf};

    const URL: &str = "https://video.test/watch?v=alpha";
    const PAYLOAD: &[u8] = b"0123456789abcdefghij";

    struct StaticProvider {
        info: SubjectInfo,
    }

    #[async_trait]
    impl MetadataProvider for StaticProvider {
        async fn resolve(&self, url: &str) -> Result<SubjectInfo, ExtractorError> {
            if url == URL {
                Ok(self.info.clone())
            } else {
                Err(ExtractorError::Resolution {
                    url: url.to_owned(),
                    message: "Unsupported URL".into(),
                })
            }
        }
    }

    #[async_trait]
    impl TransferProvider for StaticProvider {
        async fn open(
            &self,
            _url: &str,
            _rendition_id: &str,
        ) -> Result<Box<dyn TransferStream>, ExtractorError> {
            Ok(Box::new(CursorStream(Cursor::new(PAYLOAD.to_vec()))))
        }
    }

    struct CursorStream(Cursor<Vec<u8>>);

    impl AsyncRead for CursorStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    #[async_trait]
    impl TransferStream for CursorStream {
        fn declared_size(&self) -> Option<u64> {
            Some(PAYLOAD.len() as u64)
        }

        async fn finish(self: Box<Self>) -> Result<(), ExtractorError> {
            Ok(())
        }
    }

    fn sample_info() -> SubjectInfo {
        SubjectInfo {
            id: "alpha".into(),
            title: "Alpha Clip".into(),
            thumbnail: None,
            duration: Some(20),
            upload_date: None,
            view_count: None,
            url: URL.into(),
            renditions: vec![Rendition {
                id: "18".into(),
                quality: "360p".into(),
                extension: "mp4".into(),
                resolution: Some("640x360".into()),
                height: Some(360),
                fps: Some(25.0),
                filesize: Some(PAYLOAD.len() as u64),
                bitrate: None,
                vcodec: Some("avc1".into()),
                acodec: Some("mp4a".into()),
                audio_only: false,
            }],
        }
    }

    struct TestContext {
        temp: TempDir,
        state: AppState,
    }

    impl TestContext {
        async fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let download_dir = temp.path().join("downloads");
            let history = HistoryStore::open(&download_dir.join(HISTORY_DB_FILE))
                .await
                .unwrap();
            let settings = SettingsStore::load(&download_dir, DownloadSettings::default());
            let provider = Arc::new(StaticProvider {
                info: sample_info(),
            });
            let downloads = DownloadManager::new(
                download_dir,
                ProgressRegistry::new(8),
                provider.clone(),
                provider,
                Arc::new(history),
                Arc::new(settings),
            );
            let www_root = temp.path().join("www");
            std::fs::create_dir_all(www_root.join("assets")).unwrap();
            std::fs::write(www_root.join("index.html"), "<html>app</html>").unwrap();
            std::fs::write(www_root.join("assets/app.js"), "console.log(1)").unwrap();
            Self {
                temp,
                state: AppState {
                    downloads,
                    www_root: Some(Arc::new(www_root)),
                },
            }
        }

        async fn start(&self) -> DownloadView {
            let (status, Json(view)) = start_download(
                State(self.state.clone()),
                Ok(Json(DownloadRequest {
                    url: URL.into(),
                    format_id: Some("18".into()),
                })),
            )
            .await
            .unwrap();
            assert_eq!(status, StatusCode::ACCEPTED);
            view
        }

        async fn wait_completed(&self) -> DownloadView {
            for _ in 0..500 {
                if let Ok(view) = self.state.downloads.get("alpha")
                    && view.progress.status == DownloadStatus::Completed
                {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("download never completed");
        }
    }

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn backend_args_parse_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--download-dir",
            "/data",
            "--port",
            "9000",
            "--host",
            "0.0.0.0",
            "--ytdlp",
            "/opt/yt-dlp",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.download_dir, Some(PathBuf::from("/data")));
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.ytdlp_bin, Some(PathBuf::from("/opt/yt-dlp")));
        assert!(overrides.www_root.is_none());
    }

    #[test]
    fn backend_args_reject_bad_host() {
        assert!(BackendArgs::try_parse_from(["backend", "--host", "not-an-ip"]).is_err());
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "missing");
    }

    #[test]
    fn download_errors_map_to_statuses() {
        let cases = [
            (
                DownloadError::Registry(RegistryError::NotFound("a".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                DownloadError::Registry(RegistryError::AlreadyActive("a".into())),
                StatusCode::CONFLICT,
            ),
            (
                DownloadError::Extractor(ExtractorError::UnknownRendition("9".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                DownloadError::Extractor(ExtractorError::Resolution {
                    url: URL.into(),
                    message: "nope".into(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (DownloadError::NotReady("a".into()), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[tokio::test]
    async fn metadata_requires_a_url() {
        let ctx = TestContext::new().await;
        let err = resolve_metadata(
            State(ctx.state.clone()),
            Ok(Json(MetadataRequest { url: String::new() })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metadata_returns_subject_info() {
        let ctx = TestContext::new().await;
        let Json(info) = resolve_metadata(
            State(ctx.state.clone()),
            Ok(Json(MetadataRequest { url: URL.into() })),
        )
        .await
        .unwrap();
        assert_eq!(info.title, "Alpha Clip");
        assert_eq!(info.renditions.len(), 1);
    }

    #[tokio::test]
    async fn metadata_failure_is_bad_gateway() {
        let ctx = TestContext::new().await;
        let err = resolve_metadata(
            State(ctx.state.clone()),
            Ok(Json(MetadataRequest {
                url: "https://video.test/other".into(),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert!(err.message.contains("Unsupported URL"));
    }

    #[tokio::test]
    async fn stream_sets_attachment_headers() {
        let ctx = TestContext::new().await;
        let response = stream_rendition(
            State(ctx.state.clone()),
            Ok(Json(StreamRequest {
                url: URL.into(),
                format_id: "18".into(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"Alpha_Clip.mp4\""
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), PAYLOAD);
    }

    #[tokio::test]
    async fn stream_rejects_unknown_format() {
        let ctx = TestContext::new().await;
        let err = stream_rendition(
            State(ctx.state.clone()),
            Ok(Json(StreamRequest {
                url: URL.into(),
                format_id: "999".into(),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tracked_download_lifecycle() {
        let ctx = TestContext::new().await;
        let queued = ctx.start().await;
        assert_eq!(queued.title, "Alpha Clip");
        assert_eq!(queued.progress.status, DownloadStatus::Queued);

        let done = ctx.wait_completed().await;
        assert_eq!(done.progress.percentage, 100);

        let Json(list) = list_downloads(State(ctx.state.clone())).await;
        assert_eq!(list.len(), 1);

        let err = pause_download(State(ctx.state.clone()), AxumPath("alpha".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let response = download_file(
            State(ctx.state.clone()),
            AxumPath("alpha".into()),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"Alpha_Clip.mp4\""
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), PAYLOAD);

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=10-14"));
        let response = download_file(State(ctx.state.clone()), AxumPath("alpha".into()), headers)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 10-14/20"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"abcde");

        let Json(removed) = remove_download(State(ctx.state.clone()), AxumPath("alpha".into()))
            .await
            .unwrap();
        assert_eq!(removed.status, DownloadStatus::Completed);
        let err = get_download(State(ctx.state.clone()), AxumPath("alpha".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_download_is_not_found() {
        let ctx = TestContext::new().await;
        let err = cancel_download(State(ctx.state.clone()), AxumPath("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = download_file(
            State(ctx.state.clone()),
            AxumPath("ghost".into()),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn history_lists_and_removes_entries() {
        let ctx = TestContext::new().await;
        ctx.start().await;
        ctx.wait_completed().await;

        let mut records = Vec::new();
        for _ in 0..100 {
            let Json(list) = list_history(State(ctx.state.clone())).await.unwrap();
            if !list.is_empty() {
                records = list;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Alpha Clip");

        let status = remove_history(State(ctx.state.clone()), AxumPath(records[0].id.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = remove_history(State(ctx.state.clone()), AxumPath(records[0].id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let Json(cleared) = clear_history(State(ctx.state.clone())).await.unwrap();
        assert_eq!(cleared["removed"], 0);
    }

    #[tokio::test]
    async fn settings_roundtrip_through_handlers() {
        let ctx = TestContext::new().await;
        let Json(initial) = get_settings(State(ctx.state.clone())).await;
        assert_eq!(initial, DownloadSettings::default());

        let Json(updated) = update_settings(
            State(ctx.state.clone()),
            Ok(Json(DownloadSettings {
                preferred_quality: QualityPreference::Lowest,
                preferred_format: Some("WebM".into()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(updated.preferred_format.as_deref(), Some("webm"));
        assert!(ctx.temp.path().join("downloads/settings.json").exists());

        let Json(current) = get_settings(State(ctx.state.clone())).await;
        assert_eq!(current, updated);
    }

    #[tokio::test]
    async fn fallback_serves_spa_and_rejects_api_paths() {
        let ctx = TestContext::new().await;

        let request = Request::builder()
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();
        let response = static_fallback(State(ctx.state.clone()), request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "endpoint not found");

        let request = Request::builder()
            .uri("/history")
            .body(Body::empty())
            .unwrap();
        let response = static_fallback(State(ctx.state.clone()), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"<html>app</html>");

        let request = Request::builder()
            .uri("/assets/missing.js")
            .body(Body::empty())
            .unwrap();
        let response = static_fallback(State(ctx.state.clone()), request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .uri("/assets/app.js")
            .body(Body::empty())
            .unwrap();
        let response = static_fallback(State(ctx.state.clone()), request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn resolve_www_path_rejects_traversal() {
        let root = Path::new("/srv/www");
        assert!(resolve_www_path(root, "/../etc/passwd").is_err());
        assert_eq!(
            resolve_www_path(root, "/").unwrap(),
            PathBuf::from("/srv/www/index.html")
        );
        assert_eq!(
            resolve_www_path(root, "/assets/app.js").unwrap(),
            PathBuf::from("/srv/www/assets/app.js")
        );
    }

    #[test]
    fn parse_range_header_variants() {
        let value = |raw: &'static str| HeaderValue::from_static(raw);
        assert_eq!(parse_range_header(&value("bytes=0-9"), 100), Some((0, 9)));
        assert_eq!(parse_range_header(&value("bytes=90-"), 100), Some((90, 99)));
        assert_eq!(parse_range_header(&value("bytes=-10"), 100), Some((90, 99)));
        assert_eq!(parse_range_header(&value("bytes=-500"), 100), Some((0, 99)));
        assert_eq!(parse_range_header(&value("bytes=9-3"), 100), None);
        assert_eq!(parse_range_header(&value("items=0-1"), 100), None);
        assert_eq!(parse_range_header(&value("bytes=-0"), 100), None);
    }

    #[test]
    fn attachment_strips_quotes_and_controls() {
        assert_eq!(
            attachment("a\"b\\c\n.mp4"),
            "attachment; filename=\"a_b_c.mp4\""
        );
    }
}
