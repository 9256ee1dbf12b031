#![forbid(unsafe_code)]

//! Terminal front end: inspect a URL or download one rendition with a live
//! progress line.

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use grabtube::{
    config::{RuntimeOverrides, resolve_runtime_config},
    extractor::{MetadataProvider, SubjectInfo},
    history::{HISTORY_DB_FILE, HistoryStore},
    logging,
    progress::{ChunkStatus, DownloadProgress, DownloadStatus},
    registry::ProgressRegistry,
    security::ensure_not_root,
    settings::SettingsStore,
    transfer::{DownloadManager, DownloadRequest},
    units::{format_bytes, format_eta, format_speed},
    ytdlp::YtDlp,
};
use tokio::signal;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "grab", about = "Download videos through yt-dlp", long_about = None)]
struct Cli {
    /// yt-dlp executable.
    #[arg(long, global = true)]
    ytdlp: Option<PathBuf>,
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the title and available renditions of a URL.
    Info { url: String },
    /// Download one rendition into the download directory.
    Get {
        url: String,
        /// Rendition id; defaults to the stored quality preference.
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    ensure_not_root("grab")?;

    let output_dir = match &cli.command {
        Command::Get { output_dir, .. } => output_dir.clone(),
        Command::Info { .. } => None,
    };
    let config = resolve_runtime_config(RuntimeOverrides {
        download_dir: output_dir,
        ytdlp_bin: cli.ytdlp.clone(),
        env_path: cli.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    let ytdlp = Arc::new(YtDlp::new(config.ytdlp_bin.clone()));

    match cli.command {
        Command::Info { url } => {
            let info = ytdlp.resolve(&url).await?;
            print_info(&info);
            Ok(())
        }
        Command::Get { url, format, .. } => {
            std::fs::create_dir_all(&config.download_dir)
                .with_context(|| format!("creating {}", config.download_dir.display()))?;
            let history = HistoryStore::open(&config.download_dir.join(HISTORY_DB_FILE)).await?;
            let settings =
                SettingsStore::load(&config.download_dir, config.settings_defaults.clone());
            let manager = DownloadManager::new(
                config.download_dir.clone(),
                ProgressRegistry::new(config.chunk_count),
                ytdlp.clone(),
                ytdlp,
                Arc::new(history),
                Arc::new(settings),
            );
            download(&manager, url, format).await
        }
    }
}

fn print_info(info: &SubjectInfo) {
    println!("{}", info.title);
    if let Some(duration) = info.duration {
        println!("duration: {}", format_eta(duration));
    }
    println!();
    println!("{:<10} {:<6} {:<12} {:<11} {:>10}", "id", "ext", "quality", "resolution", "size");
    for rendition in &info.renditions {
        println!(
            "{:<10} {:<6} {:<12} {:<11} {:>10}",
            rendition.id,
            rendition.extension,
            rendition.quality,
            rendition.resolution.as_deref().unwrap_or("-"),
            rendition
                .filesize
                .map(format_bytes)
                .unwrap_or_else(|| "?".to_string()),
        );
    }
}

async fn download(manager: &DownloadManager, url: String, format: Option<String>) -> Result<()> {
    let queued = manager
        .start(DownloadRequest {
            url,
            format_id: format,
        })
        .await?;
    let subject = queued.progress.subject_id.clone();
    eprintln!("{} [{}]", queued.title, queued.progress.format_id);

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    let last = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if let Err(err) = manager.cancel(&subject) {
                    warn!(%err, "cancel after interrupt failed");
                }
            }
        }
        let view = manager.get(&subject)?;
        render(&view.progress);
        if view.progress.status.is_terminal() {
            break view.progress;
        }
    };
    eprintln!();

    match last.status {
        DownloadStatus::Completed => {
            let (path, _) = manager.completed_file(&subject)?;
            println!("{}", path.display());
            Ok(())
        }
        DownloadStatus::Canceled => bail!("download canceled"),
        _ => bail!(
            "download failed after {}",
            format_bytes(last.downloaded_bytes)
        ),
    }
}

fn render(progress: &DownloadProgress) {
    let line = format!(
        "\r{:>3}% [{}] {} / {}  {}  ETA {}  {}  ",
        progress.percentage,
        chunk_bar(progress),
        format_bytes(progress.downloaded_bytes),
        format_bytes(progress.total_bytes),
        format_speed(progress.instantaneous_speed),
        format_eta(progress.estimated_seconds_remaining),
        progress.status,
    );
    let mut stderr = io::stderr().lock();
    // A broken terminal must not abort the download.
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.flush();
}

fn chunk_bar(progress: &DownloadProgress) -> String {
    progress
        .chunks
        .iter()
        .map(|chunk| match chunk.status {
            ChunkStatus::Completed => '#',
            ChunkStatus::Downloading if chunk.progress >= 50 => '+',
            ChunkStatus::Downloading => '-',
            ChunkStatus::Failed => 'x',
            ChunkStatus::Pending => '.',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use grabtube::progress;

    #[test]
    fn cli_parses_get_with_options() {
        let cli = Cli::try_parse_from([
            "grab",
            "get",
            "https://video.test/watch?v=a",
            "--format",
            "18",
            "--output-dir",
            "/tmp/out",
            "--ytdlp",
            "/opt/yt-dlp",
        ])
        .unwrap();
        assert_eq!(cli.ytdlp, Some(PathBuf::from("/opt/yt-dlp")));
        match cli.command {
            Command::Get {
                url,
                format,
                output_dir,
            } => {
                assert_eq!(url, "https://video.test/watch?v=a");
                assert_eq!(format.as_deref(), Some("18"));
                assert_eq!(output_dir, Some(PathBuf::from("/tmp/out")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["grab"]).is_err());
    }

    #[test]
    fn chunk_bar_reflects_chunk_states() {
        let snapshot = progress::update(
            &progress::initialize("a", "18", 100, 4),
            60,
            100,
            progress::Sample::new(0, 0),
            1000,
        );
        assert_eq!(chunk_bar(&snapshot), "##-.");
        assert_eq!(chunk_bar(&progress::complete("a", "18", 100, 4)), "####");
    }
}
