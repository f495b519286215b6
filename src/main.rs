//! Entry point for the Korean read-along reader.
//!
//! - Parse command-line arguments.
//! - Load user configuration from `conf/config.toml` (or `--config`).
//! - Spawn a reading session for the given text file.
//! - Print highlight changes and apply commands typed on stdin.

mod audio;
mod polly;

use crate::audio::RodioAudioEngine;
use crate::polly::PollyLocatorSource;
use anyhow::{Context, Result, anyhow, bail};
use hangu_core::{
    AppConfig, FileExporter, HttpDownloader, ReaderSession, SessionOptions, SessionSnapshot,
    SynthesisClient, load_config,
};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

const DEFAULT_CONFIG_PATH: &str = "conf/config.toml";
const USAGE: &str = "Usage: hangu-reader <path-to-text> [--config <path>]";

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    text_path: PathBuf,
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle).await {
        error!("{err:?}");
        std::process::exit(1);
    }
}

async fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let args = parse_args(env::args().skip(1))?;
    if !args.text_path.exists() {
        bail!("File not found: {}", args.text_path.display());
    }
    let config = load_config(&args.config_path);
    set_log_level(reload_handle, config.log_level.as_filter_str());
    info!(
        path = %args.text_path.display(),
        level = %config.log_level,
        "Starting reader"
    );
    info!(
        region = %config.region,
        voice = %config.voice,
        engine = %config.engine,
        tick_ms = config.tick_interval().as_millis() as u64,
        "Active synthesis configuration"
    );

    let text = load_text(&args.text_path)?;
    let session = build_session(text, &config).await?;
    drive(session).await;
    Ok(())
}

fn load_text(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Reading text from {}", path.display()))?;
    let text = text.trim().to_string();
    if text.is_empty() {
        bail!("Text file {} is empty", path.display());
    }
    Ok(text)
}

async fn build_session(text: String, config: &AppConfig) -> Result<ReaderSession> {
    let locator = Arc::new(PollyLocatorSource::from_config(config).await);
    let client = SynthesisClient::new(
        locator,
        Arc::new(HttpDownloader::new()),
        config.voice.clone(),
        config.audio_dir(),
    );
    let engine = RodioAudioEngine::open().context("Failed to open audio output")?;
    let exporter = Arc::new(FileExporter::new(&config.export_path));
    Ok(ReaderSession::spawn(
        text,
        Arc::new(client),
        engine,
        exporter,
        SessionOptions {
            tick_interval: config.tick_interval(),
        },
    ))
}

async fn drive(session: ReaderSession) {
    println!("Commands: p = play/pause, r = retry, e = export vocabulary, q = quit");
    let mut snapshots = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last = SessionSnapshot::default();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("Session ended unexpectedly");
                    break;
                }
                let next = snapshots.borrow_and_update().clone();
                render(&last, &next);
                last = next;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "p" => session.toggle_play(),
                    "r" => session.retry(),
                    "e" => session.export_vocabulary(),
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command {other:?}"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!("Failed to read stdin: {err}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.shutdown().await;
}

fn render(prev: &SessionSnapshot, next: &SessionSnapshot) {
    if next.synthesizing && !prev.synthesizing {
        println!("Synthesizing...");
    }
    if next.ready && !prev.ready {
        println!(
            "Ready: {} words, {} unique",
            next.markers.len(),
            next.vocabulary.len()
        );
    }
    if next.last_error != prev.last_error {
        if let Some(err) = &next.last_error {
            println!("Error: {err}");
        }
    }
    if next.playback != prev.playback {
        println!("[{:?}]", next.playback);
    }
    if next.highlighted_index != prev.highlighted_index {
        if let (Some(idx), Some(word)) = (next.highlighted_index, &next.highlighted_word) {
            println!("{:>4}/{} {word}", idx + 1, next.markers.len());
        }
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut text_path = None;
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("--config needs a path\n{USAGE}"))?;
                config_path = PathBuf::from(path);
            }
            flag if flag.starts_with("--") => bail!("Unknown flag {flag}\n{USAGE}"),
            _ if text_path.is_none() => text_path = Some(PathBuf::from(&arg)),
            _ => bail!("Unexpected argument {arg}\n{USAGE}"),
        }
    }
    let text_path = text_path.ok_or_else(|| anyhow!(USAGE))?;
    Ok(CliArgs {
        text_path,
        config_path,
    })
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr)
                .with_filter(filter_layer),
        )
        .init();
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = handle.modify(|filter| *filter = parsed.clone()) {
        warn!(%level, "Failed to update log level from config: {err}");
    } else {
        info!(%level, "Applied log level from config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_text_path_with_default_config() {
        let parsed = parse_args(args(&["story.txt"])).expect("valid args");
        assert_eq!(parsed.text_path, PathBuf::from("story.txt"));
        assert_eq!(parsed.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn config_flag_may_come_first() {
        let parsed =
            parse_args(args(&["--config", "alt.toml", "story.txt"])).expect("valid args");
        assert_eq!(parsed.config_path, PathBuf::from("alt.toml"));
        assert_eq!(parsed.text_path, PathBuf::from("story.txt"));
    }

    #[test]
    fn rejects_missing_or_extra_arguments() {
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(parse_args(args(&["a.txt", "b.txt"])).is_err());
        assert!(parse_args(args(&["--verbose", "a.txt"])).is_err());
    }

    #[test]
    fn empty_text_files_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blank.txt");
        fs::write(&path, "  \n").expect("write");
        assert!(load_text(&path).is_err());

        fs::write(&path, " 안녕하세요 \n").expect("write");
        assert_eq!(load_text(&path).expect("text"), "안녕하세요");
    }
}
