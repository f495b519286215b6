//! `rodio` output for the reader's synthesized mp3 files.

use anyhow::{Context, Result, anyhow};
use hangu_core::{AudioEngine, AudioHandle, EngineStatus, PlaybackError};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::fs::File;
use std::io::BufReader;
use std::sync::mpsc;
use std::thread;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

type FileSource = Decoder<BufReader<File>>;

/// Wall-clock position of the loaded item, frozen while paused.
#[derive(Debug, Default, Clone, Copy)]
struct PlayClock {
    started_at: Option<Instant>,
    elapsed: Duration,
}

impl PlayClock {
    fn start(&mut self) {
        self.elapsed = Duration::ZERO;
        self.started_at = Some(Instant::now());
    }

    fn pause(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.elapsed += Instant::now().saturating_duration_since(started);
        }
    }

    fn resume(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn position(&self) -> Duration {
        match self.started_at {
            Some(started) => self.elapsed + Instant::now().saturating_duration_since(started),
            None => self.elapsed,
        }
    }
}

pub struct RodioAudioEngine {
    output: OutputStreamHandle,
    // Dropping this lets the output thread release the device.
    _release: mpsc::Sender<()>,
    sink: Option<Sink>,
    clock: PlayClock,
    loaded: Option<AudioHandle>,
}

impl RodioAudioEngine {
    /// Open the default output device.
    ///
    /// The device stream is not `Send`, so it lives on its own thread for as
    /// long as the engine does.
    pub fn open() -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    let _ = release_rx.recv();
                    drop(stream);
                    debug!("Released audio output");
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                }
            })
            .context("Spawning audio output thread")?;

        let output = ready_rx
            .recv()
            .context("Audio output thread exited early")?
            .map_err(|err| anyhow!("Opening audio output: {err}"))?;
        info!("Opened default audio output");
        Ok(Self {
            output,
            _release: release_tx,
            sink: None,
            clock: PlayClock::default(),
            loaded: None,
        })
    }

    /// Delete the previously loaded file when `next` replaces it.
    fn release_replaced(&mut self, next: &AudioHandle) {
        if self.loaded.as_ref() == Some(next) {
            return;
        }
        if let Some(previous) = self.loaded.replace(next.clone()) {
            discard(&previous);
        }
    }
}

/// Open a file and detect its format for decoding.
fn load_source(path: &Path) -> Result<FileSource, PlaybackError> {
    let file = File::open(path)
        .map_err(|err| PlaybackError::Session(format!("opening {}: {err}", path.display())))?;
    Decoder::new(BufReader::new(file)).map_err(|err| PlaybackError::Decode(err.to_string()))
}

/// Run file I/O that is reached from async code without stalling a runtime
/// worker. Only a multi-thread runtime can hand the worker's tasks off.
fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

fn discard(handle: &AudioHandle) {
    match std::fs::remove_file(handle.path()) {
        Ok(()) => debug!(path = %handle.path().display(), "Removed synthesized audio"),
        Err(err) => warn!(path = %handle.path().display(), "Failed to remove synthesized audio: {err}"),
    }
}

impl Drop for RodioAudioEngine {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.loaded.take() {
            discard(&handle);
        }
    }
}

impl AudioEngine for RodioAudioEngine {
    fn play(&mut self, handle: &AudioHandle) -> Result<(), PlaybackError> {
        self.stop();
        self.release_replaced(handle);
        let source = run_blocking(|| load_source(handle.path()))?;
        let sink =
            Sink::try_new(&self.output).map_err(|err| PlaybackError::Session(err.to_string()))?;
        sink.append(source);
        sink.play();
        self.sink = Some(sink);
        self.clock.start();
        debug!(path = %handle.path().display(), "Playing synthesized audio");
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(sink) = &self.sink {
            sink.pause();
            self.clock.pause();
        }
    }

    fn resume(&mut self) {
        if let Some(sink) = &self.sink {
            sink.play();
            self.clock.resume();
        }
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.clock.reset();
    }

    fn position(&self) -> Duration {
        self.clock.position()
    }

    fn status(&self) -> EngineStatus {
        match &self.sink {
            Some(sink) if !sink.empty() => EngineStatus::Active,
            Some(_) => EngineStatus::Ended,
            None => {
                warn!("Audio status requested with nothing loaded");
                EngineStatus::Ended
            }
        }
    }
}
