//! A reading session: one text, one synthesis pipeline, one player.
//!
//! All session state lives on a single tokio task. Commands, synthesis
//! completions and playback ticks are handed to it over channels and applied
//! one at a time, so nothing here needs a lock. Readers observe the session
//! through [`SessionSnapshot`]s published on a `watch` channel whenever
//! something visible changes.

use crate::cancellation::CancellationToken;
use crate::error::SynthesisError;
use crate::export::Exporter;
use crate::marker::Marker;
use crate::playback::{
    AudioEngine, DEFAULT_TICK_INTERVAL, PlaybackController, PlaybackEvent, PlaybackState,
    Subscription,
};
use crate::sync::{RenderedSpan, SyncEngine, ToggleAction};
use crate::synthesis::{SynthesisClient, SynthesisResult, discard_audio};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub tick_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    TogglePlay,
    Retry,
    ExportVocabulary,
    Shutdown,
}

impl SessionCommand {
    pub fn action(&self) -> &'static str {
        match self {
            Self::TogglePlay => "reader_toggle_play",
            Self::Retry => "reader_retry_synthesis",
            Self::ExportVocabulary => "reader_export_vocabulary",
            Self::Shutdown => "reader_shutdown",
        }
    }
}

/// Read-only view of a session for the rendering side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub ready: bool,
    pub synthesizing: bool,
    pub playback: PlaybackState,
    pub is_playing: bool,
    pub highlighted_index: Option<usize>,
    pub highlighted_span: Option<RenderedSpan>,
    pub highlighted_word: Option<String>,
    pub markers: Arc<[Marker]>,
    pub vocabulary: Arc<BTreeSet<String>>,
    pub last_error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            ready: false,
            synthesizing: false,
            playback: PlaybackState::Idle,
            is_playing: false,
            highlighted_index: None,
            highlighted_span: None,
            highlighted_word: None,
            markers: Arc::from(Vec::new()),
            vocabulary: Arc::new(BTreeSet::new()),
            last_error: None,
        }
    }
}

/// Handle to a running session task. Dropping it tears the session down.
pub struct ReaderSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    liveness: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReaderSession {
    /// Start a session for `text`; synthesis is requested immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<E: AudioEngine>(
        text: impl Into<Arc<str>>,
        client: Arc<SynthesisClient>,
        engine: E,
        exporter: Arc<dyn Exporter>,
        options: SessionOptions,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(SessionSnapshot::default());
        let liveness = CancellationToken::new();

        let playback = PlaybackController::new(engine, options.tick_interval);
        let subscription = playback.subscribe();
        let runtime = SessionRuntime {
            sync: SyncEngine::new(text),
            playback,
            client,
            exporter,
            liveness: liveness.clone(),
            completions: completions_tx,
            synthesis_task: None,
            audio_started: false,
            snapshots: snapshots_tx,
        };
        let task = tokio::spawn(runtime.run(commands_rx, completions_rx, subscription));

        Self {
            commands: commands_tx,
            snapshots: snapshots_rx,
            liveness,
            task: Some(task),
        }
    }

    pub fn toggle_play(&self) {
        self.send(SessionCommand::TogglePlay);
    }

    pub fn retry(&self) {
        self.send(SessionCommand::Retry);
    }

    pub fn export_vocabulary(&self) {
        self.send(SessionCommand::ExportVocabulary);
    }

    pub fn send(&self, command: SessionCommand) {
        let action = command.action();
        if self.commands.send(command).is_err() {
            debug!(action, "Session already closed; dropping command");
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Stop playback, cancel pending synthesis and wait for the task to end.
    pub async fn shutdown(mut self) {
        self.send(SessionCommand::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("Session task ended abnormally: {err}");
            }
        }
        self.liveness.cancel();
    }
}

impl Drop for ReaderSession {
    fn drop(&mut self) {
        self.liveness.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SynthesisCompletion {
    request_id: u64,
    outcome: Result<SynthesisResult, SynthesisError>,
}

struct SessionRuntime<E: AudioEngine> {
    sync: SyncEngine,
    playback: PlaybackController<E>,
    client: Arc<SynthesisClient>,
    exporter: Arc<dyn Exporter>,
    liveness: CancellationToken,
    completions: mpsc::UnboundedSender<SynthesisCompletion>,
    synthesis_task: Option<JoinHandle<()>>,
    // Once set, the engine owns the ready audio file.
    audio_started: bool,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl<E: AudioEngine> SessionRuntime<E> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut completions: mpsc::UnboundedReceiver<SynthesisCompletion>,
        mut subscription: Subscription,
    ) {
        info!("Reader session started");
        self.request_synthesis();
        self.publish();

        loop {
            tokio::select! {
                biased;
                _ = self.liveness.cancelled() => break,
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.apply_command(command),
                },
                Some(completion) = completions.recv() => self.on_synthesis_completed(completion),
                event = subscription.recv() => match event {
                    Some(event) => self.on_playback_event(event),
                    None => break,
                },
            }
            self.publish();
        }

        completions.close();
        while let Ok(completion) = completions.try_recv() {
            discard_outcome(completion.outcome);
        }
        self.teardown(subscription);
    }

    fn apply_command(&mut self, command: SessionCommand) {
        debug!(action = command.action(), "Applying session command");
        match command {
            SessionCommand::TogglePlay => self.toggle_play(),
            SessionCommand::Retry => {
                if self.sync.is_ready() {
                    debug!("Synthesis already succeeded; ignoring retry");
                } else {
                    self.request_synthesis();
                }
            }
            SessionCommand::ExportVocabulary => self.export_vocabulary(),
            SessionCommand::Shutdown => {}
        }
    }

    fn toggle_play(&mut self) {
        match self.sync.toggle(self.playback.state()) {
            None => {}
            Some(ToggleAction::Start(handle)) => {
                self.audio_started = true;
                self.playback.start(&handle);
                if self.playback.is_playing() {
                    self.sync.playback_started();
                }
            }
            Some(ToggleAction::Pause) => self.playback.pause(),
            Some(ToggleAction::Resume) => self.playback.resume(),
        }
    }

    fn export_vocabulary(&self) {
        let words: Vec<String> = self.sync.vocabulary().iter().cloned().collect();
        if words.is_empty() {
            debug!("No vocabulary to export");
            return;
        }
        if let Err(err) = self.exporter.export(&words) {
            warn!("Vocabulary export failed: {err:#}");
        }
    }

    fn request_synthesis(&mut self) {
        let Some(request_id) = self.sync.begin_synthesis() else {
            return;
        };
        let client = Arc::clone(&self.client);
        let text = self.sync.source_text();
        let liveness = self.liveness.clone();
        let completions = self.completions.clone();
        self.synthesis_task = Some(tokio::spawn(async move {
            let outcome = client.synthesize(&text, &liveness).await;
            if liveness.is_cancelled() {
                debug!(request_id, "Session closed; dropping synthesis completion");
                discard_outcome(outcome);
                return;
            }
            if let Err(unsent) = completions.send(SynthesisCompletion {
                request_id,
                outcome,
            }) {
                debug!(request_id, "Session loop gone before synthesis completed");
                discard_outcome(unsent.0.outcome);
            }
        }));
    }

    fn on_synthesis_completed(&mut self, completion: SynthesisCompletion) {
        if self.liveness.is_cancelled() || !self.sync.is_current(completion.request_id) {
            debug!(request_id = completion.request_id, "Discarding synthesis completion");
            discard_outcome(completion.outcome);
            return;
        }
        self.synthesis_task = None;
        self.sync
            .complete_synthesis(completion.request_id, completion.outcome);
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) {
        if !self.playback.handle_event(&event) {
            return;
        }
        match event {
            PlaybackEvent::Position { elapsed_ms, .. } => {
                self.sync.on_tick(elapsed_ms);
            }
            PlaybackEvent::Finished { .. } => {
                self.sync.clear_highlight();
            }
            PlaybackEvent::Failed { error, .. } => {
                self.sync.record_playback_error(&error);
                self.sync.clear_highlight();
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            ready: self.sync.is_ready(),
            synthesizing: self.sync.is_pending(),
            playback: self.playback.state(),
            is_playing: self.playback.is_playing(),
            highlighted_index: self.sync.highlighted_index(),
            highlighted_span: self.sync.highlighted_span(),
            highlighted_word: self
                .sync
                .highlighted_index()
                .and_then(|idx| self.sync.markers().get(idx).map(|m| m.word.clone())),
            markers: self.sync.markers(),
            vocabulary: self.sync.vocabulary(),
            last_error: self.sync.last_error().map(str::to_string),
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn teardown(mut self, subscription: Subscription) {
        self.liveness.cancel();
        if let Some(task) = self.synthesis_task.take() {
            task.abort();
        }
        self.playback.stop();
        subscription.cancel();
        if !self.audio_started {
            if let Some(audio) = self.sync.audio() {
                discard_audio(audio);
            }
        }
        self.publish();
        info!("Reader session closed");
    }
}

fn discard_outcome(outcome: Result<SynthesisResult, SynthesisError>) {
    if let Ok(result) = outcome {
        discard_audio(&result.audio);
    }
}
