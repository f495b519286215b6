//! Playback state machine and the position ticker that drives highlighting.
//!
//! `Idle -> Playing <-> Paused`, back to `Idle` on end-of-audio, decode failure
//! or an explicit stop. While `Playing`, a ticker task samples the engine at a
//! fixed cadence and broadcasts [`PlaybackEvent`]s to subscribers.

use crate::error::PlaybackError;
use crate::synthesis::AudioHandle;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// What the platform audio engine reports about the loaded item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Active,
    Ended,
    Failed(PlaybackError),
}

/// Platform audio primitives. Decoding and session handling live behind this.
pub trait AudioEngine: Send + 'static {
    /// Load `handle` and start playing it from the beginning.
    fn play(&mut self, handle: &AudioHandle) -> Result<(), PlaybackError>;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
    /// Elapsed playback position of the loaded item.
    fn position(&self) -> Duration;
    fn status(&self) -> EngineStatus;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Position { generation: u64, elapsed_ms: u64 },
    Finished { generation: u64 },
    Failed { generation: u64, error: PlaybackError },
}

impl PlaybackEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Position { generation, .. }
            | Self::Finished { generation }
            | Self::Failed { generation, .. } => *generation,
        }
    }
}

/// Receiving end of the controller's event stream. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<PlaybackEvent>,
}

impl Subscription {
    /// Next event, or `None` once the controller is gone.
    pub async fn recv(&mut self) -> Option<PlaybackEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Playback subscriber lagged; dropping stale ticks");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<PlaybackEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Stop receiving events. The controller no longer buffers ticks for
    /// this subscriber once it returns.
    pub fn cancel(self) {
        drop(self.receiver);
        debug!("Playback subscription cancelled");
    }
}

pub struct PlaybackController<E: AudioEngine> {
    engine: Arc<Mutex<E>>,
    state: PlaybackState,
    current: Option<AudioHandle>,
    generation: u64,
    ticker: Option<JoinHandle<()>>,
    tick_interval: Duration,
    events: broadcast::Sender<PlaybackEvent>,
}

impl<E: AudioEngine> PlaybackController<E> {
    pub fn new(engine: E, tick_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            engine: Arc::new(Mutex::new(engine)),
            state: PlaybackState::Idle,
            current: None,
            generation: 0,
            ticker: None,
            tick_interval: tick_interval.max(Duration::from_millis(1)),
            events,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.events.subscribe(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn current_handle(&self) -> Option<&AudioHandle> {
        self.current.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn start(&mut self, handle: &AudioHandle) {
        if self.state != PlaybackState::Idle {
            if self.current.as_ref() == Some(handle) {
                debug!(state = ?self.state, "Playback already active on this handle");
                return;
            }
            info!("Replacing active playback with a new handle");
            self.halt();
        }

        self.generation = self.generation.wrapping_add(1);
        let outcome = self.engine.lock().play(handle);
        match outcome {
            Ok(()) => {
                info!(
                    generation = self.generation,
                    path = %handle.path().display(),
                    "Started playback"
                );
                self.state = PlaybackState::Playing;
                self.current = Some(handle.clone());
                self.spawn_ticker();
            }
            Err(error) => {
                warn!(generation = self.generation, "Failed to start playback: {error}");
                self.engine.lock().stop();
                self.state = PlaybackState::Idle;
                self.current = None;
                self.publish(PlaybackEvent::Failed {
                    generation: self.generation,
                    error,
                });
            }
        }
    }

    pub fn pause(&mut self) {
        if self.state != PlaybackState::Playing {
            debug!(state = ?self.state, "Ignoring pause outside of playback");
            return;
        }
        self.stop_ticker();
        self.engine.lock().pause();
        self.state = PlaybackState::Paused;
        info!(generation = self.generation, "Paused playback");
    }

    pub fn resume(&mut self) {
        if self.state != PlaybackState::Paused {
            debug!(state = ?self.state, "Ignoring resume while not paused");
            return;
        }
        self.engine.lock().resume();
        self.state = PlaybackState::Playing;
        self.spawn_ticker();
        info!(generation = self.generation, "Resumed playback");
    }

    pub fn stop(&mut self) {
        if self.state == PlaybackState::Idle {
            return;
        }
        info!(generation = self.generation, "Stopping playback");
        self.halt();
    }

    /// Apply an event received from [`Self::subscribe`].
    ///
    /// Returns `false` for events of a superseded playback, which callers
    /// should ignore. Terminal events reset the controller to `Idle`.
    pub fn handle_event(&mut self, event: &PlaybackEvent) -> bool {
        if event.generation() != self.generation {
            trace!(
                generation = event.generation(),
                current = self.generation,
                "Ignoring stale playback event"
            );
            return false;
        }
        match event {
            PlaybackEvent::Position { .. } => {}
            PlaybackEvent::Finished { .. } => {
                if self.state != PlaybackState::Idle {
                    info!(generation = self.generation, "Playback reached end of audio");
                    self.halt();
                }
            }
            PlaybackEvent::Failed { error, .. } => {
                if self.state != PlaybackState::Idle {
                    warn!(generation = self.generation, "Playback failed: {error}");
                    self.halt();
                }
            }
        }
        true
    }

    fn halt(&mut self) {
        self.stop_ticker();
        self.engine.lock().stop();
        self.state = PlaybackState::Idle;
        self.current = None;
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    fn publish(&self, event: PlaybackEvent) {
        if self.events.send(event).is_err() {
            trace!("No playback subscribers");
        }
    }

    fn spawn_ticker(&mut self) {
        self.stop_ticker();
        let engine = Arc::clone(&self.engine);
        let events = self.events.clone();
        let generation = self.generation;
        let period = self.tick_interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let (status, position) = {
                    let engine = engine.lock();
                    (engine.status(), engine.position())
                };
                let event = match status {
                    EngineStatus::Active => PlaybackEvent::Position {
                        generation,
                        elapsed_ms: u64::try_from(position.as_millis()).unwrap_or(u64::MAX),
                    },
                    EngineStatus::Ended => PlaybackEvent::Finished { generation },
                    EngineStatus::Failed(error) => PlaybackEvent::Failed { generation, error },
                };
                let terminal = !matches!(event, PlaybackEvent::Position { .. });
                let _ = events.send(event);
                if terminal {
                    debug!(generation, "Ticker stopped on terminal engine status");
                    break;
                }
            }
        }));
    }
}

impl<E: AudioEngine> Drop for PlaybackController<E> {
    fn drop(&mut self) {
        self.stop_ticker();
        if self.state != PlaybackState::Idle {
            self.engine.lock().stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeEngineState {
        pub position: Duration,
        pub status: Option<EngineStatus>,
        pub fail_next_play: Option<PlaybackError>,
        pub plays: usize,
        pub pauses: usize,
        pub resumes: usize,
        pub stops: usize,
    }

    /// Engine double whose position and status are driven by the test.
    #[derive(Clone, Default)]
    pub struct FakeEngine {
        pub state: Arc<Mutex<FakeEngineState>>,
    }

    impl FakeEngine {
        pub fn set_position_ms(&self, ms: u64) {
            self.state.lock().position = Duration::from_millis(ms);
        }

        pub fn set_status(&self, status: EngineStatus) {
            self.state.lock().status = Some(status);
        }
    }

    impl AudioEngine for FakeEngine {
        fn play(&mut self, _handle: &AudioHandle) -> Result<(), PlaybackError> {
            let mut state = self.state.lock();
            if let Some(err) = state.fail_next_play.take() {
                return Err(err);
            }
            state.plays += 1;
            state.position = Duration::ZERO;
            state.status = Some(EngineStatus::Active);
            Ok(())
        }

        fn pause(&mut self) {
            self.state.lock().pauses += 1;
        }

        fn resume(&mut self) {
            self.state.lock().resumes += 1;
        }

        fn stop(&mut self) {
            self.state.lock().stops += 1;
        }

        fn position(&self) -> Duration {
            self.state.lock().position
        }

        fn status(&self) -> EngineStatus {
            self.state.lock().status.clone().unwrap_or(EngineStatus::Active)
        }
    }
}
