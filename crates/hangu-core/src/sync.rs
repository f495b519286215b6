//! Highlight synchronization state.
//!
//! `SyncEngine` is plain data plus transitions; it never spawns or awaits.
//! The session feeds it synthesis completions, position ticks and toggle
//! requests on one serialized context and publishes what it derives.

use crate::error::{PlaybackError, SynthesisError};
use crate::marker::Marker;
use crate::playback::PlaybackState;
use crate::synthesis::{AudioHandle, SynthesisResult};
use crate::text_utils::vocabulary_from_markers;
use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a toggle request turns into, given the current playback state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleAction {
    Start(AudioHandle),
    Pause,
    Resume,
}

/// Location of the highlighted word inside the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedSpan {
    pub chars: Range<usize>,
    pub bytes: Range<usize>,
    pub text: String,
}

/// Greatest marker index whose start offset is at or before `elapsed_ms`.
///
/// `0` is the position a controller reports after a reset, so it never
/// highlights anything. The answer is recomputed from the whole sequence on
/// every call; positions may move backwards.
pub fn highlight_index(markers: &[Marker], elapsed_ms: u64) -> Option<usize> {
    if elapsed_ms == 0 {
        return None;
    }
    markers
        .iter()
        .rposition(|marker| marker.start_offset_ms <= elapsed_ms)
}

/// Span of the highlighted word in `source_text`.
///
/// Marker offsets count Unicode scalar values; out-of-range offsets are
/// clamped to the text.
pub fn rendered_span(
    index: Option<usize>,
    markers: &[Marker],
    source_text: &str,
) -> Option<RenderedSpan> {
    let marker = markers.get(index?)?;
    let char_len = source_text.chars().count();
    let start = marker.char_start.min(char_len);
    let end = marker.char_end.min(char_len);
    if start >= end {
        return None;
    }
    let byte_start = byte_offset(source_text, start);
    let byte_end = byte_offset(source_text, end);
    Some(RenderedSpan {
        chars: start..end,
        bytes: byte_start..byte_end,
        text: source_text[byte_start..byte_end].to_string(),
    })
}

fn byte_offset(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map(|(byte, _)| byte)
        .unwrap_or(text.len())
}

pub struct SyncEngine {
    source_text: Arc<str>,
    markers: Arc<[Marker]>,
    vocabulary: Arc<BTreeSet<String>>,
    audio: Option<AudioHandle>,
    highlighted: Option<usize>,
    request_id: u64,
    pending: bool,
    last_error: Option<String>,
}

impl SyncEngine {
    pub fn new(source_text: impl Into<Arc<str>>) -> Self {
        Self {
            source_text: source_text.into(),
            markers: Arc::from(Vec::new()),
            vocabulary: Arc::new(BTreeSet::new()),
            audio: None,
            highlighted: None,
            request_id: 0,
            pending: false,
            last_error: None,
        }
    }

    pub fn source_text(&self) -> Arc<str> {
        Arc::clone(&self.source_text)
    }

    pub fn markers(&self) -> Arc<[Marker]> {
        Arc::clone(&self.markers)
    }

    pub fn vocabulary(&self) -> Arc<BTreeSet<String>> {
        Arc::clone(&self.vocabulary)
    }

    pub fn audio(&self) -> Option<&AudioHandle> {
        self.audio.as_ref()
    }

    pub fn highlighted_index(&self) -> Option<usize> {
        self.highlighted
    }

    pub fn highlighted_span(&self) -> Option<RenderedSpan> {
        rendered_span(self.highlighted, &self.markers, &self.source_text)
    }

    pub fn is_ready(&self) -> bool {
        self.audio.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Open a new synthesis attempt. Returns its request id, or `None` when an
    /// attempt is already in flight.
    pub fn begin_synthesis(&mut self) -> Option<u64> {
        if self.pending {
            debug!(request_id = self.request_id, "Synthesis already in flight");
            return None;
        }
        self.request_id = self.request_id.wrapping_add(1);
        self.pending = true;
        info!(request_id = self.request_id, "Requesting synthesis");
        Some(self.request_id)
    }

    /// Whether a completion for `request_id` would still be applied.
    pub fn is_current(&self, request_id: u64) -> bool {
        self.pending && request_id == self.request_id
    }

    /// Apply the outcome of attempt `request_id`. Stale completions are
    /// ignored and reported as `false`.
    pub fn complete_synthesis(
        &mut self,
        request_id: u64,
        outcome: Result<SynthesisResult, SynthesisError>,
    ) -> bool {
        if !self.is_current(request_id) {
            debug!(
                request_id,
                current = self.request_id,
                "Ignoring stale synthesis completion"
            );
            return false;
        }
        self.pending = false;
        match outcome {
            Ok(result) => {
                let vocabulary = vocabulary_from_markers(&result.markers);
                info!(
                    request_id,
                    markers = result.markers.len(),
                    vocabulary = vocabulary.len(),
                    "Synthesis ready"
                );
                self.markers = Arc::from(result.markers);
                self.vocabulary = Arc::new(vocabulary);
                self.audio = Some(result.audio);
                self.highlighted = None;
                self.last_error = None;
            }
            Err(err) => {
                warn!(request_id, kind = err.kind(), "Synthesis attempt failed: {err}");
                self.last_error = Some(err.to_string());
            }
        }
        true
    }

    /// Map a toggle request onto a playback transition. `None` while not ready.
    pub fn toggle(&self, playback: PlaybackState) -> Option<ToggleAction> {
        let Some(audio) = &self.audio else {
            debug!("Ignoring toggle before synthesis is ready");
            return None;
        };
        Some(match playback {
            PlaybackState::Idle => ToggleAction::Start(audio.clone()),
            PlaybackState::Playing => ToggleAction::Pause,
            PlaybackState::Paused => ToggleAction::Resume,
        })
    }

    /// Recompute the highlight for a position tick; `true` when it changed.
    pub fn on_tick(&mut self, elapsed_ms: u64) -> bool {
        let next = highlight_index(&self.markers, elapsed_ms);
        if next == self.highlighted {
            return false;
        }
        debug!(elapsed_ms, from = ?self.highlighted, to = ?next, "Highlight moved");
        self.highlighted = next;
        true
    }

    pub fn clear_highlight(&mut self) -> bool {
        self.highlighted.take().is_some()
    }

    pub fn record_playback_error(&mut self, error: &PlaybackError) {
        self.last_error = Some(error.to_string());
    }

    /// Forget a reported failure once audio is playing again.
    ///
    /// Audio only exists after a successful attempt, which already cleared
    /// any synthesis error, so whatever is left came from playback.
    pub fn playback_started(&mut self) {
        if let Some(previous) = self.last_error.take() {
            debug!(%previous, "Playback recovered; clearing error");
        }
    }
}
