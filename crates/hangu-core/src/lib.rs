//! Core of the Korean read-along reader: speech synthesis, word markers,
//! playback timing and highlight synchronization.

pub mod cancellation;
pub mod config;
pub mod error;
pub mod export;
pub mod marker;
pub mod playback;
pub mod session;
pub mod sync;
pub mod synthesis;
pub mod text_utils;

pub use cancellation::CancellationToken;
pub use config::{AppConfig, load_config};
pub use error::{PlaybackError, SynthesisError};
pub use export::{Exporter, FileExporter};
pub use marker::Marker;
pub use playback::{AudioEngine, EngineStatus, PlaybackController, PlaybackEvent, PlaybackState};
pub use session::{ReaderSession, SessionCommand, SessionOptions, SessionSnapshot};
pub use sync::{RenderedSpan, SyncEngine};
pub use synthesis::{
    AudioHandle, Downloader, HttpDownloader, LegKind, LegRequest, LocatorSource, SynthesisClient,
    SynthesisResult, discard_audio,
};
