//! Remote synthesis: one audio leg and one speech-mark leg, fetched
//! concurrently and joined into a single [`SynthesisResult`].
//!
//! Each leg first asks the service for a short-lived signed locator and then
//! downloads it. Both legs always run to completion; a failure in one does not
//! cancel the other. The composite outcome is decided only after both are done.

use crate::cancellation::CancellationToken;
use crate::error::SynthesisError;
use crate::marker::{self, Marker};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Which half of a synthesis attempt a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegKind {
    Audio,
    Markers,
}

impl LegKind {
    pub fn label(self) -> &'static str {
        match self {
            LegKind::Audio => "audio",
            LegKind::Markers => "marks",
        }
    }

    /// Service output format requested for this leg.
    pub fn output_format(self) -> &'static str {
        match self {
            LegKind::Audio => "mp3",
            LegKind::Markers => "json",
        }
    }

    pub fn speech_mark_types(self) -> &'static [&'static str] {
        match self {
            LegKind::Audio => &[],
            LegKind::Markers => &["word"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegRequest {
    pub kind: LegKind,
    pub text: String,
    pub voice: String,
}

/// Issues signed, short-lived resource locators for a leg.
#[async_trait]
pub trait LocatorSource: Send + Sync {
    async fn locate(&self, request: &LegRequest) -> Result<Url, SynthesisError>;
}

/// Fetches the bytes behind a locator.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, kind: LegKind, locator: &Url) -> Result<Bytes, SynthesisError>;
}

/// Plain HTTP GET downloader for presigned URLs.
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, kind: LegKind, locator: &Url) -> Result<Bytes, SynthesisError> {
        let leg = kind.label();
        let response = self
            .client
            .get(locator.clone())
            .send()
            .await
            .map_err(|err| SynthesisError::network(leg, err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(leg, status = status.as_u16(), "Download rejected by service");
            return Err(SynthesisError::service(leg, Some(status.as_u16()), body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| SynthesisError::network(leg, err.to_string()))?;
        debug!(leg, bytes = bytes.len(), "Downloaded leg payload");
        Ok(bytes)
    }
}

/// Opaque reference to a downloaded, playable audio file.
///
/// Identity is the generated id; two downloads of the same text are distinct
/// handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHandle {
    id: Uuid,
    path: PathBuf,
}

impl AudioHandle {
    pub fn new(path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Joined output of a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    pub audio: AudioHandle,
    pub markers: Vec<Marker>,
}

#[derive(Debug)]
enum AudioPayload {
    Stored(StoredAudio),
    Empty,
}

/// A downloaded file that is removed on drop unless it is handed out.
///
/// Covers the leg finishing while the attempt is cancelled, the other leg
/// failing, and the write itself being interrupted.
#[derive(Debug)]
struct StoredAudio {
    handle: Option<AudioHandle>,
}

impl StoredAudio {
    fn new(handle: AudioHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn into_handle(mut self) -> Option<AudioHandle> {
        self.handle.take()
    }
}

impl Drop for StoredAudio {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            discard_audio(&handle);
        }
    }
}

/// Remove a synthesized file nobody is going to play.
pub fn discard_audio(handle: &AudioHandle) {
    match std::fs::remove_file(handle.path()) {
        Ok(()) => debug!(path = %handle.path().display(), "Removed orphaned audio"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %handle.path().display(), "Failed to remove orphaned audio: {err}"),
    }
}

/// Result of one leg plus the order in which it finished.
#[derive(Debug)]
struct LegOutcome<T> {
    finished: usize,
    result: Result<T, SynthesisError>,
}

pub struct SynthesisClient {
    locator: Arc<dyn LocatorSource>,
    downloader: Arc<dyn Downloader>,
    voice: String,
    audio_dir: PathBuf,
    attempts: AtomicU64,
}

impl SynthesisClient {
    pub fn new(
        locator: Arc<dyn LocatorSource>,
        downloader: Arc<dyn Downloader>,
        voice: impl Into<String>,
        audio_dir: PathBuf,
    ) -> Self {
        Self {
            locator,
            downloader,
            voice: voice.into(),
            audio_dir,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    /// Run both legs for `text` and join them.
    ///
    /// Returns [`SynthesisError::Cancelled`] as soon as `cancel` fires; the
    /// in-flight legs are dropped with it.
    pub async fn synthesize(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<SynthesisResult, SynthesisError> {
        cancel.check_cancelled("synthesis_start")?;
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            attempt,
            chars = text.chars().count(),
            voice = %self.voice,
            "Starting synthesis"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SynthesisError::Cancelled),
            outcome = self.join_legs(text) => outcome,
        };

        match &outcome {
            Ok(result) => info!(
                attempt,
                markers = result.markers.len(),
                audio = %result.audio.path().display(),
                "Synthesis completed"
            ),
            Err(err) => warn!(attempt, kind = err.kind(), "Synthesis failed: {err}"),
        }
        outcome
    }

    async fn join_legs(&self, text: &str) -> Result<SynthesisResult, SynthesisError> {
        let finished = AtomicUsize::new(0);
        let (audio, markers) = tokio::join!(
            async {
                let result = self.audio_leg(text).await;
                LegOutcome {
                    finished: finished.fetch_add(1, Ordering::SeqCst),
                    result,
                }
            },
            async {
                let result = self.marker_leg(text).await;
                LegOutcome {
                    finished: finished.fetch_add(1, Ordering::SeqCst),
                    result,
                }
            },
        );
        compose(audio, markers)
    }

    async fn audio_leg(&self, text: &str) -> Result<AudioPayload, SynthesisError> {
        let bytes = self.fetch(LegKind::Audio, text).await?;
        if bytes.is_empty() {
            debug!("Audio leg returned an empty payload");
            return Ok(AudioPayload::Empty);
        }

        tokio::fs::create_dir_all(&self.audio_dir).await?;
        let path = self.audio_dir.join(format!("{}.mp3", Uuid::new_v4()));
        let stored = StoredAudio::new(AudioHandle::new(path.clone()));
        tokio::fs::write(&path, &bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "Stored synthesized audio");
        Ok(AudioPayload::Stored(stored))
    }

    async fn marker_leg(&self, text: &str) -> Result<Vec<Marker>, SynthesisError> {
        let bytes = self.fetch(LegKind::Markers, text).await?;
        Ok(marker::parse_lines(&bytes))
    }

    async fn fetch(&self, kind: LegKind, text: &str) -> Result<Bytes, SynthesisError> {
        let request = LegRequest {
            kind,
            text: text.to_string(),
            voice: self.voice.clone(),
        };
        let locator = self.locator.locate(&request).await?;
        debug!(leg = kind.label(), host = ?locator.host_str(), "Obtained signed locator");
        self.downloader.download(kind, &locator).await
    }
}

fn compose(
    audio: LegOutcome<AudioPayload>,
    markers: LegOutcome<Vec<Marker>>,
) -> Result<SynthesisResult, SynthesisError> {
    match (audio.result, markers.result) {
        (Ok(audio), Ok(markers)) => {
            let AudioPayload::Stored(stored) = audio else {
                return Err(SynthesisError::IncompleteResult(
                    "audio payload was empty".to_string(),
                ));
            };
            if markers.is_empty() {
                return Err(SynthesisError::IncompleteResult(
                    "no word marks in speech-mark payload".to_string(),
                ));
            }
            let Some(handle) = stored.into_handle() else {
                return Err(SynthesisError::IncompleteResult(
                    "audio file was already released".to_string(),
                ));
            };
            Ok(SynthesisResult {
                audio: handle,
                markers,
            })
        }
        (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
        (Err(audio_err), Err(marker_err)) => {
            if audio.finished <= markers.finished {
                Err(audio_err)
            } else {
                Err(marker_err)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn audio_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn joins_both_legs_into_one_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = FakeService::healthy().client(dir.path().to_path_buf());

        let result = client
            .synthesize("안녕하세요, 만나서 반갑습니다.", &CancellationToken::new())
            .await
            .expect("synthesis should succeed");

        assert_eq!(result.markers.len(), 3);
        assert_eq!(result.markers[1].word, "만나서");
        assert_eq!(result.markers[1].start_offset_ms, 701);
        let stored = std::fs::read(result.audio.path()).expect("audio file should exist");
        assert_eq!(stored, b"ID3fake-mp3");
        assert_eq!(result.audio.path().extension().and_then(|e| e.to_str()), Some("mp3"));
    }

    #[tokio::test]
    async fn each_call_writes_a_uniquely_named_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = FakeService::healthy().client(dir.path().to_path_buf());
        let token = CancellationToken::new();

        let first = client.synthesize("a", &token).await.expect("first");
        let second = client.synthesize("a", &token).await.expect("second");

        assert_ne!(first.audio.path(), second.audio.path());
        assert_ne!(first.audio, second.audio);
        assert_eq!(audio_files(dir.path()), 2);
    }

    #[tokio::test]
    async fn audio_network_failure_fails_the_attempt_but_marker_leg_still_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = FakeService::new(
            LegScript::failing_download(SynthesisError::network("audio", "connection reset")),
            LegScript::ok(SAMPLE_MARKS.as_bytes()),
        );
        let client = service.client(dir.path().to_path_buf());

        let err = client
            .synthesize("text", &CancellationToken::new())
            .await
            .expect_err("audio leg failed");

        assert!(matches!(err, SynthesisError::Network { leg: "audio", .. }));
        assert!(service.downloads.lock().contains(&LegKind::Markers));
        assert_eq!(audio_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn locator_failure_on_one_leg_does_not_cancel_the_other() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = FakeService::new(
            LegScript::ok(&b"mp3"[..]).after(Duration::from_millis(30)),
            LegScript::failing_locate(SynthesisError::service("marks", Some(400), "bad voice")),
        );
        let client = service.client(dir.path().to_path_buf());

        let err = client
            .synthesize("text", &CancellationToken::new())
            .await
            .expect_err("marker locator failed");

        assert!(matches!(err, SynthesisError::Service { leg: "marks", status: Some(400), .. }));
        assert_eq!(*service.downloads.lock(), vec![LegKind::Audio]);
        assert_eq!(audio_files(dir.path()), 0, "orphaned audio should be removed");
    }

    #[tokio::test(start_paused = true)]
    async fn first_observed_error_wins_when_both_legs_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = FakeService::new(
            LegScript::failing_download(SynthesisError::network("audio", "late"))
                .after(Duration::from_millis(80)),
            LegScript::failing_download(SynthesisError::service("marks", Some(500), "early"))
                .after(Duration::from_millis(10)),
        );
        let err = service
            .client(dir.path().to_path_buf())
            .synthesize("text", &CancellationToken::new())
            .await
            .expect_err("both failed");
        assert!(matches!(err, SynthesisError::Service { leg: "marks", .. }));

        let service = FakeService::new(
            LegScript::failing_download(SynthesisError::network("audio", "early"))
                .after(Duration::from_millis(10)),
            LegScript::failing_download(SynthesisError::service("marks", Some(500), "late"))
                .after(Duration::from_millis(80)),
        );
        let err = service
            .client(dir.path().to_path_buf())
            .synthesize("text", &CancellationToken::new())
            .await
            .expect_err("both failed");
        assert!(matches!(err, SynthesisError::Network { leg: "audio", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn legs_run_concurrently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = FakeService::new(
            LegScript::ok(&b"mp3"[..]).after(Duration::from_millis(200)),
            LegScript::ok(SAMPLE_MARKS.as_bytes()).after(Duration::from_millis(200)),
        );
        let started = tokio::time::Instant::now();
        service
            .client(dir.path().to_path_buf())
            .synthesize("text", &CancellationToken::new())
            .await
            .expect("synthesis should succeed");
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn empty_payloads_are_incomplete_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = FakeService::new(LegScript::ok(Bytes::new()), LegScript::ok(SAMPLE_MARKS.as_bytes()));
        let err = service
            .client(dir.path().to_path_buf())
            .synthesize("text", &CancellationToken::new())
            .await
            .expect_err("empty audio");
        assert!(matches!(err, SynthesisError::IncompleteResult(_)));

        let service = FakeService::new(
            LegScript::ok(&b"mp3"[..]),
            LegScript::ok(&br#"{"time":0,"type":"sentence","start":0,"end":4,"value":"text"}"#[..]),
        );
        let err = service
            .client(dir.path().to_path_buf())
            .synthesize("text", &CancellationToken::new())
            .await
            .expect_err("no word marks");
        assert!(matches!(err, SynthesisError::IncompleteResult(_)));
        assert_eq!(audio_files(dir.path()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_in_flight_legs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = FakeService::new(
            LegScript::ok(&b"mp3"[..]).after(Duration::from_secs(30)),
            LegScript::ok(SAMPLE_MARKS.as_bytes()).after(Duration::from_secs(30)),
        );
        let client = Arc::new(service.client(dir.path().to_path_buf()));
        let token = CancellationToken::new();
        let task = {
            let client = client.clone();
            let token = token.clone();
            tokio::spawn(async move { client.synthesize("text", &token).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();

        let outcome = task.await.expect("task should not panic");
        assert_eq!(outcome, Err(SynthesisError::Cancelled));
        assert!(service.downloads.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelling_after_audio_is_stored_removes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = FakeService::new(
            LegScript::ok(&b"mp3"[..]),
            LegScript::ok(SAMPLE_MARKS.as_bytes()).after(Duration::from_secs(30)),
        );
        let client = Arc::new(service.client(dir.path().to_path_buf()));
        let token = CancellationToken::new();
        let task = {
            let client = client.clone();
            let token = token.clone();
            tokio::spawn(async move { client.synthesize("text", &token).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while audio_files(dir.path()) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("audio leg should store its file");
        token.cancel();

        let outcome = task.await.expect("task should not panic");
        assert_eq!(outcome, Err(SynthesisError::Cancelled));
        assert_eq!(audio_files(dir.path()), 0);
    }

    #[test]
    fn released_audio_is_kept_and_unreleased_audio_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kept = dir.path().join("kept.mp3");
        let dropped = dir.path().join("dropped.mp3");
        std::fs::write(&kept, b"mp3").expect("write");
        std::fs::write(&dropped, b"mp3").expect("write");

        let handle = StoredAudio::new(AudioHandle::new(kept.clone()))
            .into_handle()
            .expect("handle");
        drop(StoredAudio::new(AudioHandle::new(dropped.clone())));

        assert!(kept.exists());
        assert!(!dropped.exists());
        discard_audio(&handle);
        assert!(!kept.exists());
        discard_audio(&handle);
    }

    #[tokio::test]
    async fn http_downloader_maps_status_and_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/expired"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Request has expired"))
            .mount(&server)
            .await;

        let downloader = HttpDownloader::new();
        let base = Url::parse(&server.uri()).expect("server uri");

        let bytes = downloader
            .download(LegKind::Audio, &base.join("ok").expect("url"))
            .await
            .expect("200 should download");
        assert_eq!(&bytes[..], b"payload");

        let err = downloader
            .download(LegKind::Markers, &base.join("expired").expect("url"))
            .await
            .expect_err("403 should fail");
        assert_eq!(
            err,
            SynthesisError::service("marks", Some(403), "Request has expired")
        );

        let unreachable = Url::parse("http://127.0.0.1:9/never").expect("url");
        let err = downloader
            .download(LegKind::Audio, &unreachable)
            .await
            .expect_err("closed port should fail");
        assert!(matches!(err, SynthesisError::Network { leg: "audio", .. }));
    }
}
