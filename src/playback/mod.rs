pub mod fetch;
pub mod output;

pub use fetch::{AudioFetcher, HttpFetcher, PlaybackError};
pub use output::{AudioOutput, DecodedAudio, PlaybackOutcome, RodioOutput};

use crate::notifier::{ErrorBanner, Notifier, STATUS_READY};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub const STATUS_LOADING: &str = "Loading audio...";
pub const STATUS_PLAYING: &str = "Playing audio...";
pub const ERROR_PLAYBACK: &str = "An error occurred while playing the audio";
pub const ERROR_AUTOPLAY: &str =
    "Audio playback could not start automatically. Use replay to play it.";
pub const ERROR_NOTHING_TO_REPLAY: &str = "There is no audio to replay yet";
const PROXIED_ERROR_PREFIX: &str = "Audio playback failed: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Loading,
    Playing,
    Ended,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPath {
    /// Server-pushed `voice_url`, loaded as-is.
    Direct,
    /// Arbitrary source fetched through the backend proxy.
    Proxied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub source: String,
    pub path: PlaybackPath,
}

impl PlaybackRequest {
    pub fn direct(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            path: PlaybackPath::Direct,
        }
    }

    pub fn proxied(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            path: PlaybackPath::Proxied,
        }
    }
}

/// What the session layer needs from playback.
pub trait Player: Send + Sync {
    fn play(&self, request: PlaybackRequest);
    /// Manual retry of the last direct playback, without re-fetching.
    fn replay(&self);
}

enum Job {
    Load(PlaybackRequest),
    Replay,
}

#[derive(Default)]
struct Active {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    fetcher: Arc<dyn AudioFetcher>,
    output: Arc<dyn AudioOutput>,
    notifier: Arc<dyn Notifier>,
    errors: ErrorBanner,
    status: watch::Sender<PlaybackStatus>,
    active: Mutex<Active>,
    retained: Mutex<Option<DecodedAudio>>,
}

/// Owns the audio output. Every request goes through `play`/`replay`, which
/// cancel whatever is in flight before starting.
#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PlaybackController {
    pub fn new(
        fetcher: Arc<dyn AudioFetcher>,
        output: Arc<dyn AudioOutput>,
        errors: ErrorBanner,
    ) -> Self {
        let (status, _) = watch::channel(PlaybackStatus::Idle);
        Self {
            inner: Arc::new(Inner {
                fetcher,
                output,
                notifier: errors.notifier().clone(),
                errors,
                status,
                active: Mutex::new(Active::default()),
                retained: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> PlaybackStatus {
        *self.inner.status.borrow()
    }

    fn begin(&self, job: Job) {
        let mut active = lock(&self.inner.active);
        if let Some(task) = active.task.take() {
            task.abort();
        }
        self.inner.output.stop();
        active.generation += 1;
        let generation = active.generation;
        let inner = self.inner.clone();
        active.task = Some(tokio::spawn(async move {
            inner.run(generation, job).await;
        }));
    }
}

impl Player for PlaybackController {
    fn play(&self, request: PlaybackRequest) {
        log::info!("[playback] {:?} request for {}", request.path, request.source);
        self.begin(Job::Load(request));
    }

    fn replay(&self) {
        // Nothing retained: leave whatever is playing alone.
        if lock(&self.inner.retained).is_none() {
            self.inner.errors.show(ERROR_NOTHING_TO_REPLAY);
            return;
        }
        self.begin(Job::Replay);
    }
}

impl Inner {
    async fn run(self: Arc<Self>, generation: u64, job: Job) {
        match job {
            Job::Load(request) => match request.path {
                PlaybackPath::Direct => self.play_direct(generation, &request.source).await,
                PlaybackPath::Proxied => self.play_proxied(generation, &request.source).await,
            },
            Job::Replay => self.play_retained(generation).await,
        }
    }

    async fn play_direct(&self, generation: u64, source: &str) {
        if !self.transition(generation, PlaybackStatus::Loading) {
            return;
        }
        let audio = match self.load(self.fetcher.fetch_direct(source).await).await {
            Ok(audio) => audio,
            Err(e) => {
                log::error!("[playback] direct load failed: {}", e);
                self.fail(generation, ERROR_PLAYBACK);
                return;
            }
        };
        *lock(&self.retained) = Some(audio.clone());

        // No resume here: a suspended output is the autoplay refusal case.
        match self.start_if_current(generation, audio) {
            None => {}
            Some(Ok(done)) => self.await_end(generation, done).await,
            Some(Err(PlaybackError::Suspended)) => {
                log::warn!("[playback] autoplay refused: output suspended");
                if self.transition(generation, PlaybackStatus::Idle) {
                    self.notifier.set_status(STATUS_READY);
                    self.errors.show(ERROR_AUTOPLAY);
                }
            }
            Some(Err(e)) => {
                log::error!("[playback] direct start failed: {}", e);
                self.fail(generation, ERROR_PLAYBACK);
            }
        }
    }

    async fn play_proxied(&self, generation: u64, source: &str) {
        if !self.transition(generation, PlaybackStatus::Loading) {
            return;
        }
        let result: Result<DecodedAudio, PlaybackError> = async {
            let bytes = self.fetcher.fetch_proxied(source).await?;
            if self.output.is_suspended() {
                self.resume_output().await?;
            }
            self.load(Ok(bytes)).await
        }
        .await;

        let audio = match result {
            Ok(audio) => audio,
            Err(e) => {
                log::error!("[playback] proxied playback failed: {}", e);
                self.fail(generation, &format!("{}{}", PROXIED_ERROR_PREFIX, e));
                return;
            }
        };
        match self.start_if_current(generation, audio) {
            None => {}
            Some(Ok(done)) => self.await_end(generation, done).await,
            Some(Err(e)) => self.fail(generation, &format!("{}{}", PROXIED_ERROR_PREFIX, e)),
        }
    }

    async fn play_retained(&self, generation: u64) {
        let Some(audio) = lock(&self.retained).clone() else {
            self.fail(generation, ERROR_NOTHING_TO_REPLAY);
            return;
        };
        if self.output.is_suspended() {
            if let Err(e) = self.resume_output().await {
                log::error!("[playback] resume failed: {}", e);
                self.fail(generation, ERROR_PLAYBACK);
                return;
            }
        }
        match self.start_if_current(generation, audio) {
            None => {}
            Some(Ok(done)) => self.await_end(generation, done).await,
            Some(Err(e)) => {
                log::error!("[playback] replay failed: {}", e);
                self.fail(generation, ERROR_PLAYBACK);
            }
        }
    }

    async fn load(
        &self,
        fetched: Result<Vec<u8>, PlaybackError>,
    ) -> Result<DecodedAudio, PlaybackError> {
        let bytes = fetched?;
        if bytes.is_empty() {
            return Err(PlaybackError::Empty);
        }
        let output = self.output.clone();
        tokio::task::spawn_blocking(move || output.decode(&bytes))
            .await
            .map_err(|e| PlaybackError::Other(format!("decode task failed: {}", e)))?
    }

    /// Resuming may open a device, so it runs off the async workers.
    async fn resume_output(&self) -> Result<(), PlaybackError> {
        let output = self.output.clone();
        tokio::task::spawn_blocking(move || output.resume())
            .await
            .map_err(|e| PlaybackError::Other(format!("resume task failed: {}", e)))?
    }

    /// Starting and superseding share one lock, so a stale request can never
    /// start after a newer one has stopped the output.
    fn start_if_current(
        &self,
        generation: u64,
        audio: DecodedAudio,
    ) -> Option<Result<oneshot::Receiver<PlaybackOutcome>, PlaybackError>> {
        let active = lock(&self.active);
        if active.generation != generation {
            return None;
        }
        let started = self.output.start(audio);
        if started.is_ok() {
            self.status.send_replace(PlaybackStatus::Playing);
            self.notifier.set_status(STATUS_PLAYING);
        }
        Some(started)
    }

    async fn await_end(&self, generation: u64, done: oneshot::Receiver<PlaybackOutcome>) {
        match done.await {
            Ok(PlaybackOutcome::Finished) => {
                log::info!("[playback] finished");
                if self.transition(generation, PlaybackStatus::Ended) {
                    self.transition(generation, PlaybackStatus::Idle);
                }
            }
            Ok(PlaybackOutcome::Failed(e)) => {
                log::error!("[playback] output error: {}", e);
                self.fail(generation, ERROR_PLAYBACK);
            }
            Ok(PlaybackOutcome::Stopped) | Err(_) => {
                self.transition(generation, PlaybackStatus::Idle);
            }
        }
    }

    fn fail(&self, generation: u64, message: &str) {
        if self.transition(generation, PlaybackStatus::Failed) {
            self.errors.show(message);
            self.transition(generation, PlaybackStatus::Idle);
        }
    }

    /// Returns false once the request has been superseded.
    fn transition(&self, generation: u64, status: PlaybackStatus) -> bool {
        let active = lock(&self.active);
        if active.generation != generation {
            return false;
        }
        self.status.send_replace(status);
        match status {
            PlaybackStatus::Loading => self.notifier.set_status(STATUS_LOADING),
            PlaybackStatus::Playing => self.notifier.set_status(STATUS_PLAYING),
            PlaybackStatus::Ended | PlaybackStatus::Failed => {
                self.notifier.set_status(STATUS_READY)
            }
            PlaybackStatus::Idle => {}
        }
        true
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeFetcher, FakeOutput};
    use super::*;
    use crate::notifier::fake::FakeNotifier;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Rig {
        notifier: Arc<FakeNotifier>,
        fetcher: Arc<FakeFetcher>,
        output: Arc<FakeOutput>,
        playback: PlaybackController,
    }

    fn rig() -> Rig {
        let notifier = Arc::new(FakeNotifier::default());
        let fetcher = Arc::new(FakeFetcher::default());
        let output = Arc::new(FakeOutput::default());
        let errors = ErrorBanner::new(notifier.clone(), Duration::from_secs(20));
        let playback = PlaybackController::new(fetcher.clone(), output.clone(), errors);
        Rig {
            notifier,
            fetcher,
            output,
            playback,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn direct_playback_runs_to_completion() {
        let r = rig();
        r.playback.play(PlaybackRequest::direct("http://x/a.mp3"));

        eventually(|| r.output.audible() == 1).await;
        assert_eq!(r.playback.status(), PlaybackStatus::Playing);
        assert_eq!(
            r.fetcher.calls(),
            vec![("http://x/a.mp3".to_string(), PlaybackPath::Direct)]
        );

        r.output.finish_all(PlaybackOutcome::Finished);
        eventually(|| r.playback.status() == PlaybackStatus::Idle).await;
        assert_eq!(r.notifier.last_status().as_deref(), Some(STATUS_READY));
        assert!(r.notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn new_request_supersedes_audible_one() {
        let r = rig();
        r.playback.play(PlaybackRequest::direct("http://x/a.mp3"));
        eventually(|| r.output.starts.load(Ordering::SeqCst) == 1).await;

        r.playback.play(PlaybackRequest::proxied("http://x/b.mp3"));
        eventually(|| r.output.starts.load(Ordering::SeqCst) == 2).await;
        assert_eq!(r.output.audible(), 1);

        r.playback.play(PlaybackRequest::direct("http://x/c.mp3"));
        eventually(|| r.output.starts.load(Ordering::SeqCst) == 3).await;
        assert_eq!(r.output.audible(), 1);
        assert_eq!(r.playback.status(), PlaybackStatus::Playing);
    }

    #[tokio::test]
    async fn back_to_back_requests_start_only_the_last() {
        let r = rig();
        r.playback.play(PlaybackRequest::proxied("http://x/a.mp3"));
        r.playback.play(PlaybackRequest::direct("http://x/b.mp3"));

        eventually(|| r.output.audible() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(r.output.audible(), 1);
        assert_eq!(r.output.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn autoplay_refusal_asks_for_manual_replay() {
        let r = rig();
        r.output.suspended.store(true, Ordering::SeqCst);
        r.playback.play(PlaybackRequest::direct("http://x/a.mp3"));

        eventually(|| !r.notifier.errors().is_empty()).await;
        assert_eq!(r.notifier.errors(), vec![ERROR_AUTOPLAY.to_string()]);
        assert_eq!(r.output.resumes.load(Ordering::SeqCst), 0);
        eventually(|| r.playback.status() == PlaybackStatus::Idle).await;

        r.playback.replay();
        eventually(|| r.output.audible() == 1).await;
        assert_eq!(r.output.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(r.fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn proxied_playback_resumes_suspended_output() {
        let r = rig();
        r.output.suspended.store(true, Ordering::SeqCst);
        r.playback.play(PlaybackRequest::proxied("http://x/a.mp3"));

        eventually(|| r.output.audible() == 1).await;
        assert_eq!(r.output.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(
            r.fetcher.calls(),
            vec![("http://x/a.mp3".to_string(), PlaybackPath::Proxied)]
        );
    }

    #[tokio::test]
    async fn proxied_errors_surface_mapped_text() {
        let r = rig();
        r.fetcher.respond("http://x/a.mp3", Err(PlaybackError::Forbidden));
        r.playback.play(PlaybackRequest::proxied("http://x/a.mp3"));

        eventually(|| !r.notifier.errors().is_empty()).await;
        let error = &r.notifier.errors()[0];
        assert!(error.starts_with(PROXIED_ERROR_PREFIX));
        assert!(error.contains("access to the audio file was denied"));
        eventually(|| r.playback.status() == PlaybackStatus::Idle).await;
        assert_eq!(r.notifier.last_status().as_deref(), Some(STATUS_READY));
    }

    #[tokio::test]
    async fn undecodable_payload_reports_invalid_audio() {
        let r = rig();
        r.fetcher.respond("http://x/a.mp3", Ok(b"bad".to_vec()));
        r.playback.play(PlaybackRequest::proxied("http://x/a.mp3"));

        eventually(|| !r.notifier.errors().is_empty()).await;
        assert!(r.notifier.errors()[0].contains("invalid audio data"));
        assert_eq!(r.output.audible(), 0);
    }

    #[tokio::test]
    async fn direct_load_failure_is_generic() {
        let r = rig();
        r.fetcher.respond(
            "http://x/a.mp3",
            Err(PlaybackError::Network("refused".into())),
        );
        r.playback.play(PlaybackRequest::direct("http://x/a.mp3"));

        eventually(|| !r.notifier.errors().is_empty()).await;
        assert_eq!(r.notifier.errors(), vec![ERROR_PLAYBACK.to_string()]);
    }

    #[tokio::test]
    async fn output_failure_mid_playback_is_reported() {
        let r = rig();
        r.playback.play(PlaybackRequest::direct("http://x/a.mp3"));
        eventually(|| r.output.audible() == 1).await;

        r.output.finish_all(PlaybackOutcome::Failed("device lost".into()));
        eventually(|| !r.notifier.errors().is_empty()).await;
        assert_eq!(r.notifier.errors(), vec![ERROR_PLAYBACK.to_string()]);
        eventually(|| r.playback.status() == PlaybackStatus::Idle).await;
    }

    #[tokio::test]
    async fn replay_without_audio_reports_it() {
        let r = rig();
        r.playback.replay();
        eventually(|| !r.notifier.errors().is_empty()).await;
        assert_eq!(r.notifier.errors(), vec![ERROR_NOTHING_TO_REPLAY.to_string()]);
        assert_eq!(r.playback.status(), PlaybackStatus::Idle);
    }

    #[tokio::test]
    async fn empty_replay_leaves_proxied_stream_playing() {
        let r = rig();
        r.playback.play(PlaybackRequest::proxied("http://x/a.mp3"));
        eventually(|| r.output.audible() == 1).await;
        let stops = r.output.stops.load(Ordering::SeqCst);

        r.playback.replay();
        assert_eq!(r.notifier.errors(), vec![ERROR_NOTHING_TO_REPLAY.to_string()]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(r.output.audible(), 1);
        assert_eq!(r.output.stops.load(Ordering::SeqCst), stops);
        assert_eq!(r.playback.status(), PlaybackStatus::Playing);

        r.output.finish_all(PlaybackOutcome::Finished);
        eventually(|| r.playback.status() == PlaybackStatus::Idle).await;
        assert_eq!(r.notifier.last_status().as_deref(), Some(STATUS_READY));
    }

    #[tokio::test]
    async fn direct_start_failure_is_not_an_autoplay_refusal() {
        let r = rig();
        *r.output.start_error.lock().unwrap() =
            Some(PlaybackError::Other("failed to open audio sink".into()));
        r.playback.play(PlaybackRequest::direct("http://x/a.mp3"));

        eventually(|| !r.notifier.errors().is_empty()).await;
        assert_eq!(r.notifier.errors(), vec![ERROR_PLAYBACK.to_string()]);
        eventually(|| r.playback.status() == PlaybackStatus::Idle).await;
        assert_eq!(r.notifier.last_status().as_deref(), Some(STATUS_READY));
    }
}
