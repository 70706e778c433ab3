//! Interruptible playback of assistant audio.
//!
//! Exactly one playback is active at a time. `play()` resolves exactly one
//! terminal outcome per call, `Completed` or `Interrupted`, even when a natural
//! end races an `interrupt()`. Audio that cannot be played at all is an error,
//! never a completion.

use crate::recorder::AudioBlob;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// How often an active playback is polled for its natural end.
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors raised by playback sinks
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlaybackError {
    #[error("No output device available")]
    NoOutputDevice,

    #[error("Output device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open output stream: {0}")]
    Output(String),

    #[error("Failed to decode audio ({mime}): {reason}")]
    Decode { mime: String, reason: String },

    #[error("Playback does not accept streamed data")]
    NotProgressive,

    #[error("Audio stream failed: {0}")]
    Stream(String),
}

/// Byte chunks of an audio response as they arrive.
pub type ChunkStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

/// Audio arriving incrementally over the network.
pub struct AudioStream {
    pub mime_type: String,
    pub chunks: ChunkStream,
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream").field("mime_type", &self.mime_type).finish()
    }
}

/// What to play.
#[derive(Debug)]
pub enum PlaybackSource {
    /// Fully downloaded audio.
    Buffered(AudioBlob),
    /// Audio that may begin playing before the download completes.
    Streamed(AudioStream),
}

/// One playback in progress on a sink.
pub trait ActivePlayback: Send + 'static {
    fn is_finished(&self) -> bool;

    /// Stop output immediately.
    fn stop(&mut self);

    fn set_muted(&mut self, _muted: bool) {}

    /// Append streamed data. Only progressive playbacks accept this.
    fn append(&mut self, _chunk: &[u8]) -> Result<(), PlaybackError> {
        Err(PlaybackError::NotProgressive)
    }

    /// No more data will be appended.
    fn end_of_stream(&mut self) {}
}

/// An audio output.
pub trait PlaybackSink: Send + Sync + 'static {
    fn play_buffered(&self, blob: &AudioBlob) -> Result<Box<dyn ActivePlayback>, PlaybackError>;

    /// Whether `mime` can be played while it is still downloading.
    fn supports_progressive(&self, mime: &str) -> bool;

    fn open_progressive(&self, mime: &str) -> Result<Box<dyn ActivePlayback>, PlaybackError>;

    /// Mute state applied to playbacks started from now on.
    fn set_muted(&self, muted: bool);

    /// Send output to the named device.
    fn route_to(&self, device_id: &str) -> Result<(), PlaybackError>;
}

/// Terminal outcome of one `play()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
}

pub type PlaybackCallback = Box<dyn FnOnce() + Send + 'static>;

/// Observers for one playback. `on_end` and `on_interrupted` are mutually
/// exclusive; exactly one of them runs unless playback fails outright.
#[derive(Default)]
pub struct PlaybackCallbacks {
    pub on_start: Option<PlaybackCallback>,
    pub on_end: Option<PlaybackCallback>,
    pub on_interrupted: Option<PlaybackCallback>,
}

impl PlaybackCallbacks {
    pub fn on_start(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_end(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    pub fn on_interrupted(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_interrupted = Some(Box::new(f));
        self
    }
}

struct CurrentPlayback {
    id: u64,
    cancel: CancellationToken,
    active: Option<Box<dyn ActivePlayback>>,
}

/// Plays one source at a time on a sink and arbitrates interruption.
pub struct PlaybackController {
    sink: Arc<dyn PlaybackSink>,
    current: Mutex<Option<CurrentPlayback>>,
    next_id: AtomicU64,
    muted: AtomicBool,
}

impl PlaybackController {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            muted: AtomicBool::new(false),
        }
    }

    pub fn sink(&self) -> &Arc<dyn PlaybackSink> {
        &self.sink
    }

    pub fn is_playing(&self) -> bool {
        self.current.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Mute or unmute output, including the playback in progress.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        self.sink.set_muted(muted);
        if let Ok(mut current) = self.current.lock() {
            if let Some(active) = current.as_mut().and_then(|c| c.active.as_mut()) {
                active.set_muted(muted);
            }
        }
    }

    /// Stop the current playback. Synchronous and idempotent; returns false
    /// when nothing was playing.
    pub fn interrupt(&self) -> bool {
        let current = self.current.lock().ok().and_then(|mut c| c.take());
        match current {
            Some(mut current) => {
                if let Some(active) = current.active.as_mut() {
                    active.stop();
                }
                current.cancel.cancel();
                log::info!("Playback: interrupted #{}", current.id);
                true
            }
            None => false,
        }
    }

    /// Play `source` to its end or until interrupted. Any playback already in
    /// progress is interrupted first. Fails when the sink cannot play the
    /// source; a failure after an interrupt still counts as interrupted.
    pub async fn play(
        &self,
        source: PlaybackSource,
        callbacks: PlaybackCallbacks,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        self.interrupt();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(CurrentPlayback {
                id,
                cancel: cancel.clone(),
                active: None,
            });
        }

        let PlaybackCallbacks {
            mut on_start,
            on_end,
            on_interrupted,
        } = callbacks;
        let mut guard = TerminalGuard {
            controller: self,
            id,
            on_end,
            on_interrupted,
            resolved: false,
        };

        match self.drive(id, &cancel, source, &mut on_start).await {
            Ok(outcome) => {
                guard.resolve(outcome);
                Ok(outcome)
            }
            Err(e) if cancel.is_cancelled() => {
                log::debug!("Playback: #{} failed after interrupt: {}", id, e);
                guard.resolve(PlaybackOutcome::Interrupted);
                Ok(PlaybackOutcome::Interrupted)
            }
            Err(e) => {
                log::warn!("Playback: #{} failed: {}", id, e);
                guard.fail();
                Err(e)
            }
        }
    }

    /// Play with a time limit; playback still running at the limit is interrupted.
    pub async fn play_with_limit(
        &self,
        source: PlaybackSource,
        limit: Duration,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        let play = self.play(source, PlaybackCallbacks::default());
        tokio::pin!(play);

        tokio::select! {
            outcome = &mut play => outcome,
            _ = tokio::time::sleep(limit) => {
                log::info!("Playback: clip exceeded {:?}, cutting it off", limit);
                self.interrupt();
                play.await
            }
        }
    }

    async fn drive(
        &self,
        id: u64,
        cancel: &CancellationToken,
        source: PlaybackSource,
        on_start: &mut Option<PlaybackCallback>,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        match source {
            PlaybackSource::Buffered(blob) => self.drive_buffered(id, cancel, &blob, on_start).await,
            PlaybackSource::Streamed(stream) => {
                if self.sink.supports_progressive(&stream.mime_type) {
                    self.drive_progressive(id, cancel, stream, on_start).await
                } else {
                    log::debug!(
                        "Playback: {} cannot play progressively, buffering",
                        stream.mime_type
                    );
                    match collect_stream(cancel, stream).await {
                        Some(blob) if blob.is_empty() => Ok(PlaybackOutcome::Completed),
                        Some(blob) => self.drive_buffered(id, cancel, &blob, on_start).await,
                        None => Ok(PlaybackOutcome::Interrupted),
                    }
                }
            }
        }
    }

    async fn drive_buffered(
        &self,
        id: u64,
        cancel: &CancellationToken,
        blob: &AudioBlob,
        on_start: &mut Option<PlaybackCallback>,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        let active = self.sink.play_buffered(blob)?;
        if !self.install(id, active) {
            return Ok(PlaybackOutcome::Interrupted);
        }
        log::info!("Playback: #{} started ({}, {} bytes)", id, blob.mime_type(), blob.len());
        if let Some(f) = on_start.take() {
            f();
        }
        self.wait_finished(id, cancel).await
    }

    async fn drive_progressive(
        &self,
        id: u64,
        cancel: &CancellationToken,
        stream: AudioStream,
        on_start: &mut Option<PlaybackCallback>,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        let active = self.sink.open_progressive(&stream.mime_type)?;
        if !self.install(id, active) {
            return Ok(PlaybackOutcome::Interrupted);
        }
        log::info!("Playback: #{} streaming {}", id, stream.mime_type);

        let mut chunks = stream.chunks;
        let mut stream_done = false;
        let mut ticker = tokio::time::interval(FINISH_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(PlaybackOutcome::Interrupted),

                next = chunks.next(), if !stream_done => match next {
                    Some(Ok(bytes)) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        match self.with_active(id, |active| active.append(&bytes)) {
                            Some(Ok(())) => {
                                if let Some(f) = on_start.take() {
                                    log::info!("Playback: #{} audible before download completed", id);
                                    f();
                                }
                            }
                            Some(Err(e)) => {
                                log::warn!("Playback: #{} rejected stream data: {}", id, e);
                                stream_done = true;
                                self.with_active(id, |active| active.end_of_stream());
                            }
                            None => {}
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Playback: #{} stream error: {}", id, e);
                        stream_done = true;
                        self.with_active(id, |active| active.end_of_stream());
                    }
                    None => {
                        stream_done = true;
                        self.with_active(id, |active| active.end_of_stream());
                    }
                },

                _ = ticker.tick(), if stream_done => {
                    if self.with_active(id, |active| active.is_finished()) == Some(true) {
                        return Ok(PlaybackOutcome::Completed);
                    }
                }
            }
        }
    }

    async fn wait_finished(&self, id: u64, cancel: &CancellationToken) -> Result<PlaybackOutcome, PlaybackError> {
        let mut ticker = tokio::time::interval(FINISH_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(PlaybackOutcome::Interrupted),

                _ = ticker.tick() => {
                    if self.with_active(id, |active| active.is_finished()) == Some(true) {
                        return Ok(PlaybackOutcome::Completed);
                    }
                }
            }
        }
    }

    /// Attach `active` to playback `id`. If `id` was interrupted meanwhile the
    /// playback is stopped at once and false is returned.
    fn install(&self, id: u64, mut active: Box<dyn ActivePlayback>) -> bool {
        if self.is_muted() {
            active.set_muted(true);
        }
        if let Ok(mut current) = self.current.lock() {
            if let Some(current) = current.as_mut().filter(|c| c.id == id) {
                current.active = Some(active);
                return true;
            }
        }
        active.stop();
        false
    }

    fn with_active<R>(&self, id: u64, f: impl FnOnce(&mut Box<dyn ActivePlayback>) -> R) -> Option<R> {
        let mut current = self.current.lock().ok()?;
        let active = current.as_mut().filter(|c| c.id == id)?.active.as_mut()?;
        Some(f(active))
    }

    /// Remove playback `id` from the slot, stopping it if still running.
    fn release(&self, id: u64) {
        let taken = self
            .current
            .lock()
            .ok()
            .and_then(|mut current| match current.as_ref() {
                Some(c) if c.id == id => current.take(),
                _ => None,
            });
        if let Some(mut taken) = taken {
            if let Some(active) = taken.active.as_mut() {
                active.stop();
            }
        }
    }
}

/// Resolves the terminal callback exactly once, including when the `play()`
/// future is dropped before it completes.
struct TerminalGuard<'a> {
    controller: &'a PlaybackController,
    id: u64,
    on_end: Option<PlaybackCallback>,
    on_interrupted: Option<PlaybackCallback>,
    resolved: bool,
}

impl TerminalGuard<'_> {
    /// Release the slot without running either callback.
    fn fail(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.controller.release(self.id);
        }
    }

    fn resolve(&mut self, outcome: PlaybackOutcome) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        self.controller.release(self.id);
        log::debug!("Playback: #{} resolved {:?}", self.id, outcome);

        let callback = match outcome {
            PlaybackOutcome::Completed => self.on_end.take(),
            PlaybackOutcome::Interrupted => self.on_interrupted.take(),
        };
        if let Some(f) = callback {
            f();
        }
    }
}

impl Drop for TerminalGuard<'_> {
    fn drop(&mut self) {
        self.resolve(PlaybackOutcome::Interrupted);
    }
}

/// Read a whole stream into memory. `None` if cancelled first.
async fn collect_stream(cancel: &CancellationToken, stream: AudioStream) -> Option<AudioBlob> {
    let mut chunks = stream.chunks;
    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return None,

            next = chunks.next() => match next {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    log::warn!("Playback: stream error while buffering: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    Some(AudioBlob::new(stream.mime_type, buf.freeze()))
}


#[cfg(test)]
mod tests {
    use super::testing::FakeSink;
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use chunk_channel::ReceiverStream;

    /// Minimal mpsc-backed stream so tests can feed chunks on demand.
    mod chunk_channel {
        use super::*;
        use std::task::{Context, Poll};

        pub struct ReceiverStream(pub mpsc::UnboundedReceiver<std::io::Result<Bytes>>);

        impl Stream for ReceiverStream {
            type Item = std::io::Result<Bytes>;

            fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
                self.0.poll_recv(cx)
            }
        }
    }

    #[derive(Default)]
    struct Counts {
        start: AtomicUsize,
        end: AtomicUsize,
        interrupted: AtomicUsize,
    }

    fn counted(counts: &Arc<Counts>) -> PlaybackCallbacks {
        let (a, b, c) = (counts.clone(), counts.clone(), counts.clone());
        PlaybackCallbacks::default()
            .on_start(move || {
                a.start.fetch_add(1, Ordering::SeqCst);
            })
            .on_end(move || {
                b.end.fetch_add(1, Ordering::SeqCst);
            })
            .on_interrupted(move || {
                c.interrupted.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn mp3() -> PlaybackSource {
        PlaybackSource::Buffered(AudioBlob::new("audio/mpeg", vec![0u8; 64]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_completes() {
        let controller = PlaybackController::new(Arc::new(FakeSink::default()));
        let counts = Arc::new(Counts::default());

        let outcome = controller.play(mp3(), counted(&counts)).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(counts.start.load(Ordering::SeqCst), 1);
        assert_eq!(counts.end.load(Ordering::SeqCst), 1);
        assert_eq!(counts.interrupted.load(Ordering::SeqCst), 0);
        assert!(!controller.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_is_idempotent() {
        let controller = Arc::new(PlaybackController::new(Arc::new(FakeSink::default())));
        let counts = Arc::new(Counts::default());

        let player = controller.clone();
        let callbacks = counted(&counts);
        let task = tokio::spawn(async move { player.play(mp3(), callbacks).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.is_playing());
        assert!(controller.interrupt());
        assert!(!controller.interrupt());
        assert!(!controller.is_playing());

        assert_eq!(task.await.unwrap().unwrap(), PlaybackOutcome::Interrupted);
        assert_eq!(counts.interrupted.load(Ordering::SeqCst), 1);
        assert_eq!(counts.end.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_interrupt_race_resolves_exactly_once() {
        // Interrupt at offsets straddling the natural end at 500ms.
        for offset_ms in [480u64, 495, 500, 505, 510, 520, 540] {
            let controller = Arc::new(PlaybackController::new(Arc::new(FakeSink::default())));
            let counts = Arc::new(Counts::default());

            let player = controller.clone();
            let callbacks = counted(&counts);
            let task = tokio::spawn(async move { player.play(mp3(), callbacks).await });

            tokio::time::sleep(Duration::from_millis(offset_ms)).await;
            controller.interrupt();
            let outcome = task.await.unwrap().unwrap();

            let end = counts.end.load(Ordering::SeqCst);
            let interrupted = counts.interrupted.load(Ordering::SeqCst);
            assert_eq!(end + interrupted, 1, "offset {}ms", offset_ms);
            match outcome {
                PlaybackOutcome::Completed => assert_eq!(end, 1),
                PlaybackOutcome::Interrupted => assert_eq!(interrupted, 1),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_play_interrupts_previous() {
        let controller = Arc::new(PlaybackController::new(Arc::new(FakeSink::default())));
        let first_counts = Arc::new(Counts::default());

        let player = controller.clone();
        let callbacks = counted(&first_counts);
        let first = tokio::spawn(async move { player.play(mp3(), callbacks).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = controller.play(mp3(), PlaybackCallbacks::default()).await.unwrap();
        assert_eq!(second, PlaybackOutcome::Completed);
        assert_eq!(first.await.unwrap().unwrap(), PlaybackOutcome::Interrupted);
        assert_eq!(first_counts.interrupted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progressive_starts_before_stream_completes() {
        let sink = FakeSink::default();
        let log = sink.log.clone();
        let controller = Arc::new(PlaybackController::new(Arc::new(sink)));
        let counts = Arc::new(Counts::default());

        let (tx, rx) = mpsc::unbounded_channel();
        let source = PlaybackSource::Streamed(AudioStream {
            mime_type: "audio/L16;rate=24000;channels=1".into(),
            chunks: Box::pin(ReceiverStream(rx)),
        });

        let player = controller.clone();
        let callbacks = counted(&counts);
        let task = tokio::spawn(async move { player.play(source, callbacks).await });

        tx.send(Ok(Bytes::from_static(&[0, 0, 1, 0]))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counts.start.load(Ordering::SeqCst), 1, "audible after the first chunk");
        assert_eq!(counts.end.load(Ordering::SeqCst), 0);

        tx.send(Ok(Bytes::from_static(&[2, 0, 3, 0]))).unwrap();
        drop(tx);

        assert_eq!(task.await.unwrap().unwrap(), PlaybackOutcome::Completed);
        assert_eq!(log.appended_bytes.load(Ordering::SeqCst), 8);
        assert_eq!(counts.start.load(Ordering::SeqCst), 1);
        assert_eq!(counts.end.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_stream_is_buffered() {
        let sink = FakeSink {
            progressive: false,
            ..FakeSink::default()
        };
        let log = sink.log.clone();
        let controller = PlaybackController::new(Arc::new(sink));

        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let source = PlaybackSource::Streamed(AudioStream {
            mime_type: "audio/webm".into(),
            chunks: Box::pin(futures_util::stream::iter(chunks)),
        });

        assert_eq!(
            controller.play(source, PlaybackCallbacks::default()).await.unwrap(),
            PlaybackOutcome::Completed
        );
        assert_eq!(log.started.load(Ordering::SeqCst), 1);
        assert_eq!(log.appended_bytes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_is_an_error_not_a_completion() {
        let sink = FakeSink {
            fail: true,
            ..FakeSink::default()
        };
        let controller = PlaybackController::new(Arc::new(sink));
        let counts = Arc::new(Counts::default());

        let err = controller.play(mp3(), counted(&counts)).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Decode { .. }));
        assert_eq!(counts.start.load(Ordering::SeqCst), 0);
        assert_eq!(counts.end.load(Ordering::SeqCst), 0);
        assert_eq!(counts.interrupted.load(Ordering::SeqCst), 0);
        assert!(!controller.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_play_future_counts_as_interrupted() {
        let controller = PlaybackController::new(Arc::new(FakeSink::default()));
        let counts = Arc::new(Counts::default());

        let _ = tokio::time::timeout(Duration::from_millis(100), controller.play(mp3(), counted(&counts))).await;
        assert_eq!(counts.interrupted.load(Ordering::SeqCst), 1);
        assert_eq!(counts.end.load(Ordering::SeqCst), 0);
        assert!(!controller.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_with_limit_cuts_long_clip() {
        let sink = FakeSink {
            duration: Duration::from_secs(30),
            ..FakeSink::default()
        };
        let controller = PlaybackController::new(Arc::new(sink));
        let outcome = controller.play_with_limit(mp3(), Duration::from_secs(15)).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Interrupted);
    }

    #[test]
    fn test_set_muted_reaches_sink() {
        let sink = FakeSink::default();
        let log = sink.log.clone();
        let controller = PlaybackController::new(Arc::new(sink));
        controller.set_muted(true);
        assert!(controller.is_muted());
        assert!(log.muted.load(Ordering::SeqCst));
    }
}
