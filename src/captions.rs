//! Paced assistant captions.
//!
//! Reply text is revealed word by word at roughly speaking pace while the
//! reply audio plays, then committed as a final caption.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Approximate speaking rate (~160 words per minute).
const WORDS_PER_SECOND: f64 = 2.7;
/// Shortest total reveal time.
const MIN_TOTAL_MS: f64 = 2000.0;
/// Shortest gap between words.
const MIN_INTERVAL_MS: u64 = 45;

/// One caption update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption {
    pub text: String,
    pub is_final: bool,
}

/// Words of `text` and the gap between revealing each, or `None` for blank text.
pub fn caption_schedule(text: &str) -> Option<(Vec<String>, Duration)> {
    let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    if words.is_empty() {
        return None;
    }

    let total_ms = (words.len() as f64 / WORDS_PER_SECOND * 1000.0).max(MIN_TOTAL_MS);
    let interval_ms = ((total_ms / words.len() as f64).floor() as u64).max(MIN_INTERVAL_MS);
    Some((words, Duration::from_millis(interval_ms)))
}

/// A running caption reveal. Stopping it suppresses all further updates.
pub struct CaptionPacer {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CaptionPacer {
    /// Start revealing `text`; `emit` receives each growing prefix and then the
    /// full text as final. Returns `None` for blank text.
    pub fn start<F>(text: &str, emit: F) -> Option<Self>
    where
        F: Fn(Caption) + Send + 'static,
    {
        let (words, interval) = caption_schedule(text)?;
        let full = words.join(" ");
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            for shown in 1..=words.len() {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if shown < words.len() {
                    emit(Caption {
                        text: words[..shown].join(" "),
                        is_final: false,
                    });
                }
            }

            if !task_cancel.is_cancelled() {
                emit(Caption {
                    text: full,
                    is_final: true,
                });
            }
        });

        Some(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Wait for the reveal to finish or be stopped.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for CaptionPacer {
    fn drop(&mut self) {
        self.stop();
    }
}
