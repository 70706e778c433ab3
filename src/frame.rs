//! Frame-cadence scheduling for detector loops.
//!
//! Every detector samples its analyser once per frame. A `FrameLoop` is the
//! handle to one scheduled loop; `cancel()` deregisters it synchronously so a
//! torn-down component never leaves a callback scheduled behind it.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type FrameCallback = Box<dyn FnMut(f64) -> ControlFlow<()> + Send + 'static>;

/// Registration of one loop in the scheduler's live count. Owns the frame
/// callback so releasing drops whatever it captured.
struct Registration {
    active: AtomicBool,
    counter: Arc<AtomicUsize>,
    callback: Mutex<Option<FrameCallback>>,
}

impl Registration {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Idempotent: only the first release decrements the counter. The
    /// callback is dropped here unless a frame is running it right now, in
    /// which case the loop drops it when that frame returns.
    fn release(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
        if let Ok(mut callback) = self.callback.try_lock() {
            callback.take();
        }
    }

    fn run_frame(&self, now_ms: f64) -> ControlFlow<()> {
        match self.callback.lock() {
            Ok(mut callback) => match callback.as_mut() {
                Some(on_frame) => on_frame(now_ms),
                None => ControlFlow::Break(()),
            },
            Err(_) => ControlFlow::Break(()),
        }
    }
}

/// Spawns frame loops at a fixed cadence and tracks how many are scheduled.
#[derive(Clone)]
pub struct FrameScheduler {
    interval: Duration,
    scheduled: Arc<AtomicUsize>,
}

impl FrameScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            scheduled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of loops currently scheduled (not yet cancelled or finished).
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Run `on_frame` once per frame until it breaks or the loop is cancelled.
    ///
    /// `on_frame` receives milliseconds since the loop started; the first frame
    /// fires immediately at 0.
    pub fn spawn<F>(&self, on_frame: F) -> FrameLoop
    where
        F: FnMut(f64) -> ControlFlow<()> + Send + 'static,
    {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        let registration = Arc::new(Registration {
            active: AtomicBool::new(true),
            counter: self.scheduled.clone(),
            callback: Mutex::new(Some(Box::new(on_frame))),
        });
        let cancel = CancellationToken::new();

        let task_registration = registration.clone();
        let task_cancel = cancel.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = task_cancel.cancelled() => break,

                    tick = ticker.tick() => {
                        if !task_registration.is_active() {
                            break;
                        }
                        let now_ms = tick.saturating_duration_since(started).as_secs_f64() * 1000.0;
                        if task_registration.run_frame(now_ms).is_break() {
                            break;
                        }
                    }
                }
            }

            task_registration.release();
        });

        FrameLoop {
            registration,
            cancel,
            handle: Some(handle),
        }
    }
}

/// Handle to one scheduled frame loop.
pub struct FrameLoop {
    registration: Arc<Registration>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FrameLoop {
    /// Deregister and stop the loop. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.registration.release();
        self.cancel.cancel();
    }

    pub fn is_scheduled(&self) -> bool {
        self.registration.is_active()
    }

    /// A cloneable handle that can cancel this loop from elsewhere.
    pub fn canceller(&self) -> FrameCanceller {
        FrameCanceller {
            registration: self.registration.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Wait for the loop task to exit.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Cancels a frame loop without owning it.
#[derive(Clone)]
pub struct FrameCanceller {
    registration: Arc<Registration>,
    cancel: CancellationToken,
}

impl FrameCanceller {
    pub fn cancel(&self) {
        self.registration.release();
        self.cancel.cancel();
    }

    pub fn is_scheduled(&self) -> bool {
        self.registration.is_active()
    }
}
