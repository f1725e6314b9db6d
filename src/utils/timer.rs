//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::utils::VigilError;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Boxed timer expiry callback type.
pub type TimerCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Timer utility for signalling after a given timeout. Supports being
/// restarted with a different duration and being extended while armed, for
/// implementing renew retries and lease refreshes.
///
/// All methods take `&self`, so timers can live inside shared maps. Firing is
/// driven by a dedicated tokio task; an optional callback is invoked on every
/// fire. Must be used within the context of a tokio runtime.
pub struct Timer {
    /// Sender side of the deadline watch channel; `None` means disarmed.
    deadline_tx: watch::Sender<Option<Instant>>,

    /// True if the timer has fired since the last kickoff/cancel.
    exploded: Arc<AtomicBool>,

    /// Signalled once per fire, for the `timeout()` await style.
    fired: Arc<Notify>,

    /// Join handle of the timer task.
    timer_handle: JoinHandle<()>,
}

impl Timer {
    /// Creates a new timer utility, initially disarmed. If `callback` is
    /// given, it is invoked (on the timer task) every time the timer fires.
    pub fn new(callback: Option<TimerCallback>) -> Self {
        let (deadline_tx, deadline_rx) = watch::channel(None);
        let exploded = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(Notify::new());

        let timer_handle = tokio::spawn(Self::timer_task(
            deadline_rx,
            exploded.clone(),
            fired.clone(),
            callback,
        ));

        Timer {
            deadline_tx,
            exploded,
            fired,
            timer_handle,
        }
    }

    /// Arms the timer to fire after the given duration, overwriting any
    /// currently armed deadline.
    pub fn kickoff(&self, dur: Duration) -> Result<(), VigilError> {
        if dur.is_zero() {
            return Err(VigilError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.exploded.store(false, Ordering::Release);
        self.deadline_tx.send(Some(Instant::now() + dur))?;
        Ok(())
    }

    /// Pushes the armed deadline further out by the given duration. If the
    /// timer is currently disarmed, behaves like `kickoff`.
    pub fn extend(&self, dur: Duration) -> Result<(), VigilError> {
        if dur.is_zero() {
            return Err(VigilError::msg(format!(
                "invalid extend duration {} ns",
                dur.as_nanos()
            )));
        }

        let base = match *self.deadline_tx.borrow() {
            Some(deadline) => deadline.max(Instant::now()),
            None => Instant::now(),
        };
        self.exploded.store(false, Ordering::Release);
        self.deadline_tx.send(Some(base + dur))?;
        Ok(())
    }

    /// Disarms the timer. A fire already in flight may still be observed by
    /// its receiver; callers validate against their own state snapshot.
    pub fn cancel(&self) -> Result<(), VigilError> {
        self.exploded.store(false, Ordering::Release);
        self.deadline_tx.send(None)?;
        Ok(())
    }

    /// True if the timer has fired since it was last armed.
    pub fn exploded(&self) -> bool {
        self.exploded.load(Ordering::Acquire)
    }

    /// True if a deadline is currently armed.
    pub fn armed(&self) -> bool {
        self.deadline_tx.borrow().is_some()
    }

    /// Waits for the timer to fire. Typically used as a branch of a
    /// `tokio::select!`.
    pub async fn timeout(&self) {
        self.fired.notified().await;
    }

    /// Timer task: tracks the latest armed deadline and fires on reaching it.
    async fn timer_task(
        mut deadline_rx: watch::Receiver<Option<Instant>>,
        exploded: Arc<AtomicBool>,
        fired: Arc<Notify>,
        callback: Option<TimerCallback>,
    ) {
        let mut deadline: Option<Instant> = None;
        loop {
            match deadline {
                Some(d) => {
                    tokio::select! {
                        changed = deadline_rx.changed() => {
                            if changed.is_err() {
                                break; // sender dropped
                            }
                            deadline = *deadline_rx.borrow();
                        },
                        _ = time::sleep_until(d) => {
                            exploded.store(true, Ordering::Release);
                            if let Some(cb) = callback.as_ref() {
                                cb();
                            }
                            fired.notify_one();
                            deadline = None;
                        },
                    }
                }
                None => {
                    if deadline_rx.changed().await.is_err() {
                        break;
                    }
                    deadline = *deadline_rx.borrow();
                }
            }
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.timer_handle.abort();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("armed", &self.armed())
            .field("exploded", &self.exploded())
            .finish()
    }
}
