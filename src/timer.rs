//! Single-shot timers feeding the manager queue.
//!
//! The retry timer and the AP-shutdown timer are both one-shot and carry no
//! payload; firing just enqueues another message. Re-arming must follow the
//! stop-then-start discipline, which [`OneShot::arm`] enforces by cancelling
//! any previous arming first, so a timer is never double-armed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A cancellable one-shot timer.
pub struct OneShot {
    name: &'static str,
    cancelled: Option<Arc<AtomicBool>>,
}

impl OneShot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cancelled: None,
        }
    }

    /// Arm the timer: after `delay`, invoke `f` once, unless cancelled or
    /// re-armed in the meantime. Any previous arming is cancelled first.
    pub fn arm<F>(&mut self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();

        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancelled = Some(cancelled.clone());

        let name = self.name;
        let builder = thread::Builder::new().name(format!("timer-{}", name));
        let spawned = builder.spawn(move || {
            thread::sleep(delay);
            if !cancelled.load(Ordering::Acquire) {
                log::debug!("timer '{}' fired", name);
                f();
            }
        });
        if let Err(e) = spawned {
            log::error!("failed to spawn timer '{}': {}", name, e);
        }
    }

    /// Cancel a pending arming. A timer that already fired is unaffected.
    pub fn cancel(&mut self) {
        if let Some(cancelled) = self.cancelled.take() {
            cancelled.store(true, Ordering::Release);
        }
    }

    /// True while an arming is pending (armed and neither fired nor
    /// cancelled). Best-effort: the flag flips only on cancel, so a fired
    /// timer still reads as armed until the next `cancel`/`arm`.
    pub fn is_armed(&self) -> bool {
        self.cancelled
            .as_ref()
            .map(|c| !c.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.cancel();
    }
}
