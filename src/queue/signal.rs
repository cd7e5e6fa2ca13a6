use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, Thread};
use std::time::Duration;

/// One-waiter park/wake handshake.
///
/// The waiting side announces itself through `parked` before re-checking
/// its condition; the signalling side publishes its state change before
/// checking `parked`. Both sides fence with `SeqCst` in between, so at
/// least one of them observes the other and a wake-up cannot be lost.
/// Parking is bounded by a timeout regardless.
///
/// The waiter registers itself on every park, so the waiting role may move
/// between threads as long as two threads never wait at once.
#[derive(Debug, Default)]
pub struct WakeSignal {
    parked: AtomicBool,
    waiting: AtomicBool,
    waiter: Mutex<Option<Thread>>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the calling thread until `ready` holds, a signal arrives or
    /// `timeout` elapses. Returns the final value of `ready`.
    ///
    /// Panics if another thread is waiting on this signal at the same time.
    pub fn park_until_signalled(&self, ready: impl Fn() -> bool, timeout: Duration) -> bool {
        assert!(
            !self.waiting.swap(true, Ordering::Acquire),
            "WakeSignal supports one waiting thread at a time"
        );
        *self.waiter.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current());

        self.parked.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let ready_now = ready();
        if !ready_now {
            thread::park_timeout(timeout);
        }
        self.parked.store(false, Ordering::Relaxed);
        self.waiting.store(false, Ordering::Release);
        ready_now || ready()
    }

    /// Wake the waiter if it announced itself as parked. Never blocks on
    /// the waiter. Callers must have published the state `ready` looks at
    /// first.
    pub fn signal_if_parked(&self) -> bool {
        fence(Ordering::SeqCst);
        if !self.parked.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.unpark_waiter();
        true
    }

    /// Unconditionally wake the waiter, parked or not.
    pub fn signal(&self) {
        fence(Ordering::SeqCst);
        self.parked.store(false, Ordering::Relaxed);
        self.unpark_waiter();
    }

    fn unpark_waiter(&self) {
        let waiter = self.waiter.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(thread) = waiter.as_ref() {
            thread.unpark();
        }
    }
}
