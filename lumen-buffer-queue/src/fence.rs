//! Synchronization fences for cross-process buffer handoff.
//!
//! A [`Fence`] is an opaque token signaling when a buffer becomes safe to
//! read or write. Fences travel with buffer handoffs; the receiving side
//! must wait on the fence before touching buffer memory. The
//! already-signaled sentinel ([`Fence::signaled`]) stands in for "no fence
//! needed" so callers never branch on an absent fence.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

/// Errors from waiting on a fence.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FenceError {
    /// The signaling side was dropped without ever signaling. Waiting any
    /// longer would block forever.
    #[error("fence was abandoned before signaling")]
    Abandoned,

    /// The wait deadline elapsed before the fence signaled.
    #[error("fence wait timed out")]
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Pending,
    Signaled,
    Abandoned,
}

#[derive(Debug)]
struct FenceState {
    state: Mutex<SignalState>,
    cond: Condvar,
}

/// A waitable synchronization token.
///
/// Cloning a fence yields another handle to the same underlying signal.
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Option<Arc<FenceState>>,
}

/// The signaling half of a pending fence.
///
/// Exactly one signaler exists per pending fence. Dropping it without
/// calling [`FenceSignaler::signal`] marks the fence abandoned, which turns
/// every pending and future wait into [`FenceError::Abandoned`] instead of
/// a hang.
#[derive(Debug)]
pub struct FenceSignaler {
    inner: Arc<FenceState>,
    signaled: bool,
}

impl Fence {
    /// Creates a pending fence and its signaling half.
    pub fn new() -> (Fence, FenceSignaler) {
        let state = Arc::new(FenceState {
            state: Mutex::new(SignalState::Pending),
            cond: Condvar::new(),
        });
        (
            Fence { inner: Some(state.clone()) },
            FenceSignaler { inner: state, signaled: false },
        )
    }

    /// The "no fence" sentinel: an already-signaled fence.
    pub fn signaled() -> Fence {
        Fence { inner: None }
    }

    /// Whether a wait on this fence could block.
    pub fn is_pending(&self) -> bool {
        match &self.inner {
            None => false,
            Some(state) => {
                let guard = state.state.lock().unwrap_or_else(|e| e.into_inner());
                *guard == SignalState::Pending
            }
        }
    }

    /// Blocks until the fence signals or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        let state = match &self.inner {
            None => return Ok(()),
            Some(state) => state,
        };
        let mut guard = state.state.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match *guard {
                SignalState::Signaled => return Ok(()),
                SignalState::Abandoned => return Err(FenceError::Abandoned),
                SignalState::Pending => {}
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(FenceError::TimedOut);
            }
            let (next, result) = state
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
            if result.timed_out() && *guard == SignalState::Pending {
                return Err(FenceError::TimedOut);
            }
        }
    }

    /// Blocks until the fence signals.
    ///
    /// Used only on the synchronous direct-pixel path, where fences are
    /// display-bounded and expected to be short.
    pub fn wait_forever(&self) -> Result<(), FenceError> {
        let state = match &self.inner {
            None => return Ok(()),
            Some(state) => state,
        };
        let mut guard = state.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match *guard {
                SignalState::Signaled => return Ok(()),
                SignalState::Abandoned => return Err(FenceError::Abandoned),
                SignalState::Pending => {
                    guard = state.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }
}

impl FenceSignaler {
    /// Signals the fence, waking all waiters.
    pub fn signal(mut self) {
        self.set_state(SignalState::Signaled);
        self.signaled = true;
    }

    fn set_state(&self, new: SignalState) {
        let mut guard = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == SignalState::Pending {
            *guard = new;
            self.inner.cond.notify_all();
        }
    }
}

impl Drop for FenceSignaler {
    fn drop(&mut self) {
        if !self.signaled {
            self.set_state(SignalState::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signaled_sentinel_never_blocks() {
        let fence = Fence::signaled();
        assert!(!fence.is_pending());
        assert!(fence.wait(Duration::from_millis(1)).is_ok());
        assert!(fence.wait_forever().is_ok());
    }

    #[test]
    fn wait_returns_after_signal_from_other_thread() {
        let (fence, signaler) = Fence::new();
        assert!(fence.is_pending());

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.signal();
        });

        assert!(fence.wait_forever().is_ok());
        assert!(!fence.is_pending());
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_on_pending_fence() {
        let (fence, _signaler) = Fence::new();
        assert_eq!(
            fence.wait(Duration::from_millis(5)),
            Err(FenceError::TimedOut)
        );
    }

    #[test]
    fn dropped_signaler_abandons_fence() {
        let (fence, signaler) = Fence::new();
        drop(signaler);
        assert_eq!(fence.wait_forever(), Err(FenceError::Abandoned));
        assert_eq!(
            fence.wait(Duration::from_secs(1)),
            Err(FenceError::Abandoned)
        );
    }

    #[test]
    fn clones_share_the_signal() {
        let (fence, signaler) = Fence::new();
        let clone = fence.clone();
        signaler.signal();
        assert!(fence.wait_forever().is_ok());
        assert!(clone.wait_forever().is_ok());
    }
}
