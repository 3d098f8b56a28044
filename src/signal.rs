use core::fmt;
use core::time::Duration;

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::error::{Error, Result};

/// A condition signal: a mutex-protected `(condition, flag)` pair plus a
/// condition variable.
///
/// `signal` stores a condition value and raises the flag; `wait` blocks until
/// the flag is raised, lowers it and hands back the stored condition. One
/// signal may be shared by any number of AIO handles and threads (clones refer
/// to the same state), which is what makes it a multiplexing point for the
/// wait adapters.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

#[derive(Default)]
struct State {
    condition: i32,
    flag: bool,
    /// Sticky marker set by flagging pipe notifiers; only `reset` clears it.
    flagged: bool,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                cv: Condvar::new(),
            }),
        }
    }

    /// Blocks until the signal is raised, then lowers it and returns the
    /// condition it was raised with.
    pub fn wait(&self) -> i32 {
        let mut state = self.lock();

        while !state.flag {
            state = self.inner.cv.wait(state).unwrap();
        }

        state.flag = false;

        state.condition
    }

    /// Like [`Signal::wait`] but gives up at `deadline`.
    ///
    /// A deadline already in the past behaves as a poll: a raised signal is
    /// still consumed, an unraised one fails immediately with
    /// [`Error::Timeout`] and the state is left untouched.
    pub fn wait_until(&self, deadline: Instant) -> Result<i32> {
        let mut state = self.lock();

        while !state.flag {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }

            state = self.inner.cv.wait_timeout(state, deadline - now).unwrap().0;
        }

        state.flag = false;

        Ok(state.condition)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<i32> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => Ok(self.wait()),
        }
    }

    /// Stores `condition`, raises the flag and wakes one waiter.
    pub fn signal(&self, condition: i32) {
        let mut state = self.lock();

        state.condition = condition;
        state.flag = true;

        self.inner.cv.notify_one();
    }

    /// Like [`Signal::signal`], and also marks the signal as flagged.
    pub(crate) fn signal_flagged(&self, condition: i32) {
        let mut state = self.lock();

        state.condition = condition;
        state.flag = true;
        state.flagged = true;

        self.inner.cv.notify_one();
    }

    /// Lowers the flag and clears the condition so a stale signal cannot
    /// satisfy a later wait. Also clears the flagged marker.
    pub fn reset(&self) {
        let mut state = self.lock();

        state.condition = 0;
        state.flag = false;
        state.flagged = false;
    }

    pub fn value(&self) -> i32 {
        self.lock().condition
    }

    pub fn is_raised(&self) -> bool {
        self.lock().flag
    }

    /// Whether a pipe notifier registered with [`NotifyFlag::Set`] or
    /// [`NotifyFlag::Raise`] has fired on this signal since the last reset.
    ///
    /// [`NotifyFlag::Set`]: crate::NotifyFlag::Set
    /// [`NotifyFlag::Raise`]: crate::NotifyFlag::Raise
    pub fn is_flagged(&self) -> bool {
        self.lock().flagged
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();

        f.debug_struct("Signal")
            .field("condition", &state.condition)
            .field("flag", &state.flag)
            .field("flagged", &state.flagged)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn wait_returns_signalled_condition() {
        let signal = Signal::new();

        let remote = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.signal(42);
        });

        assert_eq!(signal.wait(), 42);
        assert!(!signal.is_raised());

        handle.join().unwrap();
    }

    #[test]
    fn past_deadline_times_out_without_state_change() {
        let signal = Signal::new();

        let past = Instant::now() - Duration::from_millis(5);
        assert_eq!(signal.wait_until(past), Err(Error::Timeout));
        assert_eq!(signal.value(), 0);
        assert!(!signal.is_raised());
    }

    #[test]
    fn raised_signal_is_consumed_even_past_deadline() {
        let signal = Signal::new();
        signal.signal(3);

        let past = Instant::now() - Duration::from_millis(5);
        assert_eq!(signal.wait_until(past), Ok(3));
        assert!(!signal.is_raised());
    }

    #[test]
    fn reset_discards_stale_signal() {
        let signal = Signal::new();
        signal.signal(7);
        signal.reset();

        assert_eq!(
            signal.wait_timeout(Duration::from_millis(20)),
            Err(Error::Timeout)
        );
        assert_eq!(signal.value(), 0);
    }

    #[test]
    fn flagged_marker_survives_waits_until_reset() {
        let signal = Signal::new();

        signal.signal_flagged(2);

        assert_eq!(signal.wait(), 2);
        assert!(signal.is_flagged());

        signal.signal(1);
        assert_eq!(signal.wait(), 1);
        assert!(signal.is_flagged());

        signal.reset();
        assert!(!signal.is_flagged());
    }
}
