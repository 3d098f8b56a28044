use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use log::{error, trace};

use crate::dispatch::{self, Job};

/// Identifies a scheduled deadline so it can be cancelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey(Instant, u64);

/// A deadline queue served by a single background thread.
///
/// Expired jobs are not run on the timer thread itself; they are handed to the
/// completion dispatcher, so expiry obeys the same threading rules as any
/// other AIO completion.
pub(crate) struct Timers {
    entries: Mutex<BTreeMap<TimerKey, Job>>,
    cv: Condvar,
    seq: AtomicU64,
    started: AtomicBool,
}

impl Timers {
    const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            cv: Condvar::new(),
            seq: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn schedule(&'static self, when: Instant, job: Job) -> TimerKey {
        self.start();

        let key = TimerKey(when, self.seq.fetch_add(1, Ordering::Relaxed));

        let mut entries = self.entries.lock().unwrap();

        let earliest = entries.keys().next().map_or(true, |first| key < *first);

        entries.insert(key, job);

        if earliest {
            self.cv.notify_one();
        }

        key
    }

    /// Returns `false` if the deadline had already fired or was never known.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        self.entries.lock().unwrap().remove(&key).is_some()
    }

    fn start(&'static self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let spawned = std::thread::Builder::new()
            .name("nano-aio-timer".into())
            .spawn(move || self.run());

        if let Err(e) = spawned {
            error!("Timer thread failed to start: {e}");
            self.started.store(false, Ordering::SeqCst);
        }
    }

    fn run(&self) {
        let mut entries = self.entries.lock().unwrap();

        loop {
            let now = Instant::now();

            let Some(first) = entries.keys().next().copied() else {
                entries = self.cv.wait(entries).unwrap();
                continue;
            };

            if first.0 > now {
                entries = self.cv.wait_timeout(entries, first.0 - now).unwrap().0;
                continue;
            }

            if let Some(job) = entries.remove(&first) {
                drop(entries);

                trace!("Deadline {:?} expired", first.1);
                dispatch::submit(job);

                entries = self.entries.lock().unwrap();
            }
        }
    }
}

static TIMERS: Timers = Timers::new();

/// Runs `job` on the dispatcher once `when` has passed.
pub(crate) fn at<F>(when: Instant, job: F) -> TimerKey
where
    F: FnOnce() + Send + 'static,
{
    TIMERS.schedule(when, Box::new(job))
}

pub(crate) fn cancel(key: TimerKey) -> bool {
    TIMERS.cancel(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();

        let late = tx.clone();
        at(now + Duration::from_millis(60), move || late.send(2).unwrap());
        at(now + Duration::from_millis(20), move || tx.send(1).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(2));
    }

    #[test]
    fn cancelled_deadline_never_fires() {
        let (tx, rx) = mpsc::channel::<()>();

        let key = at(Instant::now() + Duration::from_millis(30), move || {
            tx.send(()).unwrap()
        });

        assert!(cancel(key));
        assert!(!cancel(key));
        assert!(rx.recv_timeout(Duration::from_millis(120)).is_err());
    }
}
