use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{error, trace};

use crate::dispatch;
use crate::error::{Code, Error, Result};
use crate::registry;
use crate::signal::Signal;
use crate::timer::{self, TimerKey};

/// Lifecycle of an AIO handle. `Unresolved` moves to exactly one of the
/// terminal states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AioState {
    Unresolved,
    Completed,
    Errored,
}

impl AioState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AioKind {
    Send,
    Recv,
    Request,
    Http,
}

type Callback<T> = Box<dyn FnOnce(&Aio<T>) + Send>;
type Abort = Box<dyn FnOnce() + Send>;

/// A handle to one asynchronous operation.
///
/// Submission returns immediately; the transport later resolves the handle
/// from a dispatcher thread. Resolution first claims the handle, so of the
/// transport, a deadline and [`Aio::stop`] exactly one gets to decide the
/// outcome and the others become no-ops.
///
/// On resolution, in order: the outcome is stored, the handle's private
/// signal is raised, the user [`Signal`] (if any) is raised with the result
/// code, a pending waker is woken and the completion callback runs.
///
/// `Aio` is also a [`Future`] yielding the outcome.
pub struct Aio<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    id: u32,
    kind: AioKind,
    origin: Option<u32>,
    claimed: AtomicBool,
    done: Signal,
    slot: Mutex<Slot<T>>,
}

struct Slot<T> {
    state: AioState,
    code: Option<Code>,
    outcome: Option<Result<T>>,
    waker: Option<Waker>,
    signal: Option<Signal>,
    callback: Option<Callback<T>>,
    abort: Option<Abort>,
    timer: Option<TimerKey>,
}

impl<T> Clone for Aio<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Aio<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(kind: AioKind, origin: Option<u32>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: registry::next_id(),
                kind,
                origin,
                claimed: AtomicBool::new(false),
                done: Signal::new(),
                slot: Mutex::new(Slot {
                    state: AioState::Unresolved,
                    code: None,
                    outcome: None,
                    waker: None,
                    signal: None,
                    callback: None,
                    abort: None,
                    timer: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn kind(&self) -> AioKind {
        self.inner.kind
    }

    /// Id of the socket, context, stream or session that issued the
    /// operation. Resolve it with the owner's `find` to get a live handle;
    /// the AIO never keeps its owner alive.
    pub fn origin(&self) -> Option<u32> {
        self.inner.origin
    }

    pub fn state(&self) -> AioState {
        self.lock().state
    }

    /// The result code once resolved: `0` on success.
    pub fn code(&self) -> Option<i32> {
        let slot = self.lock();

        match slot.state {
            AioState::Unresolved => None,
            _ => Some(slot.code.map_or(0, Code::raw)),
        }
    }

    /// Attaches a condition signal raised with the result code on resolution.
    ///
    /// Attaching to an already resolved handle raises the signal right away.
    pub fn set_signal(&self, signal: Option<Signal>) {
        let mut slot = self.lock();

        if let (true, Some(signal)) = (slot.state.is_terminal(), signal.as_ref()) {
            signal.signal(slot.code.map_or(0, Code::raw));
        }

        slot.signal = signal;
    }

    /// Registers a callback run on a dispatcher thread after resolution.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Aio<T>) + Send + 'static,
    {
        let mut slot = self.lock();

        if slot.state.is_terminal() {
            drop(slot);

            let this = self.clone();
            dispatch::submit(move || callback(&this));
        } else {
            slot.callback = Some(Box::new(callback));
        }
    }

    /// Non-blocking peek at the outcome.
    ///
    /// Once the payload has been moved out with [`Aio::take`] this reports
    /// `Incorrect state`.
    pub fn result(&self) -> Poll<Result<T>>
    where
        T: Clone,
    {
        let slot = self.lock();

        match (&slot.state, &slot.outcome) {
            (AioState::Unresolved, _) => Poll::Pending,
            (_, Some(outcome)) => Poll::Ready(outcome.clone()),
            (_, None) => Poll::Ready(Err(Error::Transport(Code::STATE))),
        }
    }

    /// Moves the outcome out of a resolved handle.
    pub fn take(&self) -> Poll<Result<T>> {
        let mut slot = self.lock();

        match slot.state {
            AioState::Unresolved => Poll::Pending,
            _ => Poll::Ready(
                slot.outcome
                    .take()
                    .unwrap_or(Err(Error::Transport(Code::STATE))),
            ),
        }
    }

    /// Blocks until the handle is resolved.
    pub fn wait(&self) -> AioState {
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }

            self.inner.done.wait();
        }
    }

    /// Blocks until the handle is resolved or `deadline` passes, whichever
    /// comes first. Does not cancel anything.
    pub fn wait_until(&self, deadline: Instant) -> AioState {
        loop {
            let state = self.state();
            if state.is_terminal() || self.inner.done.wait_until(deadline).is_err() {
                return self.state();
            }
        }
    }

    /// Cancels the operation.
    ///
    /// Wins only if nobody has claimed the handle yet, in which case it
    /// resolves with `Operation canceled`. Always runs the abort hook so a
    /// sub-operation in flight is torn down too. Safe to call at any time,
    /// any number of times.
    pub fn stop(&self) {
        let abort = self.lock().abort.take();

        if let Some(abort) = abort {
            abort();
        }

        if let Some(completer) = self.claim() {
            trace!("Aio {} stopped", self.inner.id);
            completer.complete(Err(Error::Transport(Code::CANCELED)));
        }
    }

    /// Blocks for the outcome; if `deadline` passes first the operation is
    /// stopped and the call returns once the handle is terminal.
    pub(crate) fn block(&self, deadline: Option<Instant>) -> Result<T> {
        crate::wait::settle_on(self, &self.inner.done, deadline)
    }

    /// Takes exclusive ownership of the right to resolve this handle.
    pub(crate) fn claim(&self) -> Option<Completer<T>> {
        if self.inner.claimed.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Completer { aio: self.clone() })
        }
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.inner.claimed.load(Ordering::Acquire)
    }

    /// Installs the hook [`Aio::stop`] (or expiry) runs to tear down work the
    /// transport has already started on behalf of this handle.
    pub(crate) fn set_abort<F>(&self, abort: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock().abort = Some(Box::new(abort));
    }

    /// Resolves the handle with `Timed out` at `deadline` unless something
    /// else claims it first.
    pub(crate) fn expire_at(&self, deadline: Instant) {
        let weak = Arc::downgrade(&self.inner);

        let key = timer::at(deadline, move || {
            if let Some(inner) = weak.upgrade() {
                Aio { inner }.expire();
            }
        });

        self.lock().timer = Some(key);
    }

    /// Makes a resolved, consumed handle reusable for a new submission.
    pub(crate) fn rearm(&self) -> Result<()> {
        let mut slot = self.lock();

        if !slot.state.is_terminal() || slot.outcome.is_some() {
            Err(Code::STATE)?;
        }

        slot.state = AioState::Unresolved;
        slot.code = None;

        self.inner.done.reset();
        self.inner.claimed.store(false, Ordering::Release);

        Ok(())
    }

    fn expire(&self) {
        let abort = self.lock().abort.take();

        if let Some(abort) = abort {
            abort();
        }

        if let Some(completer) = self.claim() {
            trace!("Aio {} expired", self.inner.id);
            completer.complete(Err(Error::Timeout));
        }
    }

    fn resolve(&self, outcome: Result<T>) {
        let code = outcome.as_ref().err().map(Error::code);

        let (waker, signal, callback, timer) = {
            let mut slot = self.lock();

            if slot.state.is_terminal() {
                // Claiming makes this unreachable; continuing would hand two
                // outcomes to one waiter.
                error!("Aio {} resolved twice", self.inner.id);
                std::process::abort();
            }

            slot.state = if code.is_some() {
                AioState::Errored
            } else {
                AioState::Completed
            };
            slot.code = code;
            slot.outcome = Some(outcome);
            slot.abort = None;

            (
                slot.waker.take(),
                slot.signal.clone(),
                slot.callback.take(),
                slot.timer.take(),
            )
        };

        if let Some(key) = timer {
            timer::cancel(key);
        }

        let raw = code.map_or(0, Code::raw);

        self.inner.done.signal(raw);

        if let Some(signal) = signal {
            signal.signal(raw);
        }

        if let Some(waker) = waker {
            waker.wake();
        }

        if let Some(callback) = callback {
            callback(self);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.inner.slot.lock().unwrap()
    }
}

impl<T> Future for Aio<T>
where
    T: Send + 'static,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.lock();

        if slot.state.is_terminal() {
            return Poll::Ready(
                slot.outcome
                    .take()
                    .unwrap_or(Err(Error::Transport(Code::STATE))),
            );
        }

        if let Some(prev_waker) = slot.waker.replace(cx.waker().clone()) {
            if !prev_waker.will_wake(cx.waker()) {
                prev_waker.wake();
            }
        }

        Poll::Pending
    }
}

impl<T> fmt::Debug for Aio<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aio")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("claimed", &self.inner.claimed.load(Ordering::Relaxed))
            .finish()
    }
}

/// The exclusive right to resolve an [`Aio`], obtained through claiming.
pub(crate) struct Completer<T> {
    aio: Aio<T>,
}

impl<T> Completer<T>
where
    T: Send + 'static,
{
    /// Hands the outcome to a dispatcher thread, never resolving inline.
    pub(crate) fn complete(self, outcome: Result<T>) {
        let aio = self.aio;

        dispatch::submit(move || aio.resolve(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::time::Duration;

    fn aio() -> Aio<Vec<u8>> {
        Aio::new(AioKind::Recv, None)
    }

    #[test]
    fn resolves_exactly_once() {
        let aio = aio();

        let first = aio.claim().unwrap();
        assert!(aio.claim().is_none());

        first.complete(Ok(b"payload".to_vec()));
        assert_eq!(aio.wait(), AioState::Completed);

        // A late stop is a no-op.
        aio.stop();
        assert_eq!(aio.result(), Poll::Ready(Ok(b"payload".to_vec())));
        assert_eq!(aio.code(), Some(0));
    }

    #[test]
    fn stop_cancels_unclaimed_handle() {
        let aio = aio();
        let signal = Signal::new();
        aio.set_signal(Some(signal.clone()));

        aio.stop();

        assert_eq!(aio.wait(), AioState::Errored);
        assert_eq!(signal.wait(), Code::CANCELED.raw());
        assert_eq!(
            aio.take(),
            Poll::Ready(Err(Error::Transport(Code::CANCELED)))
        );
    }

    #[test]
    fn stop_runs_abort_hook() {
        let aio = aio();
        let (tx, rx) = mpsc::channel();
        aio.set_abort(move || tx.send(()).unwrap());

        aio.stop();
        aio.stop();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn expiry_resolves_with_timeout() {
        let aio = aio();
        aio.expire_at(Instant::now() + Duration::from_millis(20));

        assert_eq!(aio.wait(), AioState::Errored);
        assert_eq!(aio.take(), Poll::Ready(Err(Error::Timeout)));
    }

    #[test]
    fn wait_until_leaves_handle_pending() {
        let aio = aio();

        let state = aio.wait_until(Instant::now() + Duration::from_millis(20));
        assert_eq!(state, AioState::Unresolved);
        assert!(!aio.is_claimed());
        assert_eq!(aio.result(), Poll::Pending);
    }

    #[test]
    fn callback_runs_after_outcome_is_visible() {
        let aio = aio();
        let (tx, rx) = mpsc::channel();

        aio.on_complete(move |aio| tx.send(aio.result()).unwrap());
        aio.claim().unwrap().complete(Err(Error::Closed));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Poll::Ready(Err(Error::Closed))
        );
    }

    #[test]
    fn rearm_requires_consumed_payload() {
        let aio = aio();
        assert!(aio.rearm().is_err());

        aio.claim().unwrap().complete(Ok(vec![1]));
        aio.wait();
        assert!(aio.rearm().is_err());

        assert_eq!(aio.take(), Poll::Ready(Ok(vec![1])));
        aio.rearm().unwrap();
        assert_eq!(aio.state(), AioState::Unresolved);
        assert!(aio.claim().is_some());
    }

    #[test]
    fn awaitable() {
        let aio = aio();

        let remote = aio.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.claim().unwrap().complete(Ok(vec![9]));
        });

        let outcome = futures_lite::future::block_on(aio);
        assert_eq!(outcome, Ok(vec![9]));
    }
}
