//! Blocking adapters over AIO handles.
//!
//! Every operation here is bounded: with a timeout it returns no later than
//! (roughly) the deadline, and before returning on a timeout it stops the
//! operation and waits for the handle to become terminal, so no completion can
//! land after the caller has moved on.

use core::task::Poll;
use core::time::Duration;

use std::time::Instant;

use log::trace;

use crate::aio::{Aio, AioKind};
use crate::context::Context;
use crate::error::{Code, Error, Result};
use crate::signal::Signal;
use crate::socket::Block;
use crate::timer;

/// Something messages can be sent through and received from: a [`Socket`]
/// or a [`Context`].
///
/// [`Socket`]: crate::Socket
pub trait Messaging {
    /// Id recorded as the origin of AIO handles issued through this object.
    fn origin(&self) -> u32;

    /// Queues `data`; `aio` resolves once the transport has taken it.
    fn submit_send(&self, data: Vec<u8>, aio: &Aio<()>) -> Result<()>;

    /// Posts a receive; `aio` resolves with the next message.
    fn submit_recv(&self, aio: &Aio<Vec<u8>>) -> Result<()>;
}

/// Submits an asynchronous send.
///
/// `signal`, if given, is raised with the result code on completion.
/// `timeout` resolves the handle with `Timed out` if the transport has not
/// taken the message by then.
pub fn send_aio<C>(
    con: &C,
    data: &[u8],
    timeout: Option<Duration>,
    signal: Option<&Signal>,
) -> Result<Aio<()>>
where
    C: Messaging + ?Sized,
{
    let aio = Aio::new(AioKind::Send, Some(con.origin()));
    aio.set_signal(signal.cloned());

    con.submit_send(data.to_vec(), &aio)?;

    if let Some(deadline) = timeout.and_then(deadline_after) {
        aio.expire_at(deadline);
    }

    Ok(aio)
}

/// Submits an asynchronous receive.
pub fn recv_aio<C>(
    con: &C,
    timeout: Option<Duration>,
    signal: Option<&Signal>,
) -> Result<Aio<Vec<u8>>>
where
    C: Messaging + ?Sized,
{
    let aio = Aio::new(AioKind::Recv, Some(con.origin()));
    aio.set_signal(signal.cloned());

    con.submit_recv(&aio)?;

    if let Some(deadline) = timeout.and_then(deadline_after) {
        aio.expire_at(deadline);
    }

    Ok(aio)
}

/// Sends a request on `context` and receives the reply, as one AIO handle.
///
/// The send runs on an internal handle; once it completes, the receive is
/// submitted on the returned handle unless that was stopped meanwhile.
/// Stopping the returned handle also stops a send still in flight. `timeout`
/// covers both phases.
pub fn request(
    context: &Context,
    data: &[u8],
    timeout: Option<Duration>,
    signal: Option<&Signal>,
) -> Result<Aio<Vec<u8>>> {
    let core = context.core();
    core.ensure_open()?;

    let reply = Aio::new(AioKind::Request, Some(core.id()));
    reply.set_signal(signal.cloned());

    let send = Aio::<()>::new(AioKind::Send, Some(core.id()));

    {
        let send = send.clone();
        reply.set_abort(move || send.stop());
    }

    {
        let reply = reply.clone();
        let core = core.clone();

        send.on_complete(move |send| match send.take() {
            Poll::Ready(Ok(())) => {
                if reply.is_claimed() {
                    return;
                }

                if let Err(e) = core.submit_recv(&reply) {
                    if let Some(completer) = reply.claim() {
                        completer.complete(Err(e));
                    }
                }
            }
            Poll::Ready(Err(e)) => {
                if let Some(completer) = reply.claim() {
                    completer.complete(Err(e));
                }
            }
            Poll::Pending => (),
        });
    }

    if let Err(e) = core.submit_send(data.to_vec(), &send) {
        reply.stop();
        return Err(e);
    }

    if let Some(deadline) = timeout.and_then(deadline_after) {
        reply.expire_at(deadline);
    }

    Ok(reply)
}

/// Synchronous request: sends `data` on `context` and blocks on `signal`
/// for the reply.
///
/// On timeout the request is stopped and the call returns [`Error::Timeout`]
/// only once the handle is terminal. `signal` is raised with the result code
/// either way, so other threads multiplexing on it see the completion too.
pub fn cv_request(
    context: &Context,
    data: &[u8],
    signal: &Signal,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let aio = request(context, data, None, Some(signal))?;

    settle_on(&aio, signal, timeout.and_then(deadline_after))
}

/// Synchronous receive that blocks on `signal`.
pub fn cv_recv_aio<C>(con: &C, signal: &Signal, timeout: Option<Duration>) -> Result<Vec<u8>>
where
    C: Messaging + ?Sized,
{
    let aio = recv_aio(con, None, Some(signal))?;

    settle_on(&aio, signal, timeout.and_then(deadline_after))
}

pub fn cv_wait(signal: &Signal) -> i32 {
    signal.wait()
}

pub fn cv_until(signal: &Signal, deadline: Instant) -> Result<i32> {
    signal.wait_until(deadline)
}

pub fn cv_signal(signal: &Signal, condition: i32) {
    signal.signal(condition)
}

pub fn cv_reset(signal: &Signal) {
    signal.reset()
}

pub fn cv_value(signal: &Signal) -> i32 {
    signal.value()
}

/// Raises `signal` with `condition` from a dispatcher thread once `delay` has
/// passed. Returns immediately.
pub fn timed_signal(signal: &Signal, condition: i32, delay: Duration) {
    let Some(when) = deadline_after(delay) else {
        trace!("Timed signal {delay:?} away dropped");
        return;
    };

    let signal = signal.clone();

    timer::at(when, move || signal.signal(condition));
}

/// Waits on `signal` until `aio` is terminal or `deadline` passes; in the
/// latter case stops the operation and waits it out.
pub(crate) fn settle_on<T>(aio: &Aio<T>, signal: &Signal, deadline: Option<Instant>) -> Result<T>
where
    T: Send + 'static,
{
    while !aio.state().is_terminal() {
        let woken = match deadline {
            Some(deadline) => signal.wait_until(deadline).is_ok(),
            None => {
                signal.wait();
                true
            }
        };

        if !woken {
            aio.stop();
            aio.wait();

            return match outcome(aio) {
                Err(Error::Transport(Code::CANCELED)) => Err(Error::Timeout),
                other => other,
            };
        }
    }

    outcome(aio)
}

/// Blocks on `aio` as directed by `block`; `default` is the socket's
/// configured timeout.
pub(crate) fn settle<T>(aio: &Aio<T>, block: Block, default: Option<Duration>) -> Result<T>
where
    T: Send + 'static,
{
    match block {
        Block::NonBlocking => {
            if !aio.is_claimed() {
                aio.stop();
            }

            aio.wait();

            match outcome(aio) {
                Err(Error::Transport(Code::CANCELED)) => Err(Code::TRY_AGAIN.into()),
                other => other,
            }
        }
        Block::Default => aio.block(default.and_then(deadline_after)),
        Block::Forever => aio.block(None),
        Block::Timeout(timeout) => aio.block(deadline_after(timeout)),
    }
}

pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn outcome<T>(aio: &Aio<T>) -> Result<T>
where
    T: Send + 'static,
{
    match aio.take() {
        Poll::Ready(outcome) => outcome,
        Poll::Pending => Err(Error::Transport(Code::STATE)),
    }
}
