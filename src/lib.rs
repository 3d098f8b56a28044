//! Synchronous, timeout-bounded observation of callback-driven messaging I/O.
//!
//! This crate provides scalability-protocol [`Socket`]s (pair, bus, push/pull,
//! pub/sub, req/rep) over `inproc://`, `tcp://` and `tls+tcp://`, raw byte
//! [`Stream`]s and an HTTP client ([`ncurl`], [`Session`]). Every I/O
//! operation is asynchronous and is represented by an [`Aio`] handle, which a
//! caller without an event loop can wait on, bound with a timeout or stop.
//!
//! # Implementation
//!
//! The first time an operation completes, a small pool of threads called
//! "nano-aio" is spawned (see [`DispatcherConfig`]). Completions and the
//! finalization of dropped handles always run there, never on the thread
//! that submitted the operation. Connections are driven by threads of their
//! own.
//!
//! Dropping the last clone of a [`Socket`], [`Context`], [`Dialer`],
//! [`Listener`], [`Stream`] or [`Session`] closes it in the background;
//! `close()` does the same right away and is idempotent.
//!
//! # Examples
//!
//! A request/reply round trip in-process.
//!
//! ```
//! use std::time::Duration;
//!
//! use nano_aio::{Block, Context, ListenOptions, DialOptions, Protocol, Signal, Socket};
//!
//! # fn main() -> nano_aio::Result<()> {
//! let rep = Socket::open(Protocol::Rep)?;
//! rep.listen("inproc://doc-example", ListenOptions::new())?;
//!
//! let req = Socket::open(Protocol::Req)?;
//! req.dial("inproc://doc-example", DialOptions::new().block(true))?;
//!
//! let ctx = Context::open(&req)?;
//! let signal = Signal::new();
//! let reply = ctx.request(b"ping", Some(Duration::from_secs(5)), Some(&signal))?;
//!
//! assert_eq!(rep.recv(Block::Forever)?, b"ping");
//! rep.send(b"pong", Block::Forever)?;
//!
//! nano_aio::cv_wait(&signal);
//! assert_eq!(reply.take(), std::task::Poll::Ready(Ok(b"pong".to_vec())));
//! # Ok(())
//! # }
//! ```

pub use aio::{Aio, AioKind, AioState};
pub use context::Context;
pub use dispatch::{configure, DispatcherConfig};
pub use endpoint::{DialOptions, Dialer, EndpointState, ListenOptions, Listener};
pub use enumset::EnumSet;
pub use error::{strerror, Code, Error, Result};
pub use http::{HttpRequest, Response, DEFAULT_MAX_BODY};
pub use ncurl::{ncurl, ncurl_aio, HttpState, Session};
pub use pipe::{NotifyFlag, Pipe, PipeEvent, PipeNotify, MAX_NOTIFIERS};
pub use protocol::Protocol;
pub use signal::Signal;
pub use socket::{Block, ResourceState, Socket};
pub use stream::Stream;
pub use tls::TlsConfig;
pub use wait::{
    cv_recv_aio, cv_request, cv_reset, cv_signal, cv_until, cv_value, cv_wait, recv_aio, request,
    send_aio, timed_signal, Messaging,
};

mod aio;
mod context;
mod dispatch;
mod endpoint;
mod error;
mod http;
mod ncurl;
mod pipe;
mod protocol;
mod registry;
mod signal;
mod socket;
mod stream;
mod sys;
mod timer;
mod tls;
mod transport;
mod wait;
