use core::fmt;

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use enumset::{EnumSet, EnumSetType};
use log::{error, trace, warn};

use crate::dispatch;
use crate::signal::Signal;
use crate::socket::{Socket, SocketCore};
use crate::sys;

/// Maximum number of pipe notifiers a single socket accepts.
pub const MAX_NOTIFIERS: usize = 8;

/// Pipe lifecycle events a socket can report.
#[derive(EnumSetType, Debug)]
pub enum PipeEvent {
    Add = 0,
    Remove = 1,
}

impl PipeEvent {
    /// The condition value a [`Signal`] notifier is raised with.
    pub const fn code(self) -> i32 {
        match self {
            Self::Add => 1,
            Self::Remove => 2,
        }
    }
}

/// A connection between two sockets, as seen by notifier callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pipe {
    id: u32,
    socket: u32,
}

impl Pipe {
    pub(crate) const fn new(id: u32, socket: u32) -> Self {
        Self { id, socket }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn socket_id(&self) -> u32 {
        self.socket
    }

    /// The owning socket, if any host handle to it is still alive.
    pub fn socket(&self) -> Option<Socket> {
        Socket::find(self.socket)
    }
}

/// Extra marking a [`PipeNotify::Signals`] notifier applies to its primary
/// signal.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum NotifyFlag {
    #[default]
    None,
    /// Marks the signal as flagged (see [`Signal::is_flagged`]).
    Set,
    /// Marks the signal as flagged, then raises this OS signal in the
    /// process (e.g. `libc::SIGINT`).
    Raise(i32),
}

/// What to do when a pipe event fires.
///
/// Callbacks receive the pipe rather than the socket so a closure never has
/// to capture its own socket; use [`Pipe::socket`] to get back to it.
///
/// Notifications of one socket are delivered one at a time, in the order the
/// pipes came and went.
#[derive(Clone)]
pub enum PipeNotify {
    Signal(Signal),
    /// Raises `signal` and, if given, `also` with the event code.
    Signals {
        signal: Signal,
        also: Option<Signal>,
        flag: NotifyFlag,
    },
    Callback(Arc<dyn Fn(PipeEvent, Pipe) + Send + Sync>),
}

impl PipeNotify {
    fn deliver(&self, event: PipeEvent, pipe: Pipe) {
        match self {
            Self::Signal(signal) => signal.signal(event.code()),
            Self::Signals { signal, also, flag } => {
                if *flag == NotifyFlag::None {
                    signal.signal(event.code());
                } else {
                    signal.signal_flagged(event.code());
                }

                if let Some(also) = also {
                    also.signal(event.code());
                }

                if let NotifyFlag::Raise(number) = flag {
                    if let Err(e) = sys::raise(*number) {
                        warn!("Pipe {} {event:?}: raising signal {number} failed: {e}", pipe.id);
                    }
                }
            }
            Self::Callback(callback) => callback(event, pipe),
        }
    }
}

impl fmt::Debug for PipeNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(signal) => f.debug_tuple("Signal").field(signal).finish(),
            Self::Signals { signal, also, flag } => f
                .debug_struct("Signals")
                .field("signal", signal)
                .field("also", also)
                .field("flag", flag)
                .finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

struct Registration {
    events: EnumSet<PipeEvent>,
    target: PipeNotify,
}

pub(crate) struct Notifiers {
    vec: heapless::Vec<Registration, MAX_NOTIFIERS>,
}

impl Notifiers {
    pub(crate) const fn new() -> Self {
        Self {
            vec: heapless::Vec::new(),
        }
    }

    pub(crate) fn register(
        &mut self,
        events: EnumSet<PipeEvent>,
        target: PipeNotify,
    ) -> io::Result<()> {
        if events.is_empty() {
            Err(ErrorKind::InvalidInput)?;
        }

        self.vec
            .push(Registration { events, target })
            .map_err(|_| ErrorKind::OutOfMemory)?;

        Ok(())
    }

    /// Snapshot of the targets interested in `event`.
    pub(crate) fn targets(&self, event: PipeEvent) -> Vec<PipeNotify> {
        self.vec
            .iter()
            .filter(|reg| reg.events.contains(event))
            .map(|reg| reg.target.clone())
            .collect()
    }
}

struct Notice {
    targets: Vec<PipeNotify>,
    event: PipeEvent,
    pipe: Pipe,
}

#[derive(Default)]
struct NoticeQueue {
    pending: VecDeque<Notice>,
    draining: bool,
}

/// The pipe events of one socket awaiting delivery.
///
/// At most one dispatcher job drains the queue at a time, so notifiers see
/// events in the order they were posted.
pub(crate) struct Notices {
    queue: Mutex<NoticeQueue>,
}

impl Notices {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(NoticeQueue::default()),
        })
    }

    /// Queues `event` for `targets`. Callers post while holding the lock
    /// that orders their pipe changes.
    pub(crate) fn post(self: &Arc<Self>, targets: Vec<PipeNotify>, event: PipeEvent, pipe: Pipe) {
        if targets.is_empty() {
            return;
        }

        trace!("Pipe {} {event:?} on socket {}", pipe.id, pipe.socket);

        let mut queue = self.queue.lock().unwrap();

        queue.pending.push_back(Notice {
            targets,
            event,
            pipe,
        });

        if !queue.draining {
            queue.draining = true;

            let notices = self.clone();
            dispatch::submit(move || notices.drain());
        }
    }

    fn drain(&self) {
        loop {
            let notice = {
                let mut queue = self.queue.lock().unwrap();

                let Some(notice) = queue.pending.pop_front() else {
                    queue.draining = false;
                    return;
                };

                notice
            };

            for target in &notice.targets {
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                    target.deliver(notice.event, notice.pipe)
                }));

                if delivered.is_err() {
                    error!("Pipe notifier panicked on {:?}", notice.event);
                }
            }
        }
    }
}

/// Where a socket pushes outbound message bodies for one pipe.
#[derive(Clone)]
pub(crate) enum PipeSink {
    /// Drained by the pipe's I/O thread, which frames and writes them.
    Conn(async_channel::Sender<Vec<u8>>),
    /// Delivered straight into the peer socket of an in-process pipe.
    Inproc { peer: Weak<SocketCore>, pipe: u32 },
}

impl PipeSink {
    /// Returns `false` if the pipe is already gone.
    pub(crate) fn push(&self, body: Vec<u8>) -> bool {
        match self {
            Self::Conn(sender) => sender.try_send(body).is_ok(),
            Self::Inproc { peer, pipe } => match peer.upgrade() {
                Some(peer) if peer.is_open() => {
                    peer.deliver(*pipe, body);
                    true
                }
                _ => false,
            },
        }
    }

    /// Tears down the far side of the pipe.
    pub(crate) fn release(&self) {
        match self {
            Self::Conn(sender) => {
                sender.close();
            }
            Self::Inproc { peer, pipe } => {
                if let Some(peer) = peer.upgrade() {
                    peer.detach(*pipe);
                }
            }
        }
    }
}

pub(crate) struct PipeEntry {
    pub(crate) id: u32,
    pub(crate) endpoint: u32,
    pub(crate) sink: PipeSink,
}
