use core::fmt;
use core::time::Duration;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use enumset::EnumSet;
use log::{debug, trace, warn};

use crate::aio::{Aio, Completer};
use crate::dispatch;
use crate::endpoint::{DialOptions, Dialer, ListenOptions, Listener};
use crate::error::{Code, Error, Result};
use crate::pipe::{Notices, Notifiers, Pipe, PipeEntry, PipeEvent, PipeNotify, PipeSink};
use crate::signal::Signal;
use crate::protocol::{self, Protocol, REQUEST_ID_BIT};
use crate::registry::{self, OpenFlag, Registry};
use crate::wait::{self, Messaging};

/// Context id under which socket-level operations run on req/rep sockets.
pub(crate) const SOCKET_CONTEXT: u32 = 0;

static SOCKETS: Registry<u32, SocketHandle> = Registry::new();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Open,
    Closed,
}

/// How long a synchronous send or receive may block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Block {
    /// Fail with `Try again` unless the operation can finish right away.
    NonBlocking,
    /// Use the socket's send or receive timeout (forever when unset).
    #[default]
    Default,
    Forever,
    Timeout(Duration),
}

struct Inbound {
    pipe: u32,
    request: Option<u32>,
    body: Vec<u8>,
}

struct Reader {
    ctx: u32,
    aio: Aio<Vec<u8>>,
}

struct PendingSend {
    frame: Vec<u8>,
    aio: Aio<()>,
}

#[derive(Default)]
struct ContextSlot {
    /// Request id a req context is waiting on.
    outstanding: Option<u32>,
    /// Reply that arrived before a receive was posted.
    reply: Option<Vec<u8>>,
    /// Pipe and request id a rep context owes a reply to.
    reply_to: Option<(u32, u32)>,
}

struct SocketState {
    pipes: Vec<PipeEntry>,
    cursor: usize,
    backlog: VecDeque<PendingSend>,
    inbox: VecDeque<Inbound>,
    readers: VecDeque<Reader>,
    contexts: BTreeMap<u32, ContextSlot>,
    subscriptions: Vec<Vec<u8>>,
    notifiers: Notifiers,
    lock: Option<PipeLock>,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    next_request: u32,
}

/// Refusal of new pipes set by [`Socket::lock`].
enum PipeLock {
    Always,
    /// Only while the signal holds an odd condition.
    WhileOdd(Signal),
}

impl PipeLock {
    fn refuses(&self) -> bool {
        match self {
            Self::Always => true,
            Self::WhileOdd(signal) => signal.value() % 2 != 0,
        }
    }
}

impl SocketState {
    fn new(protocol: Protocol) -> Self {
        let mut contexts = BTreeMap::new();
        if protocol.has_contexts() {
            contexts.insert(SOCKET_CONTEXT, ContextSlot::default());
        }

        Self {
            pipes: Vec::new(),
            cursor: 0,
            backlog: VecDeque::new(),
            inbox: VecDeque::new(),
            readers: VecDeque::new(),
            contexts,
            subscriptions: Vec::new(),
            notifiers: Notifiers::new(),
            lock: None,
            send_timeout: None,
            recv_timeout: None,
            next_request: registry::next_id(),
        }
    }

    fn request_id(&mut self) -> u32 {
        self.next_request = self.next_request.wrapping_add(1);

        self.next_request | REQUEST_ID_BIT
    }

    fn next_sink(&mut self) -> Option<PipeSink> {
        if self.pipes.is_empty() {
            return None;
        }

        self.cursor = (self.cursor + 1) % self.pipes.len();

        Some(self.pipes[self.cursor].sink.clone())
    }

    fn sink(&self, pipe: u32) -> Option<PipeSink> {
        self.pipes
            .iter()
            .find(|entry| entry.id == pipe)
            .map(|entry| entry.sink.clone())
    }

    /// Claims the oldest live reader, of `ctx` if given. Readers whose AIO
    /// was already claimed elsewhere (stopped, expired) are discarded on the
    /// way.
    fn take_reader(&mut self, ctx: Option<u32>) -> Option<(u32, Completer<Vec<u8>>)> {
        let mut index = 0;

        while index < self.readers.len() {
            if ctx.is_some_and(|ctx| self.readers[index].ctx != ctx) {
                index += 1;
                continue;
            }

            let reader = self.readers.remove(index)?;
            if let Some(completer) = reader.aio.claim() {
                return Some((reader.ctx, completer));
            }
        }

        None
    }

    fn prune_readers(&mut self) {
        self.readers.retain(|reader| !reader.aio.is_claimed());
    }

    fn subscribed(&self, body: &[u8]) -> bool {
        self.subscriptions
            .iter()
            .any(|topic| body.starts_with(topic))
    }
}

/// The native socket: protocol state machine plus its pipes.
///
/// Threads (pipe I/O, endpoints, contexts) hold this directly. Host code
/// holds it only through [`Socket`], whose last drop schedules [`close`].
///
/// [`close`]: SocketCore::close
pub(crate) struct SocketCore {
    id: u32,
    protocol: Protocol,
    open: OpenFlag,
    state: Mutex<SocketState>,
    notices: Arc<Notices>,
}

impl SocketCore {
    fn new(protocol: Protocol) -> Arc<Self> {
        Arc::new(Self {
            id: registry::next_id(),
            protocol,
            open: OpenFlag::new(),
            state: Mutex::new(SocketState::new(protocol)),
            notices: Notices::new(),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.is_open()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    pub(crate) fn send_timeout(&self) -> Option<Duration> {
        self.lock().send_timeout
    }

    pub(crate) fn recv_timeout(&self) -> Option<Duration> {
        self.lock().recv_timeout
    }

    /// Queues `body` on the context `ctx`. The AIO resolves once the body is
    /// handed to a pipe, or stays pending in the backlog until one attaches.
    pub(crate) fn submit_send(&self, ctx: u32, body: Vec<u8>, aio: &Aio<()>) -> Result<()> {
        self.ensure_open()?;

        if !self.protocol.can_send() {
            Err(Code::NOT_SUPPORTED)?;
        }

        let (deliveries, strict) = {
            let mut state = self.lock();

            match self.protocol {
                Protocol::Pub | Protocol::Bus => {
                    let deliveries = state
                        .pipes
                        .iter()
                        .map(|entry| (entry.sink.clone(), body.clone()))
                        .collect::<Vec<_>>();

                    (deliveries, false)
                }
                Protocol::Rep => {
                    let slot = state.contexts.get_mut(&ctx).ok_or(Error::Closed)?;

                    let Some((pipe, id)) = slot.reply_to.take() else {
                        return Err(Code::STATE.into());
                    };

                    match state.sink(pipe) {
                        Some(sink) => (vec![(sink, protocol::encode_request(id, &body))], false),
                        None => {
                            trace!("Socket {}: reply for vanished pipe {pipe} dropped", self.id);
                            (Vec::new(), false)
                        }
                    }
                }
                _ => {
                    let frame = if self.protocol == Protocol::Req {
                        let id = state.request_id();

                        let slot = state.contexts.get_mut(&ctx).ok_or(Error::Closed)?;
                        slot.outstanding = Some(id);
                        slot.reply = None;

                        protocol::encode_request(id, &body)
                    } else {
                        body
                    };

                    match state.next_sink() {
                        Some(sink) => (vec![(sink, frame)], true),
                        None => {
                            trace!("Socket {}: no pipe yet, send queued", self.id);
                            state.backlog.push_back(PendingSend {
                                frame,
                                aio: aio.clone(),
                            });

                            return Ok(());
                        }
                    }
                }
            }
        };

        let Some(completer) = aio.claim() else {
            return Ok(());
        };

        let mut delivered = true;
        for (sink, frame) in deliveries {
            delivered &= sink.push(frame);
        }

        completer.complete(if delivered || !strict {
            Ok(())
        } else {
            Err(Error::Transport(Code::CONN_SHUTDOWN))
        });

        Ok(())
    }

    /// Posts a receive on context `ctx`; completes at once if a message is
    /// already queued.
    pub(crate) fn submit_recv(&self, ctx: u32, aio: &Aio<Vec<u8>>) -> Result<()> {
        self.ensure_open()?;

        if !self.protocol.can_recv() {
            Err(Code::NOT_SUPPORTED)?;
        }

        let handoff = {
            let mut state = self.lock();

            state.prune_readers();

            match self.protocol {
                Protocol::Req => {
                    let slot = state.contexts.get_mut(&ctx).ok_or(Error::Closed)?;

                    match slot.reply.take() {
                        Some(reply) => match aio.claim() {
                            Some(completer) => Some((completer, reply)),
                            None => {
                                slot.reply = Some(reply);
                                None
                            }
                        },
                        None if slot.outstanding.is_none() => {
                            return Err(Code::STATE.into());
                        }
                        None => {
                            state.readers.push_back(Reader {
                                ctx,
                                aio: aio.clone(),
                            });
                            None
                        }
                    }
                }
                _ => {
                    if self.protocol == Protocol::Rep && !state.contexts.contains_key(&ctx) {
                        return Err(Error::Closed);
                    }

                    match state.inbox.pop_front() {
                        Some(message) => match aio.claim() {
                            Some(completer) => {
                                if let Some(slot) = state.contexts.get_mut(&ctx) {
                                    slot.reply_to = message.request.map(|id| (message.pipe, id));
                                }

                                Some((completer, message.body))
                            }
                            None => {
                                state.inbox.push_front(message);
                                None
                            }
                        },
                        None => {
                            state.readers.push_back(Reader {
                                ctx,
                                aio: aio.clone(),
                            });
                            None
                        }
                    }
                }
            }
        };

        if let Some((completer, body)) = handoff {
            completer.complete(Ok(body));
        }

        Ok(())
    }

    /// Routes a message body that arrived on `pipe`.
    pub(crate) fn deliver(&self, pipe: u32, body: Vec<u8>) {
        if !self.is_open() {
            return;
        }

        let handoff = {
            let mut state = self.lock();

            match self.protocol {
                Protocol::Push | Protocol::Pub => {
                    trace!("Socket {}: {} cannot receive, dropped", self.id, self.protocol);
                    None
                }
                Protocol::Req => {
                    let Some((id, reply)) = protocol::decode_request(&body) else {
                        trace!("Socket {}: malformed reply dropped", self.id);
                        return;
                    };

                    let Some(ctx) = state
                        .contexts
                        .iter()
                        .find(|(_, slot)| slot.outstanding == Some(id))
                        .map(|(ctx, _)| *ctx)
                    else {
                        trace!("Socket {}: stale reply {id:#x} dropped", self.id);
                        return;
                    };

                    let reply = reply.to_vec();

                    match state.take_reader(Some(ctx)) {
                        Some((_, completer)) => {
                            if let Some(slot) = state.contexts.get_mut(&ctx) {
                                slot.outstanding = None;
                            }

                            Some((completer, reply))
                        }
                        None => {
                            if let Some(slot) = state.contexts.get_mut(&ctx) {
                                slot.outstanding = None;
                                slot.reply = Some(reply);
                            }

                            None
                        }
                    }
                }
                Protocol::Rep => {
                    let Some((id, request)) = protocol::decode_request(&body) else {
                        trace!("Socket {}: malformed request dropped", self.id);
                        return;
                    };

                    let request = request.to_vec();

                    match state.take_reader(None) {
                        Some((ctx, completer)) => {
                            if let Some(slot) = state.contexts.get_mut(&ctx) {
                                slot.reply_to = Some((pipe, id));
                            }

                            Some((completer, request))
                        }
                        None => {
                            state.inbox.push_back(Inbound {
                                pipe,
                                request: Some(id),
                                body: request,
                            });

                            None
                        }
                    }
                }
                _ => {
                    if self.protocol == Protocol::Sub && !state.subscribed(&body) {
                        return;
                    }

                    match state.take_reader(None) {
                        Some((_, completer)) => Some((completer, body)),
                        None => {
                            state.inbox.push_back(Inbound {
                                pipe,
                                request: None,
                                body,
                            });

                            None
                        }
                    }
                }
            }
        };

        if let Some((completer, body)) = handoff {
            completer.complete(Ok(body));
        }
    }

    /// Adds a pipe that already passed the protocol handshake. Queued sends
    /// are flushed into it.
    pub(crate) fn attach(&self, pipe: u32, endpoint: u32, sink: PipeSink) -> Result<()> {
        self.ensure_open()?;

        let drained = {
            let mut state = self.lock();

            if state.lock.as_ref().is_some_and(PipeLock::refuses) {
                debug!("Socket {}: locked, pipe {pipe} refused", self.id);
                Err(Code::CONN_REFUSED)?;
            }

            if self.protocol == Protocol::Pair && !state.pipes.is_empty() {
                debug!("Socket {}: pair already connected, pipe {pipe} rejected", self.id);
                Err(Code::BUSY)?;
            }

            state.pipes.push(PipeEntry {
                id: pipe,
                endpoint,
                sink: sink.clone(),
            });

            let mut drained = Vec::new();
            while let Some(pending) = state.backlog.pop_front() {
                if let Some(completer) = pending.aio.claim() {
                    drained.push((pending.frame, completer));
                }
            }

            self.notices.post(
                state.notifiers.targets(PipeEvent::Add),
                PipeEvent::Add,
                Pipe::new(pipe, self.id),
            );

            drained
        };

        debug!("Socket {}: pipe {pipe} attached", self.id);

        for (frame, completer) in drained {
            completer.complete(if sink.push(frame) {
                Ok(())
            } else {
                Err(Error::Transport(Code::CONN_SHUTDOWN))
            });
        }

        Ok(())
    }

    /// Removes a pipe. Returns `false` if it was not attached.
    pub(crate) fn detach(&self, pipe: u32) -> bool {
        let entry = {
            let mut state = self.lock();

            let Some(index) = state.pipes.iter().position(|entry| entry.id == pipe) else {
                return false;
            };

            self.notices.post(
                state.notifiers.targets(PipeEvent::Remove),
                PipeEvent::Remove,
                Pipe::new(pipe, self.id),
            );

            state.pipes.remove(index)
        };

        debug!("Socket {}: pipe {pipe} detached", self.id);

        entry.sink.release();

        true
    }

    /// Removes every pipe created by `endpoint`.
    pub(crate) fn detach_endpoint(&self, endpoint: u32) {
        let pipes = self
            .lock()
            .pipes
            .iter()
            .filter(|entry| entry.endpoint == endpoint)
            .map(|entry| entry.id)
            .collect::<Vec<_>>();

        for pipe in pipes {
            self.detach(pipe);
        }
    }

    pub(crate) fn pipe_count(&self) -> usize {
        self.lock().pipes.len()
    }

    pub(crate) fn open_context(&self) -> Result<u32> {
        self.ensure_open()?;

        if !self.protocol.has_contexts() {
            Err(Code::NOT_SUPPORTED)?;
        }

        let ctx = registry::next_id();

        self.lock().contexts.insert(ctx, ContextSlot::default());

        Ok(ctx)
    }

    /// Drops the context's protocol state and fails its pending receives.
    pub(crate) fn close_context(&self, ctx: u32) {
        let orphans = {
            let mut state = self.lock();

            state.contexts.remove(&ctx);

            let mut orphans = Vec::new();
            state.readers.retain(|reader| {
                if reader.ctx == ctx {
                    orphans.push(reader.aio.clone());
                    false
                } else {
                    true
                }
            });

            orphans
        };

        for aio in orphans {
            if let Some(completer) = aio.claim() {
                completer.complete(Err(Error::Closed));
            }
        }
    }

    pub(crate) fn set_subscription(&self, topic: &[u8], subscribe: bool) -> Result<()> {
        self.ensure_open()?;

        if self.protocol != Protocol::Sub {
            Err(Code::NOT_SUPPORTED)?;
        }

        let mut state = self.lock();

        let existing = state
            .subscriptions
            .iter()
            .position(|current| current.as_slice() == topic);

        match (subscribe, existing) {
            (true, None) => state.subscriptions.push(topic.to_vec()),
            (false, Some(index)) => {
                state.subscriptions.remove(index);
            }
            (false, None) => Err(Code::NOT_FOUND)?,
            (true, Some(_)) => (),
        }

        Ok(())
    }

    /// Tears the socket down. Only the first caller does the work; it fails
    /// every pending operation with `Object closed` and drops all pipes.
    pub(crate) fn close(&self) -> bool {
        if !self.open.close() {
            return false;
        }

        let (pipes, readers, backlog) = {
            let mut state = self.lock();

            state.contexts.clear();
            state.inbox.clear();

            let targets = state.notifiers.targets(PipeEvent::Remove);
            for entry in &state.pipes {
                self.notices.post(targets.clone(), PipeEvent::Remove, Pipe::new(entry.id, self.id));
            }

            (
                core::mem::take(&mut state.pipes),
                core::mem::take(&mut state.readers),
                core::mem::take(&mut state.backlog),
            )
        };

        for reader in readers {
            if let Some(completer) = reader.aio.claim() {
                completer.complete(Err(Error::Closed));
            }
        }

        for pending in backlog {
            if let Some(completer) = pending.aio.claim() {
                completer.complete(Err(Error::Closed));
            }
        }

        for entry in pipes {
            entry.sink.release();
        }

        debug!("Socket {} closed", self.id);

        true
    }

    fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap()
    }
}

enum Endpoint {
    Dialer(Dialer),
    Listener(Listener),
}

/// Host-side owner of a socket. Its drop is the finalizer.
pub(crate) struct SocketHandle {
    core: Arc<SocketCore>,
    endpoints: Mutex<Vec<Endpoint>>,
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        let core = self.core.clone();

        dispatch::defer(move || {
            if core.close() {
                trace!("Socket {} finalized", core.id());
            }
        });
    }
}

/// A messaging socket speaking one [`Protocol`].
///
/// Clones share the socket. When the last clone is dropped the socket is
/// closed on a dispatcher thread, along with the dialers and listeners it
/// created.
#[derive(Clone)]
pub struct Socket {
    handle: Arc<SocketHandle>,
}

impl Socket {
    pub fn open(protocol: Protocol) -> Result<Self> {
        let handle = Arc::new(SocketHandle {
            core: SocketCore::new(protocol),
            endpoints: Mutex::new(Vec::new()),
        });

        SOCKETS.insert(handle.core.id(), &handle);

        debug!("Socket {} opened ({protocol})", handle.core.id());

        Ok(Self { handle })
    }

    /// Looks up a socket by id. Fails once every host handle is gone.
    pub fn find(id: u32) -> Option<Self> {
        SOCKETS.get(&id).map(|handle| Self { handle })
    }

    pub fn id(&self) -> u32 {
        self.core().id()
    }

    pub fn protocol(&self) -> Protocol {
        self.core().protocol()
    }

    pub fn state(&self) -> ResourceState {
        if self.core().is_open() {
            ResourceState::Open
        } else {
            ResourceState::Closed
        }
    }

    /// Creates a dialer for `url` and, unless told otherwise, starts it.
    ///
    /// The socket keeps the dialer alive; the returned handle is for
    /// inspecting or closing it early.
    pub fn dial(&self, url: &str, options: DialOptions) -> Result<Dialer> {
        let autostart = options.autostart;
        let block = options.block;

        let dialer = Dialer::create(self.core(), url, options)?;

        if autostart {
            dialer.start(block)?;
        }

        self.lock_endpoints().push(Endpoint::Dialer(dialer.clone()));

        Ok(dialer)
    }

    /// Creates a listener for `url` and, unless told otherwise, starts it.
    pub fn listen(&self, url: &str, options: ListenOptions) -> Result<Listener> {
        let autostart = options.autostart;

        let listener = Listener::create(self.core(), url, options)?;

        if autostart {
            listener.start()?;
        }

        self.lock_endpoints().push(Endpoint::Listener(listener.clone()));

        Ok(listener)
    }

    pub fn dialers(&self) -> Vec<Dialer> {
        self.lock_endpoints()
            .iter()
            .filter_map(|endpoint| match endpoint {
                Endpoint::Dialer(dialer) => Some(dialer.clone()),
                Endpoint::Listener(_) => None,
            })
            .collect()
    }

    pub fn listeners(&self) -> Vec<Listener> {
        self.lock_endpoints()
            .iter()
            .filter_map(|endpoint| match endpoint {
                Endpoint::Listener(listener) => Some(listener.clone()),
                Endpoint::Dialer(_) => None,
            })
            .collect()
    }

    pub fn send(&self, data: &[u8], block: Block) -> Result<()> {
        let aio = wait::send_aio(self, data, None, None)?;

        wait::settle(&aio, block, self.core().send_timeout())
    }

    pub fn recv(&self, block: Block) -> Result<Vec<u8>> {
        let aio = wait::recv_aio(self, None, None)?;

        wait::settle(&aio, block, self.core().recv_timeout())
    }

    pub fn send_aio(&self, data: &[u8], timeout: Option<Duration>) -> Result<Aio<()>> {
        wait::send_aio(self, data, timeout, None)
    }

    pub fn recv_aio(&self, timeout: Option<Duration>) -> Result<Aio<Vec<u8>>> {
        wait::recv_aio(self, timeout, None)
    }

    /// Subscribes a sub socket to messages starting with `topic`. An empty
    /// topic matches everything.
    pub fn subscribe(&self, topic: &[u8]) -> Result<()> {
        self.core().set_subscription(topic, true)
    }

    pub fn unsubscribe(&self, topic: &[u8]) -> Result<()> {
        self.core().set_subscription(topic, false)
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core().ensure_open()?;
        self.core().lock().send_timeout = timeout;

        Ok(())
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core().ensure_open()?;
        self.core().lock().recv_timeout = timeout;

        Ok(())
    }

    pub fn send_timeout(&self) -> Result<Option<Duration>> {
        self.core().ensure_open()?;

        Ok(self.core().lock().send_timeout)
    }

    pub fn recv_timeout(&self) -> Result<Option<Duration>> {
        self.core().ensure_open()?;

        Ok(self.core().lock().recv_timeout)
    }

    /// Refuses new pipes; existing ones are kept.
    ///
    /// With `signal`, pipes are refused only while it holds an odd condition.
    /// A signal also registered through [`Socket::pipe_notify`] for both
    /// events is odd (`1`) after an add and even (`2`) after a remove, so
    /// the socket admits one peer at a time and a replacement once it leaves.
    pub fn lock(&self, signal: Option<Signal>) -> Result<()> {
        self.core().ensure_open()?;

        self.core().lock().lock = Some(match signal {
            Some(signal) => PipeLock::WhileOdd(signal),
            None => PipeLock::Always,
        });

        debug!("Socket {} locked", self.id());

        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        self.core().ensure_open()?;
        self.core().lock().lock = None;

        debug!("Socket {} unlocked", self.id());

        Ok(())
    }

    /// Registers a notifier for pipe `events`.
    ///
    /// At most [`MAX_NOTIFIERS`](crate::MAX_NOTIFIERS) may be registered per
    /// socket; the next one fails with `Out of memory`.
    pub fn pipe_notify(&self, events: EnumSet<PipeEvent>, target: PipeNotify) -> Result<()> {
        self.core().ensure_open()?;
        self.core().lock().notifiers.register(events, target)?;

        Ok(())
    }

    /// Number of live pipes.
    pub fn pipes(&self) -> usize {
        self.core().pipe_count()
    }

    /// Closes the socket and its endpoints. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.core().close() {
            let endpoints = core::mem::take(&mut *self.lock_endpoints());

            for endpoint in endpoints {
                let closed = match &endpoint {
                    Endpoint::Dialer(dialer) => dialer.close(),
                    Endpoint::Listener(listener) => listener.close(),
                };

                if let Err(e) = closed {
                    warn!("Socket {}: endpoint close failed: {e}", self.id());
                }
            }
        }

        Ok(())
    }

    pub(crate) fn core(&self) -> &Arc<SocketCore> {
        &self.handle.core
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, Vec<Endpoint>> {
        self.handle.endpoints.lock().unwrap()
    }
}

impl Messaging for Socket {
    fn origin(&self) -> u32 {
        self.id()
    }

    fn submit_send(&self, data: Vec<u8>, aio: &Aio<()>) -> Result<()> {
        self.core().submit_send(SOCKET_CONTEXT, data, aio)
    }

    fn submit_recv(&self, aio: &Aio<Vec<u8>>) -> Result<()> {
        self.core().submit_recv(SOCKET_CONTEXT, aio)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .finish()
    }
}
