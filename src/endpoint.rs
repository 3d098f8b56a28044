use core::fmt;
use core::time::Duration;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, trace, warn};

use crate::dispatch;
use crate::error::{Code, Error, Result};
use crate::registry::{self, OpenFlag};
use crate::socket::SocketCore;
use crate::tls::TlsConfig;
use crate::transport::{self, Address, Conn, PipeDriver};

const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointState {
    NotStarted,
    Started,
    Closed,
}

/// Options for [`Socket::dial`](crate::Socket::dial).
#[derive(Debug)]
pub struct DialOptions {
    /// Start dialing right away.
    pub autostart: bool,
    /// When starting, connect synchronously and report the first failure
    /// instead of retrying in the background.
    pub block: bool,
    pub tls: Option<TlsConfig>,
    /// Delay between reconnection attempts.
    pub reconnect: Duration,
}

impl DialOptions {
    pub const fn new() -> Self {
        Self {
            autostart: true,
            block: false,
            tls: None,
            reconnect: Duration::from_millis(100),
        }
    }

    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn reconnect(mut self, reconnect: Duration) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl Default for DialOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for [`Socket::listen`](crate::Socket::listen).
#[derive(Debug)]
pub struct ListenOptions {
    pub autostart: bool,
    pub tls: Option<TlsConfig>,
}

impl ListenOptions {
    pub const fn new() -> Self {
        Self {
            autostart: true,
            tls: None,
        }
    }

    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self::new()
    }
}

fn state_of(open: &OpenFlag, started: &AtomicBool) -> EndpointState {
    if !open.is_open() {
        EndpointState::Closed
    } else if started.load(Ordering::Acquire) {
        EndpointState::Started
    } else {
        EndpointState::NotStarted
    }
}

enum Link {
    Pipe(PipeDriver),
    Inproc,
}

pub(crate) struct DialerCore {
    id: u32,
    url: String,
    address: Address,
    socket: Arc<SocketCore>,
    tls: Option<TlsConfig>,
    reconnect: Duration,
    open: OpenFlag,
    started: AtomicBool,
}

impl DialerCore {
    fn is_live(&self) -> bool {
        self.open.is_open() && self.socket.is_open()
    }

    fn connect(&self) -> Result<Link> {
        match &self.address {
            Address::Inproc(name) => {
                transport::connect_inproc(&self.socket, self.id, name)?;

                Ok(Link::Inproc)
            }
            address => {
                let conn = Conn::connect(address, self.tls.as_ref())?;

                Ok(Link::Pipe(transport::establish(&self.socket, self.id, conn)?))
            }
        }
    }

    /// Drives the current link, then keeps reconnecting until the dialer or
    /// its socket closes. Inproc links are not re-dialed once established.
    fn run(self: Arc<Self>, mut link: Option<Link>) {
        let mut attempt_now = link.is_none();

        loop {
            match link.take() {
                Some(Link::Pipe(driver)) => driver.run(),
                Some(Link::Inproc) => break,
                None => (),
            }

            if !self.is_live() {
                break;
            }

            if !attempt_now {
                thread::sleep(self.reconnect);

                if !self.is_live() {
                    break;
                }
            }

            attempt_now = false;

            match self.connect() {
                Ok(next) => link = Some(next),
                Err(e) => trace!("Dialer {} ({}): {e}", self.id, self.url),
            }
        }

        trace!("Dialer {} thread exiting", self.id);
    }

    fn close(&self) -> bool {
        if !self.open.close() {
            return false;
        }

        self.socket.detach_endpoint(self.id);

        debug!("Dialer {} closed", self.id);

        true
    }
}

struct DialerHandle {
    core: Arc<DialerCore>,
}

impl Drop for DialerHandle {
    fn drop(&mut self) {
        let core = self.core.clone();

        dispatch::defer(move || {
            core.close();
        });
    }
}

/// Connects its socket to a remote listener and reconnects when the
/// connection drops.
#[derive(Clone)]
pub struct Dialer {
    handle: Arc<DialerHandle>,
}

impl Dialer {
    pub(crate) fn create(socket: &Arc<SocketCore>, url: &str, options: DialOptions) -> Result<Self> {
        socket.ensure_open()?;

        let address = Address::parse(url)?;

        if options.tls.as_ref().is_some_and(|tls| !tls.is_client()) {
            Err(Code::INVALID)?;
        }

        Ok(Self {
            handle: Arc::new(DialerHandle {
                core: Arc::new(DialerCore {
                    id: registry::next_id(),
                    url: url.to_string(),
                    address,
                    socket: socket.clone(),
                    tls: options.tls,
                    reconnect: options.reconnect,
                    open: OpenFlag::new(),
                    started: AtomicBool::new(false),
                }),
            }),
        })
    }

    /// Starts dialing.
    ///
    /// With `block` the first connection attempt happens on the calling
    /// thread and its failure is returned; otherwise attempts run in the
    /// background until one succeeds. Starting twice is an `Incorrect state`.
    pub fn start(&self, block: bool) -> Result<()> {
        let core = self.core();

        if !core.is_live() {
            return Err(Error::Closed);
        }

        if core.started.swap(true, Ordering::AcqRel) {
            Err(Code::STATE)?;
        }

        let link = if block {
            match core.connect() {
                Ok(link) => Some(link),
                Err(e) => {
                    core.started.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        } else {
            None
        };

        debug!("Dialer {} started for {}", core.id, core.url);

        let runner = core.clone();
        let spawned = thread::Builder::new()
            .name(format!("nano-dialer-{}", core.id))
            .spawn(move || runner.run(link));

        if let Err(e) = spawned {
            core.started.store(false, Ordering::Release);
            return Err(e.into());
        }

        Ok(())
    }

    /// Closes the dialer and drops its connections. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.core().close();

        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.core().id
    }

    pub fn url(&self) -> &str {
        &self.core().url
    }

    pub fn socket_id(&self) -> u32 {
        self.core().socket.id()
    }

    pub fn state(&self) -> EndpointState {
        let core = self.core();

        state_of(&core.open, &core.started)
    }

    fn core(&self) -> &Arc<DialerCore> {
        &self.handle.core
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("id", &self.id())
            .field("url", &self.url())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct ListenerCore {
    id: u32,
    url: String,
    address: Address,
    socket: Arc<SocketCore>,
    tls: Option<TlsConfig>,
    bound: Mutex<Option<String>>,
    open: OpenFlag,
    started: AtomicBool,
}

impl ListenerCore {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn socket(&self) -> &Arc<SocketCore> {
        &self.socket
    }

    pub(crate) fn is_live(&self) -> bool {
        self.open.is_open() && self.socket.is_open()
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.is_live() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    trace!("Listener {}: accepted {peer}", self.id);

                    let this = self.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("nano-pipe-{}", self.id))
                        .spawn(move || this.serve(stream));

                    if let Err(e) = spawned {
                        warn!("Listener {}: cannot spawn pipe thread: {e}", self.id);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    warn!("Listener {}: accept failed: {e}", self.id);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }

        trace!("Listener {} accept loop exiting", self.id);
    }

    fn serve(&self, stream: std::net::TcpStream) {
        let established = Conn::accept(stream, self.tls.as_ref())
            .and_then(|conn| transport::establish(&self.socket, self.id, conn));

        match established {
            Ok(driver) => driver.run(),
            Err(e) => debug!("Listener {}: handshake failed: {e}", self.id),
        }
    }

    fn close(self: &Arc<Self>) -> bool {
        if !self.open.close() {
            return false;
        }

        if let Address::Inproc(name) = &self.address {
            transport::unbind_inproc(name, self);
        }

        self.socket.detach_endpoint(self.id);

        debug!("Listener {} closed", self.id);

        true
    }
}

struct ListenerHandle {
    core: Arc<ListenerCore>,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let core = self.core.clone();

        dispatch::defer(move || {
            core.close();
        });
    }
}

/// Accepts connections for its socket.
#[derive(Clone)]
pub struct Listener {
    handle: Arc<ListenerHandle>,
}

impl Listener {
    pub(crate) fn create(socket: &Arc<SocketCore>, url: &str, options: ListenOptions) -> Result<Self> {
        socket.ensure_open()?;

        let address = Address::parse(url)?;

        match &options.tls {
            Some(tls) if tls.is_client() => Err(Code::INVALID)?,
            None if address.is_tls() => Err(Code::INVALID)?,
            _ => (),
        }

        Ok(Self {
            handle: Arc::new(ListenerHandle {
                core: Arc::new(ListenerCore {
                    id: registry::next_id(),
                    url: url.to_string(),
                    address,
                    socket: socket.clone(),
                    tls: options.tls,
                    bound: Mutex::new(None),
                    open: OpenFlag::new(),
                    started: AtomicBool::new(false),
                }),
            }),
        })
    }

    /// Binds the address and starts accepting. Bind failures are reported
    /// here; starting twice is an `Incorrect state`.
    pub fn start(&self) -> Result<()> {
        let core = self.core();

        if !core.is_live() {
            return Err(Error::Closed);
        }

        if core.started.swap(true, Ordering::AcqRel) {
            Err(Code::STATE)?;
        }

        let bound = match &core.address {
            Address::Inproc(name) => transport::bind_inproc(name, core).map(|_| core.url.clone()),
            address => transport::bind_tcp(address).and_then(|(listener, local)| {
                let runner = core.clone();

                thread::Builder::new()
                    .name(format!("nano-listener-{}", core.id))
                    .spawn(move || runner.accept_loop(listener))?;

                Ok(address.with_port(local.port()))
            }),
        };

        match bound {
            Ok(url) => {
                debug!("Listener {} started on {url}", core.id);
                *core.bound.lock().unwrap() = Some(url);

                Ok(())
            }
            Err(e) => {
                core.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn close(&self) -> Result<()> {
        self.core().close();

        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.core().id
    }

    /// The URL as given, or once started, with the bound port filled in.
    pub fn url(&self) -> String {
        self.core()
            .bound
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.core().url.clone())
    }

    pub fn socket_id(&self) -> u32 {
        self.core().socket.id()
    }

    pub fn state(&self) -> EndpointState {
        let core = self.core();

        state_of(&core.open, &core.started)
    }

    fn core(&self) -> &Arc<ListenerCore> {
        &self.handle.core
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id())
            .field("url", &self.url())
            .field("state", &self.state())
            .finish()
    }
}
