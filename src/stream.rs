use core::fmt;
use core::time::Duration;

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;

use async_channel::{Receiver, Sender};
use log::{debug, trace};

use crate::aio::{Aio, AioKind};
use crate::dispatch;
use crate::error::{Code, Error, Result};
use crate::registry::{self, OpenFlag};
use crate::socket::{Block, ResourceState};
use crate::tls::TlsConfig;
use crate::transport::{self, Address, Conn};
use crate::wait;

/// How often a blocked receive checks whether it was stopped.
const RECV_POLL: Duration = Duration::from_millis(10);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

enum Op {
    Send(Vec<u8>, Aio<()>),
    Recv(usize, Aio<Vec<u8>>),
}

struct StreamCore {
    id: u32,
    url: String,
    open: OpenFlag,
    ops: Sender<Op>,
    tcp: TcpStream,
}

impl StreamCore {
    fn ensure_open(&self) -> Result<()> {
        if self.open.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    fn submit(&self, op: Op) -> Result<()> {
        self.ensure_open()?;

        self.ops.try_send(op).map_err(|_| Error::Closed)
    }

    fn close(&self) -> bool {
        if !self.open.close() {
            return false;
        }

        self.ops.close();
        let _ = self.tcp.shutdown(Shutdown::Both);

        debug!("Stream {} closed", self.id);

        true
    }
}

struct StreamHandle {
    core: Arc<StreamCore>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let core = self.core.clone();

        dispatch::defer(move || {
            core.close();
        });
    }
}

/// A raw byte stream over `tcp://` or `tls+tcp://`, without message framing.
///
/// All I/O runs on a thread owned by the stream, one operation at a time in
/// submission order.
#[derive(Clone)]
pub struct Stream {
    handle: Arc<StreamHandle>,
}

impl Stream {
    /// Connects to `url`. `tls+tcp://` dials without a configuration trust
    /// the web PKI roots.
    pub fn dial(url: &str, tls: Option<TlsConfig>) -> Result<Self> {
        let address = stream_address(url)?;

        if tls.as_ref().is_some_and(|tls| !tls.is_client()) {
            Err(Code::INVALID)?;
        }

        let conn = Conn::connect(&address, tls.as_ref())?;

        Self::spawn(url.to_string(), conn)
    }

    /// Binds `url` and blocks until exactly one peer has connected.
    pub fn listen(url: &str, tls: Option<TlsConfig>) -> Result<Self> {
        let address = stream_address(url)?;

        match &tls {
            Some(tls) if tls.is_client() => Err(Code::INVALID)?,
            None if address.is_tls() => Err(Code::INVALID)?,
            _ => (),
        }

        let (listener, local) = transport::bind_tcp(&address)?;

        debug!("Stream listening on {local}");

        let stream = loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    trace!("Stream accepted {peer}");
                    break stream;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => return Err(e.into()),
            }
        };

        let conn = Conn::accept(stream, tls.as_ref())?;

        Self::spawn(address.with_port(local.port()), conn)
    }

    fn spawn(url: String, conn: Conn) -> Result<Self> {
        let (ops, queue) = async_channel::unbounded();

        let core = Arc::new(StreamCore {
            id: registry::next_id(),
            url,
            open: OpenFlag::new(),
            ops,
            tcp: conn.tcp().try_clone()?,
        });

        let id = core.id;

        thread::Builder::new()
            .name(format!("nano-stream-{id}"))
            .spawn(move || serve(id, conn, queue))?;

        debug!("Stream {id} opened to {}", core.url);

        Ok(Self {
            handle: Arc::new(StreamHandle { core }),
        })
    }

    pub fn id(&self) -> u32 {
        self.core().id
    }

    pub fn url(&self) -> &str {
        &self.core().url
    }

    pub fn state(&self) -> ResourceState {
        if self.core().open.is_open() {
            ResourceState::Open
        } else {
            ResourceState::Closed
        }
    }

    /// Writes all of `data`.
    pub fn send(&self, data: &[u8], block: Block) -> Result<()> {
        let aio = self.send_aio(data, None)?;

        wait::settle(&aio, block, None)
    }

    /// Reads at most `n` bytes, as soon as any are available.
    pub fn recv(&self, n: usize, block: Block) -> Result<Vec<u8>> {
        let aio = self.recv_aio(n, None)?;

        wait::settle(&aio, block, None)
    }

    pub fn send_aio(&self, data: &[u8], timeout: Option<Duration>) -> Result<Aio<()>> {
        let aio = Aio::new(AioKind::Send, Some(self.id()));

        self.core().submit(Op::Send(data.to_vec(), aio.clone()))?;

        if let Some(deadline) = timeout.and_then(wait::deadline_after) {
            aio.expire_at(deadline);
        }

        Ok(aio)
    }

    pub fn recv_aio(&self, n: usize, timeout: Option<Duration>) -> Result<Aio<Vec<u8>>> {
        if n == 0 {
            Err(Code::INVALID)?;
        }

        let aio = Aio::new(AioKind::Recv, Some(self.id()));

        self.core().submit(Op::Recv(n, aio.clone()))?;

        if let Some(deadline) = timeout.and_then(wait::deadline_after) {
            aio.expire_at(deadline);
        }

        Ok(aio)
    }

    /// Closes the stream; operations still queued or in flight fail with
    /// `Closed`. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.core().close();

        Ok(())
    }

    fn core(&self) -> &Arc<StreamCore> {
        &self.handle.core
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("url", &self.url())
            .field("state", &self.state())
            .finish()
    }
}

fn stream_address(url: &str) -> Result<Address> {
    match Address::parse(url)? {
        Address::Inproc(_) => Err(Code::NOT_SUPPORTED.into()),
        address => Ok(address),
    }
}

fn serve(id: u32, mut conn: Conn, queue: Receiver<Op>) {
    let mut failed: Option<Error> = None;

    while let Ok(op) = queue.recv_blocking() {
        // After an I/O failure or close every remaining op fails the same way.
        if queue.is_closed() || failed.is_some() {
            let error = failed.clone().unwrap_or(Error::Closed);

            match op {
                Op::Send(_, aio) => fail(&aio, error),
                Op::Recv(_, aio) => fail(&aio, error),
            }

            continue;
        }

        match op {
            Op::Send(data, aio) => {
                if aio.is_claimed() {
                    continue;
                }

                let outcome = conn.write_all(&data).and_then(|_| conn.flush());

                if let Some(completer) = aio.claim() {
                    completer.complete(outcome.map_err(|e| closed_or(&queue, e)));
                }
            }
            Op::Recv(n, aio) => match read_some(&mut conn, n, &aio, &queue) {
                Ok(Some(data)) => {
                    if let Some(completer) = aio.claim() {
                        completer.complete(Ok(data));
                    }
                }
                Ok(None) => (),
                Err(e) => {
                    let error = closed_or(&queue, e);

                    if !matches!(error, Error::Closed) {
                        failed = Some(error.clone());
                    }

                    fail(&aio, error);
                }
            },
        }
    }

    conn.shutdown();

    trace!("Stream {id} I/O thread exiting");
}

/// Reads up to `n` bytes. `Ok(None)` means the handle was stopped while
/// waiting.
fn read_some(
    conn: &mut Conn,
    n: usize,
    aio: &Aio<Vec<u8>>,
    queue: &Receiver<Op>,
) -> io::Result<Option<Vec<u8>>> {
    conn.set_read_timeout(Some(RECV_POLL))?;

    let mut buf = vec![0_u8; n];

    loop {
        if aio.is_claimed() {
            return Ok(None);
        }

        if queue.is_closed() {
            return Err(ErrorKind::NotConnected.into());
        }

        match conn.read(&mut buf) {
            Ok(0) => return Err(ErrorKind::ConnectionAborted.into()),
            Ok(len) => {
                buf.truncate(len);
                return Ok(Some(buf));
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
}

fn closed_or(queue: &Receiver<Op>, e: io::Error) -> Error {
    if queue.is_closed() {
        Error::Closed
    } else {
        e.into()
    }
}

fn fail<T>(aio: &Aio<T>, error: Error)
where
    T: Send + 'static,
{
    if let Some(completer) = aio.claim() {
        completer.complete(Err(error));
    }
}
