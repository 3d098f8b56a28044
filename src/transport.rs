use core::time::Duration;

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::thread;

use async_channel::{Receiver, TryRecvError};
use log::{debug, trace, warn};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection, StreamOwned};

use crate::endpoint::ListenerCore;
use crate::error::{Code, Error, Result};
use crate::pipe::PipeSink;
use crate::protocol::{self, HEADER_LEN, MAX_MESSAGE};
use crate::registry::{self, Registry};
use crate::socket::SocketCore;
use crate::tls::TlsConfig;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// How often a TLS pipe's I/O thread checks for outbound messages.
const POLL_INTERVAL: Duration = Duration::from_millis(5);
const READ_CHUNK: usize = 16 * 1024;

static INPROC: Registry<String, ListenerCore> = Registry::new();

/// A parsed endpoint URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Address {
    Inproc(String),
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16 },
}

impl Address {
    /// Accepts `inproc://name`, `tcp://host:port` and `tls+tcp://host:port`.
    /// IPv6 hosts go in brackets; `*` or an empty host means any address.
    pub(crate) fn parse(url: &str) -> Result<Self> {
        let Some((scheme, rest)) = url.split_once("://") else {
            return Err(Code::ADDR_INVALID.into());
        };

        match scheme {
            "inproc" if !rest.is_empty() => Ok(Self::Inproc(rest.to_string())),
            "tcp" | "tls+tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or(Error::Transport(Code::ADDR_INVALID))?;

                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Transport(Code::ADDR_INVALID))?;

                let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

                Ok(if scheme == "tcp" {
                    Self::Tcp { host, port }
                } else {
                    Self::Tls { host, port }
                })
            }
            "inproc" => Err(Code::ADDR_INVALID.into()),
            _ => Err(Code::NOT_SUPPORTED.into()),
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    fn host_port(&self) -> Result<(&str, u16)> {
        match self {
            Self::Tcp { host, port } | Self::Tls { host, port } => Ok((host, *port)),
            Self::Inproc(_) => Err(Code::NOT_SUPPORTED.into()),
        }
    }

    /// Renders the address back to a URL, with `port` substituted.
    pub(crate) fn with_port(&self, port: u16) -> String {
        match self {
            Self::Inproc(name) => format!("inproc://{name}"),
            Self::Tcp { host, .. } => format!("tcp://{}:{port}", bracketed(host)),
            Self::Tls { host, .. } => format!("tls+tcp://{}:{port}", bracketed(host)),
        }
    }
}

fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// A byte stream to a peer, with or without TLS.
pub(crate) enum Conn {
    Plain(TcpStream),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Conn {
    /// Connects to a `tcp://` or `tls+tcp://` address. TLS dials without a
    /// configuration trust the web PKI roots.
    pub(crate) fn connect(address: &Address, tls: Option<&TlsConfig>) -> Result<Self> {
        let (host, port) = address.host_port()?;

        let stream = connect_tcp(host, port, CONNECT_TIMEOUT)?;

        if address.is_tls() {
            let config = match tls {
                Some(tls) => tls.client_config()?,
                None => TlsConfig::client()?.client_config()?,
            };

            Self::client(stream, config, host)
        } else {
            Ok(Self::Plain(stream))
        }
    }

    pub(crate) fn client(
        stream: TcpStream,
        config: Arc<rustls::ClientConfig>,
        host: &str,
    ) -> Result<Self> {
        let name = ServerName::try_from(host)
            .map_err(|_| Error::Transport(Code::ADDR_INVALID))?
            .to_owned();

        let conn = ClientConnection::new(config, name)?;

        Ok(Self::TlsClient(Box::new(StreamOwned::new(conn, stream))))
    }

    /// Wraps an accepted stream, terminating TLS if `tls` is given.
    pub(crate) fn accept(stream: TcpStream, tls: Option<&TlsConfig>) -> Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        match tls {
            Some(tls) => {
                let conn = ServerConnection::new(tls.server_config()?)?;

                Ok(Self::TlsServer(Box::new(StreamOwned::new(conn, stream))))
            }
            None => Ok(Self::Plain(stream)),
        }
    }

    pub(crate) fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::TlsClient(stream) => &stream.sock,
            Self::TlsServer(stream) => &stream.sock,
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_write_timeout(timeout)
    }

    pub(crate) fn shutdown(&mut self) {
        match self {
            Self::Plain(_) => (),
            Self::TlsClient(stream) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
            }
            Self::TlsServer(stream) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
            }
        }

        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::TlsClient(stream) => stream.read(buf),
            Self::TlsServer(stream) => stream.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::TlsClient(stream) => stream.write(buf),
            Self::TlsServer(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::TlsClient(stream) => stream.flush(),
            Self::TlsServer(stream) => stream.flush(),
        }
    }
}

pub(crate) fn connect_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last = io::Error::from(ErrorKind::AddrNotAvailable);

    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                trace!("Connect to {addr} failed: {e}");
                last = e;
            }
        }
    }

    Err(last)
}

/// Binds a TCP listener in non-blocking mode, ready for an accept loop.
pub(crate) fn bind_tcp(address: &Address) -> Result<(TcpListener, SocketAddr)> {
    let (host, port) = address.host_port()?;

    let host = match host {
        "" | "*" => "0.0.0.0",
        host => host,
    };

    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;

    let local = listener.local_addr()?;

    Ok((listener, local))
}

/// Length-prefix framing: a 64-bit big-endian size, then the body.
pub(crate) fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + body.len());

    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(body);

    frame
}

#[derive(Default)]
pub(crate) struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < 8 {
            return Ok(None);
        }

        let mut size = [0_u8; 8];
        size.copy_from_slice(&self.buf[..8]);
        let size = u64::from_be_bytes(size);

        if size > MAX_MESSAGE as u64 {
            return Err(io::Error::new(ErrorKind::InvalidData, "message too large"));
        }

        let end = 8 + size as usize;
        if self.buf.len() < end {
            return Ok(None);
        }

        let body = self.buf[8..end].to_vec();
        self.buf.drain(..end);

        Ok(Some(body))
    }
}

/// Runs the protocol handshake on a fresh connection and attaches the
/// resulting pipe to `socket`. The returned driver must then be run to move
/// messages.
pub(crate) fn establish(socket: &Arc<SocketCore>, endpoint: u32, mut conn: Conn) -> Result<PipeDriver> {
    conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    conn.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

    conn.write_all(&protocol::header(socket.protocol()))?;
    conn.flush()?;

    let mut header = [0_u8; HEADER_LEN];
    conn.read_exact(&mut header)?;

    let Some(peer) = protocol::parse_header(&header) else {
        debug!("Socket {}: peer sent a bad header", socket.id());
        conn.shutdown();
        return Err(Code::PROTOCOL.into());
    };

    if peer != socket.protocol().peer() {
        debug!(
            "Socket {}: {} cannot talk to {peer}",
            socket.id(),
            socket.protocol()
        );
        conn.shutdown();
        return Err(Code::PROTOCOL.into());
    }

    conn.set_write_timeout(None)?;

    let (sender, outbound) = async_channel::unbounded();
    let pipe = registry::next_id();

    if let Err(e) = socket.attach(pipe, endpoint, PipeSink::Conn(sender)) {
        conn.shutdown();
        return Err(e);
    }

    Ok(PipeDriver {
        conn,
        pipe,
        socket: Arc::downgrade(socket),
        outbound,
    })
}

/// Moves messages between one connection and its socket until either side
/// goes away, then detaches the pipe.
pub(crate) struct PipeDriver {
    conn: Conn,
    pipe: u32,
    socket: Weak<SocketCore>,
    outbound: Receiver<Vec<u8>>,
}

impl PipeDriver {
    pub(crate) fn run(self) {
        let PipeDriver {
            conn,
            pipe,
            socket,
            outbound,
        } = self;

        let reason = match conn {
            Conn::Plain(stream) => run_split(stream, pipe, &socket, outbound),
            conn => run_polled(conn, pipe, &socket, outbound),
        };

        debug!("Pipe {pipe} closing: {reason}");

        if let Some(socket) = socket.upgrade() {
            socket.detach(pipe);
        }
    }
}

/// Plain TCP: a writer thread blocks on the outbound queue while this thread
/// blocks on reads.
fn run_split(
    stream: TcpStream,
    pipe: u32,
    socket: &Weak<SocketCore>,
    outbound: Receiver<Vec<u8>>,
) -> io::Error {
    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => return e,
    };

    let spawned = thread::Builder::new()
        .name(format!("nano-pipe-{pipe}-tx"))
        .spawn(move || {
            let mut writer = writer;

            while let Ok(body) = outbound.recv_blocking() {
                if let Err(e) = writer.write_all(&encode_frame(&body)) {
                    trace!("Pipe {pipe} write failed: {e}");
                    break;
                }
            }

            let _ = writer.shutdown(Shutdown::Both);
        });

    let writer = match spawned {
        Ok(writer) => writer,
        Err(e) => return e,
    };

    let reason = read_plain(&stream, pipe, socket);

    let _ = stream.shutdown(Shutdown::Both);

    // The writer exits once the pipe's sender is released on detach.
    if let Some(socket) = socket.upgrade() {
        socket.detach(pipe);
    }

    if writer.join().is_err() {
        warn!("Pipe {pipe} writer panicked");
    }

    reason
}

/// TLS: one thread owns the session, alternating short timed reads with
/// draining the outbound queue.
fn run_polled(
    mut conn: Conn,
    pipe: u32,
    socket: &Weak<SocketCore>,
    outbound: Receiver<Vec<u8>>,
) -> io::Error {
    let reason = pump_polled(&mut conn, pipe, socket, &outbound);

    conn.shutdown();

    reason
}

fn read_plain(stream: &TcpStream, pipe: u32, socket: &Weak<SocketCore>) -> io::Error {
    if let Err(e) = stream.set_read_timeout(None) {
        return e;
    }

    let mut decoder = FrameDecoder::default();
    let mut buf = vec![0_u8; READ_CHUNK];

    loop {
        match (&*stream).read(&mut buf) {
            Ok(0) => return ErrorKind::UnexpectedEof.into(),
            Ok(n) => {
                decoder.push(&buf[..n]);

                if let Err(e) = dispatch_frames(&mut decoder, pipe, socket) {
                    return e;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return e,
        }
    }
}

fn pump_polled(
    conn: &mut Conn,
    pipe: u32,
    socket: &Weak<SocketCore>,
    outbound: &Receiver<Vec<u8>>,
) -> io::Error {
    if let Err(e) = conn.set_read_timeout(Some(POLL_INTERVAL)) {
        return e;
    }

    let mut decoder = FrameDecoder::default();
    let mut buf = vec![0_u8; READ_CHUNK];

    loop {
        loop {
            match outbound.try_recv() {
                Ok(body) => {
                    if let Err(e) = conn
                        .write_all(&encode_frame(&body))
                        .and_then(|_| conn.flush())
                    {
                        return e;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => return ErrorKind::NotConnected.into(),
            }
        }

        match conn.read(&mut buf) {
            Ok(0) => return ErrorKind::UnexpectedEof.into(),
            Ok(n) => {
                decoder.push(&buf[..n]);

                if let Err(e) = dispatch_frames(&mut decoder, pipe, socket) {
                    return e;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => return e,
        }
    }
}

fn dispatch_frames(decoder: &mut FrameDecoder, pipe: u32, socket: &Weak<SocketCore>) -> io::Result<()> {
    while let Some(body) = decoder.next_frame()? {
        let Some(socket) = socket.upgrade() else {
            return Err(ErrorKind::NotConnected.into());
        };

        socket.deliver(pipe, body);
    }

    Ok(())
}

/// Registers `listener` under its inproc name.
pub(crate) fn bind_inproc(name: &str, listener: &Arc<ListenerCore>) -> Result<()> {
    if INPROC.insert_vacant(name.to_string(), listener, ListenerCore::is_live) {
        Ok(())
    } else {
        Err(Code::ADDR_IN_USE.into())
    }
}

pub(crate) fn unbind_inproc(name: &str, listener: &Arc<ListenerCore>) {
    INPROC.remove(&name.to_string(), listener);
}

/// Connects `socket` to the inproc listener `name` with a pair of pipes that
/// deliver straight into each other's socket.
pub(crate) fn connect_inproc(socket: &Arc<SocketCore>, dialer: u32, name: &str) -> Result<()> {
    let Some(listener) = INPROC
        .get(&name.to_string())
        .filter(|listener| listener.is_live())
    else {
        return Err(Code::CONN_REFUSED.into());
    };

    let remote = listener.socket();

    if remote.protocol() != socket.protocol().peer() {
        return Err(Code::PROTOCOL.into());
    }

    let near = registry::next_id();
    let far = registry::next_id();

    remote.attach(
        far,
        listener.id(),
        PipeSink::Inproc {
            peer: Arc::downgrade(socket),
            pipe: near,
        },
    )?;

    let attached = socket.attach(
        near,
        dialer,
        PipeSink::Inproc {
            peer: Arc::downgrade(remote),
            pipe: far,
        },
    );

    if let Err(e) = attached {
        remote.detach(far);
        return Err(e);
    }

    debug!("Inproc {name}: socket {} connected to socket {}", socket.id(), remote.id());

    Ok(())
}
