//! HTTP client built on the AIO layer: one-shot [`ncurl`], asynchronous
//! [`ncurl_aio`] and the connection-reusing [`Session`].

use core::fmt;
use core::time::Duration;

use std::io::{self, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use async_channel::{Receiver, Sender};
use log::{debug, trace, warn};
use url::Url;

use crate::aio::{Aio, AioKind};
use crate::dispatch;
use crate::error::{Code, Error, Result};
use crate::http::{self, HttpRequest, RawResponse, Response};
use crate::registry::{self, OpenFlag};
use crate::tls::TlsConfig;
use crate::transport::{self, Conn, CONNECT_TIMEOUT};
use crate::wait;

/// Progress of an HTTP transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HttpState {
    Connecting,
    RequestSent,
    AwaitingResponse,
    Complete,
    Redirected,
    Failed,
}

/// Performs one request and blocks for the response. The connection is torn
/// down afterwards.
pub fn ncurl(url: &str, request: HttpRequest) -> Result<Response> {
    ncurl_aio(url, request)?.block(None)
}

/// Starts one request on a background thread and returns its handle.
///
/// URL errors are reported here; everything after that resolves the handle.
/// Stopping the handle aborts the connection in progress.
pub fn ncurl_aio(url: &str, request: HttpRequest) -> Result<Aio<Response>> {
    let url = parse_url(url)?;

    let aio = Aio::new(AioKind::Http, None);
    let interrupt = Interrupt::default();

    {
        let interrupt = interrupt.clone();
        aio.set_abort(move || interrupt.fire());
    }

    let deadline = request.timeout.and_then(wait::deadline_after);
    if let Some(deadline) = deadline {
        aio.expire_at(deadline);
    }

    let worker = aio.clone();

    thread::Builder::new()
        .name(format!("nano-ncurl-{}", aio.id()))
        .spawn(move || {
            let outcome = transact(None, &url, &request, deadline, &interrupt, &mut |state: HttpState| {
                trace!("Aio {}: {state:?}", worker.id())
            });

            if let Some(completer) = worker.claim() {
                completer.complete(outcome);
            }
        })?;

    Ok(aio)
}

/// A reusable HTTP connection to one URL.
///
/// The connection is made when the session is created and kept alive across
/// transactions; if the server closes it, the next transaction reconnects.
/// Each transaction re-arms the same AIO handle.
#[derive(Clone)]
pub struct Session {
    handle: Arc<SessionHandle>,
}

struct SessionCore {
    id: u32,
    url: Url,
    request: HttpRequest,
    open: OpenFlag,
    state: Mutex<HttpState>,
    jobs: Sender<Aio<Response>>,
    aio: Mutex<Option<Aio<Response>>>,
    interrupt: Interrupt,
}

impl SessionCore {
    fn set_state(&self, state: HttpState) {
        *self.state.lock().unwrap() = state;
    }

    fn close(&self) -> bool {
        if !self.open.close() {
            return false;
        }

        self.jobs.close();
        self.interrupt.fire();

        let aio = self.aio.lock().unwrap().clone();
        if let Some(completer) = aio.as_ref().and_then(Aio::claim) {
            completer.complete(Err(Error::Closed));
        }

        debug!("Session {} closed", self.id);

        true
    }

    fn serve(self: Arc<Self>, mut conn: Option<HttpConn>, jobs: Receiver<Aio<Response>>) {
        while let Ok(aio) = jobs.recv_blocking() {
            if aio.is_claimed() {
                continue;
            }

            let deadline = self.request.timeout.and_then(wait::deadline_after);

            let outcome = transact(
                Some(&mut conn),
                &self.url,
                &self.request,
                deadline,
                &self.interrupt,
                &mut |state: HttpState| self.set_state(state),
            );

            self.set_state(if outcome.is_ok() {
                HttpState::Complete
            } else {
                HttpState::Failed
            });

            if let Some(completer) = aio.claim() {
                completer.complete(outcome);
            }
        }

        trace!("Session {} worker exiting", self.id);
    }
}

struct SessionHandle {
    core: Arc<SessionCore>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let core = self.core.clone();

        dispatch::defer(move || {
            core.close();
        });
    }
}

impl Session {
    /// Connects to `url`. Connection failures are reported here.
    pub fn new(url: &str, request: HttpRequest) -> Result<Self> {
        let url = parse_url(url)?;

        let deadline = request.timeout.and_then(wait::deadline_after);
        let conn = HttpConn::open(&url, request.tls.as_ref(), deadline)?;

        let (jobs, queue) = async_channel::unbounded();

        let core = Arc::new(SessionCore {
            id: registry::next_id(),
            url,
            request,
            open: OpenFlag::new(),
            state: Mutex::new(HttpState::Connecting),
            jobs,
            aio: Mutex::new(None),
            interrupt: Interrupt::default(),
        });

        let worker = core.clone();

        thread::Builder::new()
            .name(format!("nano-session-{}", core.id))
            .spawn(move || worker.serve(Some(conn), queue))?;

        debug!("Session {} connected to {}", core.id, core.url);

        Ok(Self {
            handle: Arc::new(SessionHandle { core }),
        })
    }

    /// Runs one transaction and blocks for the response.
    pub fn transact(&self) -> Result<Response> {
        self.transact_aio()?.block(None)
    }

    /// Starts one transaction on the session's handle.
    ///
    /// Fails with `Resource busy` while the previous transaction is still in
    /// flight. An outcome the caller never took is discarded.
    pub fn transact_aio(&self) -> Result<Aio<Response>> {
        let core = self.core();

        if !core.open.is_open() {
            return Err(Error::Closed);
        }

        let mut slot = core.aio.lock().unwrap();

        let aio = match slot.as_ref() {
            Some(aio) if !aio.state().is_terminal() => Err(Code::BUSY)?,
            Some(aio) => {
                let _ = aio.take();

                aio.rearm()?;
                aio.clone()
            }
            None => Aio::new(AioKind::Http, Some(core.id)),
        };

        core.interrupt.reset();

        {
            let interrupt = core.interrupt.clone();
            aio.set_abort(move || interrupt.fire());
        }

        core.jobs
            .try_send(aio.clone())
            .map_err(|_| Error::Closed)?;

        if let Some(deadline) = core.request.timeout.and_then(wait::deadline_after) {
            aio.expire_at(deadline);
        }

        *slot = Some(aio.clone());

        Ok(aio)
    }

    pub fn state(&self) -> HttpState {
        *self.core().state.lock().unwrap()
    }

    pub fn is_open(&self) -> bool {
        self.core().open.is_open()
    }

    pub fn url(&self) -> &str {
        self.core().url.as_str()
    }

    /// Closes the connection; a transaction in flight fails with `Closed`.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        self.core().close();

        Ok(())
    }

    fn core(&self) -> &Arc<SessionCore> {
        &self.handle.core
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core().id)
            .field("url", &self.url())
            .field("state", &self.state())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Lets a stop or expiry break a blocking read or write by shutting the
/// socket down underneath it.
#[derive(Clone, Default)]
struct Interrupt {
    inner: Arc<Mutex<InterruptState>>,
}

#[derive(Default)]
struct InterruptState {
    stream: Option<TcpStream>,
    fired: bool,
}

impl Interrupt {
    fn watch(&self, tcp: &TcpStream) -> Result<()> {
        let mut state = self.inner.lock().unwrap();

        if state.fired {
            Err(Code::CANCELED)?;
        }

        state.stream = Some(tcp.try_clone()?);

        Ok(())
    }

    fn fire(&self) {
        let mut state = self.inner.lock().unwrap();

        state.fired = true;

        if let Some(stream) = state.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_fired(&self) -> bool {
        self.inner.lock().unwrap().fired
    }

    fn reset(&self) {
        let mut state = self.inner.lock().unwrap();

        state.fired = false;
        state.stream = None;
    }
}

struct HttpConn {
    reader: BufReader<Conn>,
    tcp: TcpStream,
}

impl HttpConn {
    fn open(url: &Url, tls: Option<&TlsConfig>, deadline: Option<Instant>) -> Result<Self> {
        let host = url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .ok_or(Error::Transport(Code::ADDR_INVALID))?;

        let port = url
            .port_or_known_default()
            .ok_or(Error::Transport(Code::ADDR_INVALID))?;

        let timeout = remaining(deadline)?.map_or(CONNECT_TIMEOUT, |left| left.min(CONNECT_TIMEOUT));

        let stream = transport::connect_tcp(host, port, timeout).map_err(io_error)?;
        let tcp = stream.try_clone()?;

        let conn = if url.scheme() == "https" {
            let config = match tls {
                Some(tls) => tls.client_config()?,
                None => TlsConfig::client()?.client_config()?,
            };

            Conn::client(stream, config, host)?
        } else {
            Conn::Plain(stream)
        };

        trace!("Connected to {host}:{port}");

        Ok(Self {
            reader: BufReader::new(conn),
            tcp,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn exchange(
        &mut self,
        method: &str,
        url: &Url,
        request: &HttpRequest,
        body: Option<&[u8]>,
        close: bool,
        deadline: Option<Instant>,
        progress: &mut dyn FnMut(HttpState),
    ) -> Result<RawResponse> {
        let wire = http::write_request(method, url, &request.headers, body, close);

        let conn = self.reader.get_mut();
        conn.set_write_timeout(remaining(deadline)?)?;
        conn.write_all(&wire)
            .and_then(|_| conn.flush())
            .map_err(io_error)?;

        progress(HttpState::RequestSent);

        self.reader.get_ref().set_read_timeout(remaining(deadline)?)?;

        progress(HttpState::AwaitingResponse);

        http::read_response(&mut self.reader, method == "HEAD", request.max_body)
            .map_err(io_error)
    }
}

/// Carries out `request` against `url`, following redirects as configured.
///
/// With `session`, the first hop runs over the session's persistent
/// connection (opening a fresh one if there is none, or if a reused one turns
/// out to be stale); redirect hops always use one-shot connections.
fn transact(
    mut session: Option<&mut Option<HttpConn>>,
    url: &Url,
    request: &HttpRequest,
    deadline: Option<Instant>,
    interrupt: &Interrupt,
    progress: &mut dyn FnMut(HttpState),
) -> Result<Response> {
    let mut current = url.clone();
    let mut method = request.method.clone();
    let mut body = request.body.clone();
    let mut hops = 0;

    loop {
        let raw = match (hops, session.as_deref_mut()) {
            (0, Some(slot)) => exchange_persistent(
                slot,
                &current,
                &method,
                request,
                body.as_deref(),
                deadline,
                interrupt,
                progress,
            )?,
            _ => {
                progress(HttpState::Connecting);

                let mut conn = HttpConn::open(&current, request.tls.as_ref(), deadline)?;
                interrupt.watch(&conn.tcp)?;

                conn.exchange(
                    &method,
                    &current,
                    request,
                    body.as_deref(),
                    true,
                    deadline,
                    progress,
                )?
            }
        };

        let location = http::header(&raw.headers, "location")
            .filter(|_| request.follow_redirects && is_redirect(raw.status))
            .map(str::to_string);

        match location {
            Some(location) => {
                if hops >= request.max_redirects {
                    debug!("Giving up on {current} after {hops} redirects");
                    return Err(Error::TooManyRedirects {
                        limit: request.max_redirects,
                    });
                }

                let next = current
                    .join(&location)
                    .map_err(|_| Error::Transport(Code::ADDR_INVALID))?;

                debug!("{} redirect: {current} -> {next}", raw.status);

                if redirects_to_get(raw.status, &method) {
                    method = "GET".to_string();
                    body = None;
                }

                current = next;
                hops += 1;

                progress(HttpState::Redirected);
            }
            None => {
                progress(HttpState::Complete);

                return Ok(Response::new(
                    raw.status,
                    request.select_headers(raw.headers),
                    raw.body,
                    current.to_string(),
                ));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn exchange_persistent(
    slot: &mut Option<HttpConn>,
    url: &Url,
    method: &str,
    request: &HttpRequest,
    body: Option<&[u8]>,
    deadline: Option<Instant>,
    interrupt: &Interrupt,
    progress: &mut dyn FnMut(HttpState),
) -> Result<RawResponse> {
    let reused = slot.is_some();

    let mut conn = match slot.take() {
        Some(conn) => conn,
        None => {
            progress(HttpState::Connecting);
            HttpConn::open(url, request.tls.as_ref(), deadline)?
        }
    };

    interrupt.watch(&conn.tcp)?;

    let raw = match conn.exchange(method, url, request, body, false, deadline, progress) {
        Ok(raw) => raw,
        Err(e) if reused && !e.is_timeout() && !interrupt.is_fired() => {
            debug!("Kept-alive connection to {url} failed ({e}), reconnecting");

            progress(HttpState::Connecting);

            conn = HttpConn::open(url, request.tls.as_ref(), deadline)?;
            interrupt.watch(&conn.tcp)?;

            conn.exchange(method, url, request, body, false, deadline, progress)?
        }
        Err(e) => return Err(e),
    };

    if raw.close {
        trace!("Server closed the connection to {url}");
    } else {
        *slot = Some(conn);
    }

    Ok(raw)
}

fn parse_url(url: &str) -> Result<Url> {
    let url = Url::parse(url).map_err(|_| Error::Transport(Code::ADDR_INVALID))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => {
            warn!("Unsupported URL scheme {scheme}");
            Err(Code::NOT_SUPPORTED.into())
        }
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// 303 always continues as `GET`; 301 and 302 do so after a `POST`.
fn redirects_to_get(status: u16, method: &str) -> bool {
    match status {
        303 => method != "HEAD",
        301 | 302 => method == "POST",
        _ => false,
    }
}

/// What is left of the overall timeout, if there is one.
fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };

    let left = deadline.saturating_duration_since(Instant::now());

    if left.is_zero() {
        Err(Error::Timeout)
    } else {
        Ok(Some(left))
    }
}

fn io_error(e: io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout,
        _ => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_rewriting_on_redirect() {
        assert!(redirects_to_get(303, "PUT"));
        assert!(!redirects_to_get(303, "HEAD"));
        assert!(redirects_to_get(302, "POST"));
        assert!(!redirects_to_get(301, "PUT"));
        assert!(!redirects_to_get(307, "POST"));
        assert!(!redirects_to_get(308, "POST"));
    }

    #[test]
    fn only_http_schemes() {
        assert_eq!(
            ncurl_aio("ftp://example.com/", HttpRequest::new()).map(|_| ()),
            Err(Error::Transport(Code::NOT_SUPPORTED))
        );
        assert_eq!(
            ncurl("not a url", HttpRequest::new()).map(|_| ()),
            Err(Error::Transport(Code::ADDR_INVALID))
        );
    }

    #[test]
    fn expired_deadline_is_a_timeout() {
        let past = Instant::now();
        thread::sleep(Duration::from_millis(2));

        assert_eq!(remaining(Some(past)), Err(Error::Timeout));
        assert_eq!(remaining(None), Ok(None));
    }
}
