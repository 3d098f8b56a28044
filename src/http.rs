//! A small HTTP/1.1 client codec: request serialisation and response parsing
//! over any buffered reader.

use core::fmt;
use core::time::Duration;

use std::io::{self, BufRead, ErrorKind, Read};

use url::Url;

use crate::tls::TlsConfig;

const MAX_HEADER_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 128;

/// Largest response body accepted unless the request says otherwise.
pub const DEFAULT_MAX_BODY: usize = 16 * 1024 * 1024;

/// One HTTP request: method, headers, body and how to carry it out.
///
/// A request may own a [`TlsConfig`] for `https://` URLs and is therefore
/// not `Clone`.
pub struct HttpRequest {
    pub(crate) method: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<Vec<u8>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) follow_redirects: bool,
    pub(crate) max_redirects: usize,
    pub(crate) max_body: usize,
    pub(crate) response_headers: Option<Vec<String>>,
    pub(crate) tls: Option<TlsConfig>,
}

impl HttpRequest {
    /// A `GET` request that follows up to 10 redirects and never times out.
    pub fn new() -> Self {
        Self {
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            follow_redirects: true,
            max_redirects: 10,
            max_body: DEFAULT_MAX_BODY,
            response_headers: None,
            tls: None,
        }
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Bounds the whole transaction, redirects included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Caps the response body; a larger one fails the transaction with a
    /// protocol error.
    pub fn max_body(mut self, max: usize) -> Self {
        self.max_body = max;
        self
    }

    /// Keeps only the named response headers (case-insensitive) in the
    /// returned [`Response`].
    pub fn response_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.response_headers = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub(crate) fn select_headers(&self, headers: Vec<(String, String)>) -> Vec<(String, String)> {
        let Some(names) = &self.response_headers else {
            return headers;
        };

        headers
            .into_iter()
            .filter(|(name, _)| names.iter().any(|wanted| wanted.eq_ignore_ascii_case(name)))
            .collect()
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(Vec::len))
            .field("timeout", &self.timeout)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("max_body", &self.max_body)
            .finish()
    }
}

/// A complete HTTP response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    url: String,
}

impl Response {
    pub(crate) fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>, url: String) -> Self {
        Self {
            status,
            headers,
            body,
            url,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The first value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// The body as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The URL that produced this response, after any redirects.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A response as read off the wire, before header selection.
pub(crate) struct RawResponse {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
    /// The server will not accept another request on this connection.
    pub(crate) close: bool,
}

pub(crate) fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Serialises a request for `url`. With `close` the server is asked to drop
/// the connection after responding.
pub(crate) fn write_request(
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    body: Option<&[u8]>,
    close: bool,
) -> Vec<u8> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };

    let mut out = format!("{method} {target} HTTP/1.1\r\nHost: {host}\r\n");

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }

        out.push_str(&format!("{name}: {value}\r\n"));
    }

    if let Some(body) = body {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }

    if close {
        out.push_str("Connection: close\r\n");
    }

    out.push_str("\r\n");

    let mut out = out.into_bytes();
    if let Some(body) = body {
        out.extend_from_slice(body);
    }

    out
}

/// Reads one response. `head` marks a response to a `HEAD` request, which
/// never has a body. Bodies longer than `limit` are rejected before they are
/// buffered.
pub(crate) fn read_response<R>(
    reader: &mut R,
    head: bool,
    limit: usize,
) -> io::Result<RawResponse>
where
    R: BufRead,
{
    let status_line = read_line(reader)?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status = parts
        .next()
        .and_then(|status| status.parse::<u16>().ok())
        .filter(|_| version.starts_with("HTTP/1."))
        .ok_or_else(|| invalid("malformed status line"))?;

    let mut headers = Vec::new();

    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            break;
        }

        if headers.len() == MAX_HEADERS {
            Err(invalid("too many headers"))?;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid("malformed header"))?;

        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let chunked = header(&headers, "transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));

    let content_length = header(&headers, "content-length")
        .map(|value| value.parse::<usize>().map_err(|_| invalid("bad content length")))
        .transpose()?;

    let mut close = version == "HTTP/1.0"
        || header(&headers, "connection").is_some_and(|value| value.eq_ignore_ascii_case("close"));

    let body = if head || status / 100 == 1 || status == 204 || status == 304 {
        Vec::new()
    } else if chunked {
        read_chunked(reader, limit)?
    } else if let Some(len) = content_length {
        if len > limit {
            Err(invalid("body too large"))?;
        }

        let mut body = Vec::new();
        read_exactly(reader, len, &mut body)?;
        body
    } else {
        close = true;

        let mut body = Vec::new();
        reader
            .by_ref()
            .take((limit as u64).saturating_add(1))
            .read_to_end(&mut body)?;

        if body.len() > limit {
            Err(invalid("body too large"))?;
        }

        body
    };

    Ok(RawResponse {
        status,
        headers,
        body,
        close,
    })
}

fn read_chunked<R>(reader: &mut R, limit: usize) -> io::Result<Vec<u8>>
where
    R: BufRead,
{
    let mut body = Vec::new();

    loop {
        let line = read_line(reader)?;

        // Chunk extensions (`;key=value`) are ignored.
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16).map_err(|_| invalid("bad chunk size"))?;

        if size == 0 {
            // Trailers, up to the blank line.
            while !read_line(reader)?.is_empty() {}

            return Ok(body);
        }

        if body.len().checked_add(size).map_or(true, |total| total > limit) {
            Err(invalid("body too large"))?;
        }

        read_exactly(reader, size, &mut body)?;

        if !read_line(reader)?.is_empty() {
            Err(invalid("missing chunk terminator"))?;
        }
    }
}

/// Appends exactly `len` bytes to `buf`. The buffer only grows with what
/// actually arrives.
fn read_exactly<R>(reader: &mut R, len: usize, buf: &mut Vec<u8>) -> io::Result<()>
where
    R: Read,
{
    let read = reader.by_ref().take(len as u64).read_to_end(buf)?;

    if read < len {
        Err(io::Error::from(ErrorKind::UnexpectedEof))?;
    }

    Ok(())
}

/// One CRLF- (or LF-) terminated line, without the terminator.
fn read_line<R>(reader: &mut R) -> io::Result<String>
where
    R: BufRead,
{
    let mut line = Vec::new();

    let n = reader
        .by_ref()
        .take(MAX_HEADER_LINE as u64 + 2)
        .read_until(b'\n', &mut line)?;

    if n == 0 {
        Err(io::Error::from(ErrorKind::UnexpectedEof))?;
    }

    if line.last() != Some(&b'\n') {
        Err(invalid("line too long"))?;
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line).map_err(|_| invalid("non-UTF-8 header"))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}
