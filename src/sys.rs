use std::io::{self, ErrorKind};

use libc as sys;

use crate::error::Code;

/// Maps an OS-level failure onto the messaging status codes.
///
/// The raw errno wins when there is one; otherwise the [`ErrorKind`] decides.
/// TLS failures tunnelled through `io::Error` by rustls are unwrapped first.
pub(crate) fn code_of(err: &io::Error) -> Code {
    if let Some(tls) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return tls_code(tls);
    }

    if let Some(code) = err.raw_os_error().and_then(from_errno) {
        return code;
    }

    match err.kind() {
        ErrorKind::ConnectionRefused => Code::CONN_REFUSED,
        ErrorKind::ConnectionReset => Code::CONN_RESET,
        ErrorKind::ConnectionAborted => Code::CONN_ABORTED,
        ErrorKind::NotConnected => Code::CLOSED,
        ErrorKind::AddrInUse => Code::ADDR_IN_USE,
        ErrorKind::AddrNotAvailable => Code::ADDR_INVALID,
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => Code::CONN_SHUTDOWN,
        ErrorKind::WouldBlock => Code::TRY_AGAIN,
        ErrorKind::TimedOut => Code::TIMED_OUT,
        ErrorKind::InvalidInput => Code::INVALID,
        ErrorKind::InvalidData => Code::PROTOCOL,
        ErrorKind::PermissionDenied => Code::PERMISSION,
        ErrorKind::NotFound => Code::NOT_FOUND,
        ErrorKind::AlreadyExists => Code::EXISTS,
        ErrorKind::OutOfMemory => Code::NO_MEMORY,
        ErrorKind::Interrupted => Code::INTERRUPTED,
        ErrorKind::Unsupported => Code::NOT_SUPPORTED,
        _ => Code::INTERNAL,
    }
}

pub(crate) fn tls_code(err: &rustls::Error) -> Code {
    match err {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
            Code::PEER_AUTH
        }
        _ => Code::CRYPTO,
    }
}

/// Raises `signal` in the current process.
pub(crate) fn raise(signal: i32) -> io::Result<()> {
    if unsafe { sys::raise(signal) } != 0 {
        Err(io::Error::last_os_error())?;
    }

    Ok(())
}

#[allow(unreachable_patterns)]
fn from_errno(errno: i32) -> Option<Code> {
    let code = match errno {
        sys::ECONNREFUSED => Code::CONN_REFUSED,
        sys::ETIMEDOUT => Code::TIMED_OUT,
        sys::EADDRINUSE => Code::ADDR_IN_USE,
        sys::EADDRNOTAVAIL => Code::ADDR_INVALID,
        sys::ECONNRESET => Code::CONN_RESET,
        sys::ECONNABORTED => Code::CONN_ABORTED,
        sys::EHOSTUNREACH | sys::ENETUNREACH => Code::UNREACHABLE,
        sys::EACCES | sys::EPERM => Code::PERMISSION,
        sys::ENOMEM | sys::ENOBUFS => Code::NO_MEMORY,
        sys::EMFILE | sys::ENFILE => Code::NO_FILES,
        sys::ENOSPC => Code::NO_SPACE,
        sys::EINTR => Code::INTERRUPTED,
        sys::EAGAIN | sys::EWOULDBLOCK | sys::EINPROGRESS => Code::TRY_AGAIN,
        sys::EINVAL => Code::INVALID,
        sys::EPIPE | sys::ESHUTDOWN => Code::CONN_SHUTDOWN,
        sys::ENOENT => Code::NOT_FOUND,
        sys::EEXIST => Code::EXISTS,
        sys::EMSGSIZE => Code::MSG_TOO_LARGE,
        sys::ENOTSUP | sys::EOPNOTSUPP => Code::NOT_SUPPORTED,
        _ => return None,
    };

    Some(code)
}
