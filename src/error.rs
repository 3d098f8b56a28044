use core::fmt;

use std::io;

/// A numeric status code as reported by the messaging layer.
///
/// Codes are stable integers; [`Code::strerror`] renders the human-readable
/// message and the [`Display`](fmt::Display) impl renders `"{code} | {message}"`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Code(i32);

impl Code {
    pub const INTERRUPTED: Code = Code(1);
    pub const NO_MEMORY: Code = Code(2);
    pub const INVALID: Code = Code(3);
    pub const BUSY: Code = Code(4);
    pub const TIMED_OUT: Code = Code(5);
    pub const CONN_REFUSED: Code = Code(6);
    pub const CLOSED: Code = Code(7);
    pub const TRY_AGAIN: Code = Code(8);
    pub const NOT_SUPPORTED: Code = Code(9);
    pub const ADDR_IN_USE: Code = Code(10);
    pub const STATE: Code = Code(11);
    pub const NOT_FOUND: Code = Code(12);
    pub const PROTOCOL: Code = Code(13);
    pub const UNREACHABLE: Code = Code(14);
    pub const ADDR_INVALID: Code = Code(15);
    pub const PERMISSION: Code = Code(16);
    pub const MSG_TOO_LARGE: Code = Code(17);
    pub const CONN_ABORTED: Code = Code(18);
    pub const CONN_RESET: Code = Code(19);
    pub const CANCELED: Code = Code(20);
    pub const NO_FILES: Code = Code(21);
    pub const NO_SPACE: Code = Code(22);
    pub const EXISTS: Code = Code(23);
    pub const READ_ONLY: Code = Code(24);
    pub const WRITE_ONLY: Code = Code(25);
    pub const CRYPTO: Code = Code(26);
    pub const PEER_AUTH: Code = Code(27);
    pub const NO_ARGUMENT: Code = Code(28);
    pub const AMBIGUOUS: Code = Code(29);
    pub const BAD_TYPE: Code = Code(30);
    pub const CONN_SHUTDOWN: Code = Code(31);
    pub const INTERNAL: Code = Code(1000);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// The message associated with this code.
    pub fn strerror(self) -> &'static str {
        strerror(self.0)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.0, self.strerror())
    }
}

/// Translates a raw status code into its message.
///
/// Unknown codes render as `"Unknown error"`.
pub fn strerror(code: i32) -> &'static str {
    match code {
        0 => "Hunky dory",
        1 => "Interrupted",
        2 => "Out of memory",
        3 => "Invalid argument",
        4 => "Resource busy",
        5 => "Timed out",
        6 => "Connection refused",
        7 => "Object closed",
        8 => "Try again",
        9 => "Not supported",
        10 => "Address in use",
        11 => "Incorrect state",
        12 => "Entry not found",
        13 => "Protocol error",
        14 => "Destination unreachable",
        15 => "Address invalid",
        16 => "Permission denied",
        17 => "Message too large",
        18 => "Connection aborted",
        19 => "Connection reset",
        20 => "Operation canceled",
        21 => "Out of files",
        22 => "Out of space",
        23 => "Resource already exists",
        24 => "Read only resource",
        25 => "Write only resource",
        26 => "Cryptographic error",
        27 => "Peer could not be authenticated",
        28 => "Option requires argument",
        29 => "Ambiguous option",
        30 => "Incorrect type",
        31 => "Connection shutdown",
        1000 => "Internal error",
        _ => "Unknown error",
    }
}

/// Errors surfaced by every operation in this crate.
///
/// `Timeout` and `Closed` get their own variants because callers branch on
/// them; everything else carries the transport's [`Code`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{}", Code::TIMED_OUT)]
    Timeout,
    #[error("{}", Code::CLOSED)]
    Closed,
    #[error("{0}")]
    Transport(Code),
    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: usize },
}

impl Error {
    pub fn from_code(code: Code) -> Self {
        match code {
            Code::TIMED_OUT => Self::Timeout,
            Code::CLOSED => Self::Closed,
            code => Self::Transport(code),
        }
    }

    /// The status code an AIO handle records for this error.
    ///
    /// Redirect exhaustion has no transport code of its own and reports as a
    /// protocol error.
    pub fn code(&self) -> Code {
        match self {
            Self::Timeout => Code::TIMED_OUT,
            Self::Closed => Code::CLOSED,
            Self::Transport(code) => *code,
            Self::TooManyRedirects { .. } => Code::PROTOCOL,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Self::from_code(code)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_code(crate::sys::code_of(&err))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Transport(crate::sys::tls_code(&err))
    }
}

pub type Result<T> = core::result::Result<T, Error>;
