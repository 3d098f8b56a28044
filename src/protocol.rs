use core::fmt;
use core::str::FromStr;

use crate::error::{Code, Error};

/// Scalability protocols a socket can speak.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Bus,
    Pair,
    Push,
    Pull,
    Pub,
    Sub,
    Req,
    Rep,
}

impl Protocol {
    /// The 16-bit protocol number exchanged in the connection header.
    pub const fn id(self) -> u16 {
        match self {
            Self::Pair => 0x10,
            Self::Pub => 0x20,
            Self::Sub => 0x21,
            Self::Req => 0x30,
            Self::Rep => 0x31,
            Self::Push => 0x50,
            Self::Pull => 0x51,
            Self::Bus => 0x70,
        }
    }

    pub const fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            0x10 => Self::Pair,
            0x20 => Self::Pub,
            0x21 => Self::Sub,
            0x30 => Self::Req,
            0x31 => Self::Rep,
            0x50 => Self::Push,
            0x51 => Self::Pull,
            0x70 => Self::Bus,
            _ => return None,
        })
    }

    /// The only protocol this one may be connected to.
    pub const fn peer(self) -> Self {
        match self {
            Self::Bus => Self::Bus,
            Self::Pair => Self::Pair,
            Self::Push => Self::Pull,
            Self::Pull => Self::Push,
            Self::Pub => Self::Sub,
            Self::Sub => Self::Pub,
            Self::Req => Self::Rep,
            Self::Rep => Self::Req,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Bus => "bus",
            Self::Pair => "pair",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Pub => "pub",
            Self::Sub => "sub",
            Self::Req => "req",
            Self::Rep => "rep",
        }
    }

    pub(crate) const fn can_send(self) -> bool {
        !matches!(self, Self::Pull | Self::Sub)
    }

    pub(crate) const fn can_recv(self) -> bool {
        !matches!(self, Self::Push | Self::Pub)
    }

    pub(crate) const fn has_contexts(self) -> bool {
        matches!(self, Self::Req | Self::Rep)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bus" => Self::Bus,
            "pair" => Self::Pair,
            "push" => Self::Push,
            "pull" => Self::Pull,
            "pub" => Self::Pub,
            "sub" => Self::Sub,
            "req" => Self::Req,
            "rep" => Self::Rep,
            _ => Err(Code::INVALID)?,
        })
    }
}

pub(crate) const HEADER_LEN: usize = 8;

/// Largest message body accepted off the wire.
pub(crate) const MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Marks the final (originating) hop of a request id.
pub(crate) const REQUEST_ID_BIT: u32 = 0x8000_0000;

/// The connection header: `0x00 'S' 'P' 0x00`, the protocol id, two
/// reserved zero bytes.
pub(crate) fn header(protocol: Protocol) -> [u8; HEADER_LEN] {
    let [hi, lo] = protocol.id().to_be_bytes();

    [0, b'S', b'P', 0, hi, lo, 0, 0]
}

pub(crate) fn parse_header(header: &[u8; HEADER_LEN]) -> Option<Protocol> {
    if header[..4] != [0, b'S', b'P', 0] || header[6..] != [0, 0] {
        return None;
    }

    Protocol::from_id(u16::from_be_bytes([header[4], header[5]]))
}

/// Prefixes a request or reply body with its 32-bit request id.
pub(crate) fn encode_request(id: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + body.len());

    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(body);

    frame
}

pub(crate) fn decode_request(frame: &[u8]) -> Option<(u32, &[u8])> {
    if frame.len() < 4 {
        return None;
    }

    let (id, body) = frame.split_at(4);
    let id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);

    (id & REQUEST_ID_BIT != 0).then_some((id, body))
}
