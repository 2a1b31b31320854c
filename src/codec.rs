//! Wire codec for the controller socket.
//!
//! Two frame shapes travel over a controller's WebSocket:
//!
//! - **Forward frame** (gateway → controller):
//!   `FWD: <id>\r\n<METHOD> <path> HTTP/<ver>\r\n<headers>\r\n\r\n<body>`.
//!   Header order is preserved from the incoming request; the body is the raw
//!   bytes as received.
//! - **Response frame** (controller → gateway): a header `RES: <id>`
//!   terminated by the first `\n`, then opaque body bytes. Only the header
//!   portion is UTF-8-validated; the body is never re-parsed.
//!
//! There is no length prefix; framing is by transport message boundary, so
//! decoding never allocates based on peer-supplied lengths.

use std::fmt;

use axum::extract::ws::Message;
use axum::http::{HeaderMap, Method, Version};
use rand::Rng;

/// Correlates a forwarded request with its reply. Rendered on the wire as
/// exactly four lowercase hex digits (`0000`..`ffff`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u16);

impl RequestId {
    /// Draw an id uniformly from the full 16-bit space.
    pub fn random() -> Self {
        Self(rand::rng().random::<u16>())
    }

    pub const fn from_u16(raw: u16) -> Self {
        Self(raw)
    }

    /// Parse the strict wire shape `[0-9a-f]{4}`. Uppercase digits, short or
    /// long strings, and non-hex bytes are all rejected.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 4 {
            return None;
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
        u16::from_str_radix(s, 16).ok().map(Self)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Serialize a forwarded HTTP request into frame bytes.
///
/// Headers are emitted in the order the HTTP parser yielded them, names
/// untouched beyond that parser's own normalization. An absent body yields an
/// empty body segment.
pub fn encode_forward_frame(
    id: RequestId,
    method: &Method,
    path: &str,
    version: Version,
    headers: &HeaderMap,
    body: &[u8],
) -> Vec<u8> {
    let head = format!("FWD: {id}\r\n{method} {path} HTTP/{}\r\n", version_label(version));
    let mut frame = Vec::with_capacity(head.len() + 256 + body.len());
    frame.extend_from_slice(head.as_bytes());
    for (name, value) in headers {
        frame.extend_from_slice(name.as_str().as_bytes());
        frame.extend_from_slice(b": ");
        frame.extend_from_slice(value.as_bytes());
        frame.extend_from_slice(b"\r\n");
    }
    frame.extend_from_slice(b"\r\n");
    frame.extend_from_slice(body);
    frame
}

/// Wrap encoded frame bytes in the right transport message: text when the
/// bytes are valid UTF-8 (the common case), binary otherwise.
pub fn frame_message(frame: Vec<u8>) -> Message {
    match String::from_utf8(frame) {
        Ok(text) => Message::Text(text.into()),
        Err(raw) => Message::Binary(raw.into_bytes().into()),
    }
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// No `\n` terminator anywhere in the frame.
    MissingTerminator,
    /// The header portion is not valid UTF-8.
    HeaderNotUtf8,
    /// The header is not `RES: ` followed by four lowercase hex digits.
    BadHeader,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::MissingTerminator => "missing header terminator",
            Self::HeaderNotUtf8 => "header is not valid UTF-8",
            Self::BadHeader => "malformed response header",
        };
        f.write_str(msg)
    }
}

/// A decoded response frame: the request id and the opaque reply body.
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseFrame<'a> {
    pub id: RequestId,
    pub body: &'a [u8],
}

impl<'a> ResponseFrame<'a> {
    /// Split the frame at the first `\n`. Everything before it must decode as
    /// UTF-8 and match `RES: <id>` exactly; everything after is the body,
    /// forwarded verbatim.
    pub fn parse(raw: &'a [u8]) -> Result<Self, FrameError> {
        let nl = raw
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(FrameError::MissingTerminator)?;
        let header = std::str::from_utf8(&raw[..nl]).map_err(|_| FrameError::HeaderNotUtf8)?;
        let id = header
            .strip_prefix("RES: ")
            .and_then(RequestId::parse)
            .ok_or(FrameError::BadHeader)?;
        Ok(Self {
            id,
            body: &raw[nl + 1..],
        })
    }
}
