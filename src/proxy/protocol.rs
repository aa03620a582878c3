//! PostgreSQL v3 wire message framing and codec.
//!
//! Two decoder roles exist: the relay reads *frontend* messages from the
//! client side and *backend* messages from the server side. Messages the
//! relay does not need to understand are carried as [`FrontendMessage::Other`]
//! / [`BackendMessage::Other`] and re-encoded byte-for-byte.
//!
//! Every recognized message round-trips exactly: `encode(decode(bytes))`
//! reproduces `bytes`. The relay depends on this to forward authentication
//! scrambles and bound parameters without corrupting them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

// Frontend message tags.
pub const TAG_QUERY: u8 = b'Q';
pub const TAG_PARSE: u8 = b'P';
pub const TAG_BIND: u8 = b'B';
pub const TAG_EXECUTE: u8 = b'E';
pub const TAG_TERMINATE: u8 = b'X';

// Backend message tags.
pub const TAG_READY_FOR_QUERY: u8 = b'Z';
pub const TAG_ERROR_RESPONSE: u8 = b'E';
pub const TAG_COMMAND_COMPLETE: u8 = b'C';

/// Protocol version carried by a v3 startup message.
pub const PROTOCOL_VERSION_3: u32 = 196_608;
/// Magic codes sent in place of a protocol version.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

// PostgreSQL rejects messages beyond 1 GiB; anything larger is a framing bug.
const MAX_MESSAGE_LEN: usize = 0x4000_0000;
const MAX_STARTUP_LEN: usize = 10_000;

/// A framed message: one tag byte plus the length-prefixed payload
/// (length excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tag: u8,
    pub body: Bytes,
}

/// The untagged first message of a session: a startup message proper, an
/// SSLRequest, a GSSENCRequest, or a CancelRequest. The payload (including
/// the 4-byte version/code) is kept verbatim so forwarding is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub body: Bytes,
}

impl StartupMessage {
    /// The protocol version or request code in the first four payload bytes.
    pub fn code(&self) -> u32 {
        if self.body.len() < 4 {
            return 0;
        }
        u32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]])
    }

    /// SSLRequest or GSSENCRequest: the upstream answers with a single byte
    /// instead of a framed message.
    pub fn is_negotiation_request(&self) -> bool {
        matches!(self.code(), SSL_REQUEST_CODE | GSSENC_REQUEST_CODE)
    }

    pub fn is_cancel_request(&self) -> bool {
        self.code() == CANCEL_REQUEST_CODE
    }

    /// Looks up a startup parameter such as `user` or `database`.
    /// Only meaningful for protocol-3 startup messages.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        if self.code() != PROTOCOL_VERSION_3 {
            return None;
        }
        let mut rest = &self.body[4..];
        while let Some(end) = rest.iter().position(|&b| b == 0) {
            if end == 0 {
                break;
            }
            let key = std::str::from_utf8(&rest[..end]).ok()?;
            rest = &rest[end + 1..];
            let val_end = rest.iter().position(|&b| b == 0)?;
            let value = std::str::from_utf8(&rest[..val_end]).ok()?;
            if key == name {
                return Some(value);
            }
            rest = &rest[val_end + 1..];
        }
        None
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.body.len() as u32 + 4);
        dst.put_slice(&self.body);
    }
}

/// Messages sent by the client. Only the shapes the capture path inspects
/// are decoded; everything else stays opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query {
        sql: String,
    },
    Parse {
        name: String,
        query: String,
        param_types: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Other {
        tag: u8,
        body: Bytes,
    },
}

/// Messages sent by the server. `ReadyForQuery` bounds the startup phase,
/// `ErrorResponse` and `CommandComplete` feed the capture hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    ReadyForQuery {
        /// Transaction status: `I` idle, `T` in transaction, `E` failed.
        status: u8,
    },
    ErrorResponse {
        /// Ordered `(field type, value)` pairs as sent on the wire.
        fields: Vec<(u8, String)>,
    },
    CommandComplete {
        tag: String,
    },
    Other {
        tag: u8,
        body: Bytes,
    },
}

enum FieldError {
    Truncated(&'static str),
    NotUtf8,
}

impl FrontendMessage {
    /// Decodes a framed client message. Unknown tags and messages whose
    /// strings are not valid UTF-8 are returned opaquely; structurally
    /// malformed payloads for recognized tags are protocol errors.
    pub fn decode(frame: RawFrame) -> Result<Self> {
        let decoded = match frame.tag {
            TAG_QUERY => decode_query(&frame.body),
            TAG_PARSE => decode_parse(&frame.body),
            TAG_BIND => decode_bind(&frame.body),
            TAG_EXECUTE => decode_execute(&frame.body),
            tag => {
                return Ok(FrontendMessage::Other {
                    tag,
                    body: frame.body,
                })
            }
        };
        match decoded {
            Ok(msg) => Ok(msg),
            Err(FieldError::NotUtf8) => Ok(FrontendMessage::Other {
                tag: frame.tag,
                body: frame.body,
            }),
            Err(FieldError::Truncated(what)) => Err(Error::Protocol(format!(
                "malformed '{}' message: {what}",
                frame.tag as char
            ))),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            FrontendMessage::Query { sql } => write_message(dst, TAG_QUERY, |b| {
                put_cstring(b, sql);
            }),
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => write_message(dst, TAG_PARSE, |b| {
                put_cstring(b, name);
                put_cstring(b, query);
                b.put_i16(param_types.len() as i16);
                for oid in param_types {
                    b.put_u32(*oid);
                }
            }),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => write_message(dst, TAG_BIND, |b| {
                put_cstring(b, portal);
                put_cstring(b, statement);
                b.put_i16(param_formats.len() as i16);
                for code in param_formats {
                    b.put_i16(*code);
                }
                b.put_i16(params.len() as i16);
                for value in params {
                    match value {
                        Some(bytes) => {
                            b.put_i32(bytes.len() as i32);
                            b.put_slice(bytes);
                        }
                        None => b.put_i32(-1),
                    }
                }
                b.put_i16(result_formats.len() as i16);
                for code in result_formats {
                    b.put_i16(*code);
                }
            }),
            FrontendMessage::Execute { portal, max_rows } => {
                write_message(dst, TAG_EXECUTE, |b| {
                    put_cstring(b, portal);
                    b.put_i32(*max_rows);
                })
            }
            FrontendMessage::Other { tag, body } => write_message(dst, *tag, |b| {
                b.put_slice(body);
            }),
        }
    }
}

impl BackendMessage {
    /// Decodes a framed server message; the same opaque-fallback rules as
    /// [`FrontendMessage::decode`] apply.
    pub fn decode(frame: RawFrame) -> Result<Self> {
        let decoded = match frame.tag {
            TAG_READY_FOR_QUERY => decode_ready_for_query(&frame.body),
            TAG_ERROR_RESPONSE => decode_error_response(&frame.body),
            TAG_COMMAND_COMPLETE => decode_command_complete(&frame.body),
            tag => {
                return Ok(BackendMessage::Other {
                    tag,
                    body: frame.body,
                })
            }
        };
        match decoded {
            Ok(msg) => Ok(msg),
            Err(FieldError::NotUtf8) => Ok(BackendMessage::Other {
                tag: frame.tag,
                body: frame.body,
            }),
            Err(FieldError::Truncated(what)) => Err(Error::Protocol(format!(
                "malformed '{}' message: {what}",
                frame.tag as char
            ))),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            BackendMessage::ReadyForQuery { status } => {
                write_message(dst, TAG_READY_FOR_QUERY, |b| {
                    b.put_u8(*status);
                })
            }
            BackendMessage::ErrorResponse { fields } => {
                write_message(dst, TAG_ERROR_RESPONSE, |b| {
                    for (kind, value) in fields {
                        b.put_u8(*kind);
                        put_cstring(b, value);
                    }
                    b.put_u8(0);
                })
            }
            BackendMessage::CommandComplete { tag } => {
                write_message(dst, TAG_COMMAND_COMPLETE, |b| {
                    put_cstring(b, tag);
                })
            }
            BackendMessage::Other { tag, body } => write_message(dst, *tag, |b| {
                b.put_slice(body);
            }),
        }
    }

    /// The human-readable message field of an `ErrorResponse`, if present.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            BackendMessage::ErrorResponse { fields } => fields
                .iter()
                .find(|(kind, _)| *kind == b'M')
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

fn decode_query(body: &[u8]) -> std::result::Result<FrontendMessage, FieldError> {
    let mut cur = body;
    let sql = get_cstring(&mut cur)?;
    Ok(FrontendMessage::Query { sql })
}

fn decode_parse(body: &[u8]) -> std::result::Result<FrontendMessage, FieldError> {
    let mut cur = body;
    let name = get_cstring(&mut cur)?;
    let query = get_cstring(&mut cur)?;
    let n = get_count(&mut cur, "parameter type count")?;
    let mut param_types = Vec::with_capacity(n);
    for _ in 0..n {
        param_types.push(get_u32(&mut cur, "parameter type oid")?);
    }
    Ok(FrontendMessage::Parse {
        name,
        query,
        param_types,
    })
}

fn decode_bind(body: &[u8]) -> std::result::Result<FrontendMessage, FieldError> {
    let mut cur = body;
    let portal = get_cstring(&mut cur)?;
    let statement = get_cstring(&mut cur)?;

    let n_formats = get_count(&mut cur, "parameter format count")?;
    let mut param_formats = Vec::with_capacity(n_formats);
    for _ in 0..n_formats {
        param_formats.push(get_i16(&mut cur, "parameter format code")?);
    }

    let n_params = get_count(&mut cur, "parameter count")?;
    let mut params = Vec::with_capacity(n_params);
    for _ in 0..n_params {
        let len = get_i32(&mut cur, "parameter length")?;
        if len < 0 {
            params.push(None);
        } else {
            let len = len as usize;
            if cur.len() < len {
                return Err(FieldError::Truncated("parameter value"));
            }
            params.push(Some(cur[..len].to_vec()));
            cur = &cur[len..];
        }
    }

    let n_results = get_count(&mut cur, "result format count")?;
    let mut result_formats = Vec::with_capacity(n_results);
    for _ in 0..n_results {
        result_formats.push(get_i16(&mut cur, "result format code")?);
    }

    Ok(FrontendMessage::Bind {
        portal,
        statement,
        param_formats,
        params,
        result_formats,
    })
}

fn decode_execute(body: &[u8]) -> std::result::Result<FrontendMessage, FieldError> {
    let mut cur = body;
    let portal = get_cstring(&mut cur)?;
    let max_rows = get_i32(&mut cur, "row limit")?;
    Ok(FrontendMessage::Execute { portal, max_rows })
}

fn decode_ready_for_query(body: &[u8]) -> std::result::Result<BackendMessage, FieldError> {
    if body.len() != 1 {
        return Err(FieldError::Truncated("transaction status byte"));
    }
    Ok(BackendMessage::ReadyForQuery { status: body[0] })
}

fn decode_error_response(body: &[u8]) -> std::result::Result<BackendMessage, FieldError> {
    let mut cur = body;
    let mut fields = Vec::new();
    loop {
        if cur.is_empty() {
            return Err(FieldError::Truncated("field terminator"));
        }
        let kind = cur[0];
        cur = &cur[1..];
        if kind == 0 {
            break;
        }
        fields.push((kind, get_cstring(&mut cur)?));
    }
    Ok(BackendMessage::ErrorResponse { fields })
}

fn decode_command_complete(body: &[u8]) -> std::result::Result<BackendMessage, FieldError> {
    let mut cur = body;
    let tag = get_cstring(&mut cur)?;
    Ok(BackendMessage::CommandComplete { tag })
}

fn get_cstring(buf: &mut &[u8]) -> std::result::Result<String, FieldError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(FieldError::Truncated("unterminated string"))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| FieldError::NotUtf8)?
        .to_string();
    *buf = &buf[end + 1..];
    Ok(s)
}

fn get_i16(buf: &mut &[u8], what: &'static str) -> std::result::Result<i16, FieldError> {
    if buf.remaining() < 2 {
        return Err(FieldError::Truncated(what));
    }
    Ok(buf.get_i16())
}

// Counts are signed on the wire; a negative count is malformed and must not
// reach an allocation.
fn get_count(buf: &mut &[u8], what: &'static str) -> std::result::Result<usize, FieldError> {
    let n = get_i16(buf, what)?;
    if n < 0 {
        return Err(FieldError::Truncated(what));
    }
    Ok(n as usize)
}

fn get_i32(buf: &mut &[u8], what: &'static str) -> std::result::Result<i32, FieldError> {
    if buf.remaining() < 4 {
        return Err(FieldError::Truncated(what));
    }
    Ok(buf.get_i32())
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> std::result::Result<u32, FieldError> {
    if buf.remaining() < 4 {
        return Err(FieldError::Truncated(what));
    }
    Ok(buf.get_u32())
}

fn write_message(dst: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    dst.put_u8(tag);
    let len_at = dst.len();
    dst.put_u32(0);
    body(dst);
    let len = (dst.len() - len_at) as u32;
    dst[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Buffered frame reader over one direction of a session.
///
/// All reads are cancellation safe: bytes consumed from the socket stay in
/// the internal buffer, so a read future dropped by `select!` never loses a
/// partial frame.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Reads one tagged frame. Returns `Ok(None)` on a clean end-of-stream
    /// at a frame boundary; EOF inside a frame is a protocol error.
    pub async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "connection closed mid-message".to_string(),
                ));
            }
        }
    }

    /// Reads the untagged session-opening message.
    pub async fn next_startup(&mut self) -> Result<Option<StartupMessage>> {
        loop {
            if self.buf.len() >= 4 {
                let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                    as usize;
                if !(8..=MAX_STARTUP_LEN).contains(&len) {
                    return Err(Error::Protocol(format!("invalid startup length {len}")));
                }
                if self.buf.len() >= len {
                    let mut frame = self.buf.split_to(len);
                    frame.advance(4);
                    return Ok(Some(StartupMessage {
                        body: frame.freeze(),
                    }));
                }
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "connection closed mid-startup".to_string(),
                ));
            }
        }
    }

    /// Reads the single-byte answer to an SSLRequest / GSSENCRequest.
    pub async fn next_byte(&mut self) -> Result<u8> {
        while self.buf.is_empty() {
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::Protocol(
                    "connection closed during negotiation".to_string(),
                ));
            }
        }
        let byte = self.buf.split_to(1);
        Ok(byte[0])
    }

    fn take_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if !(4..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(Error::Protocol(format!(
                "invalid message length {len} for tag '{}'",
                self.buf[0] as char
            )));
        }
        if self.buf.len() < 1 + len {
            return Ok(None);
        }
        let tag = self.buf[0];
        let mut frame = self.buf.split_to(1 + len);
        frame.advance(5);
        Ok(Some(RawFrame {
            tag,
            body: frame.freeze(),
        }))
    }
}
