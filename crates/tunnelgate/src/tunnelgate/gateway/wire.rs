//! Wire shapes carried over the control transport.
//!
//! Three layouts live here:
//! - the `tcpip-forward` payload in SSH wire encoding,
//! - the sideband command payload sent on a data channel,
//! - the request frames and preamble used by the mux transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC_PREAMBLE: &[u8; 4] = b"TGCT"; // TunnelGate Control Transport
pub const PROTOCOL_V1: u8 = 1;

pub const MAX_TOKEN_BYTES: u32 = 4096;
pub const MAX_PAYLOAD_BYTES: u32 = 1 << 20; // 1 MiB

pub const STATUS_OK: u8 = 0;
pub const STATUS_UNAUTHORIZED: u8 = 1;

const FLAG_WANT_REPLY: u8 = 0x01;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("short read")]
    ShortRead,
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    #[error("request kind too long: {0}")]
    KindTooLong(usize),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Body of a `tcpip-forward` global request.
///
/// The origin fields are reserved by the wire format and unused by the
/// gateway; a payload that omits them still decodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardRequest {
    pub address: String,
    pub port: u32,
    pub origin_address: String,
    pub origin_port: u32,
}

impl ForwardRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut b = payload;
        let address = get_string(&mut b)?;
        let port = get_u32(&mut b)?;

        let mut req = ForwardRequest {
            address,
            port,
            ..Default::default()
        };
        if b.has_remaining() {
            req.origin_address = get_string(&mut b)?;
            req.origin_port = get_u32(&mut b)?;
        }
        if b.has_remaining() {
            return Err(WireError::TrailingBytes(b.remaining()));
        }
        Ok(req)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(16 + self.address.len() + self.origin_address.len());
        put_string(&mut out, &self.address);
        out.put_u32(self.port);
        put_string(&mut out, &self.origin_address);
        out.put_u32(self.origin_port);
        out.freeze()
    }
}

fn get_u32(b: &mut &[u8]) -> Result<u32, WireError> {
    if b.remaining() < 4 {
        return Err(WireError::ShortRead);
    }
    Ok(b.get_u32())
}

fn get_string(b: &mut &[u8]) -> Result<String, WireError> {
    let n = get_u32(b)? as usize;
    if b.remaining() < n {
        return Err(WireError::ShortRead);
    }
    let s = String::from_utf8_lossy(&b[..n]).into_owned();
    b.advance(n);
    Ok(s)
}

fn put_string(out: &mut BytesMut, s: &str) {
    let n: u32 = s.len().try_into().unwrap_or(u32::MAX);
    out.put_u32(n);
    out.put_slice(s.as_bytes());
}

/// Classification of one request payload received on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sideband {
    /// Four bytes or fewer: nothing to parse.
    TooShort,
    /// Neither `tcp` nor `http` appears anywhere in the payload.
    Internal,
    /// The command string, truncated to the bytes actually present.
    Command(String),
}

/// Splits a `[u32 BE length][command]` payload.
pub fn decode_sideband(payload: &[u8]) -> Sideband {
    if payload.len() <= 4 {
        return Sideband::TooShort;
    }

    let whole = String::from_utf8_lossy(payload);
    if !whole.contains("tcp") && !whole.contains("http") {
        return Sideband::Internal;
    }

    let declared = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let end = 4usize.saturating_add(declared).min(payload.len());
    Sideband::Command(String::from_utf8_lossy(&payload[4..end]).into_owned())
}

pub fn encode_sideband(command: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + command.len());
    put_string(&mut out, command);
    out.freeze()
}

/// One request on a mux stream.
///
/// ```text
/// [u8 kind_len][kind][u8 flags][u32 BE payload_len][payload]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub kind: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: &str,
    want_reply: bool,
    payload: &[u8],
) -> Result<(), WireError> {
    let k = kind.as_bytes();
    let kind_len: u8 = k.len().try_into().map_err(|_| WireError::KindTooLong(k.len()))?;
    let n: u32 = payload.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_PAYLOAD_BYTES {
        return Err(WireError::PayloadTooLarge(n));
    }

    let mut buf = BytesMut::with_capacity(6 + k.len() + payload.len());
    buf.put_u8(kind_len);
    buf.put_slice(k);
    buf.put_u8(if want_reply { FLAG_WANT_REPLY } else { 0 });
    buf.put_u32(n);
    buf.put_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Reads the next request frame; `Ok(None)` on a clean EOF between frames.
pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<RequestFrame>, WireError> {
    let kind_len = match r.read_u8().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut kind = vec![0u8; kind_len];
    r.read_exact(&mut kind).await?;
    let flags = r.read_u8().await?;

    let n = r.read_u32().await?;
    if n > MAX_PAYLOAD_BYTES {
        return Err(WireError::PayloadTooLarge(n));
    }
    let mut payload = vec![0u8; n as usize];
    r.read_exact(&mut payload).await?;

    Ok(Some(RequestFrame {
        kind: String::from_utf8_lossy(&kind).into_owned(),
        want_reply: flags & FLAG_WANT_REPLY != 0,
        payload: Bytes::from(payload),
    }))
}
