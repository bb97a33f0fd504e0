//! Wire framing for protocol v0 and v1.
//!
//! Two formats coexist on the wire:
//!
//! - **v0**: an 8-byte header (4 reserved bytes, then the payload length as
//!   big-endian `u32`) followed by the payload. There is no handshake and no
//!   frame kind; both directions use the same shape. Server read paths cap
//!   request payloads at [`V0_MAX_PAYLOAD`].
//! - **v1**: an 8-byte header carrying an explicit protocol-version byte, a
//!   frame kind, two reserved bytes and the payload length as big-endian
//!   `u32`. A connection starts with a handshake-request/handshake-response
//!   exchange before any request frame is accepted.
//!
//! Which format a connection speaks is decided per endpoint from the
//! registry advertisement, never sniffed from the wire.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{CallError, FramingError, TransportError};

/// Protocol version spoken by v1 framing.
pub const PROTOCOL_V1: u8 = 1;

/// Header length shared by both formats.
pub const HEADER_LEN: usize = 8;

/// Cap for request payloads on the v0 server read path.
pub const V0_MAX_PAYLOAD: usize = 64 * 1024;

/// Sanity cap for v1 payloads and for v0 response reads on the client side.
pub const V1_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Kind byte of a v1 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    HandshakeRequest = 1,
    HandshakeResponse = 2,
    Request = 3,
    Response = 4,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::HandshakeRequest),
            2 => Some(Self::HandshakeResponse),
            3 => Some(Self::Request),
            4 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Write one v0 frame.
pub async fn write_frame_v0<W>(writer: &mut W, payload: &[u8]) -> Result<(), CallError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    writer
        .write_all(&header)
        .await
        .map_err(|e| CallError::Transport(TransportError::Io(e)))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| CallError::Transport(TransportError::Io(e)))?;
    writer
        .flush()
        .await
        .map_err(|e| CallError::Transport(TransportError::Io(e)))?;
    Ok(())
}

/// Read one v0 frame, rejecting payloads above `max_payload`.
///
/// A clean end of stream before the first header byte maps to
/// [`TransportError::Closed`]; an end of stream inside a frame is a
/// [`FramingError::Truncated`].
pub async fn read_frame_v0<R>(reader: &mut R, max_payload: usize) -> Result<Vec<u8>, CallError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_header(reader, &mut header).await?;

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > max_payload {
        return Err(FramingError::Oversize { len, max: max_payload }.into());
    }

    read_payload(reader, len).await
}

/// Write one v1 frame of the given kind.
pub async fn write_frame_v1<W>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), CallError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    header[0] = PROTOCOL_V1;
    header[1] = kind as u8;
    header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    writer
        .write_all(&header)
        .await
        .map_err(|e| CallError::Transport(TransportError::Io(e)))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| CallError::Transport(TransportError::Io(e)))?;
    writer
        .flush()
        .await
        .map_err(|e| CallError::Transport(TransportError::Io(e)))?;
    Ok(())
}

/// Read one v1 frame.
pub async fn read_frame_v1<R>(reader: &mut R) -> Result<(FrameKind, Vec<u8>), CallError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_header(reader, &mut header).await?;

    if header[0] != PROTOCOL_V1 {
        return Err(FramingError::UnknownVersion(header[0]).into());
    }
    let kind = FrameKind::from_u8(header[1]).ok_or(FramingError::UnknownKind(header[1]))?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > V1_MAX_PAYLOAD {
        return Err(FramingError::Oversize { len, max: V1_MAX_PAYLOAD }.into());
    }

    let payload = read_payload(reader, len).await?;
    Ok((kind, payload))
}

/// Read one v1 frame and require a specific kind.
pub async fn expect_frame_v1<R>(reader: &mut R, expected: FrameKind) -> Result<Vec<u8>, CallError>
where
    R: AsyncRead + Unpin,
{
    let (kind, payload) = read_frame_v1(reader).await?;
    if kind != expected {
        return Err(FramingError::UnexpectedKind { expected, got: kind }.into());
    }
    Ok(payload)
}

async fn read_header<R>(reader: &mut R, header: &mut [u8; HEADER_LEN]) -> Result<(), CallError>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CallError::Transport(TransportError::Closed)
        } else {
            CallError::Transport(TransportError::Io(e))
        }
    })?;
    Ok(())
}

async fn read_payload<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, CallError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CallError::Framing(FramingError::Truncated)
            } else {
                CallError::Transport(TransportError::Io(e))
            }
        })?;
    }
    Ok(payload)
}
