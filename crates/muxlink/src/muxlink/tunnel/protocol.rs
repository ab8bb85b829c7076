use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::muxlink::tunnel::registry::RouteId;

const MAGIC_CONTROL_REQUEST: &[u8; 4] = b"MXRC"; // muxlink RPC call
const MAGIC_CONTROL_RESPONSE: &[u8; 4] = b"MXRS"; // muxlink RPC response
const PROTOCOL_V1: u8 = 1;

pub const MAX_CONTROL_JSON_BYTES: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMethod {
    OpenTcp,
    OpenUnix,
}

impl std::fmt::Display for ControlMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMethod::OpenTcp => write!(f, "OpenTCP"),
            ControlMethod::OpenUnix => write!(f, "OpenUnix"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub method: ControlMethod,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RouteId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn write_control_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &ControlRequest,
) -> Result<(), ProtocolError> {
    write_frame(w, MAGIC_CONTROL_REQUEST, req).await
}

#[cfg(test)]
pub async fn read_control_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ControlRequest, ProtocolError> {
    read_frame(r, MAGIC_CONTROL_REQUEST).await
}

#[cfg(test)]
pub async fn write_control_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    resp: &ControlResponse,
) -> Result<(), ProtocolError> {
    write_frame(w, MAGIC_CONTROL_RESPONSE, resp).await
}

pub async fn read_control_response<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ControlResponse, ProtocolError> {
    read_frame(r, MAGIC_CONTROL_RESPONSE).await
}

async fn write_frame<W, T>(w: &mut W, magic: &[u8; 4], v: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let b = serde_json::to_vec(v)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_CONTROL_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    w.write_all(magic).await?;
    w.write_u8(PROTOCOL_V1).await?;
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(r: &mut R, magic: &[u8; 4]) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut got = [0u8; 4];
    r.read_exact(&mut got).await?;
    if &got != magic {
        return Err(ProtocolError::BadMagic);
    }

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion);
    }

    let n = r.read_u32().await?;
    if n > MAX_CONTROL_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Reads the 4-byte little-endian route id that prefixes every data stream.
pub async fn read_route_id<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<RouteId> {
    r.read_u32_le().await
}

#[cfg(test)]
pub async fn write_route_id<W: AsyncWrite + Unpin>(w: &mut W, id: RouteId) -> std::io::Result<()> {
    w.write_u32_le(id).await
}

/// Writes a plaintext diagnostic line onto a stream the peer is still reading.
///
/// Best effort: the stream is about to be closed anyway, so write errors are ignored.
pub async fn write_diagnostic<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, msg: &str) {
    let mut line = String::with_capacity(msg.len() + 1);
    line.push_str(msg);
    line.push('\n');
    let _ = w.write_all(line.as_bytes()).await;
    let _ = w.flush().await;
}
