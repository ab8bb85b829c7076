use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;

use crate::muxlink::tunnel::registry::Target;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// One multiplexed transport connection.
///
/// Implementations must allow `open_stream` and `accept_stream` to be called
/// concurrently from different tasks.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    /// Resolves once the underlying connection is gone, whoever closed it.
    async fn closed(&self);
    fn is_closed(&self) -> bool;
    /// Human-readable peer description (socket address or socket path).
    fn peer(&self) -> String;
}

pub mod yamux;

/// Dial the tunnel server and wrap the connection in a yamux client session.
pub async fn dial_session(
    server: &Target,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn TransportSession>> {
    let dial = async {
        match server {
            Target::Tcp(addr) => {
                let c = tokio::net::TcpStream::connect(addr.as_str()).await?;
                let _ = c.set_nodelay(true);
                let peer = c
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| addr.clone());
                Ok::<Arc<dyn TransportSession>, std::io::Error>(Arc::new(
                    yamux::YamuxSession::client(c, peer),
                ))
            }
            #[cfg(unix)]
            Target::Unix(path) => {
                let c = tokio::net::UnixStream::connect(path).await?;
                let session: Arc<dyn TransportSession> =
                    Arc::new(yamux::YamuxSession::client(c, path.display().to_string()));
                Ok(session)
            }
            #[cfg(not(unix))]
            Target::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    };

    if timeout > Duration::from_millis(0) {
        tokio::time::timeout(timeout, dial)
            .await
            .with_context(|| format!("tunnel: dial {server} timed out"))?
            .with_context(|| format!("tunnel: dial {server}"))
    } else {
        dial.await.with_context(|| format!("tunnel: dial {server}"))
    }
}
