use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
};

use crate::muxlink::tunnel::transport::{BoxedStream, TransportSession};

/// A yamux session over any byte stream (TCP, Unix socket, in-memory duplex).
///
/// The session itself is driven by a background task that forwards inbound
/// streams to `accept_stream` and flips `closed` once the connection ends.
/// Inbound streams queue without limit until accepted.
pub struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<tokio_yamux::StreamHandle>>,
    closed: watch::Receiver<bool>,
    peer: String,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    pub fn client<T>(c: T, peer: String) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = tokio_yamux::Session::new_client(c, tokio_yamux::Config::default());
        Self::from_session(session, peer)
    }

    #[cfg(test)]
    pub fn server<T>(c: T, peer: String) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = tokio_yamux::Session::new_server(c, tokio_yamux::Config::default());
        Self::from_session(session, peer)
    }

    fn from_session<T>(mut session: tokio_yamux::Session<T>, peer: String) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let control = session.control();

        // Unbounded: the driver must keep polling the session no matter how far
        // behind accept_stream is, or every stream on it stalls.
        let (tx, rx) = mpsc::unbounded_channel::<tokio_yamux::StreamHandle>();
        let (closed_tx, closed_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "tunnel: session error");
                        break;
                    }
                }
            }
            let _ = closed_tx.send(true);
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            closed: closed_rx,
            peer,
            task,
        }
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if self.is_closed() {
            anyhow::bail!("tunnel: session closed");
        }
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(st))
    }

    async fn close(&self) {
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }

    async fn closed(&self) {
        let mut rx = self.closed.clone();
        // An error means the driver task is gone, which is also a close.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
