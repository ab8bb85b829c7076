//! Full-duplex byte bridge between a local connection and a tunnel stream.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
    sync::{OwnedSemaphorePermit, watch},
    task::JoinHandle,
};

use crate::muxlink::tunnel::transport::BoxedStream;

/// One side of a bridge pair.
pub struct BridgeEnd {
    /// Role label used only in diagnostics ("local", "remote").
    pub role: &'static str,
    pub peer: String,
    pub stream: BoxedStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The reading side returned end-of-stream.
    Eof,
    /// A read or write failed.
    Error,
    /// The opposite direction finished first and tore the pair down.
    PeerClosed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Eof => "eof",
            EndReason::Error => "error",
            EndReason::PeerClosed => "peer_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionReport {
    pub reason: EndReason,
    pub bytes: u64,
}

pub struct BridgeHandles {
    /// Copies bytes from the first end to the second.
    pub forward: JoinHandle<DirectionReport>,
    /// Copies bytes from the second end to the first.
    pub backward: JoinHandle<DirectionReport>,
}

// Held by both directions; released when the last one finishes.
struct PairGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

impl PairGuard {
    fn new(permit: Option<OwnedSemaphorePermit>) -> Self {
        metrics::counter!("muxlink_bridges_total").increment(1);
        metrics::gauge!("muxlink_active_bridges").increment(1.0);
        Self { _permit: permit }
    }
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        metrics::gauge!("muxlink_active_bridges").decrement(1.0);
    }
}

struct Side {
    tag: char,
    role: &'static str,
    peer: String,
}

/// Joins `a` and `b`, copying each way on its own task.
///
/// Whichever direction ends first (EOF or error) shuts down the stream it was
/// writing to and stops the other direction, so both connections close together.
/// Returns immediately; the handles may be dropped to detach.
pub fn bridge(a: BridgeEnd, b: BridgeEnd, permit: Option<OwnedSemaphorePermit>) -> BridgeHandles {
    let guard = Arc::new(PairGuard::new(permit));
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let side_a = Arc::new(Side {
        tag: 'A',
        role: a.role,
        peer: a.peer,
    });
    let side_b = Arc::new(Side {
        tag: 'B',
        role: b.role,
        peer: b.peer,
    });

    let (a_rd, a_wr) = tokio::io::split(a.stream);
    let (b_rd, b_wr) = tokio::io::split(b.stream);

    let forward = tokio::spawn(pump(
        side_a.clone(),
        a_rd,
        side_b.clone(),
        b_wr,
        stop_tx.clone(),
        stop_rx.clone(),
        guard.clone(),
    ));
    let backward = tokio::spawn(pump(side_b, b_rd, side_a, a_wr, stop_tx, stop_rx, guard));

    BridgeHandles { forward, backward }
}

async fn pump(
    from: Arc<Side>,
    rd: ReadHalf<BoxedStream>,
    to: Arc<Side>,
    mut wr: WriteHalf<BoxedStream>,
    stop_tx: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
    _guard: Arc<PairGuard>,
) -> DirectionReport {
    let mut src = Counted { inner: rd, bytes: 0 };
    let (reason, failure) = tokio::select! {
        r = tokio::io::copy(&mut src, &mut wr) => match r {
            Ok(_) => (EndReason::Eof, None),
            Err(err) => (EndReason::Error, Some(err)),
        },
        _ = stop_rx.wait_for(|stop| *stop) => (EndReason::PeerClosed, None),
    };
    let Counted { inner: rd, bytes } = src;

    let _ = stop_tx.send(true);
    let _ = wr.shutdown().await;
    drop(wr);
    drop(rd);

    metrics::counter!(
        "muxlink_bridge_bytes_total",
        "direction" => format!("{}_to_{}", from.role, to.role)
    )
    .increment(bytes);

    match &failure {
        Some(err) => tracing::info!(
            from = %format_args!("{}({}:{})", from.tag, from.role, from.peer),
            to = %format_args!("{}({}:{})", to.tag, to.role, to.peer),
            reason = reason.as_str(),
            bytes,
            err = %err,
            "bridge: EOF"
        ),
        None => tracing::info!(
            from = %format_args!("{}({}:{})", from.tag, from.role, from.peer),
            to = %format_args!("{}({}:{})", to.tag, to.role, to.peer),
            reason = reason.as_str(),
            bytes,
            "bridge: EOF"
        ),
    }

    DirectionReport { reason, bytes }
}

// Counts bytes pulled from the source, so a direction cut short by its peer
// still reports how much it moved.
struct Counted<R> {
    inner: R,
    bytes: u64,
}

impl<R: AsyncRead + Unpin> AsyncRead for Counted<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            self.bytes += (buf.filled().len() - before) as u64;
        }
        res
    }
}
