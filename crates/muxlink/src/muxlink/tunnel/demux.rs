//! Accept loop over the tunnel session: every inbound stream names its route in
//! a 4-byte header and is bridged to the matching local target.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    sync::{OwnedSemaphorePermit, Semaphore},
};

use crate::muxlink::{
    net::Dialer,
    tunnel::{
        bridge::{self, BridgeEnd, BridgeHandles},
        protocol,
        registry::{Registry, RouteId},
        transport::{BoxedStream, TransportSession},
    },
};

pub const DEFAULT_LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("tunnel: can not accept stream: {0}")]
    Accept(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Bridged,
    BadHeader,
    UnknownRoute,
    DialFailed,
    NotConnected,
}

impl StreamOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            StreamOutcome::Bridged => "bridged",
            StreamOutcome::BadHeader => "bad_header",
            StreamOutcome::UnknownRoute => "unknown_route",
            StreamOutcome::DialFailed => "dial_failed",
            StreamOutcome::NotConnected => "not_connected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DemuxOptions {
    pub local_dial_timeout: Duration,
    /// Upper bound on concurrently routed streams; `0` disables the limit.
    pub max_bridges: usize,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            local_dial_timeout: DEFAULT_LOCAL_DIAL_TIMEOUT,
            max_bridges: 1024,
        }
    }
}

/// Shared by every per-stream task.
pub struct Router {
    registry: Arc<Registry>,
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    server: String,
}

impl Router {
    pub fn new(registry: Arc<Registry>, dialer: Arc<dyn Dialer>, dial_timeout: Duration) -> Self {
        let dial_timeout = if dial_timeout <= Duration::from_millis(0) {
            DEFAULT_LOCAL_DIAL_TIMEOUT
        } else {
            dial_timeout
        };
        Self {
            registry,
            dialer,
            dial_timeout,
            server: "server".to_string(),
        }
    }

    /// Names the server end of bridged streams in logs.
    pub fn with_server(mut self, server: String) -> Self {
        self.server = server;
        self
    }

    fn remote_peer(&self, id: RouteId) -> String {
        format!("{}#{id}", self.server)
    }

    /// Routes one inbound stream. Failures close only this stream, after
    /// writing a diagnostic line onto it.
    pub async fn handle_stream(
        &self,
        mut st: BoxedStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> StreamOutcome {
        let outcome = self.route(&mut st).await;
        let outcome = match outcome {
            Ok((id, local)) => {
                tracing::info!(route_id = id, local = %local.peer, "tunnel: local connected; bridge started");
                // The bridge owns both streams and the permit from here on.
                let handles = bridge::bridge(
                    BridgeEnd {
                        role: "local",
                        peer: local.peer,
                        stream: local.stream,
                    },
                    BridgeEnd {
                        role: "remote",
                        peer: self.remote_peer(id),
                        stream: st,
                    },
                    permit,
                );
                tokio::spawn(report_bridge(id, handles));
                StreamOutcome::Bridged
            }
            Err(outcome) => {
                let _ = st.shutdown().await;
                outcome
            }
        };
        metrics::counter!("muxlink_streams_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn route(
        &self,
        st: &mut BoxedStream,
    ) -> Result<(RouteId, crate::muxlink::net::LocalConn), StreamOutcome> {
        let id = match protocol::read_route_id(st).await {
            Ok(id) => id,
            Err(err) => {
                let msg = format!("read route id failed: {err}");
                tracing::warn!(err = %err, "tunnel: {msg}");
                protocol::write_diagnostic(st, &msg).await;
                return Err(StreamOutcome::BadHeader);
            }
        };
        tracing::debug!(route_id = id, "tunnel: stream header read");

        let Some(target) = self.registry.resolve(id) else {
            let msg = format!("invalid route id: {id}");
            tracing::warn!(route_id = id, "tunnel: {msg}");
            protocol::write_diagnostic(st, &msg).await;
            return Err(StreamOutcome::UnknownRoute);
        };

        tracing::info!(route_id = id, target = %target, "tunnel: connecting to local target");

        match self.dialer.dial(&target, self.dial_timeout).await {
            Ok(Some(local)) => Ok((id, local)),
            Ok(None) => {
                tracing::info!(route_id = id, target = %target, "tunnel: dial returned no connection; closing stream");
                Err(StreamOutcome::NotConnected)
            }
            Err(err) => {
                let msg = format!("target connection to {target} failed: {err}.");
                tracing::warn!(route_id = id, target = %target, err = %err, "tunnel: failed to connect local");
                protocol::write_diagnostic(st, &msg).await;
                Err(StreamOutcome::DialFailed)
            }
        }
    }
}

async fn report_bridge(id: RouteId, handles: BridgeHandles) {
    let (up, down) = tokio::join!(handles.forward, handles.backward);
    if let (Ok(up), Ok(down)) = (up, down) {
        tracing::debug!(
            route_id = id,
            bytes_to_remote = up.bytes,
            bytes_to_local = down.bytes,
            local_end = up.reason.as_str(),
            remote_end = down.reason.as_str(),
            "tunnel: bridge finished"
        );
    }
}

/// Accepts streams until the session fails; per-stream work runs on its own task.
///
/// Accepting never waits on the bridge limit. A stream over the limit is held
/// by its task, unread, until a permit frees up.
pub struct Demux {
    session: Arc<dyn TransportSession>,
    router: Arc<Router>,
    limiter: Option<Arc<Semaphore>>,
}

impl Demux {
    pub fn new(session: Arc<dyn TransportSession>, router: Arc<Router>, opts: &DemuxOptions) -> Self {
        let limiter = (opts.max_bridges > 0).then(|| Arc::new(Semaphore::new(opts.max_bridges)));
        Self {
            session,
            router,
            limiter,
        }
    }

    /// Runs until `shutdown` flips or accepting fails. An accept failure means
    /// the session is unusable and is returned to the caller.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), DemuxError> {
        loop {
            let st = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return Ok(()),
                st = self.session.accept_stream() => st.map_err(DemuxError::Accept)?,
            };
            tracing::debug!(server = %self.session.peer(), "tunnel: got new stream from server");

            let router = self.router.clone();
            let limiter = self.limiter.clone();
            tokio::spawn(async move {
                let permit = match limiter {
                    // The semaphore is never closed.
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                router.handle_stream(st, permit).await;
            });
        }
    }
}
