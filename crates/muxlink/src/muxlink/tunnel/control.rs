//! Control-plane client: asks the server to open a remote listener and binds the
//! returned route id to a local target.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::muxlink::tunnel::{
    protocol::{self, ControlMethod, ControlRequest, ProtocolError},
    registry::{Registry, RouteId, Target},
    transport::TransportSession,
};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control: open stream: {0}")]
    Open(anyhow::Error),
    #[error("control: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("control: {method} {address:?} rejected: {message}")]
    Rejected {
        method: ControlMethod,
        address: String,
        message: String,
    },
    #[error("control: {method} {address:?} returned no id")]
    MissingId {
        method: ControlMethod,
        address: String,
    },
    #[error("control: {method} {address:?} timed out after {timeout:?}")]
    Timeout {
        method: ControlMethod,
        address: String,
        timeout: Duration,
    },
}

/// The two registration calls of the control channel.
#[async_trait]
pub trait ControlRpc: Send + Sync {
    async fn open_tcp(&self, address: &str) -> Result<RouteId, ControlError>;
    async fn open_unix(&self, address: &str) -> Result<RouteId, ControlError>;
}

/// Control RPC carried over the tunnel session: one fresh logical stream per call.
pub struct SessionRpc {
    session: Arc<dyn TransportSession>,
    call_timeout: Duration,
}

impl SessionRpc {
    pub fn new(session: Arc<dyn TransportSession>, call_timeout: Duration) -> Self {
        Self {
            session,
            call_timeout,
        }
    }

    async fn call(&self, method: ControlMethod, address: &str) -> Result<RouteId, ControlError> {
        let fut = self.call_inner(method, address);
        if self.call_timeout > Duration::from_millis(0) {
            tokio::time::timeout(self.call_timeout, fut)
                .await
                .map_err(|_| ControlError::Timeout {
                    method,
                    address: address.to_string(),
                    timeout: self.call_timeout,
                })?
        } else {
            fut.await
        }
    }

    async fn call_inner(&self, method: ControlMethod, address: &str) -> Result<RouteId, ControlError> {
        let mut st = self.session.open_stream().await.map_err(ControlError::Open)?;

        let req = ControlRequest {
            method,
            address: address.to_string(),
        };
        protocol::write_control_request(&mut st, &req).await?;
        let resp = protocol::read_control_response(&mut st).await?;
        let _ = st.shutdown().await;

        if let Some(message) = resp.error.filter(|m| !m.trim().is_empty()) {
            return Err(ControlError::Rejected {
                method,
                address: req.address,
                message,
            });
        }
        resp.id.ok_or(ControlError::MissingId {
            method,
            address: req.address,
        })
    }
}

#[async_trait]
impl ControlRpc for SessionRpc {
    async fn open_tcp(&self, address: &str) -> Result<RouteId, ControlError> {
        self.call(ControlMethod::OpenTcp, address).await
    }

    async fn open_unix(&self, address: &str) -> Result<RouteId, ControlError> {
        self.call(ControlMethod::OpenUnix, address).await
    }
}

/// Registers routes with the server and records them in the registry.
pub struct ControlClient {
    rpc: Arc<dyn ControlRpc>,
    registry: Arc<Registry>,
}

impl ControlClient {
    pub fn new(rpc: Arc<dyn ControlRpc>, registry: Arc<Registry>) -> Self {
        Self { rpc, registry }
    }

    pub async fn open_tcp(&self, remote: &str, target: Target) -> Result<RouteId, ControlError> {
        let id = self.rpc.open_tcp(remote).await?;
        self.record(ControlMethod::OpenTcp, remote, id, target);
        Ok(id)
    }

    pub async fn open_unix(&self, remote: &str, target: Target) -> Result<RouteId, ControlError> {
        let id = self.rpc.open_unix(remote).await?;
        self.record(ControlMethod::OpenUnix, remote, id, target);
        Ok(id)
    }

    /// Picks `OpenTCP` or `OpenUnix` from the remote address kind.
    pub async fn open(&self, remote: &Target, local: Target) -> Result<RouteId, ControlError> {
        match remote {
            Target::Tcp(_) => self.open_tcp(&remote.address(), local).await,
            Target::Unix(_) => self.open_unix(&remote.address(), local).await,
        }
    }

    fn record(&self, method: ControlMethod, remote: &str, id: RouteId, target: Target) {
        tracing::info!(route_id = id, method = %method, remote = %remote, target = %target, "tunnel: route registered");
        if let Some(prev) = self.registry.register(id, target) {
            tracing::warn!(route_id = id, previous = %prev, "tunnel: route id reused; overwriting");
        }
        metrics::counter!("muxlink_routes_registered_total").increment(1);
    }
}
