use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::muxlink::{
    net::{Dialer, NetDialer},
    tunnel::{
        control::{ControlClient, ControlError, SessionRpc},
        demux::{Demux, DemuxError, DemuxOptions, Router},
        monitor::{self, SessionClosed},
        registry::{Registry, RouteId, Target},
        transport::{self, TransportSession},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Address the server should open on its side.
    pub remote: Target,
    /// Where streams for this route are dialed locally.
    pub local: Target,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: Target,
    pub dial_timeout: Duration,
    pub call_timeout: Duration,
    pub routes: Vec<RouteSpec>,
    pub demux: DemuxOptions,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("tunnel: connect: {0:#}")]
    Connect(anyhow::Error),
    #[error("tunnel: register {remote} -> {local}: {source}")]
    Register {
        remote: Target,
        local: Target,
        #[source]
        source: ControlError,
    },
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error(transparent)]
    SessionClosed(#[from] SessionClosed),
}

/// A connected tunnel client: one session, its route table, and the control
/// channel used to fill that table.
pub struct Client {
    opts: ClientOptions,
    session: Arc<dyn TransportSession>,
    registry: Arc<Registry>,
    control: ControlClient,
    dialer: Arc<dyn Dialer>,
}

impl Client {
    /// Dials the server and sets up the session. Failure here is fatal; there
    /// is no retry.
    pub async fn connect(mut opts: ClientOptions) -> Result<Self, ClientError> {
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        let session = transport::dial_session(&opts.server_addr, opts.dial_timeout)
            .await
            .map_err(ClientError::Connect)?;
        tracing::info!(server = %opts.server_addr, peer = %session.peer(), "tunnel: connected");
        Ok(Self::from_session(opts, session, Arc::new(NetDialer)))
    }

    pub fn from_session(
        opts: ClientOptions,
        session: Arc<dyn TransportSession>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let rpc = Arc::new(SessionRpc::new(session.clone(), opts.call_timeout));
        let control = ControlClient::new(rpc, registry.clone());
        Self {
            opts,
            session,
            registry,
            control,
            dialer,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn session(&self) -> Arc<dyn TransportSession> {
        self.session.clone()
    }

    /// Registers every configured route, in order. The first failure aborts.
    pub async fn register_routes(&self) -> Result<Vec<RouteId>, ClientError> {
        let mut ids = Vec::with_capacity(self.opts.routes.len());
        for r in &self.opts.routes {
            let id = self
                .control
                .open(&r.remote, r.local.clone())
                .await
                .map_err(|source| ClientError::Register {
                    remote: r.remote.clone(),
                    local: r.local.clone(),
                    source,
                })?;
            ids.push(id);
        }
        tracing::info!(routes = ids.len(), "tunnel: routes registered");
        Ok(ids)
    }

    /// Serves inbound streams until shutdown or until the session is lost.
    ///
    /// Losing the session is returned as an error; the caller decides whether
    /// that ends the process.
    pub async fn run(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), ClientError> {
        if self.registry.is_empty() {
            tracing::warn!("tunnel: no routes registered; every inbound stream will be rejected");
        }
        let router = Arc::new(
            Router::new(
                self.registry.clone(),
                self.dialer.clone(),
                self.opts.demux.local_dial_timeout,
            )
            .with_server(self.session.peer()),
        );
        let demux = Demux::new(self.session.clone(), router, &self.opts.demux);
        let mut watcher = tokio::spawn(monitor::watch_session(self.session.clone()));

        let res = tokio::select! {
            res = demux.run(shutdown) => match res {
                Ok(()) => {
                    self.session.close().await;
                    Ok(())
                }
                Err(err) if self.session.is_closed() => {
                    tracing::debug!(err = %err, "tunnel: accept failed after session close");
                    Err(ClientError::SessionClosed(SessionClosed { peer: self.session.peer() }))
                }
                Err(err) => Err(err.into()),
            },
            closed = &mut watcher => match closed {
                Ok(closed) => Err(closed.into()),
                Err(_) => Err(ClientError::SessionClosed(SessionClosed { peer: self.session.peer() })),
            },
        };
        watcher.abort();
        res
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::muxlink::tunnel::control::tests::{serve_control, session_pair};

    fn opts(routes: Vec<RouteSpec>) -> ClientOptions {
        ClientOptions {
            server_addr: Target::Tcp("127.0.0.1:7000".into()),
            dial_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            routes,
            demux: DemuxOptions::default(),
        }
    }

    #[tokio::test]
    async fn hello_reaches_registered_target() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let (client_sess, server) = session_pair();
        let control = serve_control(server.clone(), 7);

        let client = Client::from_session(
            opts(vec![RouteSpec {
                remote: Target::Tcp(":9000".into()),
                local: Target::Tcp(addr.to_string()),
            }]),
            client_sess,
            Arc::new(NetDialer),
        );
        assert_eq!(client.register_routes().await.unwrap(), vec![7]);
        control.abort();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let client = Arc::new(client);
        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run(rx).await })
        };

        let mut st = server.open_stream().await.unwrap();
        st.write_all(&[0x07, 0x00, 0x00, 0x00]).await.unwrap();
        st.write_all(b"hello").await.unwrap();
        st.flush().await.unwrap();

        let (mut local, _) = ln.accept().await.unwrap();
        let mut buf = [0u8; 5];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        runner.abort();
    }

    #[tokio::test]
    async fn registration_failure_is_fatal() {
        let (client_sess, server) = session_pair();
        serve_control(server.clone(), 1);

        let client = Client::from_session(
            opts(vec![
                RouteSpec {
                    remote: Target::Tcp(":8080".into()),
                    local: Target::Tcp("127.0.0.1:1".into()),
                },
                RouteSpec {
                    remote: Target::Tcp("busy:8081".into()),
                    local: Target::Tcp("127.0.0.1:2".into()),
                },
            ]),
            client_sess,
            Arc::new(NetDialer),
        );

        let err = client.register_routes().await.unwrap_err();
        assert!(matches!(err, ClientError::Register { .. }));
        assert!(err.to_string().contains("busy:8081 in use"));
        // The first route made it in before the failure.
        assert_eq!(client.registry().len(), 1);
    }

    #[tokio::test]
    async fn run_reports_session_loss() {
        let (client_sess, server) = session_pair();
        let client = Client::from_session(opts(vec![]), client_sess, Arc::new(NetDialer));

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let client = Arc::new(client);
        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run(rx).await })
        };

        server.close().await;
        drop(server);

        let res = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run returns")
            .unwrap();
        assert!(matches!(res, Err(ClientError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn run_returns_ok_on_shutdown() {
        let (client_sess, _server) = session_pair();
        let client = Client::from_session(opts(vec![]), client_sess, Arc::new(NetDialer));

        let (tx, rx) = tokio::sync::watch::channel(false);
        let client = Arc::new(client);
        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run(rx).await })
        };
        tx.send(true).unwrap();

        let res = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run returns")
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);

        let mut o = opts(vec![]);
        o.server_addr = Target::Tcp(addr.to_string());
        let res = Client::connect(o).await;
        assert!(matches!(res, Err(ClientError::Connect(_))));
    }
}
