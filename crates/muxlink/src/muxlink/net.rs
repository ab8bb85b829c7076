use std::{borrow::Cow, time::Duration};

use async_trait::async_trait;

use crate::muxlink::tunnel::{registry::Target, transport::BoxedStream};

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// A dialed local connection plus a printable peer address for logs.
pub struct LocalConn {
    pub stream: BoxedStream,
    pub peer: String,
}

/// Opens local connections for routed streams.
///
/// `Ok(None)` means the dial neither failed nor produced a usable connection;
/// callers must treat it as "not connected".
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &Target, timeout: Duration) -> std::io::Result<Option<LocalConn>>;
}

/// Dials TCP and Unix-domain targets with the OS network stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDialer;

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, target: &Target, timeout: Duration) -> std::io::Result<Option<LocalConn>> {
        let fut = dial_target(target);
        if timeout > Duration::from_millis(0) {
            match tokio::time::timeout(timeout, fut).await {
                Ok(res) => res.map(Some),
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial timeout after {}", humantime::format_duration(timeout)),
                )),
            }
        } else {
            fut.await.map(Some)
        }
    }
}

async fn dial_target(target: &Target) -> std::io::Result<LocalConn> {
    match target {
        Target::Tcp(addr) => {
            let c = tokio::net::TcpStream::connect(addr.as_str()).await?;
            let _ = c.set_nodelay(true);
            let peer = c
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| addr.clone());
            Ok(LocalConn {
                stream: Box::new(c),
                peer,
            })
        }
        #[cfg(unix)]
        Target::Unix(path) => {
            let c = tokio::net::UnixStream::connect(path).await?;
            Ok(LocalConn {
                stream: Box::new(c),
                peer: path.display().to_string(),
            })
        }
        #[cfg(not(unix))]
        Target::Unix(_) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[tokio::test]
    async fn dials_tcp_target() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut c, _) = ln.accept().await.unwrap();
            c.write_all(b"hi").await.unwrap();
        });

        let conn = NetDialer
            .dial(&Target::Tcp(addr.to_string()), Duration::from_secs(5))
            .await
            .unwrap()
            .expect("connected");
        assert_eq!(conn.peer, addr.to_string());

        let mut st = conn.stream;
        let mut buf = [0u8; 2];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn refused_tcp_dial_is_an_error() {
        // Bind then drop to get a port that is very likely closed.
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);

        let res = NetDialer
            .dial(&Target::Tcp(addr.to_string()), Duration::from_secs(5))
            .await;
        assert!(res.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dials_unix_target() {
        let dir = std::env::temp_dir().join(format!("muxlink_net_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("app.sock");
        let _ = std::fs::remove_file(&path);

        let ln = tokio::net::UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut c, _) = ln.accept().await.unwrap();
            let mut buf = [0u8; 3];
            c.read_exact(&mut buf).await.unwrap();
            c.write_all(&buf).await.unwrap();
        });

        let conn = NetDialer
            .dial(&Target::Unix(path.clone()), Duration::from_secs(5))
            .await
            .unwrap()
            .expect("connected");
        let mut st = conn.stream;
        st.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
