use std::sync::Arc;

use thiserror::Error;

use crate::muxlink::tunnel::transport::TransportSession;

#[derive(Debug, Error)]
#[error("tunnel: connection dropped by server ({peer})")]
pub struct SessionClosed {
    pub peer: String,
}

/// Waits for the session to go away. There is no reconnect: the caller is
/// expected to treat the returned value as fatal.
pub async fn watch_session(session: Arc<dyn TransportSession>) -> SessionClosed {
    session.closed().await;
    let peer = session.peer();
    tracing::error!(server = %peer, "tunnel: connection dropped by server");
    SessionClosed { peer }
}
