//! Server side of the QUIC transport

use super::handler::{handle_stream, StreamContext};
use super::log_stream_error;
use crate::error::TunnelError;
use crate::helper::Lifecycle;
use crate::transport::quic::QuicStream;
use quinn::ConnectionError;
use std::sync::Arc;
use tracing::debug;

/// Accept bidirectional streams on one incoming QUIC connection
pub async fn serve_connection(
    incoming: quinn::Incoming,
    ctx: Arc<StreamContext>,
    lifecycle: Lifecycle,
) -> Result<(), TunnelError> {
    let peer = incoming.remote_address();
    let conn = incoming
        .await
        .map_err(|e| TunnelError::Handshake(format!("QUIC handshake with {}: {}", peer, e)))?;
    debug!("QUIC connection from {}", peer);

    loop {
        let next = tokio::select! {
            _ = lifecycle.stopped() => break,
            next = conn.accept_bi() => next,
        };
        let (send, recv) = match next {
            Ok(stream) => stream,
            Err(
                ConnectionError::ApplicationClosed(_)
                | ConnectionError::ConnectionClosed(_)
                | ConnectionError::LocallyClosed
                | ConnectionError::TimedOut,
            ) => break,
            Err(e) => return Err(TunnelError::Transport(format!("QUIC {}: {}", peer, e))),
        };

        let ctx = ctx.clone();
        lifecycle.spawn(async move {
            if let Err(e) = handle_stream(QuicStream::new(send, recv), &ctx).await {
                log_stream_error(peer, &e);
            }
        });
    }

    debug!("QUIC connection from {} closed", peer);
    Ok(())
}
