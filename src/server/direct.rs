use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::handshake::Flow;
use crate::mux::Multiplexer;

use super::{session, Gatekeeper};

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handshake and payload on a single TCP connection.
#[derive(Debug)]
pub struct DirectServer {
    listener: TcpListener,
    gate: Gatekeeper,
}

impl DirectServer {
    pub async fn bind(addr: impl ToSocketAddrs, gate: Gatekeeper) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, gate })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `token` is cancelled. Each connection gets its
    /// own task and a child token.
    pub async fn listen(self, token: CancellationToken) -> Result<(), Error> {
        info!(addr = %self.local_addr()?, "direct server listening");
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "failed to accept connection");
                    if !backoff(&token).await {
                        break;
                    }
                    continue;
                }
            };
            let gate = self.gate.clone();
            let token = token.child_token();
            tokio::spawn(async move { serve_connection(gate, socket, peer, token).await });
        }
        info!("direct server stopped");
        Ok(())
    }
}

/// Sleep for [`ACCEPT_BACKOFF`]. Returns `false` if cancelled meanwhile.
async fn backoff(token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn serve_connection(
    gate: Gatekeeper,
    socket: TcpStream,
    peer: SocketAddr,
    token: CancellationToken,
) {
    debug!(%peer, "accepted connection");
    let mux = Multiplexer::stream(socket, peer, &token);
    let handshake = gate.handshake(Flow::Direct, peer.ip());
    let end = session::drive(&gate, &mux, handshake).await;
    debug!(%peer, ?end, "connection finished");
    mux.close().await;
}
