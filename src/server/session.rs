use tracing::debug;

use crate::codec::{Command, Message};
use crate::error::{ProtocolError, Rejection};
use crate::handshake::{Handshake, Step};
use crate::mux::Multiplexer;

use super::Gatekeeper;

/// How a stream session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Closed,
    IdleTimeout,
    Disconnected,
    Rejected(Rejection),
}

/// Feed every inbound message of `mux` to `handshake` until the session ends.
///
/// Each wait for the next message is bounded by [`Gatekeeper::wait_for`];
/// expiry ends the session the same way a `Close` would.
pub(crate) async fn drive(
    gate: &Gatekeeper,
    mux: &Multiplexer,
    mut handshake: Handshake,
) -> SessionEnd {
    loop {
        let message = match mux.recv_timeout(gate.wait_for(handshake.state())).await {
            Ok(message) => message,
            Err(ProtocolError::Timeout { .. }) => {
                handshake.expire();
                return SessionEnd::IdleTimeout;
            }
            Err(ProtocolError::Closed) => return SessionEnd::Disconnected,
        };

        match handshake.on_message(&message) {
            Ok(Step::Reply(reply)) => {
                if !send_reply(mux, reply).await {
                    return SessionEnd::Disconnected;
                }
            }
            Ok(Step::Admitted) => {
                handshake.enter_data_exchange();
                if !send_reply(mux, content(gate)).await {
                    return SessionEnd::Disconnected;
                }
            }
            Ok(Step::Deliver) => {
                if !send_reply(mux, content(gate)).await {
                    return SessionEnd::Disconnected;
                }
            }
            Ok(Step::Finish(reply)) => {
                if let Some(reply) = reply {
                    send_reply(mux, reply).await;
                }
                return SessionEnd::Closed;
            }
            Err(rejection) => {
                if let Some(reply) = rejection.reply() {
                    send_reply(mux, reply).await;
                }
                return SessionEnd::Rejected(rejection);
            }
        }
    }
}

fn content(gate: &Gatekeeper) -> Message {
    Message::new(Command::Content, gate.payload())
}

async fn send_reply(mux: &Multiplexer, reply: Message) -> bool {
    match mux.send(reply).await {
        Ok(()) => true,
        Err(err) => {
            debug!(%err, "session reply not sent");
            false
        }
    }
}
