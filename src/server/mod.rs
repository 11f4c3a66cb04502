//! Listeners that put a [`Handshake`] in front of the payload.
//!
//! [`DirectServer`] runs the whole exchange on one TCP connection.
//! [`RendezvousServer`] runs the handshake over UDP and hands admitted
//! clients a leased TCP endpoint for the payload.

mod direct;
mod rendezvous;
mod session;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub use direct::DirectServer;
pub use rendezvous::{RendezvousServer, SessionListener, TcpSessionListener};
pub use session::SessionEnd;

use crate::blocklist::Blocklist;
use crate::config::{ServerConfig, DEFAULT_CHALLENGE_TIMEOUT, MAX_DURATION};
use crate::handshake::{Flow, Handshake, HandshakeState};
use crate::payload::PayloadProvider;
use crate::pow::{HashPow, PowHandler};

/// Everything a listener shares between its connections.
#[derive(Clone)]
pub struct Gatekeeper {
    pow: Arc<dyn PowHandler>,
    payload: Arc<dyn PayloadProvider>,
    blocklist: Blocklist,
    difficulty: usize,
    timeout: Duration,
    challenge_timeout: Duration,
}

impl Gatekeeper {
    pub fn new(
        pow: Arc<dyn PowHandler>,
        payload: Arc<dyn PayloadProvider>,
        blocklist: Blocklist,
        difficulty: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            pow,
            payload,
            blocklist,
            difficulty,
            timeout: timeout.min(MAX_DURATION),
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
        }
    }

    /// How long a client may take to solve its challenge. Clamped to
    /// [`MAX_DURATION`], like the session timeout.
    pub fn with_challenge_timeout(mut self, challenge_timeout: Duration) -> Self {
        self.challenge_timeout = challenge_timeout.min(MAX_DURATION);
        self
    }

    pub fn from_config(config: &ServerConfig, payload: Arc<dyn PayloadProvider>) -> Self {
        Self::new(
            Arc::new(HashPow::new(config.algorithm)),
            payload,
            Blocklist::new(config.blocklist_capacity, config.blocklist_ttl),
            config.difficulty,
            config.timeout,
        )
        .with_challenge_timeout(config.challenge_timeout)
    }

    /// Fresh handshake for a client at `client`.
    pub fn handshake(&self, flow: Flow, client: IpAddr) -> Handshake {
        Handshake::new(
            flow,
            client,
            self.difficulty,
            self.pow.clone(),
            self.blocklist.clone(),
        )
    }

    pub fn payload(&self) -> Vec<u8> {
        self.payload.payload()
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn challenge_timeout(&self) -> Duration {
        self.challenge_timeout
    }

    /// Bound on the wait for the next message of a client in `state`.
    pub fn wait_for(&self, state: HandshakeState) -> Duration {
        match state {
            HandshakeState::ChallengeIssued => self.challenge_timeout,
            _ => self.timeout,
        }
    }
}

impl fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("pow", &self.pow)
            .field("difficulty", &self.difficulty)
            .field("timeout", &self.timeout)
            .field("challenge_timeout", &self.challenge_timeout)
            .finish_non_exhaustive()
    }
}
