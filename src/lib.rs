//! Proof-of-work gated request/response protocol.
//!
//! A server hands out a short payload only to clients that first solve a
//! puzzle bound to their own IP address. Failed clients land on a short-lived
//! blocklist. Two transport shapes share one [`Handshake`] state machine:
//!
//! - [`server::DirectServer`] runs challenge, solution and payload on one TCP
//!   connection.
//! - [`server::RendezvousServer`] runs the challenge over UDP and leases an
//!   admitted client a dedicated TCP endpoint from a [`SessionPool`].
//!
//! Frames are a 4-byte big-endian length followed by a bincode envelope, see
//! [`codec`]. Each socket is owned by a [`Multiplexer`] with separate read and
//! write loops.

pub mod blocklist;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod mux;
pub mod payload;
pub mod pool;
pub mod pow;
pub mod server;
pub mod solver;

pub use blocklist::Blocklist;
pub use client::{DirectClient, RendezvousClient};
pub use codec::{Command, Message, MessageCodec};
pub use config::{ClientConfig, Mode, ServerConfig};
pub use error::{ClientError, CodecError, Error, PoolError, PowError, ProtocolError, Rejection};
pub use handshake::{Flow, Handshake, HandshakeState, Step};
pub use mux::Multiplexer;
pub use payload::{PayloadProvider, Quotes};
pub use pool::{Lease, SessionPool};
pub use pow::{Condition, HashPow, PowAlgorithm, PowHandler, Puzzle};
pub use server::{Gatekeeper, SessionEnd};
pub use solver::{Solver, SolverBuilder, StopFlag};
