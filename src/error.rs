use std::io;

use crate::codec::Command;
use crate::handshake::HandshakeState;

/// Crate-level error for setup and bootstrap paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures of the nonce search.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PowError {
    #[error("could not find a solution")]
    NotFound,
    #[error("solution search was cancelled")]
    Cancelled,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("solver failed: {0}")]
    SolverFailed(String),
}

/// Errors raised while framing or parsing a [`crate::Message`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unknown command tag {0}")]
    UnknownCommand(i32),
    #[error("datagram message has no destination peer")]
    MissingPeer,
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Outcomes of a multiplexer wait that callers branch on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("no message received within {duration_ms} ms")]
    Timeout { duration_ms: u64 },
    #[error("protocol channels are closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("session pool is exhausted")]
    Exhausted,
}

/// Why a handshake ended in [`HandshakeState::Rejected`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("client is blocklisted")]
    Blocked,
    #[error("solution does not satisfy the puzzle")]
    InvalidSolution,
    /// A solution arrived after its challenge was forgotten.
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("unexpected {command:?} while {state:?}")]
    UnexpectedCommand {
        state: HandshakeState,
        command: Command,
    },
    #[error("session pool is exhausted")]
    PoolExhausted,
    #[error("session endpoint is unavailable")]
    EndpointUnavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server rejected the solution")]
    InvalidHash,
    #[error("unexpected {0:?} reply")]
    WrongCommand(Command),
    #[error("server refused the session: {0}")]
    Refused(String),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Pow(#[from] PowError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
