//! Server-side admission state machine.
//!
//! A [`Handshake`] is fed every inbound message of one client and answers
//! with the next [`Step`]. It owns the client's [`Puzzle`] from the moment the
//! challenge is issued until the one and only solution attempt is checked.
//! Transport concerns (sockets, pool leases, payload delivery) stay with the
//! caller.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::blocklist::Blocklist;
use crate::codec::{Command, Message};
use crate::error::Rejection;
use crate::pow::{PowHandler, Puzzle};

/// Body of the `Close` reply sent when no session endpoint is free.
pub const POOL_EXHAUSTED_BODY: &[u8] = b"session pool is exhausted";

/// Body of the `Close` reply to a solution whose challenge is gone.
pub const CHALLENGE_EXPIRED_BODY: &[u8] = b"challenge expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    AwaitingVerify,
    ChallengeIssued,
    /// Transient: held only while [`Handshake::on_message`] checks a
    /// solution, which always leaves the handshake `Admitted` or `Rejected`.
    AwaitingSolution,
    Admitted,
    DataExchange,
    Closed,
    Rejected,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Closed | HandshakeState::Rejected)
    }
}

/// Which transport shape the handshake runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// One TCP connection; the solution arrives as `Content{nonce}`.
    Direct,
    /// UDP rendezvous; the solution arrives as `Connect{nonce}` and admission
    /// leases a dedicated TCP endpoint.
    Rendezvous,
}

impl Flow {
    pub fn solution_command(self) -> Command {
        match self {
            Flow::Direct => Command::Content,
            Flow::Rendezvous => Command::Connect,
        }
    }
}

/// What the caller should do after feeding a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Reply(Message),
    /// The solution checked out. The caller finishes admission.
    Admitted,
    /// The client asked for the payload.
    Deliver,
    /// The session is over; send the message if any, then hang up.
    Finish(Option<Message>),
}

#[derive(Debug, Clone)]
pub struct Handshake {
    flow: Flow,
    identity: IpAddr,
    difficulty: usize,
    pow: Arc<dyn PowHandler>,
    blocklist: Blocklist,
    state: HandshakeState,
    puzzle: Option<Puzzle>,
}

impl Handshake {
    pub fn new(
        flow: Flow,
        identity: IpAddr,
        difficulty: usize,
        pow: Arc<dyn PowHandler>,
        blocklist: Blocklist,
    ) -> Self {
        Self {
            flow,
            identity: identity.to_canonical(),
            difficulty,
            pow,
            blocklist,
            state: HandshakeState::AwaitingVerify,
            puzzle: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn identity(&self) -> IpAddr {
        self.identity
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn on_message(&mut self, message: &Message) -> Result<Step, Rejection> {
        let command = message.command();
        debug!(identity = %self.identity, state = ?self.state, %command, "handshake input");

        if command == Command::Close {
            let reply = (self.state == HandshakeState::DataExchange)
                .then(|| Message::empty(Command::Close));
            self.state = HandshakeState::Closed;
            return Ok(Step::Finish(reply));
        }

        if self.state == HandshakeState::AwaitingVerify && self.blocklist.is_blocked(self.identity)
        {
            self.state = HandshakeState::Rejected;
            return Err(Rejection::Blocked);
        }

        match (self.state, command) {
            (HandshakeState::AwaitingVerify, Command::Verify | Command::Connect)
                if message.body().is_empty() =>
            {
                let puzzle = Puzzle::new(
                    self.pow.build_seed(),
                    self.difficulty,
                    self.pow.derive_condition(self.identity),
                );
                let reply = Message::new(command, puzzle.seed.to_vec());
                self.puzzle = Some(puzzle);
                self.state = HandshakeState::ChallengeIssued;
                Ok(Step::Reply(reply))
            }
            (HandshakeState::ChallengeIssued, c) if c == self.flow.solution_command() => {
                self.state = HandshakeState::AwaitingSolution;
                let accepted = match (self.puzzle.take(), parse_nonce(message.body())) {
                    (Some(puzzle), Some(nonce)) => puzzle.accepts(self.pow.as_ref(), nonce),
                    _ => false,
                };
                if !accepted {
                    return Err(self.reject(Rejection::InvalidSolution));
                }
                info!(identity = %self.identity, "client admitted");
                self.state = HandshakeState::Admitted;
                Ok(Step::Admitted)
            }
            // The rendezvous server forgets pending challenges after a while;
            // a solution landing on a fresh handshake is late, not wrong.
            (HandshakeState::AwaitingVerify, Command::Connect)
                if self.flow == Flow::Rendezvous =>
            {
                Err(self.reject(Rejection::ChallengeExpired))
            }
            (HandshakeState::DataExchange, Command::Content) => Ok(Step::Deliver),
            (state, command) => Err(self.reject(Rejection::UnexpectedCommand { state, command })),
        }
    }

    /// Move an admitted client onto the data phase.
    pub fn enter_data_exchange(&mut self) {
        if self.state == HandshakeState::Admitted {
            self.state = HandshakeState::DataExchange;
        }
    }

    /// The idle timeout fired. Same outcome as a `Close` from the client.
    pub fn expire(&mut self) {
        if !self.state.is_terminal() {
            debug!(identity = %self.identity, state = ?self.state, "handshake idle timeout");
            self.state = HandshakeState::Closed;
        }
    }

    /// End the handshake with `rejection`, recording protocol violations in
    /// the blocklist.
    pub fn reject(&mut self, rejection: Rejection) -> Rejection {
        if matches!(
            rejection,
            Rejection::InvalidSolution | Rejection::UnexpectedCommand { .. }
        ) {
            self.blocklist.block(self.identity);
        }
        info!(identity = %self.identity, %rejection, "handshake rejected");
        self.state = HandshakeState::Rejected;
        self.puzzle = None;
        rejection
    }
}

impl Rejection {
    /// Message owed to the client, if the rejection is not silent.
    pub fn reply(&self) -> Option<Message> {
        match self {
            Rejection::Blocked => None,
            Rejection::InvalidSolution | Rejection::UnexpectedCommand { .. } => {
                Some(Message::empty(Command::ErrInvalidHash))
            }
            Rejection::ChallengeExpired => {
                Some(Message::new(Command::Close, CHALLENGE_EXPIRED_BODY))
            }
            Rejection::PoolExhausted => Some(Message::new(Command::Close, POOL_EXHAUSTED_BODY)),
            Rejection::EndpointUnavailable => {
                Some(Message::new(Command::Close, self.to_string().into_bytes()))
            }
        }
    }
}

fn parse_nonce(body: &[u8]) -> Option<u64> {
    std::str::from_utf8(body).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::{Condition, HashPow, Seed};
    use std::net::Ipv4Addr;

    /// Real hashing with a fixed seed and condition, so nonce 255 solves at difficulty 1.
    #[derive(Debug)]
    struct FixedPow;

    impl PowHandler for FixedPow {
        fn build_seed(&self) -> Seed {
            [1u8; 32]
        }

        fn derive_condition(&self, _client: IpAddr) -> Condition {
            Condition {
                index: 23,
                byte: b'1',
            }
        }

        fn digest(&self, seed: &[u8], nonce: u64) -> Vec<u8> {
            HashPow::default().digest(seed, nonce)
        }

        fn validate(&self, digest: &[u8], condition: Condition, difficulty: usize) -> bool {
            HashPow::default().validate(digest, condition, difficulty)
        }
    }

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))
    }

    fn handshake(flow: Flow, blocklist: &Blocklist) -> Handshake {
        Handshake::new(flow, client(), 1, Arc::new(FixedPow), blocklist.clone())
    }

    fn challenge(hs: &mut Handshake, command: Command) {
        let step = hs.on_message(&Message::empty(command)).unwrap();
        assert_eq!(step, Step::Reply(Message::new(command, vec![1u8; 32])));
        assert_eq!(hs.state(), HandshakeState::ChallengeIssued);
    }

    #[test]
    fn direct_flow_reaches_data_exchange() {
        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Direct, &blocklist);
        challenge(&mut hs, Command::Verify);

        let step = hs.on_message(&Message::new(Command::Content, b"255".to_vec()));
        assert_eq!(step, Ok(Step::Admitted));
        assert_eq!(hs.state(), HandshakeState::Admitted);

        hs.enter_data_exchange();
        assert_eq!(hs.state(), HandshakeState::DataExchange);
        assert_eq!(
            hs.on_message(&Message::empty(Command::Content)),
            Ok(Step::Deliver)
        );
        assert_eq!(
            hs.on_message(&Message::empty(Command::Close)),
            Ok(Step::Finish(Some(Message::empty(Command::Close))))
        );
        assert_eq!(hs.state(), HandshakeState::Closed);
        assert!(!blocklist.is_blocked(client()));
    }

    #[test]
    fn rendezvous_flow_takes_solution_on_connect() {
        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Rendezvous, &blocklist);
        challenge(&mut hs, Command::Verify);
        assert_eq!(
            hs.on_message(&Message::new(Command::Connect, b"255".to_vec())),
            Ok(Step::Admitted)
        );
    }

    #[test]
    fn wrong_nonce_blocks_the_client() {
        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Direct, &blocklist);
        challenge(&mut hs, Command::Verify);

        let rejection = hs
            .on_message(&Message::new(Command::Content, b"254".to_vec()))
            .unwrap_err();
        assert_eq!(rejection, Rejection::InvalidSolution);
        assert_eq!(rejection.reply(), Some(Message::empty(Command::ErrInvalidHash)));
        assert_eq!(hs.state(), HandshakeState::Rejected);
        assert!(blocklist.is_blocked(client()));

        let mut retry = handshake(Flow::Direct, &blocklist);
        let rejection = retry.on_message(&Message::empty(Command::Verify)).unwrap_err();
        assert_eq!(rejection, Rejection::Blocked);
        assert_eq!(rejection.reply(), None);
    }

    #[test]
    fn garbage_nonce_is_an_invalid_solution() {
        let bodies: [&[u8]; 4] = [b"", b"abc", b"-1", b"99999999999999999999999"];
        for body in bodies {
            let blocklist = Blocklist::default();
            let mut hs = handshake(Flow::Direct, &blocklist);
            challenge(&mut hs, Command::Verify);
            assert_eq!(
                hs.on_message(&Message::new(Command::Content, body.to_vec())),
                Err(Rejection::InvalidSolution)
            );
        }
    }

    #[test]
    fn solution_is_checked_only_once() {
        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Direct, &blocklist);
        challenge(&mut hs, Command::Verify);
        assert!(hs
            .on_message(&Message::new(Command::Content, b"1".to_vec()))
            .is_err());
        let again = hs.on_message(&Message::new(Command::Content, b"255".to_vec()));
        assert!(matches!(
            again,
            Err(Rejection::UnexpectedCommand {
                state: HandshakeState::Rejected,
                command: Command::Content
            })
        ));
    }

    #[test]
    fn out_of_order_commands_are_rejected() {
        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Rendezvous, &blocklist);
        challenge(&mut hs, Command::Connect);
        let rejection = hs
            .on_message(&Message::new(Command::Content, b"255".to_vec()))
            .unwrap_err();
        assert_eq!(
            rejection,
            Rejection::UnexpectedCommand {
                state: HandshakeState::ChallengeIssued,
                command: Command::Content
            }
        );
        assert!(blocklist.is_blocked(client()));

        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Direct, &blocklist);
        assert!(matches!(
            hs.on_message(&Message::new(Command::Verify, b"x".to_vec())),
            Err(Rejection::UnexpectedCommand { .. })
        ));
    }

    #[test]
    fn close_and_timeout_end_quietly() {
        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Direct, &blocklist);
        assert_eq!(
            hs.on_message(&Message::empty(Command::Close)),
            Ok(Step::Finish(None))
        );

        let mut hs = handshake(Flow::Direct, &blocklist);
        challenge(&mut hs, Command::Verify);
        hs.expire();
        assert_eq!(hs.state(), HandshakeState::Closed);
        assert!(!blocklist.is_blocked(client()));
    }

    #[test]
    fn solution_without_pending_challenge_is_not_blocked() {
        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Rendezvous, &blocklist);
        let rejection = hs
            .on_message(&Message::new(Command::Connect, b"255".to_vec()))
            .unwrap_err();
        assert_eq!(rejection, Rejection::ChallengeExpired);
        assert_eq!(
            rejection.reply(),
            Some(Message::new(Command::Close, CHALLENGE_EXPIRED_BODY))
        );
        assert_eq!(hs.state(), HandshakeState::Rejected);
        assert!(!blocklist.is_blocked(client()));

        let mut retry = handshake(Flow::Rendezvous, &blocklist);
        challenge(&mut retry, Command::Verify);
    }

    #[test]
    fn solution_check_never_rests_in_awaiting_solution() {
        let blocklist = Blocklist::default();
        for nonce in [&b"255"[..], &b"254"[..]] {
            let mut hs = handshake(Flow::Direct, &blocklist);
            challenge(&mut hs, Command::Verify);
            let _ = hs.on_message(&Message::new(Command::Content, nonce.to_vec()));
            assert_ne!(hs.state(), HandshakeState::AwaitingSolution);
        }
    }

    #[test]
    fn pool_exhaustion_reply_is_distinguished() {
        let blocklist = Blocklist::default();
        let mut hs = handshake(Flow::Rendezvous, &blocklist);
        challenge(&mut hs, Command::Verify);
        hs.on_message(&Message::new(Command::Connect, b"255".to_vec()))
            .unwrap();
        let rejection = hs.reject(Rejection::PoolExhausted);
        assert_eq!(
            rejection.reply(),
            Some(Message::new(Command::Close, POOL_EXHAUSTED_BODY))
        );
        assert_eq!(hs.state(), HandshakeState::Rejected);
        assert!(!blocklist.is_blocked(client()));
    }
}
