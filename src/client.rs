//! Clients for both server variants.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{Command, Message};
use crate::config::ClientConfig;
use crate::error::{ClientError, Error};
use crate::mux::Multiplexer;
use crate::pow::{HashPow, PowHandler, Puzzle, Seed, SEED_LEN};
use crate::solver::{Solver, SolverBuilder};

/// Solves challenges on behalf of a client.
#[derive(Debug, Clone)]
struct Prover {
    solver: Solver,
    difficulty: usize,
    timeout: Duration,
}

impl Prover {
    fn from_config(config: &ClientConfig) -> Result<Self, Error> {
        let solver = SolverBuilder::default()
            .threads(config.solver_threads)
            .pow(Arc::new(HashPow::new(config.algorithm)) as Arc<dyn PowHandler>)
            .build_validated()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(Self {
            solver,
            difficulty: config.difficulty,
            timeout: config.solve_timeout,
        })
    }

    /// Nonce for the seed in `challenge`, bound to `local_ip`.
    async fn prove(
        &self,
        challenge: &[u8],
        local_ip: IpAddr,
        token: &CancellationToken,
    ) -> Result<u64, ClientError> {
        let seed: Seed = challenge.try_into().map_err(|_| {
            ClientError::MalformedReply(format!(
                "expected a {SEED_LEN}-byte seed, got {} bytes",
                challenge.len()
            ))
        })?;
        let condition = self.solver.pow.derive_condition(local_ip);
        let puzzle = Puzzle::new(seed, self.difficulty, condition);
        let nonce = self
            .solver
            .solve_until(puzzle, self.timeout, token)
            .await?;
        debug!(nonce, "solved challenge");
        Ok(nonce)
    }
}

fn expect_reply(reply: Message, command: Command) -> Result<Message, ClientError> {
    match reply.command() {
        c if c == command => Ok(reply),
        Command::ErrInvalidHash => Err(ClientError::InvalidHash),
        Command::Close => Err(ClientError::Refused(
            String::from_utf8_lossy(reply.body()).into_owned(),
        )),
        other => Err(ClientError::WrongCommand(other)),
    }
}

/// Fetch the payload over an established stream session, then say goodbye.
async fn fetch_content(
    session: &Multiplexer,
    request: Message,
    timeout: Duration,
) -> Result<Vec<u8>, ClientError> {
    let reply = session.request(request, timeout).await?;
    let content = expect_reply(reply, Command::Content)?.into_body();
    session.send(Message::empty(Command::Close)).await?;
    Ok(content)
}

/// Talks to a [`crate::server::DirectServer`].
#[derive(Debug, Clone)]
pub struct DirectClient {
    server: String,
    timeout: Duration,
    prover: Prover,
}

impl DirectClient {
    pub fn from_config(config: &ClientConfig) -> Result<Self, Error> {
        Ok(Self {
            server: config.server_addr(),
            timeout: config.timeout,
            prover: Prover::from_config(config)?,
        })
    }

    /// Verify, solve, and return the payload the server hands out.
    pub async fn get_message(&self, token: &CancellationToken) -> Result<Vec<u8>, ClientError> {
        let stream = TcpStream::connect(&self.server).await?;
        let local_ip = stream.local_addr()?.ip();
        let peer = stream.peer_addr()?;
        let mux = Multiplexer::stream(stream, peer, token);

        let result = self.exchange(&mux, local_ip, token).await;
        mux.close().await;
        result
    }

    async fn exchange(
        &self,
        mux: &Multiplexer,
        local_ip: IpAddr,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, ClientError> {
        let challenge = mux
            .request(Message::empty(Command::Verify), self.timeout)
            .await?;
        let challenge = expect_reply(challenge, Command::Verify)?;
        let nonce = self
            .prover
            .prove(challenge.body(), local_ip, token)
            .await?;
        fetch_content(
            mux,
            Message::new(Command::Content, nonce.to_string()),
            self.timeout,
        )
        .await
    }
}

/// Talks to a [`crate::server::RendezvousServer`].
#[derive(Debug, Clone)]
pub struct RendezvousClient {
    server: String,
    bind: String,
    timeout: Duration,
    prover: Prover,
}

impl RendezvousClient {
    pub fn from_config(config: &ClientConfig) -> Result<Self, Error> {
        Ok(Self {
            server: config.server_addr(),
            bind: config.bind_addr(),
            timeout: config.timeout,
            prover: Prover::from_config(config)?,
        })
    }

    /// Rendezvous over UDP, then fetch the payload from the leased endpoint.
    pub async fn get_message(&self, token: &CancellationToken) -> Result<Vec<u8>, ClientError> {
        let server = lookup_host(&self.server).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve", self.server),
            )
        })?;
        let socket = UdpSocket::bind(&self.bind).await?;
        let local_ip = local_ip_towards(&socket, server).await?;
        let mux = Multiplexer::datagram(socket, token);

        let endpoint = self.rendezvous(&mux, server, local_ip, token).await;
        mux.close().await;
        let endpoint = endpoint?;
        debug!(%endpoint, "session endpoint assigned");

        let stream = TcpStream::connect(endpoint).await?;
        let session = Multiplexer::stream(stream, endpoint, token);
        let result = fetch_content(&session, Message::empty(Command::Content), self.timeout).await;
        session.close().await;
        result
    }

    async fn rendezvous(
        &self,
        mux: &Multiplexer,
        server: SocketAddr,
        local_ip: IpAddr,
        token: &CancellationToken,
    ) -> Result<SocketAddr, ClientError> {
        let challenge = mux
            .request(Message::empty(Command::Verify).with_peer(server), self.timeout)
            .await?;
        let challenge = expect_reply(challenge, Command::Verify)?;
        let nonce = self
            .prover
            .prove(challenge.body(), local_ip, token)
            .await?;

        let reply = mux
            .request(
                Message::new(Command::Connect, nonce.to_string()).with_peer(server),
                self.timeout,
            )
            .await?;
        let reply = expect_reply(reply, Command::Connect)?;
        let endpoint: SocketAddr = std::str::from_utf8(reply.body())
            .ok()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| {
                ClientError::MalformedReply(format!(
                    "session endpoint {:?}",
                    String::from_utf8_lossy(reply.body())
                ))
            })?;

        if endpoint.ip().is_unspecified() {
            return Ok(SocketAddr::new(server.ip(), endpoint.port()));
        }
        Ok(endpoint)
    }
}

/// Address the server will see our datagrams come from.
async fn local_ip_towards(socket: &UdpSocket, server: SocketAddr) -> io::Result<IpAddr> {
    let bound = socket.local_addr()?.ip();
    if !bound.is_unspecified() {
        return Ok(bound);
    }
    let any: IpAddr = match server {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let probe = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
    probe.connect(server).await?;
    Ok(probe.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfigBuilder, Mode};
    use crate::pool::SessionPool;
    use crate::server::testing::{gatekeeper, QUOTE};
    use crate::server::{DirectServer, RendezvousServer};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(port: u16, mode: Mode) -> ClientConfig {
        ClientConfigBuilder::default()
            .server_port(port)
            .host("127.0.0.1".to_string())
            .mode(mode)
            .difficulty(2)
            .timeout(WAIT)
            .build_validated()
            .unwrap()
    }

    #[tokio::test]
    async fn direct_client_gets_quote() {
        let server = DirectServer::bind("127.0.0.1:0", gatekeeper(2, WAIT))
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let token = CancellationToken::new();
        tokio::spawn(server.listen(token.clone()));

        let client = DirectClient::from_config(&config(port, Mode::Direct)).unwrap();
        assert_eq!(client.get_message(&token).await.unwrap(), QUOTE);
        // The blocklist is untouched by a good client, so a second run works too.
        assert_eq!(client.get_message(&token).await.unwrap(), QUOTE);
        token.cancel();
    }

    #[tokio::test]
    async fn rendezvous_client_gets_quote() {
        let pool = Arc::new(SessionPool::new(vec!["127.0.0.1:0".parse().unwrap()]));
        let server = RendezvousServer::bind("127.0.0.1:0", gatekeeper(2, WAIT), pool.clone())
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let token = CancellationToken::new();
        tokio::spawn(server.listen(token.clone()));

        let client = RendezvousClient::from_config(&config(port, Mode::Rendezvous)).unwrap();
        assert_eq!(client.get_message(&token).await.unwrap(), QUOTE);
        token.cancel();
    }

    #[tokio::test]
    async fn rendezvous_client_surfaces_exhaustion() {
        let pool = Arc::new(SessionPool::new(Vec::new()));
        let server = RendezvousServer::bind("127.0.0.1:0", gatekeeper(2, WAIT), pool)
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let token = CancellationToken::new();
        tokio::spawn(server.listen(token.clone()));

        let client = RendezvousClient::from_config(&config(port, Mode::Rendezvous)).unwrap();
        match client.get_message(&token).await {
            Err(ClientError::Refused(reason)) => assert_eq!(reason, "session pool is exhausted"),
            other => panic!("expected refusal, got {other:?}"),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let mut cfg = config(port, Mode::Rendezvous);
        cfg.timeout = Duration::from_millis(100);
        let client = RendezvousClient::from_config(&cfg).unwrap();
        let token = CancellationToken::new();
        assert!(matches!(
            client.get_message(&token).await,
            Err(ClientError::Protocol(
                crate::error::ProtocolError::Timeout { .. }
            ))
        ));
        drop(socket);
    }
}
