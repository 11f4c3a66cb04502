use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use moka::sync::Cache;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Command, Message};
use crate::error::{Error, PoolError, Rejection};
use crate::handshake::{Flow, Handshake, Step};
use crate::mux::Multiplexer;
use crate::pool::{Lease, SessionPool};

use super::{session, Gatekeeper};

/// Upper bound on handshakes waiting for a solution at once.
const PENDING_CAPACITY: u64 = 1024;

/// Opens the dedicated listener behind a leased session endpoint.
pub trait SessionListener: Send + Sync {
    fn bind(&self, endpoint: SocketAddr) -> io::Result<TcpListener>;
}

/// Binds a real TCP socket on the endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSessionListener;

impl SessionListener for TcpSessionListener {
    fn bind(&self, endpoint: SocketAddr) -> io::Result<TcpListener> {
        let listener = StdTcpListener::bind(endpoint)?;
        listener.set_nonblocking(true)?;
        TcpListener::from_std(listener)
    }
}

/// UDP handshake, payload over a leased TCP endpoint.
///
/// Handshakes in flight are kept per client address in a cache whose TTL is
/// the challenge timeout, so abandoned challenges expire without a sweeper.
pub struct RendezvousServer {
    socket: UdpSocket,
    gate: Gatekeeper,
    pool: Arc<SessionPool>,
    listener: Arc<dyn SessionListener>,
    pending: Cache<SocketAddr, Handshake>,
}

impl RendezvousServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        gate: Gatekeeper,
        pool: Arc<SessionPool>,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        let pending = Cache::builder()
            .max_capacity(PENDING_CAPACITY)
            .time_to_live(gate.challenge_timeout())
            .build();
        Ok(Self {
            socket,
            gate,
            pool,
            listener: Arc::new(TcpSessionListener),
            pending,
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve rendezvous datagrams until `token` is cancelled.
    pub async fn listen(self, token: CancellationToken) -> Result<(), Error> {
        info!(addr = %self.local_addr()?, pool = %self.pool, "rendezvous server listening");
        let Self {
            socket,
            gate,
            pool,
            listener,
            pending,
        } = self;
        let rendezvous = Rendezvous {
            gate,
            pool,
            listener,
            pending,
        };

        let mux = Multiplexer::datagram(socket, &token);
        while let Ok(message) = mux.recv().await {
            let Some(peer) = message.peer() else {
                continue;
            };
            rendezvous.handle(&mux, peer, &message, &token).await;
        }
        mux.close().await;
        info!("rendezvous server stopped");
        Ok(())
    }
}

struct Rendezvous {
    gate: Gatekeeper,
    pool: Arc<SessionPool>,
    listener: Arc<dyn SessionListener>,
    pending: Cache<SocketAddr, Handshake>,
}

impl Rendezvous {
    async fn handle(
        &self,
        mux: &Multiplexer,
        peer: SocketAddr,
        message: &Message,
        token: &CancellationToken,
    ) {
        let mut handshake = self
            .pending
            .get(&peer)
            .unwrap_or_else(|| self.gate.handshake(Flow::Rendezvous, peer.ip()));

        match handshake.on_message(message) {
            Ok(Step::Reply(reply)) => {
                self.pending.insert(peer, handshake);
                reply_to(mux, peer, reply).await;
            }
            Ok(Step::Admitted) => {
                self.pending.invalidate(&peer);
                self.admit(mux, peer, handshake, token).await;
            }
            Ok(Step::Finish(reply)) => {
                self.pending.invalidate(&peer);
                if let Some(reply) = reply {
                    reply_to(mux, peer, reply).await;
                }
            }
            // Payload requests only make sense on the session endpoint.
            Ok(Step::Deliver) => self.pending.invalidate(&peer),
            Err(rejection) => {
                self.pending.invalidate(&peer);
                debug!(%peer, %rejection, "rendezvous rejected");
                if let Some(reply) = rejection.reply() {
                    reply_to(mux, peer, reply).await;
                }
            }
        }
    }

    async fn admit(
        &self,
        mux: &Multiplexer,
        peer: SocketAddr,
        mut handshake: Handshake,
        token: &CancellationToken,
    ) {
        let lease = match self.pool.lease_guard() {
            Ok(lease) => lease,
            Err(PoolError::Exhausted) => {
                warn!(%peer, "no free session endpoint");
                refuse(mux, peer, handshake.reject(Rejection::PoolExhausted)).await;
                return;
            }
        };

        let listener = match self.listener.bind(lease.endpoint()) {
            Ok(listener) => listener,
            Err(err) => {
                warn!(endpoint = %lease.endpoint(), %err, "failed to bind session endpoint");
                refuse(mux, peer, handshake.reject(Rejection::EndpointUnavailable)).await;
                return;
            }
        };
        let endpoint = listener.local_addr().unwrap_or_else(|_| lease.endpoint());

        handshake.enter_data_exchange();
        reply_to(
            mux,
            peer,
            Message::new(Command::Connect, endpoint.to_string()),
        )
        .await;
        debug!(%peer, %endpoint, "session endpoint handed out");

        let gate = self.gate.clone();
        let token = token.child_token();
        tokio::spawn(serve_leased(gate, listener, lease, handshake, token));
    }
}

async fn reply_to(mux: &Multiplexer, peer: SocketAddr, reply: Message) {
    if let Err(err) = mux.send(reply.with_peer(peer)).await {
        debug!(%peer, %err, "rendezvous reply not sent");
    }
}

async fn refuse(mux: &Multiplexer, peer: SocketAddr, rejection: Rejection) {
    if let Some(reply) = rejection.reply() {
        reply_to(mux, peer, reply).await;
    }
}

/// Serve one admitted client on its leased endpoint. The lease is released
/// when this returns, whichever way it does.
async fn serve_leased(
    gate: Gatekeeper,
    listener: TcpListener,
    lease: Lease,
    handshake: Handshake,
    token: CancellationToken,
) {
    let accepted = tokio::select! {
        _ = token.cancelled() => return,
        accepted = tokio::time::timeout(gate.timeout(), accept_from(&listener, &handshake)) => accepted,
    };
    let (socket, peer) = match accepted {
        Ok(Ok(connection)) => connection,
        Ok(Err(err)) => {
            warn!(endpoint = %lease.endpoint(), %err, "session accept failed");
            return;
        }
        Err(_) => {
            debug!(endpoint = %lease.endpoint(), "admitted client never connected");
            return;
        }
    };
    drop(listener);

    let mux = Multiplexer::stream(socket, peer, &token);
    let end = session::drive(&gate, &mux, handshake).await;
    debug!(%peer, endpoint = %lease.endpoint(), ?end, "session finished");
    mux.close().await;
}

/// Accept the first connection coming from the admitted client's host.
async fn accept_from(
    listener: &TcpListener,
    handshake: &Handshake,
) -> io::Result<(TcpStream, SocketAddr)> {
    loop {
        let (socket, peer) = listener.accept().await?;
        if peer.ip().to_canonical() == handshake.identity() {
            return Ok((socket, peer));
        }
        warn!(%peer, expected = %handshake.identity(), "dropping session connection from another host");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::pow::{derive_condition, Puzzle, Seed};
    use crate::server::testing::{gatekeeper, QUOTE};
    use crate::solver::{Solver, StopFlag};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Default)]
    struct CountingListener {
        binds: AtomicUsize,
    }

    impl SessionListener for CountingListener {
        fn bind(&self, endpoint: SocketAddr) -> io::Result<TcpListener> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            TcpSessionListener.bind(endpoint)
        }
    }

    struct Harness {
        server: SocketAddr,
        client: Multiplexer,
        pool: Arc<SessionPool>,
        binds: Arc<CountingListener>,
        token: CancellationToken,
    }

    async fn start(endpoints: Vec<SocketAddr>, timeout: Duration) -> Harness {
        start_with(endpoints, gatekeeper(1, timeout)).await
    }

    async fn start_with(endpoints: Vec<SocketAddr>, gate: Gatekeeper) -> Harness {
        let pool = Arc::new(SessionPool::new(endpoints));
        let binds = Arc::new(CountingListener::default());
        let server = RendezvousServer::bind("127.0.0.1:0", gate, pool.clone())
            .await
            .unwrap()
            .with_listener(binds.clone());
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.listen(token.clone()));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Harness {
            server: addr,
            client: Multiplexer::datagram(socket, &token),
            pool,
            binds,
            token,
        }
    }

    fn local_endpoint() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    impl Harness {
        async fn request(&self, message: Message) -> Message {
            self.client
                .request(message.with_peer(self.server), WAIT)
                .await
                .unwrap()
        }

        /// Run the handshake and return the server's reply to the solution.
        async fn admit(&self) -> Message {
            let nonce = self.solve_challenge().await;
            self.request(Message::new(Command::Connect, nonce.to_string()))
                .await
        }

        async fn solve_challenge(&self) -> u64 {
            let challenge = self.request(Message::empty(Command::Verify)).await;
            assert_eq!(challenge.command(), Command::Verify);
            let seed: Seed = challenge.body().try_into().unwrap();
            let puzzle = Puzzle::new(seed, 1, derive_condition("127.0.0.1".parse().unwrap()));
            Solver::default()
                .solve(&puzzle, &Arc::new(StopFlag::new()))
                .unwrap()
        }
    }

    async fn wait_for_free(pool: &SessionPool) {
        tokio::time::timeout(WAIT, async {
            while pool.available() < pool.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lease released");
    }

    #[tokio::test]
    async fn admitted_client_fetches_payload_from_endpoint() {
        let h = start(vec![local_endpoint()], WAIT).await;
        let reply = h.admit().await;
        assert_eq!(reply.command(), Command::Connect);
        let endpoint: SocketAddr = std::str::from_utf8(reply.body())
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(h.pool.available(), 0);

        let stream = TcpStream::connect(endpoint).await.unwrap();
        let session = Multiplexer::stream(stream, endpoint, &h.token);
        let content = session
            .request(Message::empty(Command::Content), WAIT)
            .await
            .unwrap();
        assert_eq!(content.body(), QUOTE);
        session.send(Message::empty(Command::Close)).await.unwrap();
        session.close().await;

        wait_for_free(&h.pool).await;
        assert_eq!(h.binds.binds.load(Ordering::SeqCst), 1);
        h.token.cancel();
    }

    #[tokio::test]
    async fn exhausted_pool_refuses_without_listener() {
        let h = start(Vec::new(), WAIT).await;
        let reply = h.admit().await;
        assert_eq!(reply.command(), Command::Close);
        assert_eq!(reply.body(), crate::handshake::POOL_EXHAUSTED_BODY);
        assert_eq!(h.binds.binds.load(Ordering::SeqCst), 0);
        h.token.cancel();
    }

    #[tokio::test]
    async fn wrong_solution_is_refused_and_blocked() {
        let h = start(vec![local_endpoint()], WAIT).await;
        h.request(Message::empty(Command::Verify)).await;
        let reply = h
            .request(Message::new(Command::Connect, b"x".to_vec()))
            .await;
        assert_eq!(reply.command(), Command::ErrInvalidHash);

        let silent = h
            .client
            .request(
                Message::empty(Command::Verify).with_peer(h.server),
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(
            silent,
            Err(crate::error::ProtocolError::Timeout { .. })
        ));
        assert_eq!(h.pool.available(), 1);
        h.token.cancel();
    }

    #[tokio::test]
    async fn oversized_timeouts_do_not_break_bind() {
        let gate = gatekeeper(1, Duration::MAX).with_challenge_timeout(Duration::MAX);
        let pool = Arc::new(SessionPool::new(vec![local_endpoint()]));
        assert!(RendezvousServer::bind("127.0.0.1:0", gate, pool).await.is_ok());
    }

    #[tokio::test]
    async fn late_solution_is_refused_without_blocking() {
        let gate = gatekeeper(1, WAIT).with_challenge_timeout(Duration::from_millis(200));
        let blocklist = gate.blocklist().clone();
        let h = start_with(vec![local_endpoint()], gate).await;

        let nonce = h.solve_challenge().await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        let reply = h
            .request(Message::new(Command::Connect, nonce.to_string()))
            .await;
        assert_eq!(reply.command(), Command::Close);
        assert_eq!(reply.body(), crate::handshake::CHALLENGE_EXPIRED_BODY);
        assert!(!blocklist.is_blocked("127.0.0.1".parse().unwrap()));

        assert_eq!(h.admit().await.command(), Command::Connect);
        assert_eq!(h.binds.binds.load(Ordering::SeqCst), 1);
        h.token.cancel();
    }

    #[tokio::test]
    async fn idle_session_frees_its_endpoint() {
        let h = start(vec![local_endpoint()], Duration::from_millis(300)).await;
        let reply = h.admit().await;
        let endpoint: SocketAddr = std::str::from_utf8(reply.body())
            .unwrap()
            .parse()
            .unwrap();

        let stream = TcpStream::connect(endpoint).await.unwrap();
        let session = Multiplexer::stream(stream, endpoint, &h.token);
        let end = session.recv_timeout(WAIT).await;
        assert_eq!(end, Err(crate::error::ProtocolError::Closed));
        wait_for_free(&h.pool).await;
        h.token.cancel();
    }

    #[tokio::test]
    async fn unclaimed_endpoint_is_released() {
        let h = start(vec![local_endpoint()], Duration::from_millis(200)).await;
        assert_eq!(h.admit().await.command(), Command::Connect);
        wait_for_free(&h.pool).await;
        h.token.cancel();
    }
}
