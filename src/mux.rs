//! Duplex message channels over one socket.
//!
//! A [`Multiplexer`] owns its socket through a pair of tasks: the read loop
//! decodes frames into a bounded inbound queue, the write loop drains a
//! bounded outbound queue into the socket. A supervisor task joins both, so
//! the queues are only released after both loops have stopped.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use flume::{Receiver, Sender};
use futures::{Sink, SinkExt, Stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;
use tracing::{debug, warn};

use crate::codec::{Message, MessageCodec};
use crate::error::{CodecError, ProtocolError};

/// Capacity of each direction's queue.
pub const QUEUE_DEPTH: usize = 64;

/// How long the write loop keeps flushing queued messages after cancellation.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Stream,
    Datagram,
}

#[derive(Debug)]
pub struct Multiplexer {
    outbound: Sender<Message>,
    inbound: Receiver<Message>,
    token: CancellationToken,
    peer: Option<SocketAddr>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Wrap a connected byte stream. Every received message is tagged with `peer`.
    pub fn stream<T>(io: T, peer: SocketAddr, parent: &CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = Framed::new(io, MessageCodec).split();
        let stream = stream.map_ok(move |message: Message| message.with_peer(peer));
        Self::spawn(
            sink,
            stream,
            Ok::<Message, CodecError>,
            Transport::Stream,
            Some(peer),
            parent,
        )
    }

    /// Wrap a datagram socket. Outbound messages must carry their destination peer.
    pub fn datagram(socket: UdpSocket, parent: &CancellationToken) -> Self {
        let (sink, stream) = UdpFramed::new(socket, MessageCodec).split();
        let stream =
            stream.map_ok(|(message, peer): (Message, SocketAddr)| message.with_peer(peer));
        Self::spawn(sink, stream, address, Transport::Datagram, None, parent)
    }

    fn spawn<Si, St, I>(
        sink: Si,
        stream: St,
        route: Route<I>,
        transport: Transport,
        peer: Option<SocketAddr>,
        parent: &CancellationToken,
    ) -> Self
    where
        Si: Sink<I, Error = CodecError> + Send + Unpin + 'static,
        St: Stream<Item = Result<Message, CodecError>> + Send + Unpin + 'static,
        I: Send + 'static,
    {
        let token = parent.child_token();
        let (outbound_tx, outbound_rx) = flume::bounded(QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = flume::bounded(QUEUE_DEPTH);

        let reader = tokio::spawn(read_loop(stream, inbound_tx, transport, token.clone()));
        let writer = tokio::spawn(write_loop(sink, outbound_rx, route, token.clone()));
        let supervisor = tokio::spawn(async move {
            let (read, write) = tokio::join!(reader, writer);
            for joined in [read, write] {
                if let Err(err) = joined {
                    warn!(%err, "multiplexer loop panicked");
                }
            }
        });

        Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            token,
            peer,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Remote end of a stream multiplexer.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Queue `message` for the write loop. Waits only while the queue is full.
    pub async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        if self.token.is_cancelled() {
            return Err(ProtocolError::Closed);
        }
        tokio::select! {
            sent = self.outbound.send_async(message) => sent.map_err(|_| ProtocolError::Closed),
            _ = self.token.cancelled() => Err(ProtocolError::Closed),
        }
    }

    /// Send `message` and wait for the next inbound message, whatever it is.
    ///
    /// There is no correlation between request and reply, so concurrent
    /// requests on one multiplexer race for replies.
    pub async fn request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, ProtocolError> {
        self.send(message).await?;
        self.recv_timeout(timeout).await
    }

    /// Next inbound message. Fails with [`ProtocolError::Closed`] once the
    /// read loop has stopped and the queue is empty, or on [`Multiplexer::close`].
    pub async fn recv(&self) -> Result<Message, ProtocolError> {
        tokio::select! {
            biased;
            received = self.inbound.recv_async() => received.map_err(|_| ProtocolError::Closed),
            _ = self.token.cancelled() => Err(ProtocolError::Closed),
        }
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Message, ProtocolError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(received) => received,
            Err(_) => Err(ProtocolError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Handle on the inbound stream for full-duplex consumers.
    pub fn receive(&self) -> Receiver<Message> {
        self.inbound.clone()
    }

    /// Stop both loops and wait for them to exit. Later calls return at once.
    pub async fn close(&self) {
        self.token.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(err) = handle.await {
                warn!(%err, "multiplexer supervisor failed");
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Turns a queued message into the sink's item type.
type Route<I> = fn(Message) -> Result<I, CodecError>;

/// Datagram sinks need the destination next to the message.
fn address(message: Message) -> Result<(Message, SocketAddr), CodecError> {
    match message.peer() {
        Some(peer) => Ok((message, peer)),
        None => Err(CodecError::MissingPeer),
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

async fn read_loop<St>(
    mut stream: St,
    inbound: Sender<Message>,
    transport: Transport,
    token: CancellationToken,
) where
    St: Stream<Item = Result<Message, CodecError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                debug!(
                    command = %message.command(),
                    size = message.body().len(),
                    peer = ?message.peer(),
                    "received message"
                );
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = inbound.send_async(message) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Some(Err(CodecError::Io(err)))
                if transport == Transport::Stream && is_disconnect(&err) =>
            {
                debug!(%err, "connection closed by peer");
                return;
            }
            Some(Err(err)) => warn!(%err, "failed to read message"),
            None => {
                debug!("connection reached end of stream");
                return;
            }
        }
    }
}

async fn write_loop<Si, I>(
    mut sink: Si,
    outbound: Receiver<Message>,
    route: Route<I>,
    token: CancellationToken,
) where
    Si: Sink<I, Error = CodecError> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = outbound.recv_async() => match next {
                Ok(message) => message,
                Err(_) => break,
            },
        };
        write_one(&mut sink, route, message).await;
    }

    let drain = async {
        while let Ok(message) = outbound.try_recv() {
            write_one(&mut sink, route, message).await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        debug!("gave up draining outbound queue");
    }
    if let Err(err) = sink.close().await {
        debug!(%err, "failed to close sink");
    }
}

async fn write_one<Si, I>(sink: &mut Si, route: Route<I>, message: Message)
where
    Si: Sink<I, Error = CodecError> + Unpin,
{
    let command = message.command();
    let peer = message.peer();
    let written = match route(message) {
        Ok(item) => sink.send(item).await,
        Err(err) => Err(err),
    };
    if let Err(err) = written {
        warn!(%command, ?peer, %err, "failed to write message");
    }
}
