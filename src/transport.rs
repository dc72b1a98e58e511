//! # Transport
//!
//! Bidirectional packet I/O over reliable byte streams. A packet is framed as
//! a 4-byte big-endian length followed by its encoded bytes; frames above
//! [`MAX_PACKET_SIZE`](crate::packet::MAX_PACKET_SIZE) are rejected before
//! decoding.
//!
//! ## Request correlation
//!
//! [`Transport::send_request`] assigns a request identifier unique to this
//! sender, registers a [`PacketFuture`] and transmits. A response packet
//! carrying the same identifier resolves the future. Futures resolve at most
//! once; cancellation is idempotent and a cancelled or expired future yields
//! `None`. Every future auto-cancels at the transport's packet timeout.
//!
//! ## Delivery
//!
//! Incoming request packets surface on the take-once stream returned by
//! [`Transport::packets`]. Responses never surface there; they resolve their
//! future or, when the waiter is gone, are dropped with a trace.
//!
//! Responses are routed to the advertised address of the request's sender
//! over a pooled outgoing connection; the pool is LRU-bounded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, trace, warn};

use crate::id::Address;
use crate::packet::{self, Packet, MAX_PACKET_SIZE};

/// Default deadline for a response to any packet.
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on pooled outgoing connections.
const MAX_POOLED_CONNECTIONS: usize = 1_000;

/// Capacity of the incoming packet stream.
const INCOMING_CHANNEL_SIZE: usize = 256;

/// Capacity of each per-connection writer queue.
const WRITER_CHANNEL_SIZE: usize = 64;

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Packet>>>>;

/// Waiter for the response correlated to one sent request.
pub struct PacketFuture {
    request_id: u64,
    rx: oneshot::Receiver<Packet>,
    pending: PendingMap,
}

impl PacketFuture {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Drop the waiter registration. Idempotent; a resolved or already
    /// cancelled future is unaffected.
    pub fn cancel(&self) {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .remove(&self.request_id);
    }

    /// Await the response. Yields `None` once cancelled, expired, or when the
    /// transport shuts down.
    pub async fn response(self) -> Option<Packet> {
        self.rx.await.ok()
    }
}

fn register_future(pending: &PendingMap, request_id: u64, deadline: Duration) -> PacketFuture {
    let (tx, rx) = oneshot::channel();
    pending
        .lock()
        .expect("pending map poisoned")
        .insert(request_id, tx);

    let expire = pending.clone();
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        if expire
            .lock()
            .expect("pending map poisoned")
            .remove(&request_id)
            .is_some()
        {
            trace!(request_id, "request expired without response");
        }
    });

    PacketFuture {
        request_id,
        rx,
        pending: pending.clone(),
    }
}

/// Packet I/O contract consumed by the DHT and the discovery bootstrapper.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Assign a request identifier, transmit, and return the response waiter.
    async fn send_request(&self, packet: Packet) -> Result<PacketFuture>;

    /// Transmit a response correlated to `request_id`. Fire-and-forget.
    async fn send_response(&self, request_id: u64, packet: Packet) -> Result<()>;

    /// Take the incoming request stream. Yields `None` on the second call.
    async fn packets(&self) -> Option<mpsc::Receiver<Packet>>;

    /// Begin accepting inbound connections.
    async fn start(&self) -> Result<()>;

    /// Signal shutdown to every background loop.
    fn stop(&self);

    /// Release live connections and pending waiters. Called once the stop
    /// signal has been observed.
    fn close(&self);

    /// Observe the shutdown signal.
    fn stopped(&self) -> watch::Receiver<bool>;

    /// The address this transport answers on.
    fn public_address(&self) -> Address;
}

/// TCP transport with one frame stream per peer connection.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    public_address: Address,
    listener: Mutex<Option<TcpListener>>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    connections: StdMutex<LruCache<SocketAddr, mpsc::Sender<Packet>>>,
    incoming_tx: mpsc::Sender<Packet>,
    incoming_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    stop_tx: watch::Sender<bool>,
    packet_timeout: Duration,
}

impl TcpTransport {
    /// Bind a listener. `127.0.0.1:0` picks a free port; the bound address is
    /// reported by [`Transport::public_address`].
    pub async fn bind(addr: &str, packet_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind transport on {}", addr))?;
        let local = listener
            .local_addr()
            .context("failed to read bound address")?;
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(TcpInner {
                public_address: Address::from_socket_addr(local),
                listener: Mutex::new(Some(listener)),
                pending: Arc::new(StdMutex::new(HashMap::new())),
                next_request_id: AtomicU64::new(0),
                connections: StdMutex::new(LruCache::new(
                    NonZeroUsize::new(MAX_POOLED_CONNECTIONS).expect("pool bound is non-zero"),
                )),
                incoming_tx,
                incoming_rx: Mutex::new(Some(incoming_rx)),
                stop_tx,
                packet_timeout,
            }),
        })
    }
}

impl TcpInner {
    fn spawn_reader(
        self: &Arc<Self>,
        mut read_half: OwnedReadHalf,
        keep_write: Option<OwnedWriteHalf>,
        remote: SocketAddr,
    ) {
        let inner = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            // Held so the peer's view of the stream stays open while we read.
            let _keep_write = keep_write;
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    frame = read_frame(&mut read_half) => match frame {
                        Ok(Some(packet)) => inner.handle_incoming(packet, remote).await,
                        Ok(None) => break,
                        Err(e) => {
                            trace!(%remote, error = %e, "closing connection on bad frame");
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_writer(&self, mut write_half: OwnedWriteHalf, remote: SocketAddr) -> mpsc::Sender<Packet> {
        let (tx, mut rx) = mpsc::channel::<Packet>(WRITER_CHANNEL_SIZE);
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let bytes = match packet::serialize_packet(&packet) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(%remote, error = %e, "dropping unencodable packet");
                        continue;
                    }
                };
                let len = (bytes.len() as u32).to_be_bytes();
                if write_half.write_all(&len).await.is_err()
                    || write_half.write_all(&bytes).await.is_err()
                    || write_half.flush().await.is_err()
                {
                    trace!(%remote, "write failed, closing connection");
                    break;
                }
            }
        });
        tx
    }

    async fn connection(self: &Arc<Self>, addr: SocketAddr) -> Result<mpsc::Sender<Packet>> {
        {
            let mut pool = self.connections.lock().expect("connection pool poisoned");
            if let Some(tx) = pool.get(&addr) {
                if !tx.is_closed() {
                    return Ok(tx.clone());
                }
                pool.pop(&addr);
            }
        }

        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("peer {} unreachable", addr))?;
        let _ = stream.set_nodelay(true);
        let remote = stream.peer_addr().context("failed to read peer address")?;
        let (read_half, write_half) = stream.into_split();
        self.spawn_reader(read_half, None, remote);
        let tx = self.spawn_writer(write_half, remote);
        self.connections
            .lock()
            .expect("connection pool poisoned")
            .put(addr, tx.clone());
        Ok(tx)
    }

    async fn dispatch(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let addr = packet.receiver.address.socket_addr();
        let conn = self.connection(addr).await?;
        conn.send(packet)
            .await
            .map_err(|_| anyhow!("connection to {} closed", addr))
    }

    async fn handle_incoming(&self, mut packet: Packet, remote: SocketAddr) {
        packet.remote_address = Some(remote.to_string());
        if packet.is_response() {
            let waiter = self
                .pending
                .lock()
                .expect("pending map poisoned")
                .remove(&packet.request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(packet);
                }
                None => {
                    trace!(
                        request_id = packet.request_id,
                        "response without waiter (cancelled or expired)"
                    );
                }
            }
        } else if self.incoming_tx.send(packet).await.is_err() {
            debug!("incoming stream consumer gone, dropping packet");
        }
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<Packet>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PACKET_SIZE {
        anyhow::bail!("frame of {} bytes exceeds packet limit", len);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.context("truncated frame")?;
    let packet = packet::deserialize_packet(&buf).context("malformed packet")?;
    Ok(Some(packet))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_request(&self, mut packet: Packet) -> Result<PacketFuture> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        packet.request_id = request_id;
        let future = register_future(&self.inner.pending, request_id, self.inner.packet_timeout);
        if let Err(e) = self.inner.dispatch(packet).await {
            future.cancel();
            return Err(e);
        }
        Ok(future)
    }

    async fn send_response(&self, request_id: u64, mut packet: Packet) -> Result<()> {
        packet.request_id = request_id;
        self.inner.dispatch(packet).await
    }

    async fn packets(&self) -> Option<mpsc::Receiver<Packet>> {
        self.inner.incoming_rx.lock().await.take()
    }

    async fn start(&self) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("transport already started"))?;
        let inner = self.inner.clone();
        let mut stop_rx = self.inner.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let _ = stream.set_nodelay(true);
                            let (read_half, write_half) = stream.into_split();
                            inner.spawn_reader(read_half, Some(write_half), remote);
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);
    }

    fn close(&self) {
        // Dropping the writer queues closes every pooled connection, and
        // dropping the waiters closes every outstanding future.
        self.inner
            .connections
            .lock()
            .expect("connection pool poisoned")
            .clear();
        self.inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .clear();
    }

    fn stopped(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    fn public_address(&self) -> Address {
        self.inner.public_address
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{NodeId, Peer, NODE_HASH_LEN};
    use crate::packet::{Packet, RequestData, ResponseData};

    fn peer_for(transport: &TcpTransport, seed: u8) -> Peer {
        let mut bytes = [0u8; NODE_HASH_LEN];
        bytes[0] = seed;
        Peer::new(NodeId::from_bytes(bytes), transport.public_address())
    }

    async fn bound(timeout: Duration) -> TcpTransport {
        let transport = TcpTransport::bind("127.0.0.1:0", timeout).await.unwrap();
        transport.start().await.unwrap();
        transport
    }

    /// Answer every incoming request with an empty ack.
    fn spawn_echo_responder(transport: TcpTransport, me: Peer) {
        tokio::spawn(async move {
            let mut packets = transport.packets().await.expect("stream taken");
            while let Some(request) = packets.recv().await {
                let response = Packet::response(me, &request, ResponseData::Ping);
                let _ = transport.send_response(request.request_id, response).await;
            }
        });
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let a = bound(DEFAULT_PACKET_TIMEOUT).await;
        let b = bound(DEFAULT_PACKET_TIMEOUT).await;
        let peer_a = peer_for(&a, 1);
        let peer_b = peer_for(&b, 2);
        spawn_echo_responder(b.clone(), peer_b);

        let request = Packet::request(peer_a, peer_b, RequestData::Ping);
        let future = a.send_request(request).await.unwrap();
        let response = future.response().await.expect("no response");

        assert!(response.is_response());
        assert_eq!(response.sender.id, peer_b.id);
        // The observed source endpoint is stamped by the receiving side.
        assert!(response.remote_address.is_some());
    }

    #[tokio::test]
    async fn future_expires_when_peer_stays_silent() {
        let a = bound(Duration::from_millis(200)).await;
        let b = bound(Duration::from_millis(200)).await;
        let peer_a = peer_for(&a, 1);
        let peer_b = peer_for(&b, 2);
        // No responder on b: the request lands in its stream and rots there.

        let request = Packet::request(peer_a, peer_b, RequestData::Ping);
        let future = a.send_request(request).await.unwrap();
        let started = std::time::Instant::now();
        assert!(future.response().await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_closes_waiter() {
        let a = bound(DEFAULT_PACKET_TIMEOUT).await;
        let b = bound(DEFAULT_PACKET_TIMEOUT).await;
        let request = Packet::request(peer_for(&a, 1), peer_for(&b, 2), RequestData::Ping);

        let future = a.send_request(request).await.unwrap();
        future.cancel();
        future.cancel();
        assert!(future.response().await.is_none());
    }

    #[tokio::test]
    async fn send_to_unreachable_peer_fails() {
        let a = bound(DEFAULT_PACKET_TIMEOUT).await;
        let peer_a = peer_for(&a, 1);
        let ghost = Peer::new(
            NodeId::from_bytes([9u8; NODE_HASH_LEN]),
            crate::id::Address::new("127.0.0.1:1").unwrap(),
        );

        let request = Packet::request(peer_a, ghost, RequestData::Ping);
        assert!(a.send_request(request).await.is_err());
    }

    #[tokio::test]
    async fn packet_stream_is_take_once() {
        let a = bound(DEFAULT_PACKET_TIMEOUT).await;
        assert!(a.packets().await.is_some());
        assert!(a.packets().await.is_none());
    }

    #[tokio::test]
    async fn stop_signals_observers() {
        let a = bound(DEFAULT_PACKET_TIMEOUT).await;
        let mut stopped = a.stopped();
        assert!(!*stopped.borrow());
        a.stop();
        stopped.changed().await.unwrap();
        assert!(*stopped.borrow());
    }

    #[tokio::test]
    async fn memory_transport_round_trip() {
        let hub = memory::MemoryHub::new();
        let a = hub.create("10.0.0.1:7001", DEFAULT_PACKET_TIMEOUT);
        let b = hub.create("10.0.0.2:7001", DEFAULT_PACKET_TIMEOUT);

        let peer_a = Peer::new(NodeId::from_bytes([1u8; NODE_HASH_LEN]), a.public_address());
        let peer_b = Peer::new(NodeId::from_bytes([2u8; NODE_HASH_LEN]), b.public_address());

        let responder = b.clone();
        let mut packets = b.packets().await.unwrap();
        tokio::spawn(async move {
            while let Some(request) = packets.recv().await {
                let response = Packet::response(peer_b, &request, ResponseData::Ping);
                let _ = responder.send_response(request.request_id, response).await;
            }
        });

        let future = a
            .send_request(Packet::request(peer_a, peer_b, RequestData::Ping))
            .await
            .unwrap();
        let response = future.response().await.expect("no response");
        assert_eq!(response.sender.id, peer_b.id);
        assert_eq!(response.remote_address.as_deref(), Some("10.0.0.2:7001"));
    }
}
