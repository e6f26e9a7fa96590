//! P2P transport: TCP server (one framed message per inbound connection) and client (one
//! connection per outbound message, then close).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use parley_core::wire::{decode_payload, frame_len, LEN_SIZE};
use parley_core::{encode_frame, FrameDecodeError, FrameEncodeError, UserId, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::context::ClientContext;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no free port in {first}..={last}")]
    BindExhausted { first: u16, last: u16 },
    #[error("peer {0} unreachable")]
    PeerUnreachable(UserId),
    #[error("send to {addr} failed: {source}")]
    SendFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("port 0 is not a valid destination ({0})")]
    InvalidPort(String),
    #[error("local listening port not published yet")]
    ReturnAddressUnknown,
    #[error("timed out")]
    Timeout,
    #[error("frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives each decoded inbound message with the connection's peer address.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_message(&self, msg: WireMessage, peer: SocketAddr);
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_address: String,
    pub port_attempts: u16,
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port_attempts: 100,
            max_connections: 64,
            read_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(1),
        }
    }
}

struct Running {
    port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct TransportServer {
    ctx: Arc<ClientContext>,
    handler: Arc<dyn InboundHandler>,
    opts: ServerOptions,
    running: Mutex<Option<Running>>,
}

/// Ports tried for `preferred`: successive ports, never wrapping past 65535.
fn candidate_ports(preferred: u16, attempts: u16) -> impl Iterator<Item = u16> {
    (0..attempts.max(1)).map_while(move |offset| preferred.checked_add(offset))
}

impl TransportServer {
    pub fn new(ctx: Arc<ClientContext>, handler: Arc<dyn InboundHandler>, opts: ServerOptions) -> Self {
        Self {
            ctx,
            handler,
            opts,
            running: Mutex::new(None),
        }
    }

    /// Bind `preferred` or the next free port and start accepting. Publishes the bound port
    /// to the client context. Already running: returns the current port.
    pub async fn start(&self, preferred: u16) -> Result<u16, TransportError> {
        if let Some(port) = self.port() {
            log::info!("transport server already running on {}", port);
            return Ok(port);
        }
        let listener = self.bind(preferred).await?;
        let port = listener.local_addr()?.port();
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        // A concurrent start may have installed its listener while this one was binding.
        if let Some(r) = running.as_ref() {
            log::info!("transport server already running on {}, releasing {}", r.port, port);
            return Ok(r.port);
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            Arc::new(Semaphore::new(self.opts.max_connections.max(1))),
            self.opts.read_timeout,
            shutdown_rx,
        ));
        *running = Some(Running {
            port,
            shutdown,
            task,
        });
        drop(running);
        self.ctx.publish_local_port(port);
        log::info!("transport server listening on {}:{}", self.opts.bind_address, port);
        Ok(port)
    }

    async fn bind(&self, preferred: u16) -> Result<TcpListener, TransportError> {
        let mut last = preferred;
        for port in candidate_ports(preferred, self.opts.port_attempts) {
            last = port;
            match TcpListener::bind((self.opts.bind_address.as_str(), port)).await {
                Ok(l) => return Ok(l),
                Err(e) => log::debug!("port {} unavailable: {}", port, e),
            }
        }
        Err(TransportError::BindExhausted {
            first: preferred,
            last,
        })
    }

    /// Bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.port)
    }

    /// Close the listener and cancel in-flight connections. Idempotent; a no-op if never started.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut running) = running else {
            return;
        };
        let _ = running.shutdown.send(true);
        if tokio::time::timeout(self.opts.join_timeout, &mut running.task)
            .await
            .is_err()
        {
            log::warn!("accept loop did not exit in {:?}, aborting", self.opts.join_timeout);
            running.task.abort();
        }
        log::info!("transport server on {} stopped", running.port);
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = running.shutdown.send(true);
            running.task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn InboundHandler>,
    slots: Arc<Semaphore>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conns = JoinSet::new();
    loop {
        while conns.try_join_next().is_some() {}
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            p = slots.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            r = listener.accept() => match r {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        let handler = handler.clone();
        conns.spawn(async move {
            let _permit = permit;
            match read_message(stream, read_timeout).await {
                Ok(mut msg) => {
                    msg.source_ip = Some(peer.ip());
                    handler.on_message(msg, peer);
                }
                Err(e) => log::warn!("dropping connection from {}: {}", peer, e),
            }
        });
    }
    drop(listener);
    conns.shutdown().await;
}

/// Read exactly one frame from the connection, then let it close.
async fn read_message(mut stream: TcpStream, read_timeout: Duration) -> Result<WireMessage, TransportError> {
    let read = async {
        let mut header = [0u8; LEN_SIZE];
        stream.read_exact(&mut header).await?;
        let len = frame_len(header)?;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok::<_, TransportError>(decode_payload(&payload)?)
    };
    tokio::time::timeout(read_timeout, read)
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Media frames in flight per client. Frames beyond this are dropped, never queued.
pub const MAX_FRAMES_IN_FLIGHT: usize = 16;

/// Outbound side. Cheap to clone; all clones share the async-send and frame pools.
#[derive(Clone)]
pub struct TransportClient {
    ctx: Arc<ClientContext>,
    connect_timeout: Duration,
    pool: Arc<Semaphore>,
    frames: Arc<Semaphore>,
}

impl TransportClient {
    pub fn new(ctx: Arc<ClientContext>, connect_timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            ctx,
            connect_timeout,
            pool: Arc::new(Semaphore::new(max_in_flight.max(1))),
            frames: Arc::new(Semaphore::new(MAX_FRAMES_IN_FLIGHT)),
        }
    }

    /// Fill in the return address: sender id if absent, listening port if 0.
    pub fn stamp(&self, msg: &mut WireMessage) -> Result<(), TransportError> {
        if msg.sender_id.is_none() {
            msg.sender_id = Some(self.ctx.local_user);
        }
        if msg.source_port == 0 {
            msg.source_port = self
                .ctx
                .local_port()
                .ok_or(TransportError::ReturnAddressUnknown)?;
        }
        Ok(())
    }

    /// Connect, write one frame, flush, close.
    pub async fn send(&self, address: &str, port: u16, mut msg: WireMessage) -> Result<(), TransportError> {
        if port == 0 {
            return Err(TransportError::InvalidPort(address.to_string()));
        }
        self.stamp(&mut msg)?;
        let frame = encode_frame(&msg)?;
        let addr = format!("{}:{}", address, port);
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((address, port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|source| TransportError::SendFailed {
                addr: addr.clone(),
                source,
            })?;
        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await?;
            stream.shutdown().await
        };
        write
            .await
            .map_err(|source| TransportError::SendFailed { addr, source })
    }

    /// Fire-and-forget send on the bounded pool. Failures are only logged.
    pub fn send_async(&self, address: String, port: u16, msg: WireMessage) {
        let client = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = client.pool.clone().acquire_owned().await else {
                return;
            };
            let kind = msg.kind;
            if let Err(e) = client.send(&address, port, msg).await {
                log::warn!("async {:?} to {}:{} failed: {}", kind, address, port, e);
            }
        });
    }

    /// Send one media frame if a frame slot is free. Returns false, dropping the frame, when
    /// all slots are taken by sends to a slow or stalled peer.
    pub fn try_send_frame(&self, address: &str, port: u16, msg: WireMessage) -> bool {
        let Ok(permit) = self.frames.clone().try_acquire_owned() else {
            return false;
        };
        let client = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = client.send(&address, port, msg).await {
                log::debug!("frame to {}:{} lost: {}", address, port, e);
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::MessageType;
    use tokio::sync::mpsc;

    struct Collect(mpsc::UnboundedSender<(WireMessage, SocketAddr)>);

    impl InboundHandler for Collect {
        fn on_message(&self, msg: WireMessage, peer: SocketAddr) {
            let _ = self.0.send((msg, peer));
        }
    }

    fn loopback_opts() -> ServerOptions {
        ServerOptions {
            bind_address: "127.0.0.1".to_string(),
            read_timeout: Duration::from_millis(500),
            ..ServerOptions::default()
        }
    }

    fn server(user: u64) -> (TransportServer, Arc<ClientContext>, mpsc::UnboundedReceiver<(WireMessage, SocketAddr)>) {
        let ctx = Arc::new(ClientContext::new(UserId(user)));
        let (tx, rx) = mpsc::unbounded_channel();
        let s = TransportServer::new(ctx.clone(), Arc::new(Collect(tx)), loopback_opts());
        (s, ctx, rx)
    }

    #[test]
    fn candidate_ports_do_not_wrap() {
        assert_eq!(candidate_ports(65530, 100).count(), 6);
        assert_eq!(candidate_ports(5000, 3).collect::<Vec<_>>(), vec![5000, 5001, 5002]);
        assert_eq!(candidate_ports(5000, 0).count(), 1);
    }

    #[tokio::test]
    async fn second_server_takes_next_port() {
        let (a, _, _rx_a) = server(1);
        let (b, _, _rx_b) = server(2);
        let pa = a.start(0).await.unwrap();
        let pb = b.start(pa).await.unwrap();
        assert!(pb > pa && pb < pa + 100, "pa={pa} pb={pb}");
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn bind_exhausted_when_all_taken() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap().port();
        let ctx = Arc::new(ClientContext::new(UserId(1)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let s = TransportServer::new(
            ctx.clone(),
            Arc::new(Collect(tx)),
            ServerOptions {
                port_attempts: 1,
                ..loopback_opts()
            },
        );
        assert!(matches!(
            s.start(taken).await,
            Err(TransportError::BindExhausted { .. })
        ));
        assert_eq!(ctx.local_port(), None);
    }

    #[tokio::test]
    async fn roundtrip_stamps_listening_port_not_ephemeral() {
        let (recv_server, _, mut rx) = server(1);
        let (send_server, send_ctx, _rx2) = server(2);
        let recv_port = recv_server.start(0).await.unwrap();
        let send_port = send_server.start(0).await.unwrap();
        assert_eq!(send_ctx.local_port(), Some(send_port));

        let client = TransportClient::new(send_ctx, Duration::from_secs(2), 4);
        let msg = WireMessage::new(MessageType::TextMessage, None, Some(UserId(1))).with_content("hi");
        assert_eq!(msg.source_port, 0);
        client.send("127.0.0.1", recv_port, msg).await.unwrap();

        let (got, peer) = rx.recv().await.unwrap();
        assert_eq!(got.source_port, send_port);
        assert_ne!(got.source_port, peer.port());
        assert_eq!(got.sender_id, Some(UserId(2)));
        assert_eq!(got.source_ip, Some(peer.ip()));
        assert_eq!(got.content.as_deref(), Some("hi"));
        recv_server.stop().await;
        send_server.stop().await;
    }

    #[tokio::test]
    async fn send_without_published_port_fails_fast() {
        let ctx = Arc::new(ClientContext::new(UserId(3)));
        let client = TransportClient::new(ctx, Duration::from_secs(1), 1);
        let msg = WireMessage::new(MessageType::TextMessage, None, None);
        assert!(matches!(
            client.send("127.0.0.1", 9, msg.clone()).await,
            Err(TransportError::ReturnAddressUnknown)
        ));
        assert!(matches!(
            client.send("127.0.0.1", 0, msg).await,
            Err(TransportError::InvalidPort(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_peer_is_send_failed() {
        let ctx = Arc::new(ClientContext::new(UserId(3)));
        ctx.publish_local_port(5000);
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = TransportClient::new(ctx, Duration::from_secs(1), 1);
        let msg = WireMessage::new(MessageType::TextMessage, None, None);
        assert!(matches!(
            client.send("127.0.0.1", port, msg).await,
            Err(TransportError::SendFailed { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_frame_dropped_server_survives() {
        let (s, ctx, mut rx) = server(1);
        let port = s.start(0).await.unwrap();

        let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        raw.write_all(&8u32.to_le_bytes()).await.unwrap();
        raw.write_all(&[0xff; 8]).await.unwrap();
        drop(raw);

        let mut huge = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        huge.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        drop(huge);

        let client = TransportClient::new(ctx, Duration::from_secs(1), 1);
        client
            .send("127.0.0.1", port, WireMessage::new(MessageType::ReadReceipt, None, None))
            .await
            .unwrap();
        let (got, _) = rx.recv().await.unwrap();
        assert_eq!(got.kind, MessageType::ReadReceipt);
        assert!(rx.try_recv().is_err());
        s.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_listener() {
        let (s, _, _rx) = server(1);
        s.stop().await;
        let port = s.start(0).await.unwrap();
        assert_eq!(s.start(0).await.unwrap(), port);
        s.stop().await;
        s.stop().await;
        assert_eq!(s.port(), None);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn silent_connection_does_not_block_stop() {
        let (s, _, _rx) = server(1);
        let port = s.start(0).await.unwrap();
        let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(2), s.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_async_delivers() {
        let (s, ctx, mut rx) = server(1);
        let port = s.start(0).await.unwrap();
        let client = TransportClient::new(ctx, Duration::from_secs(1), 2);
        for i in 0..5 {
            let msg = WireMessage::new(MessageType::TextMessage, None, None).with_content(i.to_string());
            client.send_async("127.0.0.1".to_string(), port, msg);
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            let (m, _) = rx.recv().await.unwrap();
            seen.push(m.content.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
        s.stop().await;
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_listener() {
        let ctx = Arc::new(ClientContext::new(UserId(1)));
        let (tx, _rx) = mpsc::unbounded_channel();
        // A host name makes both binds wait on resolution, so the two starts interleave.
        let s = TransportServer::new(
            ctx.clone(),
            Arc::new(Collect(tx)),
            ServerOptions {
                bind_address: "localhost".to_string(),
                ..loopback_opts()
            },
        );
        let (a, b) = tokio::join!(s.start(0), s.start(0));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(ctx.local_port(), Some(a));
        s.stop().await;
        assert_eq!(s.port(), None);
    }

    #[tokio::test]
    async fn frames_beyond_the_pool_are_dropped() {
        let (s, ctx, mut rx) = server(1);
        let port = s.start(0).await.unwrap();
        let client = TransportClient::new(ctx, Duration::from_secs(1), 2);
        let frame = || WireMessage::new(MessageType::AudioStream, None, None).with_payload(vec![0; 64]);
        let accepted = (0..40)
            .filter(|_| client.try_send_frame("127.0.0.1", port, frame()))
            .count();
        assert_eq!(accepted, MAX_FRAMES_IN_FLIGHT);
        for _ in 0..accepted {
            rx.recv().await.unwrap();
        }
        // Slots come back as sends finish.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !client.try_send_frame("127.0.0.1", port, frame()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        rx.recv().await.unwrap();
        s.stop().await;
    }
}
