//! Outbound messaging by user id: address resolution, chat helpers, file send.
//! Also the signal path for calls and the frame outlet for media.

use std::path::Path;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parley_core::{MessageType, UserId, WireMessage};

use crate::call::SignalSender;
use crate::context::ClientContext;
use crate::files::{file_message, FileError};
use crate::media::{FrameOutlet, FrameRoute};
use crate::presence::DirectoryService;
use crate::transport::{TransportClient, TransportError};

#[derive(Clone)]
pub struct Messenger {
    ctx: Arc<ClientContext>,
    client: TransportClient,
    directory: Option<Arc<dyn DirectoryService>>,
}

impl Messenger {
    pub fn new(
        ctx: Arc<ClientContext>,
        client: TransportClient,
        directory: Option<Arc<dyn DirectoryService>>,
    ) -> Self {
        Self {
            ctx,
            client,
            directory,
        }
    }

    /// Address of `peer`: the local directory first, then the directory service when the entry is
    /// missing or has no port. Fails before any I/O to the peer if neither knows it.
    pub async fn resolve(&self, peer: UserId) -> Result<(String, u16), TransportError> {
        if let Some(entry) = self.ctx.peers.lookup(peer) {
            if entry.is_routable() {
                return Ok((entry.address, entry.port));
            }
        }
        if let Some(directory) = &self.directory {
            match directory.get_peer_info(peer).await {
                Ok(Some(info)) if info.port != 0 && !info.address.is_empty() => {
                    self.ctx.peers.upsert(peer, info.address.clone(), info.port);
                    return Ok((info.address, info.port));
                }
                Ok(_) => log::debug!("directory has no address for {}", peer),
                Err(e) => log::warn!("peer lookup for {} failed: {}", peer, e),
            }
        }
        Err(TransportError::PeerUnreachable(peer))
    }

    /// Send one message to `peer` and record the outcome on its directory entry.
    pub async fn send_to(&self, peer: UserId, mut msg: WireMessage) -> Result<(), TransportError> {
        msg.receiver_id.get_or_insert(peer);
        let (address, port) = self.resolve(peer).await?;
        let result = self.client.send(&address, port, msg).await;
        self.ctx.peers.set_connected(peer, result.is_ok());
        result
    }

    /// Fire-and-forget `send_to`. Failures are logged at warn, or at debug when `quiet`.
    pub fn send_to_async(&self, peer: UserId, msg: WireMessage) {
        self.spawn_send(peer, msg, false);
    }

    fn spawn_send(&self, peer: UserId, mut msg: WireMessage, quiet: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            msg.receiver_id.get_or_insert(peer);
            let kind = msg.kind;
            let sent = match this.resolve(peer).await {
                Ok((address, port)) => {
                    this.client.send_async(address, port, msg);
                    Ok(())
                }
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                if quiet {
                    log::debug!("{:?} to {} dropped: {}", kind, peer, e);
                } else {
                    log::warn!("{:?} to {} dropped: {}", kind, peer, e);
                }
            }
        });
    }

    fn outbound(&self, kind: MessageType, peer: UserId) -> WireMessage {
        WireMessage::new(kind, Some(self.ctx.local_user), Some(peer))
    }

    /// Returns the id of the sent message.
    pub async fn send_text(&self, peer: UserId, text: &str) -> Result<String, TransportError> {
        let msg = self.outbound(MessageType::TextMessage, peer).with_content(text);
        let id = msg.message_id.clone();
        self.send_to(peer, msg).await?;
        Ok(id)
    }

    pub fn send_typing(&self, peer: UserId, typing: bool) {
        let msg = self
            .outbound(MessageType::TypingIndicator, peer)
            .with_content(typing.to_string());
        self.spawn_send(peer, msg, true);
    }

    /// Acknowledge `message_id` as read.
    pub fn send_read_receipt(&self, peer: UserId, message_id: &str) {
        let msg = self
            .outbound(MessageType::ReadReceipt, peer)
            .with_content(message_id);
        self.spawn_send(peer, msg, true);
    }

    /// Send a whole file (at most 50 MiB). Returns the message id.
    pub async fn send_file(&self, peer: UserId, path: &Path) -> Result<String, FileError> {
        let msg = file_message(path, peer).await?;
        let id = msg.message_id.clone();
        self.send_to(peer, msg).await?;
        Ok(id)
    }
}

impl SignalSender for Messenger {
    fn send_signal(&self, peer: UserId, msg: WireMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        self.send_to(peer, msg).boxed()
    }
}

impl FrameOutlet for Messenger {
    fn route(&self, peer: UserId) -> BoxFuture<'_, Option<FrameRoute>> {
        async move {
            match self.resolve(peer).await {
                Ok((address, port)) => Some(FrameRoute { address, port }),
                Err(e) => {
                    log::warn!("no media route: {}", e);
                    None
                }
            }
        }
        .boxed()
    }

    fn send_frame(&self, route: &FrameRoute, msg: WireMessage) -> bool {
        self.client.try_send_frame(&route.address, route.port, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{ChannelListener, Dispatcher, StreamHandler};
    use crate::presence::fake::FakeDirectory;
    use crate::presence::PeerInfo;
    use crate::transport::{ServerOptions, TransportServer};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NoStreams;

    impl StreamHandler for NoStreams {
        fn on_stream(&self, _msg: WireMessage) {}
    }

    struct Peer {
        server: TransportServer,
        port: u16,
        inbox: mpsc::UnboundedReceiver<WireMessage>,
    }

    async fn peer(user: u64) -> Peer {
        let ctx = Arc::new(ClientContext::new(UserId(user)));
        let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), Arc::new(NoStreams)));
        let (listener, inbox) = ChannelListener::new();
        dispatcher.add_listener(Arc::new(listener));
        let server = TransportServer::new(
            ctx,
            dispatcher,
            ServerOptions {
                bind_address: "127.0.0.1".into(),
                ..ServerOptions::default()
            },
        );
        let port = server.start(0).await.unwrap();
        Peer { server, port, inbox }
    }

    fn messenger(directory: Option<Arc<dyn DirectoryService>>) -> (Messenger, Arc<ClientContext>) {
        let ctx = Arc::new(ClientContext::new(UserId(1)));
        ctx.publish_local_port(5999);
        let client = TransportClient::new(ctx.clone(), Duration::from_secs(1), 8);
        (Messenger::new(ctx.clone(), client, directory), ctx)
    }

    #[tokio::test]
    async fn unknown_peer_fails_before_io() {
        let (m, _) = messenger(None);
        assert!(matches!(
            m.send_text(UserId(2), "hi").await,
            Err(TransportError::PeerUnreachable(UserId(2)))
        ));
    }

    #[tokio::test]
    async fn text_reaches_peer_with_return_address() {
        let mut bob = peer(2).await;
        let (m, ctx) = messenger(None);
        ctx.peers.upsert(UserId(2), "127.0.0.1", bob.port);
        let id = m.send_text(UserId(2), "hello bob").await.unwrap();
        let got = bob.inbox.recv().await.unwrap();
        assert_eq!(got.message_id, id);
        assert_eq!(got.content.as_deref(), Some("hello bob"));
        assert_eq!(got.sender_id, Some(UserId(1)));
        assert_eq!(got.receiver_id, Some(UserId(2)));
        assert_eq!(got.source_port, 5999);
        assert!(ctx.peers.lookup(UserId(2)).unwrap().connected);
        bob.server.stop().await;
    }

    #[tokio::test]
    async fn placeholder_entry_resolved_through_directory() {
        let mut bob = peer(2).await;
        let dir = Arc::new(FakeDirectory::default());
        dir.peers.lock().unwrap().insert(
            UserId(2),
            PeerInfo {
                user_id: UserId(2),
                address: "127.0.0.1".into(),
                port: bob.port,
            },
        );
        let (m, ctx) = messenger(Some(dir.clone()));
        ctx.peers.observe(UserId(2), "127.0.0.1", 0);
        m.send_typing(UserId(2), true);
        let got = bob.inbox.recv().await.unwrap();
        assert_eq!(got.kind, MessageType::TypingIndicator);
        assert_eq!(got.typing_state(), Some(true));
        assert_eq!(ctx.peers.lookup(UserId(2)).unwrap().port, bob.port);
        assert_eq!(dir.calls(), vec!["peer 2"]);
        bob.server.stop().await;
    }

    #[tokio::test]
    async fn directory_outage_is_unreachable() {
        let dir = Arc::new(FakeDirectory::default());
        dir.failing.store(true, Ordering::SeqCst);
        let (m, _) = messenger(Some(dir));
        assert!(matches!(
            m.resolve(UserId(3)).await,
            Err(TransportError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn failed_send_marks_disconnected() {
        let (m, ctx) = messenger(None);
        let dead_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        ctx.peers.upsert(UserId(2), "127.0.0.1", dead_port);
        assert!(m.send_text(UserId(2), "anyone?").await.is_err());
        assert!(!ctx.peers.lookup(UserId(2)).unwrap().connected);
    }

    #[tokio::test]
    async fn frame_route_comes_from_the_directory() {
        let mut bob = peer(2).await;
        let (m, ctx) = messenger(None);
        assert_eq!(m.route(UserId(2)).await, None);
        ctx.peers.upsert(UserId(2), "127.0.0.1", bob.port);
        let route = m.route(UserId(2)).await.unwrap();
        assert_eq!(
            route,
            FrameRoute {
                address: "127.0.0.1".into(),
                port: bob.port
            }
        );
        // Frames bypass the listeners; a chat message sent after them still arrives.
        let frame = WireMessage::new(MessageType::AudioStream, Some(UserId(1)), Some(UserId(2)));
        assert!(m.send_frame(&route, frame));
        m.send_text(UserId(2), "after the frame").await.unwrap();
        let got = bob.inbox.recv().await.unwrap();
        assert_eq!(got.content.as_deref(), Some("after the frame"));
        bob.server.stop().await;
    }

    #[tokio::test]
    async fn read_receipt_carries_message_id() {
        let mut bob = peer(2).await;
        let (m, ctx) = messenger(None);
        ctx.peers.upsert(UserId(2), "127.0.0.1", bob.port);
        m.send_read_receipt(UserId(2), "msg-17");
        let got = bob.inbox.recv().await.unwrap();
        assert_eq!(got.kind, MessageType::ReadReceipt);
        assert_eq!(got.content.as_deref(), Some("msg-17"));
        bob.server.stop().await;
    }
}
