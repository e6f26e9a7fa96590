//! Inbound message routing: refresh the sender in the peer directory, hand media frames to the
//! media manager, fan everything else out to registered listeners.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use parley_core::{MessageType, WireMessage};
use tokio::sync::mpsc;

use crate::context::ClientContext;
use crate::transport::InboundHandler;

/// Subscriber for non-stream messages. A returned error or panic is logged and isolated.
pub trait MessageListener: Send + Sync + 'static {
    fn on_message(&self, msg: &WireMessage) -> anyhow::Result<()>;
}

impl<F> MessageListener for F
where
    F: Fn(&WireMessage) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, msg: &WireMessage) -> anyhow::Result<()> {
        self(msg)
    }
}

/// Receive path for AUDIO_STREAM / VIDEO_STREAM.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_stream(&self, msg: WireMessage);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct Dispatcher {
    ctx: Arc<ClientContext>,
    streams: Arc<dyn StreamHandler>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn MessageListener>)>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ClientContext>, streams: Arc<dyn StreamHandler>) -> Self {
        Self {
            ctx,
            streams,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns false if no listener has that id.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn dispatch(&self, msg: WireMessage, peer: SocketAddr) {
        if let Some(sender) = msg.sender_id {
            self.ctx
                .peers
                .observe(sender, peer.ip().to_string(), msg.source_port);
        }
        if msg.kind.is_stream() {
            self.streams.on_stream(msg);
            return;
        }
        // Snapshot so a listener may add or remove listeners without deadlocking.
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_message(&msg))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("listener {:?} failed on {:?}: {:#}", id, msg.kind, e),
                Err(_) => log::error!("listener {:?} panicked on {:?}", id, msg.kind),
            }
        }
    }
}

impl InboundHandler for Dispatcher {
    fn on_message(&self, msg: WireMessage, peer: SocketAddr) {
        self.dispatch(msg, peer);
    }
}

/// Forwards matching messages into a channel; the receiving end lives at the presentation boundary.
pub struct ChannelListener {
    kinds: Option<Vec<MessageType>>,
    tx: mpsc::UnboundedSender<WireMessage>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { kinds: None, tx }, rx)
    }

    /// Only forward these message kinds.
    pub fn only(kinds: &[MessageType]) -> (Self, mpsc::UnboundedReceiver<WireMessage>) {
        let (mut l, rx) = Self::new();
        l.kinds = Some(kinds.to_vec());
        (l, rx)
    }
}

impl MessageListener for ChannelListener {
    fn on_message(&self, msg: &WireMessage) -> anyhow::Result<()> {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&msg.kind) {
                return Ok(());
            }
        }
        self.tx
            .send(msg.clone())
            .map_err(|_| anyhow::anyhow!("channel receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::UserId;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct StreamSink(Mutex<Vec<MessageType>>);

    impl StreamHandler for StreamSink {
        fn on_stream(&self, msg: WireMessage) {
            self.0.lock().unwrap().push(msg.kind);
        }
    }

    fn setup() -> (Dispatcher, Arc<ClientContext>, Arc<StreamSink>) {
        let ctx = Arc::new(ClientContext::new(UserId(1)));
        let sink = Arc::new(StreamSink::default());
        (Dispatcher::new(ctx.clone(), sink.clone()), ctx, sink)
    }

    fn peer() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn MessageListener>) {
        let n = Arc::new(AtomicUsize::new(0));
        let c = n.clone();
        let l = move |_: &WireMessage| -> anyhow::Result<()> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        (n, Arc::new(l))
    }

    fn msg(kind: MessageType) -> WireMessage {
        let mut m = WireMessage::new(kind, Some(UserId(7)), Some(UserId(1)));
        m.source_port = 5004;
        m
    }

    #[test]
    fn streams_bypass_listeners() {
        let (d, _, sink) = setup();
        let (n, l) = counter();
        d.add_listener(l);
        d.dispatch(msg(MessageType::AudioStream), peer());
        d.dispatch(msg(MessageType::VideoStream), peer());
        assert_eq!(n.load(Ordering::SeqCst), 0);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![MessageType::AudioStream, MessageType::VideoStream]
        );
    }

    #[test]
    fn every_listener_once_despite_failures() {
        let (d, _, sink) = setup();
        let (a, la) = counter();
        let (b, lb) = counter();
        d.add_listener(la);
        d.add_listener(Arc::new(|_: &WireMessage| -> anyhow::Result<()> {
            anyhow::bail!("listener error")
        }));
        d.add_listener(Arc::new(|_: &WireMessage| -> anyhow::Result<()> {
            panic!("listener panic")
        }));
        d.add_listener(lb);
        for kind in [
            MessageType::TextMessage,
            MessageType::FileTransfer,
            MessageType::TypingIndicator,
            MessageType::ReadReceipt,
            MessageType::CallOffer,
            MessageType::CallAnswer,
            MessageType::CallReject,
            MessageType::CallEnd,
        ] {
            d.dispatch(msg(kind), peer());
        }
        assert_eq!(a.load(Ordering::SeqCst), 8);
        assert_eq!(b.load(Ordering::SeqCst), 8);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn sender_recorded_with_socket_address() {
        let (d, ctx, _) = setup();
        d.dispatch(msg(MessageType::TextMessage), peer());
        let e = ctx.peers.lookup(UserId(7)).unwrap();
        assert_eq!(e.address, "192.168.1.20");
        assert_eq!(e.port, 5004);

        let mut anon = msg(MessageType::TextMessage);
        anon.sender_id = None;
        d.dispatch(anon, peer());
        assert_eq!(ctx.peers.len(), 1);
    }

    #[test]
    fn remove_listener_by_id() {
        let (d, _, _) = setup();
        let (n, l) = counter();
        let id = d.add_listener(l);
        d.dispatch(msg(MessageType::TextMessage), peer());
        assert!(d.remove_listener(id));
        assert!(!d.remove_listener(id));
        d.dispatch(msg(MessageType::TextMessage), peer());
        assert_eq!(n.load(Ordering::SeqCst), 1);
        assert_eq!(d.listener_count(), 0);
    }

    #[test]
    fn channel_listener_filters() {
        let (d, _, _) = setup();
        let (l, mut rx) = ChannelListener::only(&[MessageType::TextMessage]);
        d.add_listener(Arc::new(l));
        d.dispatch(msg(MessageType::CallEnd), peer());
        d.dispatch(msg(MessageType::TextMessage), peer());
        assert_eq!(rx.try_recv().unwrap().kind, MessageType::TextMessage);
        assert!(rx.try_recv().is_err());
    }
}
