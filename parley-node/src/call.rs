//! Call controller: one task owns the current call session. Local commands and inbound CALL_*
//! signals are queued to it, so the session is only ever mutated there.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parley_core::call::BUSY_CONTENT;
use parley_core::{CallEffect, CallError, CallSession, CallStatus, CallType, MessageType, UserId, WireMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::dispatcher::MessageListener;
use crate::transport::TransportError;

/// Delivers call signals to the peer.
pub trait SignalSender: Send + Sync + 'static {
    fn send_signal(&self, peer: UserId, msg: WireMessage) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Starts and stops the media pipelines for a call.
pub trait MediaControl: Send + Sync + 'static {
    fn start_media(&self, peer: UserId, call_type: CallType) -> BoxFuture<'_, ()>;
    fn stop_media(&self) -> BoxFuture<'_, ()>;
}

/// Read-only view of the current call for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub call_id: String,
    pub peer: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub is_caller: bool,
    pub duration: Duration,
}

impl From<&CallSession> for CallSnapshot {
    fn from(s: &CallSession) -> Self {
        Self {
            call_id: s.call_id().to_string(),
            peer: s.peer(),
            call_type: s.call_type(),
            status: s.status(),
            is_caller: s.is_caller(),
            duration: s.duration(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// A peer is ringing us; answer or reject through the handle.
    Incoming(CallSnapshot),
    Updated(CallSnapshot),
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Initiate {
        peer: UserId,
        call_type: CallType,
        reply: Reply<CallSnapshot>,
    },
    Answer(Reply<CallSnapshot>),
    Reject(Reply<CallSnapshot>),
    HangUp(oneshot::Sender<Option<CallSnapshot>>),
    Snapshot(oneshot::Sender<Option<CallSnapshot>>),
    Signal(WireMessage),
    RingTimeout(String),
}

/// Cheap handle to the controller task. Also the dispatcher listener for call signals.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CallHandle {
    pub async fn initiate(&self, peer: UserId, call_type: CallType) -> Result<CallSnapshot, CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Initiate {
            peer,
            call_type,
            reply,
        }, rx)
        .await
    }

    pub async fn answer(&self) -> Result<CallSnapshot, CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Answer(reply), rx).await
    }

    pub async fn reject(&self) -> Result<CallSnapshot, CallError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Reject(reply), rx).await
    }

    /// End the current call. None when there is no call at all.
    pub async fn hang_up(&self) -> Option<CallSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::HangUp(reply)).ok()?;
        rx.await.ok().flatten()
    }

    /// Current or most recent call.
    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Snapshot(reply)).ok()?;
        rx.await.ok().flatten()
    }

    async fn request<T>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<Result<T, CallError>>,
    ) -> Result<T, CallError> {
        self.tx.send(cmd).map_err(|_| CallError::NoActiveCall)?;
        rx.await.map_err(|_| CallError::NoActiveCall)?
    }
}

impl MessageListener for CallHandle {
    fn on_message(&self, msg: &WireMessage) -> anyhow::Result<()> {
        if msg.kind.is_call_signal() {
            self.tx
                .send(Command::Signal(msg.clone()))
                .map_err(|_| anyhow::anyhow!("call controller stopped"))?;
        }
        Ok(())
    }
}

pub struct CallController {
    local: UserId,
    session: Option<CallSession>,
    signals: Arc<dyn SignalSender>,
    media: Arc<dyn MediaControl>,
    ring_timeout: Duration,
    timer: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<CallEvent>,
    timeouts: mpsc::WeakUnboundedSender<Command>,
}

impl CallController {
    /// Spawn the controller task. It exits once every handle is dropped.
    pub fn spawn(
        local: UserId,
        signals: Arc<dyn SignalSender>,
        media: Arc<dyn MediaControl>,
        ring_timeout: Duration,
    ) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = CallController {
            local,
            session: None,
            signals,
            media,
            ring_timeout,
            timer: None,
            events,
            timeouts: tx.downgrade(),
        };
        let task = tokio::spawn(controller.run(rx));
        (CallHandle { tx }, events_rx, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
        }
        if let Some(effects) = self.session.as_mut().map(CallSession::hang_up) {
            self.apply(effects).await;
        }
    }

    fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.as_ref().map(CallSnapshot::from)
    }

    fn live(&self) -> bool {
        self.session.as_ref().is_some_and(CallSession::is_live)
    }

    fn publish(&self) {
        if let Some(s) = self.snapshot() {
            let _ = self.events.send(CallEvent::Updated(s));
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Initiate {
                peer,
                call_type,
                reply,
            } => {
                let _ = reply.send(self.initiate(peer, call_type).await);
            }
            Command::Answer(reply) => {
                let result = self.respond(CallSession::accept).await;
                let _ = reply.send(result);
            }
            Command::Reject(reply) => {
                let result = self.respond(CallSession::decline).await;
                let _ = reply.send(result);
            }
            Command::HangUp(reply) => {
                if let Some(effects) = self.session.as_mut().map(CallSession::hang_up) {
                    if !effects.is_empty() {
                        self.apply(effects).await;
                        self.publish();
                    }
                }
                let _ = reply.send(self.snapshot());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Signal(msg) => self.on_signal(msg).await,
            Command::RingTimeout(call_id) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.call_id() != call_id {
                    return;
                }
                let effects = session.timed_out();
                if !effects.is_empty() {
                    log::info!("call {} to {} not answered", call_id, session.peer());
                    self.apply(effects).await;
                    self.publish();
                }
            }
        }
    }

    async fn initiate(&mut self, peer: UserId, call_type: CallType) -> Result<CallSnapshot, CallError> {
        if self.live() {
            return Err(CallError::AlreadyInCall);
        }
        let session = CallSession::outgoing(peer, call_type);
        let offer = session.offer(self.local);
        self.session = Some(session);
        let sent = self.signals.send_signal(peer, offer).await;
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let effects = match sent {
            Ok(()) => session.offer_sent(),
            Err(e) => {
                log::warn!("call offer to {} failed: {}", peer, e);
                session.offer_failed()
            }
        };
        self.apply(effects).await;
        self.publish();
        self.snapshot().ok_or(CallError::NoActiveCall)
    }

    async fn respond(
        &mut self,
        transition: fn(&mut CallSession) -> Result<Vec<CallEffect>, CallError>,
    ) -> Result<CallSnapshot, CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        let effects = transition(session)?;
        self.apply(effects).await;
        self.publish();
        self.snapshot().ok_or(CallError::NoActiveCall)
    }

    async fn on_signal(&mut self, msg: WireMessage) {
        if msg.kind == MessageType::CallOffer {
            self.on_offer(msg).await;
            return;
        }
        let Some(session) = self.session.as_mut() else {
            log::debug!("{:?} with no call in progress", msg.kind);
            return;
        };
        let effects = session.on_signal(&msg);
        if effects.is_empty() {
            log::debug!("ignoring {:?} for call {}", msg.kind, msg.message_id);
            return;
        }
        self.apply(effects).await;
        self.publish();
    }

    async fn on_offer(&mut self, offer: WireMessage) {
        let Some(caller) = offer.sender_id else {
            log::warn!("call offer without sender");
            return;
        };
        if self.live() {
            if self
                .session
                .as_ref()
                .is_some_and(|s| s.call_id() == offer.message_id)
            {
                return;
            }
            log::info!("busy: rejecting call {} from {}", offer.message_id, caller);
            let busy = WireMessage::new(MessageType::CallReject, Some(self.local), Some(caller))
                .with_id(offer.message_id.clone())
                .with_content(BUSY_CONTENT);
            self.send_detached(caller, busy);
            return;
        }
        match CallSession::incoming(&offer) {
            Ok(session) => {
                log::info!("incoming {} call {} from {}", session.call_type(), session.call_id(), caller);
                let snapshot = CallSnapshot::from(&session);
                self.session = Some(session);
                let _ = self.events.send(CallEvent::Incoming(snapshot));
            }
            Err(e) => log::warn!("bad call offer from {}: {}", caller, e),
        }
    }

    async fn apply(&mut self, effects: Vec<CallEffect>) {
        for effect in effects {
            match effect {
                CallEffect::Send(kind, content) => {
                    let Some(session) = self.session.as_ref() else {
                        continue;
                    };
                    let peer = session.peer();
                    let msg = session.signal(self.local, kind, content);
                    // Closing signals must not hold up teardown or the next command.
                    if session.status().is_terminal() {
                        self.send_detached(peer, msg);
                    } else if let Err(e) = self.signals.send_signal(peer, msg).await {
                        log::warn!("{:?} to {} failed: {}", kind, peer, e);
                    }
                }
                CallEffect::StartMedia => {
                    if let Some((peer, call_type)) = self.session.as_ref().map(|s| (s.peer(), s.call_type())) {
                        self.media.start_media(peer, call_type).await;
                    }
                }
                CallEffect::StopMedia => self.media.stop_media().await,
                CallEffect::ArmTimeout => self.arm_timeout(),
                CallEffect::CancelTimeout => {
                    if let Some(timer) = self.timer.take() {
                        timer.abort();
                    }
                }
            }
        }
    }

    fn send_detached(&self, peer: UserId, msg: WireMessage) {
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let kind = msg.kind;
            if let Err(e) = signals.send_signal(peer, msg).await {
                log::warn!("{:?} to {} failed: {}", kind, peer, e);
            }
        });
    }

    fn arm_timeout(&mut self) {
        let Some(call_id) = self.session.as_ref().map(|s| s.call_id().to_string()) else {
            return;
        };
        if let Some(old) = self.timer.take() {
            old.abort();
        }
        let tx = self.timeouts.clone();
        let after = self.ring_timeout;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::RingTimeout(call_id));
            }
        }));
    }
}
