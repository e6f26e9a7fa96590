//! Call session state machine. Pure: transitions return effects and the host performs them
//! (send the signal, start or stop media, arm or cancel the no-answer timer).

use std::time::{Duration, Instant};

use crate::protocol::{new_message_id, CallType, MessageType, UserId, WireMessage};

/// How long a placed call rings before it becomes NO_ANSWER.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Content of a CALL_REJECT sent because the callee is already in a call.
pub const BUSY_CONTENT: &str = "BUSY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    Initiating,
    Ringing,
    Connected,
    Ended,
    Rejected,
    NoAnswer,
    Failed,
    Busy,
}

impl CallStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Ended
                | CallStatus::Rejected
                | CallStatus::NoAnswer
                | CallStatus::Failed
                | CallStatus::Busy
        )
    }
}

/// Work the host must do after a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEffect {
    /// Send a signal of this type with this content to the call peer.
    Send(MessageType, &'static str),
    StartMedia,
    StopMedia,
    ArmTimeout,
    CancelTimeout,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CallError {
    #[error("offer has no sender")]
    MissingSender,
    #[error("offer has no call type")]
    MissingCallType,
    #[error("offer carries unknown call type {0:?}")]
    BadCallType(String),
    #[error("not a call offer")]
    NotAnOffer,
    #[error("operation not valid in state {0:?}")]
    InvalidState(CallStatus),
    #[error("already in a call")]
    AlreadyInCall,
    #[error("no active call")]
    NoActiveCall,
}

/// One call's lifecycle, from either side.
#[derive(Debug, Clone)]
pub struct CallSession {
    call_id: String,
    peer: UserId,
    call_type: CallType,
    status: CallStatus,
    is_caller: bool,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
}

impl CallSession {
    /// Session for a call this side places. Starts in INITIATING; send `offer()` next.
    pub fn outgoing(peer: UserId, call_type: CallType) -> Self {
        Self {
            call_id: new_message_id(),
            peer,
            call_type,
            status: CallStatus::Initiating,
            is_caller: true,
            started_at: None,
            ended_at: None,
        }
    }

    /// Session for a received CALL_OFFER. Starts in RINGING since this side did not initiate.
    pub fn incoming(offer: &WireMessage) -> Result<Self, CallError> {
        if offer.kind != MessageType::CallOffer {
            return Err(CallError::NotAnOffer);
        }
        let peer = offer.sender_id.ok_or(CallError::MissingSender)?;
        let raw = offer.content.as_deref().ok_or(CallError::MissingCallType)?;
        let call_type = raw
            .parse()
            .map_err(|_| CallError::BadCallType(raw.to_string()))?;
        Ok(Self {
            call_id: offer.message_id.clone(),
            peer,
            call_type,
            status: CallStatus::Ringing,
            is_caller: false,
            started_at: None,
            ended_at: None,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn peer(&self) -> UserId {
        self.peer
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn is_caller(&self) -> bool {
        self.is_caller
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Time connected: (end or now) - start; zero if the call never connected.
    pub fn duration(&self) -> Duration {
        match self.started_at {
            Some(start) => self
                .ended_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }

    /// The CALL_OFFER for this outgoing call.
    pub fn offer(&self, local: UserId) -> WireMessage {
        self.signal(local, MessageType::CallOffer, self.call_type.as_str())
    }

    /// Build a signal for the peer. Signals reuse the call id as message id.
    pub fn signal(&self, local: UserId, kind: MessageType, content: &str) -> WireMessage {
        WireMessage::new(kind, Some(local), Some(self.peer))
            .with_id(self.call_id.clone())
            .with_content(content)
    }

    /// Whether an inbound signal belongs to this session.
    pub fn matches(&self, msg: &WireMessage) -> bool {
        msg.sender_id == Some(self.peer) && msg.message_id == self.call_id
    }

    /// Offer delivered: INITIATING -> RINGING and start the no-answer timer.
    pub fn offer_sent(&mut self) -> Vec<CallEffect> {
        if self.status != CallStatus::Initiating {
            return Vec::new();
        }
        self.status = CallStatus::Ringing;
        vec![CallEffect::ArmTimeout]
    }

    /// Offer could not be delivered: FAILED.
    pub fn offer_failed(&mut self) -> Vec<CallEffect> {
        if self.status != CallStatus::Initiating {
            return Vec::new();
        }
        self.finish(CallStatus::Failed)
    }

    /// No-answer timer fired. Only acts while still ringing; the callee is told to stop ringing.
    pub fn timed_out(&mut self) -> Vec<CallEffect> {
        if self.status != CallStatus::Ringing || !self.is_caller {
            return Vec::new();
        }
        let mut effects = vec![CallEffect::Send(MessageType::CallEnd, "ENDED")];
        effects.extend(self.finish(CallStatus::NoAnswer));
        effects
    }

    /// Callee accepts: RINGING -> CONNECTED.
    pub fn accept(&mut self) -> Result<Vec<CallEffect>, CallError> {
        if self.is_caller || self.status != CallStatus::Ringing {
            return Err(CallError::InvalidState(self.status));
        }
        self.connect();
        Ok(vec![
            CallEffect::Send(MessageType::CallAnswer, "ACCEPTED"),
            CallEffect::StartMedia,
        ])
    }

    /// Callee declines: RINGING -> REJECTED.
    pub fn decline(&mut self) -> Result<Vec<CallEffect>, CallError> {
        if self.is_caller || self.status != CallStatus::Ringing {
            return Err(CallError::InvalidState(self.status));
        }
        let mut effects = vec![CallEffect::Send(MessageType::CallReject, "REJECTED")];
        effects.extend(self.finish(CallStatus::Rejected));
        Ok(effects)
    }

    /// Local end-call. Tells the peer unless the session already reached a terminal state.
    pub fn hang_up(&mut self) -> Vec<CallEffect> {
        if self.status.is_terminal() {
            return Vec::new();
        }
        let mut effects = vec![CallEffect::Send(MessageType::CallEnd, "ENDED")];
        effects.extend(self.finish(CallStatus::Ended));
        effects
    }

    /// Inbound signal from the peer. Signals for other sessions and anything after a terminal
    /// state are ignored.
    pub fn on_signal(&mut self, msg: &WireMessage) -> Vec<CallEffect> {
        if self.status.is_terminal() || !self.matches(msg) {
            return Vec::new();
        }
        match msg.kind {
            MessageType::CallAnswer
                if self.is_caller && self.status == CallStatus::Ringing =>
            {
                self.connect();
                vec![CallEffect::CancelTimeout, CallEffect::StartMedia]
            }
            MessageType::CallReject => {
                let busy = msg.content.as_deref() == Some(BUSY_CONTENT);
                self.finish(if busy {
                    CallStatus::Busy
                } else {
                    CallStatus::Rejected
                })
            }
            MessageType::CallEnd => self.finish(CallStatus::Ended),
            _ => Vec::new(),
        }
    }

    fn connect(&mut self) {
        self.status = CallStatus::Connected;
        self.started_at = Some(Instant::now());
    }

    fn finish(&mut self, status: CallStatus) -> Vec<CallEffect> {
        self.status = status;
        if self.started_at.is_some() {
            self.ended_at = Some(Instant::now());
        }
        vec![CallEffect::CancelTimeout, CallEffect::StopMedia]
    }
}
