//! Media pipelines: paced capture/encode/send loop and queued receive/decode/render loop per kind.
//! Capture hardware, codecs and rendering are opaque collaborators behind traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parley_core::{
    AudioQuality, CallType, FrameQueue, MediaKind, MediaQuality, Pacer, UserId, VideoQuality, WireMessage,
};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::call::MediaControl;
use crate::dispatcher::StreamHandler;

/// Wait between attempts to re-acquire a failed capture device.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);
pub const AUDIO_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const VIDEO_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("codec: {0}")]
    Codec(String),
}

pub trait CaptureDevice: Send + 'static {
    fn open(&mut self, quality: MediaQuality) -> Result<(), MediaError>;
    fn capture(&mut self) -> Result<Vec<u8>, MediaError>;
    fn close(&mut self);
}

pub trait Codec: Send + Sync + 'static {
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, MediaError>;
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, MediaError>;
}

pub trait Renderer: Send + Sync + 'static {
    fn render(&self, frame: Vec<u8>);
}

/// Resolved destination for one peer's frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRoute {
    pub address: String,
    pub port: u16,
}

/// Where encoded frames go.
pub trait FrameOutlet: Send + Sync + 'static {
    /// Resolve `peer` once per pipeline start. None when it has no usable address.
    fn route(&self, peer: UserId) -> BoxFuture<'_, Option<FrameRoute>>;
    /// Hand one frame over without waiting. False when it was dropped.
    fn send_frame(&self, route: &FrameRoute, msg: WireMessage) -> bool;
}

/// Device for hosts without capture hardware; the pipeline streams placeholder frames.
pub struct NoDevice;

impl CaptureDevice for NoDevice {
    fn open(&mut self, _quality: MediaQuality) -> Result<(), MediaError> {
        Err(MediaError::DeviceUnavailable("no capture device".into()))
    }

    fn capture(&mut self) -> Result<Vec<u8>, MediaError> {
        Err(MediaError::DeviceUnavailable("no capture device".into()))
    }

    fn close(&mut self) {}
}

pub struct PassthroughCodec;

impl Codec for PassthroughCodec {
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, MediaError> {
        Ok(raw.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, MediaError> {
        Ok(data.to_vec())
    }
}

pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn render(&self, _frame: Vec<u8>) {}
}

/// Collaborators for one pipeline.
pub struct MediaParts {
    pub device: Box<dyn CaptureDevice>,
    pub codec: Arc<dyn Codec>,
    pub renderer: Arc<dyn Renderer>,
}

impl MediaParts {
    /// No hardware: placeholder capture, raw frames, nothing rendered.
    pub fn headless() -> Self {
        Self {
            device: Box::new(NoDevice),
            codec: Arc::new(PassthroughCodec),
            renderer: Arc::new(NullRenderer),
        }
    }
}

type SharedDevice = Arc<Mutex<Box<dyn CaptureDevice>>>;

fn lock(device: &SharedDevice) -> std::sync::MutexGuard<'_, Box<dyn CaptureDevice>> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a device call on the blocking pool. The device lock is only ever taken there.
/// None if the call panicked.
async fn on_device<T, F>(device: &SharedDevice, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn CaptureDevice>) -> T + Send + 'static,
{
    let device = device.clone();
    tokio::task::spawn_blocking(move || {
        let mut d = lock(&device);
        f(&mut d)
    })
    .await
    .ok()
}

struct Running {
    peer: UserId,
    stop: watch::Sender<bool>,
    send: JoinHandle<()>,
    recv: JoinHandle<()>,
}

/// One media kind's send and receive loops with an idempotent start/stop lifecycle.
pub struct MediaPipeline {
    kind: MediaKind,
    local: UserId,
    device: SharedDevice,
    codec: Arc<dyn Codec>,
    renderer: Arc<dyn Renderer>,
    outlet: Arc<dyn FrameOutlet>,
    quality: watch::Sender<MediaQuality>,
    suspended: Arc<AtomicBool>,
    inbound: Arc<Mutex<FrameQueue>>,
    inbound_ready: Arc<Notify>,
    join_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl MediaPipeline {
    pub fn new(
        local: UserId,
        quality: MediaQuality,
        parts: MediaParts,
        outlet: Arc<dyn FrameOutlet>,
        join_timeout: Duration,
    ) -> Self {
        let kind = quality.kind();
        let (quality, _) = watch::channel(quality);
        Self {
            kind,
            local,
            device: Arc::new(Mutex::new(parts.device)),
            codec: parts.codec,
            renderer: parts.renderer,
            outlet,
            quality,
            suspended: Arc::new(AtomicBool::new(false)),
            inbound: Arc::new(Mutex::new(FrameQueue::new(kind.queue_depth()))),
            inbound_ready: Arc::new(Notify::new()),
            join_timeout,
            running: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn quality(&self) -> MediaQuality {
        *self.quality.borrow()
    }

    /// Takes effect on the next capture; frames already sent are unaffected. Ignored if the
    /// preset is for the other media kind.
    pub fn set_quality(&self, quality: MediaQuality) {
        if quality.kind() != self.kind {
            log::warn!("ignoring {:?} preset for {:?} pipeline", quality, self.kind);
            return;
        }
        self.quality.send_replace(quality);
    }

    /// Mute (audio) or camera off (video): stop capturing and sending, keep receiving.
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Relaxed);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    /// Start streaming to `peer`. A running pipeline is left alone.
    pub fn start(&self, peer: UserId) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = running.as_ref() {
            log::info!("{:?} pipeline already running for {}", self.kind, r.peer);
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let sender = SendLoop {
            kind: self.kind,
            local: self.local,
            peer,
            device: self.device.clone(),
            codec: self.codec.clone(),
            outlet: self.outlet.clone(),
            suspended: self.suspended.clone(),
        };
        let send = tokio::spawn(sender.run(self.quality.subscribe(), stop_rx.clone()));
        let recv = tokio::spawn(receive_loop(
            self.inbound.clone(),
            self.inbound_ready.clone(),
            self.codec.clone(),
            self.renderer.clone(),
            stop_rx,
        ));
        *running = Some(Running {
            peer,
            stop,
            send,
            recv,
        });
        log::info!("{:?} pipeline started for {}", self.kind, peer);
    }

    /// Stop both loops within the join timeout, aborting any that overrun. No-op when stopped.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut r) = running else {
            return;
        };
        let _ = r.stop.send(true);
        let joined = tokio::time::timeout(self.join_timeout, async {
            let _ = (&mut r.send).await;
            let _ = (&mut r.recv).await;
        })
        .await;
        if joined.is_err() {
            log::warn!("{:?} pipeline did not stop in {:?}, aborting", self.kind, self.join_timeout);
            r.send.abort();
            r.recv.abort();
        }
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        log::info!("{:?} pipeline stopped", self.kind);
    }

    /// Queue a received frame for decode and render. Dropped when the pipeline is stopped.
    pub fn on_frame(&self, payload: Vec<u8>) {
        if !self.is_running() {
            return;
        }
        let dropped = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload);
        if dropped {
            log::debug!("{:?} receive queue full, dropped oldest frame", self.kind);
        }
        self.inbound_ready.notify_one();
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        if let Some(r) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            r.send.abort();
            r.recv.abort();
        }
    }
}

struct SendLoop {
    kind: MediaKind,
    local: UserId,
    peer: UserId,
    device: SharedDevice,
    codec: Arc<dyn Codec>,
    outlet: Arc<dyn FrameOutlet>,
    suspended: Arc<AtomicBool>,
}

impl SendLoop {
    async fn run(self, mut quality_rx: watch::Receiver<MediaQuality>, mut stop: watch::Receiver<bool>) {
        let mut quality = *quality_rx.borrow_and_update();
        let mut pacer = Pacer::new(quality.frame_rate());
        let mut route = self.outlet.route(self.peer).await;
        let mut next_route = Instant::now() + RETRY_BACKOFF;
        let mut retry: Option<JoinHandle<()>> = None;
        let mut live = self.open(quality, false, &mut retry).await;
        loop {
            let frame_start = Instant::now();
            if quality_rx.has_changed().unwrap_or(false) {
                quality = *quality_rx.borrow_and_update();
                pacer = Pacer::new(quality.frame_rate());
                if let Some(r) = retry.take() {
                    r.abort();
                }
                live = self.open(quality, true, &mut retry).await;
                log::info!("{:?} quality now {:?}", self.kind, quality);
            }
            if retry.as_ref().is_some_and(JoinHandle::is_finished) {
                retry = None;
                live = true;
                log::info!("{:?} capture device recovered", self.kind);
            }
            if route.is_none() && frame_start >= next_route {
                route = self.outlet.route(self.peer).await;
                next_route = Instant::now() + RETRY_BACKOFF;
            }
            if !self.suspended.load(Ordering::Relaxed) {
                let raw = if live {
                    match on_device(&self.device, |d| d.capture()).await {
                        Some(Ok(frame)) => frame,
                        failed => {
                            let reason = match failed {
                                Some(Err(e)) => e.to_string(),
                                _ => "device panicked".to_string(),
                            };
                            log::warn!("{:?} capture failed, using placeholder: {}", self.kind, reason);
                            live = false;
                            retry = Some(self.spawn_retry(quality));
                            quality.placeholder_frame()
                        }
                    }
                } else {
                    quality.placeholder_frame()
                };
                self.send(route.as_ref(), &raw);
            }
            let pause = pacer.remaining(frame_start.elapsed());
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        if let Some(r) = retry.take() {
            r.abort();
        }
        on_device(&self.device, |d| d.close()).await;
    }

    fn send(&self, route: Option<&FrameRoute>, raw: &[u8]) {
        let Some(route) = route else {
            log::debug!("{:?} frame dropped: no route to {}", self.kind, self.peer);
            return;
        };
        match self.codec.encode(raw) {
            Ok(data) => {
                let msg = WireMessage::new(self.kind.stream_type(), Some(self.local), Some(self.peer))
                    .with_payload(data);
                if !self.outlet.send_frame(route, msg) {
                    log::debug!("{:?} send pool full, frame to {} dropped", self.kind, self.peer);
                }
            }
            Err(e) => log::debug!("{:?} encode failed: {}", self.kind, e),
        }
    }

    /// (Re)open the device, closing it first when `reopen`. On failure start the background
    /// re-acquisition task.
    async fn open(&self, quality: MediaQuality, reopen: bool, retry: &mut Option<JoinHandle<()>>) -> bool {
        let opened = on_device(&self.device, move |d| {
            if reopen {
                d.close();
            }
            d.open(quality)
        })
        .await;
        match opened {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                log::warn!("{:?} device unavailable, streaming placeholder: {}", self.kind, e);
                *retry = Some(self.spawn_retry(quality));
                false
            }
            None => {
                log::warn!("{:?} device panicked on open, streaming placeholder", self.kind);
                *retry = Some(self.spawn_retry(quality));
                false
            }
        }
    }

    /// Finishes once the device reopens; aborted with the send loop.
    fn spawn_retry(&self, quality: MediaQuality) -> JoinHandle<()> {
        let device = self.device.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RETRY_BACKOFF).await;
                let reopened = on_device(&device, move |d| {
                    d.close();
                    d.open(quality)
                })
                .await;
                match reopened {
                    Some(Ok(())) => return,
                    Some(Err(e)) => log::debug!("{:?} device still unavailable: {}", kind, e),
                    None => log::debug!("{:?} device panicked on reopen", kind),
                }
            }
        })
    }
}

async fn receive_loop(
    queue: Arc<Mutex<FrameQueue>>,
    ready: Arc<Notify>,
    codec: Arc<dyn Codec>,
    renderer: Arc<dyn Renderer>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ready.notified() => {}
        }
        loop {
            let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop();
            let Some(data) = next else {
                break;
            };
            match codec.decode(&data) {
                Ok(frame) => renderer.render(frame),
                Err(e) => log::debug!("dropping undecodable frame: {}", e),
            }
        }
    }
}

/// Owns both pipelines and the notion of which peer is being streamed with.
pub struct MediaManager {
    audio: MediaPipeline,
    video: MediaPipeline,
    active: Mutex<Option<(UserId, CallType)>>,
}

impl MediaManager {
    pub fn new(
        local: UserId,
        outlet: Arc<dyn FrameOutlet>,
        audio: (AudioQuality, MediaParts),
        video: (VideoQuality, MediaParts),
    ) -> Self {
        Self {
            audio: MediaPipeline::new(
                local,
                MediaQuality::Audio(audio.0),
                audio.1,
                outlet.clone(),
                AUDIO_JOIN_TIMEOUT,
            ),
            video: MediaPipeline::new(
                local,
                MediaQuality::Video(video.0),
                video.1,
                outlet,
                VIDEO_JOIN_TIMEOUT,
            ),
            active: Mutex::new(None),
        }
    }

    pub fn audio(&self) -> &MediaPipeline {
        &self.audio
    }

    pub fn video(&self) -> &MediaPipeline {
        &self.video
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio.set_suspended(muted);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video.set_suspended(!enabled);
    }

    pub fn active_peer(&self) -> Option<UserId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|(peer, _)| peer)
    }

    pub fn start(&self, peer: UserId, call_type: CallType) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some((peer, call_type));
        self.audio.start(peer);
        if call_type == CallType::Video {
            self.video.start(peer);
        }
    }

    pub async fn stop(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.audio.stop().await;
        self.video.stop().await;
    }
}

impl StreamHandler for MediaManager {
    fn on_stream(&self, msg: WireMessage) {
        if msg.sender_id.is_none() || msg.sender_id != self.active_peer() {
            log::debug!("dropping {:?} from {:?}: not in a call with them", msg.kind, msg.sender_id);
            return;
        }
        match MediaKind::from_stream_type(msg.kind) {
            Some(MediaKind::Audio) => self.audio.on_frame(msg.payload),
            Some(MediaKind::Video) => self.video.on_frame(msg.payload),
            None => {}
        }
    }
}

impl MediaControl for MediaManager {
    fn start_media(&self, peer: UserId, call_type: CallType) -> BoxFuture<'_, ()> {
        self.start(peer, call_type);
        async {}.boxed()
    }

    fn stop_media(&self) -> BoxFuture<'_, ()> {
        self.stop().boxed()
    }
}
