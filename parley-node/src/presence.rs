//! Directory-service glue: registration, heartbeat, online-friend polling and logout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parley_core::{OnlineSet, PresenceDiff, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::context::ClientContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Online,
    Offline,
    Away,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub status: UserStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory service unavailable: {0}")]
    Unavailable(String),
}

/// Lookup and registration contract of the external directory service.
pub trait DirectoryService: Send + Sync + 'static {
    fn register_peer(&self, user: UserId, address: String, port: u16) -> BoxFuture<'_, Result<bool, DirectoryError>>;
    fn update_heartbeat(&self, user: UserId) -> BoxFuture<'_, Result<(), DirectoryError>>;
    fn get_online_friends(&self, user: UserId) -> BoxFuture<'_, Result<Vec<PeerInfo>, DirectoryError>>;
    fn unregister_peer(&self, user: UserId) -> BoxFuture<'_, Result<(), DirectoryError>>;
    fn get_user_by_id(&self, user: UserId) -> BoxFuture<'_, Result<Option<UserProfile>, DirectoryError>>;
    fn get_user_by_username(&self, username: String) -> BoxFuture<'_, Result<Option<UserProfile>, DirectoryError>>;
    fn update_status(&self, user: UserId, status: UserStatus) -> BoxFuture<'_, Result<(), DirectoryError>>;
    fn get_peer_info(&self, user: UserId) -> BoxFuture<'_, Result<Option<PeerInfo>, DirectoryError>>;
}

/// JSON-over-HTTP directory client.
pub struct HttpDirectory {
    base: String,
    http: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<Option<T>, DirectoryError> {
        let res = req.send().await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: T = res.error_for_status()?.json().await?;
        Ok(Some(body))
    }

    async fn expect_success(req: reqwest::RequestBuilder) -> Result<(), DirectoryError> {
        req.send().await?.error_for_status()?;
        Ok(())
    }
}

impl DirectoryService for HttpDirectory {
    fn register_peer(&self, user: UserId, address: String, port: u16) -> BoxFuture<'_, Result<bool, DirectoryError>> {
        async move {
            let body = PeerInfo {
                user_id: user,
                address,
                port,
            };
            let res = self.http.post(self.url("/peers")).json(&body).send().await?;
            Ok(res.status().is_success())
        }
        .boxed()
    }

    fn update_heartbeat(&self, user: UserId) -> BoxFuture<'_, Result<(), DirectoryError>> {
        Self::expect_success(self.http.post(self.url(&format!("/peers/{}/heartbeat", user)))).boxed()
    }

    fn get_online_friends(&self, user: UserId) -> BoxFuture<'_, Result<Vec<PeerInfo>, DirectoryError>> {
        async move {
            let req = self.http.get(self.url(&format!("/users/{}/friends/online", user)));
            let friends: Vec<PeerInfo> = req.send().await?.error_for_status()?.json().await?;
            Ok(friends)
        }
        .boxed()
    }

    fn unregister_peer(&self, user: UserId) -> BoxFuture<'_, Result<(), DirectoryError>> {
        Self::expect_success(self.http.delete(self.url(&format!("/peers/{}", user)))).boxed()
    }

    fn get_user_by_id(&self, user: UserId) -> BoxFuture<'_, Result<Option<UserProfile>, DirectoryError>> {
        self.get_optional(self.http.get(self.url(&format!("/users/{}", user))))
            .boxed()
    }

    fn get_user_by_username(&self, username: String) -> BoxFuture<'_, Result<Option<UserProfile>, DirectoryError>> {
        let req = self
            .http
            .get(self.url("/users/by-username"))
            .query(&[("name", username)]);
        self.get_optional(req).boxed()
    }

    fn update_status(&self, user: UserId, status: UserStatus) -> BoxFuture<'_, Result<(), DirectoryError>> {
        let req = self
            .http
            .put(self.url(&format!("/users/{}/status", user)))
            .json(&serde_json::json!({ "status": status }));
        Self::expect_success(req).boxed()
    }

    fn get_peer_info(&self, user: UserId) -> BoxFuture<'_, Result<Option<PeerInfo>, DirectoryError>> {
        self.get_optional(self.http.get(self.url(&format!("/peers/{}", user))))
            .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    Online(UserId),
    Offline(UserId),
}

#[derive(Debug, Clone)]
pub struct PresenceOptions {
    pub advertise_address: String,
    pub heartbeat_delay: Duration,
    pub heartbeat_period: Duration,
    pub poll_delay: Duration,
    pub poll_period: Duration,
    /// Local eviction while polls fail. None disables.
    pub peer_ttl: Option<Duration>,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            advertise_address: "127.0.0.1".to_string(),
            heartbeat_delay: Duration::from_secs(10),
            heartbeat_period: Duration::from_secs(30),
            poll_delay: Duration::from_secs(2),
            poll_period: Duration::from_secs(8),
            peer_ttl: Some(Duration::from_secs(120)),
        }
    }
}

struct Inner {
    ctx: Arc<ClientContext>,
    service: Arc<dyn DirectoryService>,
    opts: PresenceOptions,
    online: Mutex<OnlineSet>,
    events: mpsc::UnboundedSender<PresenceEvent>,
}

#[derive(Default)]
struct Loops {
    heartbeat: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

pub struct Presence {
    inner: Arc<Inner>,
    loops: Mutex<Loops>,
}

impl Presence {
    pub fn new(
        ctx: Arc<ClientContext>,
        service: Arc<dyn DirectoryService>,
        opts: PresenceOptions,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            ctx,
            service,
            opts,
            online: Mutex::new(OnlineSet::new()),
            events,
        });
        (
            Self {
                inner,
                loops: Mutex::new(Loops::default()),
            },
            rx,
        )
    }

    /// Register in the background, then start the heartbeat and poll loops. Restarts the loops
    /// if already running.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.register().await;
        });
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        abort(loops.heartbeat.take());
        abort(loops.poll.take());
        loops.heartbeat = Some(tokio::spawn(heartbeat_loop(self.inner.clone())));
        loops.poll = Some(tokio::spawn(poll_loop(self.inner.clone())));
    }

    /// Register this node and mark it ONLINE. False on any failure.
    pub async fn register(&self) -> bool {
        self.inner.register().await
    }

    /// One online-friend poll.
    pub async fn poll_once(&self) -> PresenceDiff {
        self.inner.poll_once().await
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.inner
            .online
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user)
    }

    /// Stop polling, go OFFLINE, unregister, stop the heartbeat, forget every peer.
    pub async fn logout(&self) {
        let poll = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll
            .take();
        abort(poll);
        let me = self.inner.ctx.local_user;
        if let Err(e) = self.inner.service.update_status(me, UserStatus::Offline).await {
            log::warn!("setting OFFLINE failed: {}", e);
        }
        if let Err(e) = self.inner.service.unregister_peer(me).await {
            log::warn!("unregister failed: {}", e);
        }
        let heartbeat = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heartbeat
            .take();
        abort(heartbeat);
        self.inner
            .online
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner.ctx.peers.clear();
        log::info!("user {} logged out", me);
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        let loops = self.loops.get_mut().unwrap_or_else(PoisonError::into_inner);
        abort(loops.heartbeat.take());
        abort(loops.poll.take());
    }
}

fn abort(task: Option<JoinHandle<()>>) {
    if let Some(t) = task {
        t.abort();
    }
}

impl Inner {
    async fn register(&self) -> bool {
        let me = self.ctx.local_user;
        let Some(port) = self.ctx.local_port() else {
            log::warn!("not registering {}: transport server not started", me);
            return false;
        };
        match self
            .service
            .register_peer(me, self.opts.advertise_address.clone(), port)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("directory refused registration of {}", me);
                return false;
            }
            Err(e) => {
                log::warn!("registration of {} failed: {}", me, e);
                return false;
            }
        }
        if let Err(e) = self.service.update_status(me, UserStatus::Online).await {
            log::warn!("setting ONLINE failed: {}", e);
        }
        log::info!("registered {} at {}:{}", me, self.opts.advertise_address, port);
        true
    }

    async fn poll_once(&self) -> PresenceDiff {
        let me = self.ctx.local_user;
        let friends = match self.service.get_online_friends(me).await {
            Ok(f) => f,
            Err(e) => {
                log::warn!("online-friend poll failed: {}", e);
                self.evict_stale();
                return PresenceDiff::default();
            }
        };
        for f in friends.iter().filter(|f| f.user_id != me) {
            self.ctx.peers.merge_listed(f.user_id, f.address.clone(), f.port);
        }
        let diff = self
            .online
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(friends.iter().map(|f| f.user_id).filter(|id| *id != me));
        for id in &diff.came_online {
            let _ = self.events.send(PresenceEvent::Online(*id));
        }
        for id in &diff.went_offline {
            self.ctx.peers.remove(*id);
            let _ = self.events.send(PresenceEvent::Offline(*id));
        }
        diff
    }

    fn evict_stale(&self) {
        let Some(ttl) = self.opts.peer_ttl else {
            return;
        };
        let evicted = self.ctx.peers.evict_idle(ttl);
        if evicted.is_empty() {
            return;
        }
        log::info!("evicted {} idle peers while directory is unreachable", evicted.len());
        let mut online = self.online.lock().unwrap_or_else(PoisonError::into_inner);
        for id in evicted {
            if online.remove(id) {
                let _ = self.events.send(PresenceEvent::Offline(id));
            }
        }
    }
}

async fn heartbeat_loop(inner: Arc<Inner>) {
    let mut ticks = interval_at(
        Instant::now() + inner.opts.heartbeat_delay,
        inner.opts.heartbeat_period,
    );
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        if let Err(e) = inner.service.update_heartbeat(inner.ctx.local_user).await {
            log::warn!("heartbeat failed: {}", e);
        }
    }
}

async fn poll_loop(inner: Arc<Inner>) {
    let mut ticks = interval_at(Instant::now() + inner.opts.poll_delay, inner.opts.poll_period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        inner.poll_once().await;
    }
}
