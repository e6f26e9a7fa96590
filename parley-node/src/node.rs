//! One running client: wires context, transport, dispatcher, calls, media, files and presence.

use std::sync::Arc;

use parley_core::{MessageType, WireMessage};
use tokio::sync::mpsc;

use crate::call::{CallController, CallEvent, CallHandle};
use crate::config::Config;
use crate::context::ClientContext;
use crate::dispatcher::{ChannelListener, Dispatcher};
use crate::files::{FileStore, ReceivedFile};
use crate::media::{MediaManager, MediaParts};
use crate::messenger::Messenger;
use crate::presence::{DirectoryError, DirectoryService, HttpDirectory, Presence, PresenceEvent, PresenceOptions};
use crate::transport::{ServerOptions, TransportClient, TransportError, TransportServer};

/// Receiving ends for everything the presentation layer reacts to.
pub struct NodeEvents {
    /// Text, typing and read-receipt messages.
    pub chat: mpsc::UnboundedReceiver<WireMessage>,
    pub calls: mpsc::UnboundedReceiver<CallEvent>,
    pub files: mpsc::UnboundedReceiver<ReceivedFile>,
    /// None without a directory service.
    pub presence: Option<mpsc::UnboundedReceiver<PresenceEvent>>,
}

pub struct Node {
    pub ctx: Arc<ClientContext>,
    config: Config,
    server: TransportServer,
    dispatcher: Arc<Dispatcher>,
    messenger: Messenger,
    media: Arc<MediaManager>,
    calls: CallHandle,
    presence: Option<Presence>,
}

impl Node {
    /// Build from config with the HTTP directory client (if `directory_url` is set) and no
    /// capture hardware. Must be called inside a tokio runtime.
    pub fn from_config(config: Config) -> Result<(Self, NodeEvents), DirectoryError> {
        let directory: Option<Arc<dyn DirectoryService>> = if config.directory_url.is_empty() {
            None
        } else {
            Some(Arc::new(HttpDirectory::new(
                &config.directory_url,
                config.read_timeout(),
            )?))
        };
        Ok(Self::new(config, directory, MediaParts::headless(), MediaParts::headless()))
    }

    /// Must be called inside a tokio runtime (the call controller task is spawned here).
    pub fn new(
        config: Config,
        directory: Option<Arc<dyn DirectoryService>>,
        audio: MediaParts,
        video: MediaParts,
    ) -> (Self, NodeEvents) {
        let ctx = Arc::new(ClientContext::new(config.user()));
        let client = TransportClient::new(ctx.clone(), config.connect_timeout(), config.max_connections);
        let messenger = Messenger::new(ctx.clone(), client, directory.clone());
        let outlet = Arc::new(messenger.clone());
        let media = Arc::new(MediaManager::new(
            ctx.local_user,
            outlet.clone(),
            (config.audio_quality, audio),
            (config.video_quality, video),
        ));
        let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), media.clone()));

        let (calls, call_events, _controller) =
            CallController::spawn(ctx.local_user, outlet, media.clone(), config.call_timeout());
        dispatcher.add_listener(Arc::new(calls.clone()));

        let (chat, chat_events) = ChannelListener::only(&[
            MessageType::TextMessage,
            MessageType::TypingIndicator,
            MessageType::ReadReceipt,
        ]);
        dispatcher.add_listener(Arc::new(chat));

        let (files, file_events) = FileStore::new(config.download_dir.clone());
        dispatcher.add_listener(Arc::new(files));

        let (presence, presence_events) = match directory {
            Some(service) => {
                let opts = PresenceOptions {
                    advertise_address: config.advertised_address(),
                    heartbeat_period: config.heartbeat_period(),
                    poll_period: config.poll_period(),
                    peer_ttl: config.peer_ttl(),
                    ..PresenceOptions::default()
                };
                let (p, rx) = Presence::new(ctx.clone(), service, opts);
                (Some(p), Some(rx))
            }
            None => (None, None),
        };

        let server = TransportServer::new(
            ctx.clone(),
            dispatcher.clone(),
            ServerOptions {
                bind_address: config.bind_address.clone(),
                port_attempts: config.port_attempts,
                max_connections: config.max_connections,
                read_timeout: config.read_timeout(),
                join_timeout: config.join_timeout(),
            },
        );

        let node = Self {
            ctx,
            config,
            server,
            dispatcher,
            messenger,
            media,
            calls,
            presence,
        };
        let events = NodeEvents {
            chat: chat_events,
            calls: call_events,
            files: file_events,
            presence: presence_events,
        };
        (node, events)
    }

    /// Bind the listener, then register and start presence in the background.
    pub async fn start(&self) -> Result<u16, TransportError> {
        let port = self.server.start(self.config.listen_port).await?;
        if let Some(presence) = &self.presence {
            presence.start();
        }
        Ok(port)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn port(&self) -> Option<u16> {
        self.server.port()
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn calls(&self) -> &CallHandle {
        &self.calls
    }

    pub fn media(&self) -> &MediaManager {
        &self.media
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn presence(&self) -> Option<&Presence> {
        self.presence.as_ref()
    }

    /// End any call, log out of the directory, close the listener, forget all peers.
    pub async fn shutdown(&self) {
        if let Some(call) = self.calls.hang_up().await {
            log::info!("ended call {} on shutdown after {:?}", call.call_id, call.duration);
        }
        self.media.stop().await;
        if let Some(presence) = &self.presence {
            presence.logout().await;
        }
        self.server.stop().await;
        self.ctx.peers.clear();
    }
}

