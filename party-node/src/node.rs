//! The node: one owned session that composes discovery, sessions, messages, resources and
//! streams behind a single control surface, and serializes everything it observes onto the
//! event bus.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use party_core::{
    should_initiate, DiscoveredPeer, DiscoveryUpdate, LocalIdentity, Message, Metadata, PeerId,
    PeerIdentity, ResourceKind, TransferError, TransferId, NAME_KEY,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::config::Config;
use crate::discovery::DiscoveryEngine;
use crate::error::{AdvertiseError, BrowseError, ConnectionError, Result};
use crate::events::{Event, EventBus};
use crate::identity_store::{data_dir, default_display_name, IdentityStore};
use crate::medium::Medium;
use crate::resource::ResourceEngine;
use crate::session::{LinkClosed, SessionEvent, SessionManager, SessionStats};
use crate::stream::{OutgoingStream, StreamRegistry};
use crate::Payload;

pub struct Node<M> {
    local: Arc<LocalIdentity>,
    config: Config,
    events: EventBus<M>,
    discovery: DiscoveryEngine,
    session: SessionManager,
    channel: MessageChannel<M>,
    resources: Arc<ResourceEngine<M>>,
    streams: Arc<StreamRegistry>,
    medium: Mutex<Option<Medium>>,
    /// Serializes `connect_as` and `disconnect`; true while joined.
    joined: tokio::sync::Mutex<bool>,
    dispatcher: JoinHandle<()>,
}

impl<M: Payload> Node<M> {
    /// Load (or create on first run) the persisted identity and build a node around it.
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let store = IdentityStore::from_config(config.storage.identity_dir.as_deref())?;
        let local = store.get_or_create_identity(&default_display_name())?;
        Ok(Self::with_identity(config, local))
    }

    /// Build a node with a given identity. Must be called inside a tokio runtime.
    pub fn with_identity(config: Config, local: LocalIdentity) -> Self {
        let local = Arc::new(local);
        let events = EventBus::new(config.events.capacity);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let session = SessionManager::new(local.clone(), config.session.clone(), session_tx);
        let discovery = DiscoveryEngine::new(local.clone(), config.discovery.clone(), discovery_tx);
        let channel = MessageChannel::new(session.clone(), config.messages.clone());
        let resources = Arc::new(ResourceEngine::new(
            session.clone(),
            events.clone(),
            config.transfer.clone(),
            inbox_dir(&config),
        ));
        let streams = Arc::new(StreamRegistry::new());

        let dispatcher = Dispatcher {
            local: local.peer_id(),
            connect_timeout: config.session.connect_timeout(),
            events: events.clone(),
            session: session.clone(),
            channel: channel.clone(),
            resources: resources.clone(),
            streams: streams.clone(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(session_rx, discovery_rx));

        Self {
            local,
            config,
            events,
            discovery,
            session,
            channel,
            resources,
            streams,
            medium: Mutex::new(None),
            joined: tokio::sync::Mutex::new(false),
            dispatcher,
        }
    }

    /// Discovery medium for the next `connect_as`. Defaults to UDP multicast from the config.
    pub fn use_medium(&self, medium: Medium) {
        *self
            .medium
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(medium);
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.local.identity()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<M>> {
        self.events.subscribe()
    }

    /// Join the configured namespace as `name`: listen for sessions, advertise, browse and
    /// connect to peers as they are found. Failures arrive as `AdvertiseFailed`/`BrowseFailed`.
    /// Does nothing if already joined.
    pub async fn connect_as(&self, name: &str) {
        let mut joined = self.joined.lock().await;
        if *joined {
            debug!("already joined {:?}", self.config.namespace);
            return;
        }
        let bind = SocketAddr::new(self.config.session.bind_addr, self.config.session.port);
        let addr = match self.session.start(bind).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("cannot listen on {}: {}", bind, e);
                self.events.emit(Event::AdvertiseFailed {
                    error: AdvertiseError::Transport(e.to_string()),
                });
                return;
            }
        };
        let medium = match self.medium().await {
            Ok(m) => m,
            Err(e) => {
                warn!("discovery unavailable: {}", e);
                self.events.emit(Event::AdvertiseFailed {
                    error: AdvertiseError::Transport(e.to_string()),
                });
                self.events.emit(Event::BrowseFailed {
                    error: BrowseError::Transport(e.to_string()),
                });
                self.session.shutdown();
                return;
            }
        };

        let namespace = &self.config.namespace;
        let mut metadata = Metadata::new();
        metadata.insert(NAME_KEY.to_string(), name.to_string());
        if let Err(error) = self
            .discovery
            .start_advertising(&medium, namespace, metadata, addr.port())
            .await
        {
            warn!("advertising failed: {}", error);
            self.events.emit(Event::AdvertiseFailed { error });
        }
        if let Err(error) = self.discovery.start_browsing(&medium, namespace).await {
            warn!("browsing failed: {}", error);
            self.events.emit(Event::BrowseFailed { error });
        }
        *joined = true;
        info!(
            "{} joined {:?} as {:?}",
            self.local.identity(),
            namespace,
            name
        );
    }

    async fn medium(&self) -> std::io::Result<Medium> {
        let configured = self
            .medium
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match configured {
            Some(m) => Ok(m),
            None => {
                let d = &self.config.discovery;
                Medium::udp(d.multicast_group, d.port).await
            }
        }
    }

    /// Leave the namespace and close every session. Safe to call repeatedly; the node can
    /// `connect_as` again afterwards.
    pub async fn disconnect(&self) {
        let mut joined = self.joined.lock().await;
        self.discovery.stop().await;
        self.resources.fail_all(TransferError::Cancelled);
        self.session.shutdown();
        self.streams.clear();
        if *joined {
            info!("{} left {:?}", self.local.identity(), self.config.namespace);
        }
        *joined = false;
    }

    pub fn is_joined(&self) -> bool {
        self.session.is_active()
    }

    /// Dial a discovered peer directly, regardless of the tie-break.
    pub fn connect(&self, peer: &PeerId, timeout: Duration) -> Result<()> {
        let found = self
            .discovery
            .lookup(peer)
            .ok_or(ConnectionError::UnknownPeer(*peer))?;
        self.session.connect(found.identity, found.addr, timeout)?;
        Ok(())
    }

    /// Close the session with one peer, cancelling its transfers.
    pub fn disconnect_peer(&self, peer: &PeerId) -> bool {
        self.resources.fail_peer(peer, TransferError::Cancelled);
        self.session.disconnect(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.session.connected_peers()
    }

    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.discovery.discovered_peers()
    }

    /// Queue `message` for `peer`; returns its sequence number.
    pub fn send(&self, peer: &PeerId, message: &M) -> Result<u64> {
        self.channel.send(peer, message)
    }

    pub fn send_to_all(&self, message: &M) -> Vec<(PeerIdentity, Result<u64>)> {
        self.channel.send_to_all(message)
    }

    pub fn send_resource(
        &self,
        peer: &PeerId,
        path: impl AsRef<Path>,
        name: &str,
        kind: ResourceKind,
    ) -> Result<TransferId> {
        self.resources
            .send_resource(peer, path.as_ref(), name, kind)
    }

    pub fn cancel_transfer(&self, id: &TransferId) -> Result<()> {
        self.resources.cancel_transfer(id)
    }

    pub fn open_stream(&self, peer: &PeerId, name: &str) -> Result<OutgoingStream> {
        self.streams.open(&self.session, peer, name)
    }

    pub fn set_accept_policy<F>(&self, policy: F)
    where
        F: Fn(&PeerIdentity) -> bool + Send + Sync + 'static,
    {
        self.session.set_accept_policy(Arc::new(policy));
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn inbox(&self) -> &Path {
        self.resources.inbox()
    }
}

impl<M> Drop for Node<M> {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.discovery.abort();
        self.session.abort();
        self.resources.abort();
    }
}

fn inbox_dir(config: &Config) -> PathBuf {
    config
        .transfer
        .inbox_dir
        .clone()
        .or_else(|| data_dir().ok().map(|d| d.join("inbox")))
        .unwrap_or_else(|| std::env::temp_dir().join("party-inbox"))
}

/// Consumes session and discovery reports in arrival order and turns them into events.
struct Dispatcher<M> {
    local: PeerId,
    connect_timeout: Duration,
    events: EventBus<M>,
    session: SessionManager,
    channel: MessageChannel<M>,
    resources: Arc<ResourceEngine<M>>,
    streams: Arc<StreamRegistry>,
}

impl<M: Payload> Dispatcher<M> {
    async fn run(
        self,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut discovery_rx: mpsc::UnboundedReceiver<DiscoveryUpdate>,
    ) {
        loop {
            tokio::select! {
                Some(event) = session_rx.recv() => self.on_session(event),
                Some(update) = discovery_rx.recv() => self.on_discovery(update),
                else => break,
            }
        }
    }

    fn on_discovery(&self, update: DiscoveryUpdate) {
        match update {
            DiscoveryUpdate::Found(peer) => {
                let name = peer.name().map(str::to_string);
                self.events.emit(Event::PeerFound {
                    peer: peer.identity.clone(),
                    name,
                });
                if should_initiate(self.local, peer.identity.id) && self.session.is_active() {
                    match self
                        .session
                        .connect(peer.identity.clone(), peer.addr, self.connect_timeout)
                    {
                        Ok(true) => debug!("inviting {}", peer.identity),
                        Ok(false) => {}
                        Err(e) => debug!("not inviting {}: {}", peer.identity, e),
                    }
                }
            }
            DiscoveryUpdate::Lost(peer) => {
                self.events.emit(Event::PeerLost {
                    peer: peer.identity,
                });
            }
        }
    }

    fn on_session(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected(peer) => self.events.emit(Event::PeerConnected { peer }),
            SessionEvent::ConnectFailed { peer, error } => {
                self.events.emit(Event::PeerConnectionFailed { peer, error })
            }
            SessionEvent::Frame { peer, message } => self.on_frame(peer, message),
            SessionEvent::Disconnected { peer, reason } => {
                let error = match reason {
                    LinkClosed::Local => TransferError::Cancelled,
                    LinkClosed::Remote(_) => TransferError::PeerDisconnected,
                };
                self.resources.fail_peer(&peer.id, error);
                self.streams.close_peer(&peer.id);
                self.events.emit(Event::PeerDisconnected { peer });
            }
            SessionEvent::Undelivered { peer, seqs, error } => {
                for seq in seqs {
                    self.events.emit(Event::DeliveryFailed {
                        peer: peer.clone(),
                        seq,
                        error: error.clone(),
                    });
                }
            }
        }
    }

    fn on_frame(&self, peer: PeerIdentity, message: Message) {
        match message {
            Message::Data { seq, body } => {
                if let Some(event) = self.channel.deliver(peer, seq, &body) {
                    self.events.emit(event);
                }
            }
            Message::ResourceOffer {
                transfer_id,
                name,
                kind,
                total_bytes,
                digest,
            } => self
                .resources
                .on_offer(peer, transfer_id, name, kind, total_bytes, digest),
            Message::ResourceChunk {
                transfer_id,
                offset,
                bytes,
            } => self.resources.on_chunk(&peer, transfer_id, offset, &bytes),
            Message::ResourceEnd { transfer_id } => self.resources.on_end(&peer, transfer_id),
            Message::ResourceCancel {
                transfer_id,
                reason,
            } => self.resources.on_cancel(&peer, transfer_id, reason),
            Message::StreamOpen { stream_id, name } => {
                let stream = self.streams.on_open(peer.clone(), stream_id, name.clone());
                self.events.emit(Event::StreamReceived { peer, name, stream });
            }
            Message::StreamData { stream_id, bytes } => {
                self.streams.on_data(&peer.id, stream_id, bytes)
            }
            Message::StreamClose { stream_id } => self.streams.on_close(&peer.id, stream_id),
            other => debug!("unexpected {} frame from {}", other.kind(), peer),
        }
    }
}
