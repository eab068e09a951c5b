//! Discovery engine: announce presence in a namespace, browse it, report peers found and lost.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use party_core::wire::{decode_message, encode_message};
use party_core::{
    validate_namespace, DiscoveredPeer, DiscoveryTable, DiscoveryUpdate, LocalIdentity, Message,
    Metadata, PeerId, PROTOCOL_VERSION,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{AdvertiseError, BrowseError};
use crate::medium::Medium;

struct Advertisement {
    namespace: String,
    announce: Vec<u8>,
    task: JoinHandle<()>,
}

struct Browse {
    table: DiscoveryTable,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct EngineState {
    medium: Option<Medium>,
    recv_task: Option<JoinHandle<()>>,
    advertising: Option<Advertisement>,
    browsing: Option<Browse>,
}

pub struct DiscoveryEngine {
    local: Arc<LocalIdentity>,
    config: DiscoveryConfig,
    updates: mpsc::UnboundedSender<DiscoveryUpdate>,
    state: Arc<Mutex<EngineState>>,
}

impl DiscoveryEngine {
    pub fn new(
        local: Arc<LocalIdentity>,
        config: DiscoveryConfig,
        updates: mpsc::UnboundedSender<DiscoveryUpdate>,
    ) -> Self {
        Self {
            local,
            config,
            updates,
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    /// Announce now, then every `announce_interval`, and answer probes for `namespace`.
    pub async fn start_advertising(
        &self,
        medium: &Medium,
        namespace: &str,
        metadata: Metadata,
        listen_port: u16,
    ) -> Result<(), AdvertiseError> {
        validate_namespace(namespace)?;
        let announce = encode_message(&Message::Announce {
            protocol_version: PROTOCOL_VERSION,
            namespace: namespace.to_string(),
            peer_id: self.local.peer_id(),
            display_name: self.local.display_name().to_string(),
            public_key: self.local.keypair().public_key().clone(),
            listen_port,
            metadata,
        })
        .map_err(|e| AdvertiseError::Transport(e.to_string()))?;

        let medium = {
            let mut st = lock(&self.state);
            if let Some(current) = &st.advertising {
                return Err(if current.namespace == namespace {
                    AdvertiseError::NamespaceInUse(namespace.to_string())
                } else {
                    AdvertiseError::AlreadyAdvertising {
                        current: current.namespace.clone(),
                        requested: namespace.to_string(),
                    }
                });
            }
            self.attach(&mut st, medium)
        };
        medium
            .send(&announce)
            .await
            .map_err(|e| AdvertiseError::Transport(e.to_string()))?;

        let interval = self.config.announce_interval();
        let task_medium = medium.clone();
        let task_announce = announce.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = task_medium.send(&task_announce).await {
                    debug!("announce failed: {}", e);
                }
            }
        });

        let mut st = lock(&self.state);
        if st.advertising.is_some() {
            task.abort();
            return Err(AdvertiseError::NamespaceInUse(namespace.to_string()));
        }
        st.advertising = Some(Advertisement {
            namespace: namespace.to_string(),
            announce,
            task,
        });
        info!("advertising {} in {:?}", self.local.peer_id(), namespace);
        Ok(())
    }

    /// Track announced peers in `namespace`. Found and lost peers go to the update channel.
    pub async fn start_browsing(&self, medium: &Medium, namespace: &str) -> Result<(), BrowseError> {
        validate_namespace(namespace)?;
        let probe = encode_message(&Message::Probe {
            protocol_version: PROTOCOL_VERSION,
            namespace: namespace.to_string(),
            peer_id: self.local.peer_id(),
        })
        .map_err(|e| BrowseError::Transport(e.to_string()))?;

        let medium = {
            let mut st = lock(&self.state);
            if let Some(current) = &st.browsing {
                return Err(BrowseError::AlreadyBrowsing(
                    current.table.namespace().to_string(),
                ));
            }
            let medium = self.attach(&mut st, medium);
            let table = DiscoveryTable::new(
                self.local.peer_id(),
                namespace,
                self.config.peer_timeout(),
            );
            let task = self.spawn_expiry();
            st.browsing = Some(Browse { table, task });
            medium
        };
        if let Err(e) = medium.send(&probe).await {
            if let Some(b) = lock(&self.state).browsing.take() {
                b.task.abort();
            }
            return Err(BrowseError::Transport(e.to_string()));
        }
        info!("browsing {:?}", namespace);
        Ok(())
    }

    /// Say goodbye if advertising and halt every task. Safe to call repeatedly.
    pub async fn stop(&self) {
        let (medium, advertising) = {
            let mut st = lock(&self.state);
            if let Some(b) = st.browsing.take() {
                b.task.abort();
            }
            if let Some(t) = st.recv_task.take() {
                t.abort();
            }
            (st.medium.take(), st.advertising.take())
        };
        if let Some(ad) = advertising {
            ad.task.abort();
            if let Some(medium) = medium {
                let goodbye = encode_message(&Message::Goodbye {
                    protocol_version: PROTOCOL_VERSION,
                    namespace: ad.namespace.clone(),
                    peer_id: self.local.peer_id(),
                });
                match goodbye {
                    Ok(bytes) => {
                        if let Err(e) = medium.send(&bytes).await {
                            debug!("goodbye failed: {}", e);
                        }
                    }
                    Err(e) => warn!("cannot encode goodbye: {}", e),
                }
            }
            info!("stopped advertising in {:?}", ad.namespace);
        }
    }

    /// Abort every task without a goodbye.
    pub fn abort(&self) {
        let mut st = lock(&self.state);
        if let Some(b) = st.browsing.take() {
            b.task.abort();
        }
        if let Some(ad) = st.advertising.take() {
            ad.task.abort();
        }
        if let Some(t) = st.recv_task.take() {
            t.abort();
        }
        st.medium = None;
    }

    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        lock(&self.state)
            .browsing
            .as_ref()
            .map(|b| b.table.snapshot())
            .unwrap_or_default()
    }

    pub fn lookup(&self, peer: &PeerId) -> Option<DiscoveredPeer> {
        lock(&self.state)
            .browsing
            .as_ref()
            .and_then(|b| b.table.get(peer).cloned())
    }

    pub fn is_advertising(&self) -> bool {
        lock(&self.state).advertising.is_some()
    }

    pub fn is_browsing(&self) -> bool {
        lock(&self.state).browsing.is_some()
    }

    /// Bind to a medium on first use and start the shared receive loop.
    fn attach(&self, st: &mut EngineState, medium: &Medium) -> Medium {
        if let Some(m) = &st.medium {
            return m.clone();
        }
        st.medium = Some(medium.clone());
        let recv_medium = medium.clone();
        let state = self.state.clone();
        let updates = self.updates.clone();
        let local = self.local.peer_id();
        st.recv_task = Some(tokio::spawn(async move {
            loop {
                let (bytes, from) = match recv_medium.recv().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("discovery receive failed: {}", e);
                        return;
                    }
                };
                let msg = match decode_message(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("ignoring undecodable datagram from {}: {}", from, e);
                        continue;
                    }
                };
                if let Some(reply) = on_datagram(&state, &updates, local, msg, from) {
                    if let Err(e) = recv_medium.send(&reply).await {
                        debug!("probe reply failed: {}", e);
                    }
                }
            }
        }));
        medium.clone()
    }

    fn spawn_expiry(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let updates = self.updates.clone();
        let period = (self.config.peer_timeout() / 4).max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let expired = match lock(&state).browsing.as_mut() {
                    Some(b) => b.table.expire(Instant::now()),
                    None => Vec::new(),
                };
                for peer in expired {
                    debug!("discovered peer {} timed out", peer.identity);
                    let _ = updates.send(DiscoveryUpdate::Lost(peer));
                }
            }
        })
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Feed one datagram to the engine. Returns an announcement to send when it was a probe for us.
fn on_datagram(
    state: &Mutex<EngineState>,
    updates: &mpsc::UnboundedSender<DiscoveryUpdate>,
    local: PeerId,
    msg: Message,
    from: IpAddr,
) -> Option<Vec<u8>> {
    let mut st = lock(state);
    if let Message::Probe {
        protocol_version,
        namespace,
        peer_id,
    } = &msg
    {
        if *protocol_version != PROTOCOL_VERSION || *peer_id == local {
            return None;
        }
        return st
            .advertising
            .as_ref()
            .filter(|ad| ad.namespace == *namespace)
            .map(|ad| ad.announce.clone());
    }
    let update = st
        .browsing
        .as_mut()
        .and_then(|b| b.table.handle(msg, from, Instant::now()))?;
    drop(st);
    match &update {
        DiscoveryUpdate::Found(p) => debug!("found {} at {}", p.identity, p.addr),
        DiscoveryUpdate::Lost(p) => debug!("lost {}", p.identity),
    }
    let _ = updates.send(update);
    None
}

fn lock(state: &Mutex<EngineState>) -> std::sync::MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::LocalHub;
    use party_core::{NamespaceError, NAME_KEY};
    use std::time::Duration;

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            announce_interval_ms: 50,
            peer_timeout_ms: 300,
            ..DiscoveryConfig::default()
        }
    }

    fn engine(name: &str) -> (DiscoveryEngine, mpsc::UnboundedReceiver<DiscoveryUpdate>) {
        engine_with(name, fast_config())
    }

    fn engine_with(
        name: &str,
        config: DiscoveryConfig,
    ) -> (DiscoveryEngine, mpsc::UnboundedReceiver<DiscoveryUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let e = DiscoveryEngine::new(Arc::new(LocalIdentity::generate(name)), config, tx);
        (e, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<DiscoveryUpdate>) -> DiscoveryUpdate {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("discovery update")
            .expect("channel open")
    }

    #[tokio::test]
    async fn browser_finds_advertiser_once() {
        let hub = LocalHub::new();
        let (a, _a_rx) = engine("a");
        let (b, mut b_rx) = engine("b");
        b.start_browsing(&Medium::local(&hub), "chat").await.unwrap();
        let mut meta = Metadata::new();
        meta.insert(NAME_KEY.into(), "Ada".into());
        a.start_advertising(&Medium::local(&hub), "chat", meta, 4000)
            .await
            .unwrap();

        match next(&mut b_rx).await {
            DiscoveryUpdate::Found(p) => {
                assert_eq!(p.identity.id, a.local.peer_id());
                assert_eq!(p.name(), Some("Ada"));
                assert_eq!(p.addr.port(), 4000);
            }
            other => panic!("expected Found, got {:?}", other),
        }
        // Periodic re-announcements refresh without a second Found.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b_rx.try_recv().is_err());
        assert_eq!(b.discovered_peers().len(), 1);
    }

    #[tokio::test]
    async fn probe_gets_an_immediate_answer() {
        let hub = LocalHub::new();
        let slow = DiscoveryConfig {
            announce_interval_ms: 60_000,
            ..fast_config()
        };
        let (a, _a_rx) = engine_with("a", slow);
        let (b, mut b_rx) = engine("b");
        a.start_advertising(&Medium::local(&hub), "chat", Metadata::new(), 1)
            .await
            .unwrap();
        b.start_browsing(&Medium::local(&hub), "chat").await.unwrap();
        assert!(matches!(next(&mut b_rx).await, DiscoveryUpdate::Found(_)));
    }

    #[tokio::test]
    async fn goodbye_reports_lost() {
        let hub = LocalHub::new();
        let (a, _a_rx) = engine("a");
        let (b, mut b_rx) = engine("b");
        b.start_browsing(&Medium::local(&hub), "chat").await.unwrap();
        a.start_advertising(&Medium::local(&hub), "chat", Metadata::new(), 1)
            .await
            .unwrap();
        assert!(matches!(next(&mut b_rx).await, DiscoveryUpdate::Found(_)));
        a.stop().await;
        assert!(matches!(next(&mut b_rx).await, DiscoveryUpdate::Lost(_)));
        assert!(b.discovered_peers().is_empty());
        a.stop().await;
    }

    #[tokio::test]
    async fn silent_peer_expires() {
        let hub = LocalHub::new();
        let (a, _a_rx) = engine("a");
        let (b, mut b_rx) = engine("b");
        b.start_browsing(&Medium::local(&hub), "chat").await.unwrap();
        a.start_advertising(&Medium::local(&hub), "chat", Metadata::new(), 1)
            .await
            .unwrap();
        assert!(matches!(next(&mut b_rx).await, DiscoveryUpdate::Found(_)));
        a.abort();
        assert!(matches!(next(&mut b_rx).await, DiscoveryUpdate::Lost(_)));
    }

    #[tokio::test]
    async fn other_namespaces_and_self_are_invisible() {
        let hub = LocalHub::new();
        let (a, mut a_rx) = engine("a");
        let (b, mut b_rx) = engine("b");
        a.start_advertising(&Medium::local(&hub), "files", Metadata::new(), 1)
            .await
            .unwrap();
        a.start_browsing(&Medium::local(&hub), "files").await.unwrap();
        b.start_browsing(&Medium::local(&hub), "chat").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_errors() {
        let hub = LocalHub::new();
        let (a, _rx) = engine("a");
        let m = Medium::local(&hub);
        assert_eq!(
            a.start_advertising(&m, "Bad_Name", Metadata::new(), 1).await,
            Err(AdvertiseError::InvalidNamespace(NamespaceError::InvalidChar(
                'B'
            )))
        );
        assert_eq!(
            a.start_browsing(&m, "").await,
            Err(BrowseError::InvalidNamespace(NamespaceError::Length(0)))
        );
        a.start_advertising(&m, "chat", Metadata::new(), 1)
            .await
            .unwrap();
        assert_eq!(
            a.start_advertising(&m, "chat", Metadata::new(), 1).await,
            Err(AdvertiseError::NamespaceInUse("chat".into()))
        );
        assert!(matches!(
            a.start_advertising(&m, "files", Metadata::new(), 1).await,
            Err(AdvertiseError::AlreadyAdvertising { .. })
        ));
        a.start_browsing(&m, "chat").await.unwrap();
        assert_eq!(
            a.start_browsing(&m, "chat").await,
            Err(BrowseError::AlreadyBrowsing("chat".into()))
        );
        a.stop().await;
        assert!(!a.is_advertising());
        assert!(!a.is_browsing());
        a.start_advertising(&m, "chat", Metadata::new(), 1)
            .await
            .unwrap();
    }
}
