//! Session manager: dial and accept sealed TCP links, admit or refuse incoming peers,
//! one ordered writer and one reader per link, liveness, teardown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use party_core::{
    Admission, ConnectionState, LocalIdentity, Message, PeerId, PeerIdentity, SessionError,
    SessionTable,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ConnectionError, Error, TransportError};
use crate::transport::{
    answer_hello, handshake_initiator, read_hello, RemoteHello, SealedReader, SealedWriter,
};

/// Decides whether an incoming peer may connect, after the built-in checks pass.
pub type AcceptPolicy = Arc<dyn Fn(&PeerIdentity) -> bool + Send + Sync>;

/// Completion signal attached to a queued frame.
pub enum Ticket {
    None,
    /// Application message; reported as undelivered if it never reaches the wire.
    Data(u64),
    /// Fired once the frame has been written.
    Written(oneshot::Sender<()>),
}

pub struct Outbound {
    pub message: Message,
    pub ticket: Ticket,
}

/// Why a link went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkClosed {
    /// `disconnect` on this side.
    Local,
    Remote(TransportError),
}

/// What the session layer reports to the node, in order.
#[derive(Debug)]
pub enum SessionEvent {
    Connected(PeerIdentity),
    ConnectFailed {
        peer: PeerIdentity,
        error: ConnectionError,
    },
    Frame {
        peer: PeerIdentity,
        message: Message,
    },
    Disconnected {
        peer: PeerIdentity,
        reason: LinkClosed,
    },
    Undelivered {
        peer: PeerIdentity,
        seqs: Vec<u64>,
        error: TransportError,
    },
}

/// Counters for connection attempts in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub dialed: u64,
    pub accepted: u64,
    pub refused: u64,
}

/// Queue handle for one link that does not keep the link alive.
#[derive(Clone)]
pub struct LinkSender {
    peer: PeerIdentity,
    tx: mpsc::WeakUnboundedSender<Outbound>,
}

impl LinkSender {
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn send(&self, message: Message, ticket: Ticket) -> Result<(), TransportError> {
        let tx = self.tx.upgrade().ok_or(TransportError::Closed)?;
        tx.send(Outbound { message, ticket })
            .map_err(|_| TransportError::Closed)
    }
}

struct Link {
    identity: PeerIdentity,
    tx: mpsc::UnboundedSender<Outbound>,
    next_seq: u64,
    generation: u64,
    reader: JoinHandle<()>,
}

/// An in-flight handshake. `task` is set for attempts we dialed.
struct Attempt {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct SessionState {
    table: SessionTable,
    links: HashMap<PeerId, Link>,
    pending: HashMap<PeerId, Attempt>,
    listener: Option<(SocketAddr, JoinHandle<()>)>,
    next_generation: u64,
}

impl SessionState {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct Inner {
    local: Arc<LocalIdentity>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    active: AtomicBool,
    policy: RwLock<AcceptPolicy>,
    events: mpsc::UnboundedSender<SessionEvent>,
    dialed: AtomicU64,
    accepted: AtomicU64,
    refused: AtomicU64,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        local: Arc<LocalIdentity>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let table = SessionTable::new(local.peer_id());
        Self {
            inner: Arc::new(Inner {
                local,
                config,
                state: Mutex::new(SessionState {
                    table,
                    links: HashMap::new(),
                    pending: HashMap::new(),
                    listener: None,
                    next_generation: 0,
                }),
                active: AtomicBool::new(false),
                policy: RwLock::new(Arc::new(|_: &PeerIdentity| true)),
                events,
                dialed: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
                refused: AtomicU64::new(0),
            }),
        }
    }

    /// Bind the listener and start admitting peers. Returns the bound address; calling again
    /// while listening returns the existing one.
    pub async fn start(&self, bind: SocketAddr) -> std::io::Result<SocketAddr> {
        let existing = self.local_addr();
        if let Some(addr) = existing {
            return Ok(addr);
        }
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        debug!("incoming connection from {}", from);
                        let inner = inner.clone();
                        tokio::spawn(async move { inner.accept_incoming(stream).await });
                    }
                    Err(e) => {
                        warn!("session listener failed: {}", e);
                        break;
                    }
                }
            }
        });
        let mut st = self.inner.lock();
        if let Some((existing, _)) = &st.listener {
            task.abort();
            return Ok(*existing);
        }
        st.listener = Some((addr, task));
        self.inner.active.store(true, Ordering::SeqCst);
        info!("session listener on {}", addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().listener.as_ref().map(|(a, _)| *a)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Stop admitting peers and tear down every link and attempt.
    pub fn shutdown(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        if let Some((_, task)) = self.inner.lock().listener.take() {
            task.abort();
        }
        self.disconnect_all();
    }

    pub fn set_accept_policy(&self, policy: AcceptPolicy) {
        *self
            .inner
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
    }

    /// Dial `peer` at `addr`. Returns `Ok(false)` if already connecting or connected.
    /// The outcome arrives as `Connected` or `ConnectFailed`.
    pub fn connect(
        &self,
        peer: PeerIdentity,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<bool, ConnectionError> {
        let mut st = self.inner.lock();
        match st.table.begin_connect(peer.clone()) {
            Ok(()) => {}
            Err(SessionError::SelfConnect) => return Err(ConnectionError::SelfConnect),
            Err(_) => return Ok(false),
        }
        let generation = st.generation();
        let inner = self.inner.clone();
        let id = peer.id;
        let task = tokio::spawn(async move { inner.dial(peer, addr, timeout, generation).await });
        st.pending.insert(
            id,
            Attempt {
                generation,
                task: Some(task),
            },
        );
        self.inner.dialed.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Close the link to `peer` after a `Bye`, or cancel a pending attempt.
    /// Returns false if there was nothing to do.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let mut st = self.inner.lock();
        self.inner.disconnect_locked(&mut st, peer)
    }

    pub fn disconnect_all(&self) {
        let mut st = self.inner.lock();
        let peers: Vec<PeerId> = st
            .links
            .keys()
            .chain(st.pending.keys())
            .copied()
            .collect();
        for peer in peers {
            self.inner.disconnect_locked(&mut st, &peer);
        }
        st.table.clear();
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.inner.lock().table.connected_peers()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.lock().table.is_connected(peer)
    }

    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        self.inner.lock().table.state(peer)
    }

    pub fn peer_identity(&self, peer: &PeerId) -> Option<PeerIdentity> {
        self.inner.lock().links.get(peer).map(|l| l.identity.clone())
    }

    /// Queue an application body. Returns its sequence number on the link.
    pub fn queue_data(&self, peer: &PeerId, body: Vec<u8>) -> Result<u64, Error> {
        let mut st = self.inner.lock();
        let link = st.links.get_mut(peer).ok_or(Error::NotConnected(*peer))?;
        let seq = link.next_seq;
        link.tx
            .send(Outbound {
                message: Message::Data { seq, body },
                ticket: Ticket::Data(seq),
            })
            .map_err(|_| TransportError::Closed)?;
        link.next_seq += 1;
        Ok(seq)
    }

    pub fn queue(&self, peer: &PeerId, message: Message, ticket: Ticket) -> Result<(), Error> {
        let st = self.inner.lock();
        let link = st.links.get(peer).ok_or(Error::NotConnected(*peer))?;
        link.tx
            .send(Outbound { message, ticket })
            .map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    /// Long-lived queue handle for tasks that send many frames.
    pub fn sender(&self, peer: &PeerId) -> Result<LinkSender, Error> {
        let st = self.inner.lock();
        let link = st.links.get(peer).ok_or(Error::NotConnected(*peer))?;
        Ok(LinkSender {
            peer: link.identity.clone(),
            tx: link.tx.downgrade(),
        })
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            dialed: self.inner.dialed.load(Ordering::SeqCst),
            accepted: self.inner.accepted.load(Ordering::SeqCst),
            refused: self.inner.refused.load(Ordering::SeqCst),
        }
    }

    /// Abort every task without goodbyes.
    pub fn abort(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        let mut st = self.inner.lock();
        if let Some((_, task)) = st.listener.take() {
            task.abort();
        }
        for (_, link) in st.links.drain() {
            link.reader.abort();
        }
        for (_, attempt) in st.pending.drain() {
            if let Some(task) = attempt.task {
                task.abort();
            }
        }
        st.table.clear();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn disconnect_locked(&self, st: &mut SessionState, peer: &PeerId) -> bool {
        let identity = st.table.identity(peer).cloned();
        st.table.mark_disconnected(peer);
        if let Some(attempt) = st.pending.remove(peer) {
            // Incoming handshakes are dropped silently; only our own dials report back.
            if let Some(task) = attempt.task {
                task.abort();
                if let Some(peer) = identity {
                    debug!("cancelled connection attempt to {}", peer);
                    self.emit(SessionEvent::ConnectFailed {
                        peer,
                        error: ConnectionError::Cancelled,
                    });
                }
            }
            return true;
        }
        match st.links.remove(peer) {
            Some(link) => {
                link.reader.abort();
                let _ = link.tx.send(Outbound {
                    message: Message::Bye,
                    ticket: Ticket::None,
                });
                info!("disconnected from {}", link.identity);
                self.emit(SessionEvent::Disconnected {
                    peer: link.identity,
                    reason: LinkClosed::Local,
                });
                true
            }
            None => false,
        }
    }

    async fn dial(
        self: Arc<Self>,
        peer: PeerIdentity,
        addr: SocketAddr,
        timeout: Duration,
        generation: u64,
    ) {
        let local = self.local.clone();
        let attempt = async {
            let mut stream = TcpStream::connect(addr).await?;
            let _ = stream.set_nodelay(true);
            let remote = handshake_initiator(&mut stream, &local, peer.id).await?;
            Ok::<_, ConnectionError>((stream, remote))
        };
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(r) => r,
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        };

        let mut st = self.lock();
        match st.pending.get(&peer.id) {
            Some(a) if a.generation == generation => {
                st.pending.remove(&peer.id);
            }
            // Cancelled or superseded by the peer's own attempt.
            _ => return,
        }
        match result {
            Ok((stream, remote)) => self.establish(&mut st, stream, remote),
            Err(error) => {
                st.table.mark_disconnected(&peer.id);
                debug!("connection to {} failed: {}", peer, error);
                self.emit(SessionEvent::ConnectFailed { peer, error });
            }
        }
    }

    async fn accept_incoming(self: Arc<Self>, mut stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let timeout = self.config.connect_timeout();
        let remote = match tokio::time::timeout(timeout, read_hello(&mut stream)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                debug!("bad hello: {}", e);
                return;
            }
            Err(_) => {
                debug!("hello not received within {:?}", timeout);
                return;
            }
        };

        let generation = self.admit(&remote.identity);
        let accepted = generation.is_some();
        if accepted {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        } else {
            self.refused.fetch_add(1, Ordering::SeqCst);
            debug!("refused {}", remote.identity);
        }
        let answered =
            tokio::time::timeout(timeout, answer_hello(&mut stream, &self.local, accepted)).await;
        let Some(generation) = generation else {
            return;
        };

        let mut st = self.lock();
        match st.pending.get(&remote.identity.id) {
            Some(a) if a.generation == generation => {
                st.pending.remove(&remote.identity.id);
            }
            _ => return,
        }
        match answered {
            Ok(Ok(())) => self.establish(&mut st, stream, remote),
            Ok(Err(e)) => {
                st.table.mark_disconnected(&remote.identity.id);
                debug!("handshake with {} failed: {}", remote.identity, e);
            }
            Err(_) => {
                st.table.mark_disconnected(&remote.identity.id);
                debug!("handshake with {} timed out", remote.identity);
            }
        }
    }

    /// Admission for an incoming hello. On acceptance the peer is `Connecting` with an
    /// incoming attempt registered; returns that attempt's generation.
    fn admit(&self, remote: &PeerIdentity) -> Option<u64> {
        if !self.active.load(Ordering::SeqCst) {
            return None;
        }
        {
            let mut st = self.lock();
            match st.table.admission(remote.id) {
                Admission::Admit => {}
                Admission::Supersede => {
                    let ours_is_dial = st.pending.get(&remote.id).map_or(false, |a| a.task.is_some());
                    if !ours_is_dial {
                        return None;
                    }
                    if let Some(Attempt { task: Some(task), .. }) = st.pending.remove(&remote.id) {
                        task.abort();
                    }
                    debug!("{} dialed us first; dropping our attempt", remote);
                    let generation = st.generation();
                    st.pending.insert(
                        remote.id,
                        Attempt {
                            generation,
                            task: None,
                        },
                    );
                    return Some(generation);
                }
                Admission::AlreadyConnected | Admission::Duplicate | Admission::SelfConnect => {
                    return None
                }
            }
        }
        let policy = self
            .policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if !policy(remote) {
            return None;
        }
        let mut st = self.lock();
        if !self.active.load(Ordering::SeqCst) || st.table.begin_connect(remote.clone()).is_err() {
            return None;
        }
        let generation = st.generation();
        st.pending.insert(
            remote.id,
            Attempt {
                generation,
                task: None,
            },
        );
        Some(generation)
    }

    /// Connecting → Connected: split the stream, spawn the writer and reader, register the link.
    fn establish(self: &Arc<Self>, st: &mut SessionState, stream: TcpStream, remote: RemoteHello) {
        let keys = remote.session_keys(&self.local);
        let (r, w) = stream.into_split();
        let (reader, writer) = match (SealedReader::new(r, &keys), SealedWriter::new(w, &keys)) {
            (Ok(r), Ok(w)) => (r, w),
            (Err(e), _) | (_, Err(e)) => {
                st.table.mark_disconnected(&remote.identity.id);
                warn!("cannot seal session with {}: {}", remote.identity, e);
                return;
            }
        };
        if st.table.mark_connected(remote.identity.clone()).is_err() {
            return;
        }
        let identity = remote.identity;
        let generation = st.generation();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(
            self.clone(),
            rx,
            writer,
            identity.clone(),
            generation,
        ));
        let reader = tokio::spawn(run_reader(self.clone(), reader, identity.clone(), generation));
        st.links.insert(
            identity.id,
            Link {
                identity: identity.clone(),
                tx,
                next_seq: 0,
                generation,
                reader,
            },
        );
        info!("connected to {}", identity);
        self.emit(SessionEvent::Connected(identity));
    }

    /// Remote-side or transport teardown. Only the first caller for a link generation reports it.
    fn link_down(&self, peer: &PeerId, generation: u64, error: TransportError) {
        let mut st = self.lock();
        match st.links.get(peer) {
            Some(link) if link.generation == generation => {}
            _ => return,
        }
        st.table.mark_disconnected(peer);
        if let Some(link) = st.links.remove(peer) {
            link.reader.abort();
            info!("link to {} closed: {}", link.identity, error);
            self.emit(SessionEvent::Disconnected {
                peer: link.identity,
                reason: LinkClosed::Remote(error),
            });
        }
    }
}

async fn run_writer(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut writer: SealedWriter<OwnedWriteHalf>,
    peer: PeerIdentity,
    generation: u64,
) {
    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval());
    heartbeat.tick().await;
    let mut undelivered = Vec::new();
    let failure = loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(out) = next else { break None };
                let bye = matches!(out.message, Message::Bye);
                match writer.send(&out.message).await {
                    Ok(()) => {
                        if let Ticket::Written(done) = out.ticket {
                            let _ = done.send(());
                        }
                        if bye {
                            break None;
                        }
                    }
                    Err(e) => {
                        if let Ticket::Data(seq) = out.ticket {
                            undelivered.push(seq);
                        }
                        break Some(e);
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = writer.send(&Message::Heartbeat).await {
                    break Some(e);
                }
            }
        }
    };
    rx.close();
    while let Ok(out) = rx.try_recv() {
        if let Ticket::Data(seq) = out.ticket {
            undelivered.push(seq);
        }
    }
    let error = failure.clone().unwrap_or(TransportError::Closed);
    if !undelivered.is_empty() {
        debug!("{} messages to {} not delivered", undelivered.len(), peer);
        inner.emit(SessionEvent::Undelivered {
            peer: peer.clone(),
            seqs: undelivered,
            error: error.clone(),
        });
    }
    if let Some(e) = failure {
        inner.link_down(&peer.id, generation, e);
    }
    writer.shutdown().await;
}

async fn run_reader(
    inner: Arc<Inner>,
    mut reader: SealedReader<OwnedReadHalf>,
    peer: PeerIdentity,
    generation: u64,
) {
    let idle = inner.config.idle_timeout();
    let error = loop {
        let message = match tokio::time::timeout(idle, reader.recv()).await {
            Err(_) => break TransportError::IdleTimeout(idle),
            Ok(Err(e)) => break e,
            Ok(Ok(m)) => m,
        };
        match message {
            Message::Heartbeat => {}
            Message::Bye => break TransportError::ClosedByPeer,
            message => inner.emit(SessionEvent::Frame {
                peer: peer.clone(),
                message,
            }),
        }
    };
    inner.link_down(&peer.id, generation, error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const LOOPBACK: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

    struct Side {
        manager: SessionManager,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        identity: PeerIdentity,
        addr: SocketAddr,
    }

    async fn side(name: &str, config: SessionConfig) -> Side {
        let local = Arc::new(LocalIdentity::generate(name));
        let (tx, events) = mpsc::unbounded_channel();
        let manager = SessionManager::new(local.clone(), config, tx);
        let addr = manager.start(LOOPBACK).await.unwrap();
        Side {
            manager,
            events,
            identity: local.identity(),
            addr,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("session event")
            .expect("channel open")
    }

    async fn connected_pair() -> (Side, Side) {
        let mut a = side("a", SessionConfig::default()).await;
        let mut b = side("b", SessionConfig::default()).await;
        assert!(a
            .manager
            .connect(b.identity.clone(), b.addr, Duration::from_secs(5))
            .unwrap());
        assert!(matches!(next(&mut a.events).await, SessionEvent::Connected(p) if p == b.identity));
        assert!(matches!(next(&mut b.events).await, SessionEvent::Connected(p) if p == a.identity));
        (a, b)
    }

    #[tokio::test]
    async fn dial_handshake_and_ordered_data() {
        let (a, mut b) = connected_pair().await;
        assert_eq!(a.manager.connected_peers(), vec![b.identity.clone()]);
        assert_eq!(
            b.manager.peer_identity(&a.identity.id).unwrap().display_name,
            "a"
        );
        for i in 0..5u8 {
            assert_eq!(a.manager.queue_data(&b.identity.id, vec![i]).unwrap(), i as u64);
        }
        for i in 0..5u8 {
            match next(&mut b.events).await {
                SessionEvent::Frame {
                    message: Message::Data { seq, body },
                    ..
                } => {
                    assert_eq!(seq, i as u64);
                    assert_eq!(body, vec![i]);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(a.manager.stats().dialed, 1);
        assert_eq!(b.manager.stats().accepted, 1);
    }

    #[tokio::test]
    async fn repeat_connect_is_noop() {
        let (a, b) = connected_pair().await;
        assert!(!a
            .manager
            .connect(b.identity.clone(), b.addr, Duration::from_secs(5))
            .unwrap());
        assert_eq!(a.manager.stats().dialed, 1);
    }

    #[tokio::test]
    async fn queue_to_stranger_is_not_connected() {
        let a = side("a", SessionConfig::default()).await;
        let stranger = LocalIdentity::generate("x").peer_id();
        assert!(matches!(
            a.manager.queue_data(&stranger, vec![1]),
            Err(Error::NotConnected(p)) if p == stranger
        ));
        assert!(a.manager.sender(&stranger).is_err());
    }

    #[tokio::test]
    async fn policy_can_refuse() {
        let mut a = side("a", SessionConfig::default()).await;
        let b = side("b", SessionConfig::default()).await;
        b.manager.set_accept_policy(Arc::new(|_: &PeerIdentity| false));
        a.manager
            .connect(b.identity.clone(), b.addr, Duration::from_secs(5))
            .unwrap();
        match next(&mut a.events).await {
            SessionEvent::ConnectFailed { peer, error } => {
                assert_eq!(peer, b.identity);
                assert_eq!(error, ConnectionError::Rejected);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.manager.state(&b.identity.id), ConnectionState::NotConnected);
        assert_eq!(b.manager.stats().refused, 1);
    }

    #[tokio::test]
    async fn inactive_manager_refuses() {
        let mut a = side("a", SessionConfig::default()).await;
        let b = side("b", SessionConfig::default()).await;
        b.manager.inner.active.store(false, Ordering::SeqCst);
        a.manager
            .connect(b.identity.clone(), b.addr, Duration::from_secs(5))
            .unwrap();
        assert!(matches!(
            next(&mut a.events).await,
            SessionEvent::ConnectFailed {
                error: ConnectionError::Rejected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_peer_fails() {
        let mut a = side("a", SessionConfig::default()).await;
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let ghost = LocalIdentity::generate("ghost").identity();
        a.manager
            .connect(ghost.clone(), closed, Duration::from_secs(5))
            .unwrap();
        match next(&mut a.events).await {
            SessionEvent::ConnectFailed { peer, error } => {
                assert_eq!(peer, ghost);
                assert!(matches!(error, ConnectionError::Io(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn mute_listener_times_out() {
        let mut a = side("a", SessionConfig::default()).await;
        // Accepts the TCP connection but never says hello.
        let mute = tokio::net::TcpListener::bind(LOOPBACK).await.unwrap();
        let addr = mute.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = mute.accept().await {
                open.push(stream);
            }
        });
        let ghost = LocalIdentity::generate("ghost").identity();
        let timeout = Duration::from_millis(200);
        a.manager.connect(ghost.clone(), addr, timeout).unwrap();
        assert_eq!(a.manager.state(&ghost.id), ConnectionState::Connecting);
        match next(&mut a.events).await {
            SessionEvent::ConnectFailed { peer, error } => {
                assert_eq!(peer, ghost);
                assert_eq!(error, ConnectionError::Timeout(timeout));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.manager.state(&ghost.id), ConnectionState::NotConnected);
        assert!(a.manager.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_reported_on_both_sides_once() {
        let (mut a, mut b) = connected_pair().await;
        assert!(a.manager.disconnect(&b.identity.id));
        assert!(matches!(
            next(&mut a.events).await,
            SessionEvent::Disconnected { reason: LinkClosed::Local, .. }
        ));
        match next(&mut b.events).await {
            SessionEvent::Disconnected { peer, reason } => {
                assert_eq!(peer, a.identity);
                assert_eq!(reason, LinkClosed::Remote(TransportError::ClosedByPeer));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!a.manager.disconnect(&b.identity.id));
        a.manager.disconnect_all();
        assert!(a.manager.connected_peers().is_empty());
        assert!(b.manager.connected_peers().is_empty());
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn silent_link_times_out() {
        let quiet = SessionConfig {
            heartbeat_interval_ms: 60_000,
            ..SessionConfig::default()
        };
        let impatient = SessionConfig {
            heartbeat_interval_ms: 60_000,
            idle_timeout_ms: 200,
            ..SessionConfig::default()
        };
        let mut a = side("a", impatient).await;
        let b = side("b", quiet).await;
        a.manager
            .connect(b.identity.clone(), b.addr, Duration::from_secs(5))
            .unwrap();
        assert!(matches!(next(&mut a.events).await, SessionEvent::Connected(_)));
        match next(&mut a.events).await {
            SessionEvent::Disconnected { reason, .. } => {
                assert!(matches!(
                    reason,
                    LinkClosed::Remote(TransportError::IdleTimeout(_))
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn heartbeats_keep_link_alive() {
        let lively = SessionConfig {
            heartbeat_interval_ms: 50,
            idle_timeout_ms: 300,
            ..SessionConfig::default()
        };
        let mut a = side("a", lively.clone()).await;
        let b = side("b", lively).await;
        a.manager
            .connect(b.identity.clone(), b.addr, Duration::from_secs(5))
            .unwrap();
        assert!(matches!(next(&mut a.events).await, SessionEvent::Connected(_)));
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(a.manager.is_connected(&b.identity.id));
    }

    #[tokio::test]
    async fn simultaneous_dials_settle_on_one_link() {
        let mut a = side("a", SessionConfig::default()).await;
        let mut b = side("b", SessionConfig::default()).await;
        a.manager
            .connect(b.identity.clone(), b.addr, Duration::from_secs(5))
            .unwrap();
        b.manager
            .connect(a.identity.clone(), a.addr, Duration::from_secs(5))
            .unwrap();
        for rx in [&mut a.events, &mut b.events] {
            loop {
                match next(rx).await {
                    SessionEvent::Connected(_) => break,
                    SessionEvent::ConnectFailed { .. } => continue,
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        assert_eq!(a.manager.connected_peers().len(), 1);
        assert_eq!(b.manager.connected_peers().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_attempt() {
        let mut a = side("a", SessionConfig::default()).await;
        // A listener that never answers the hello.
        let silent = TcpListener::bind(LOOPBACK).await.unwrap();
        let ghost = LocalIdentity::generate("ghost").identity();
        a.manager
            .connect(ghost.clone(), silent.local_addr().unwrap(), Duration::from_secs(30))
            .unwrap();
        a.manager.shutdown();
        assert!(matches!(
            next(&mut a.events).await,
            SessionEvent::ConnectFailed {
                error: ConnectionError::Cancelled,
                ..
            }
        ));
        assert!(!a.manager.is_active());
        assert_eq!(a.manager.state(&ghost.id), ConnectionState::NotConnected);
    }
}
