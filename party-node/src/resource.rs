//! Resource transfer engine: chunked, windowed uploads and verified, materialized downloads.
//!
//! Every transfer lives in the registry until it reaches a terminal state. Whoever removes
//! the entry emits the terminal event, so each transfer reports exactly one.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use image::GenericImageView;
use party_core::transfer::{crosses_percent, sanitize_name, split_into_chunks};
use party_core::{
    Direction, IncomingResource, Message, PeerId, PeerIdentity, ResourceHasher, ResourceKind,
    Transfer, TransferError, TransferId, TransferState,
};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, ImageInfo, ReceivedResource, TransferResult};
use crate::session::{LinkSender, SessionManager, Ticket};

struct Upload {
    transfer: Transfer,
    task: Option<JoinHandle<()>>,
    /// `ResourceEnd` is queued. The peer completes once it is written, so the upload task
    /// reports the outcome itself and the transfer can no longer be cancelled.
    sealed: bool,
}

/// A verified download being decoded and written into the inbox.
struct Storing {
    transfer: Transfer,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    uploads: HashMap<TransferId, Upload>,
    downloads: HashMap<TransferId, IncomingResource>,
    storing: HashMap<TransferId, Storing>,
}

impl Registry {
    /// Remove a cancellable transfer in any stage, if `peer` owns it, aborting its task.
    fn take(&mut self, id: &TransferId, peer: Option<&PeerId>) -> Option<Transfer> {
        let owned = |t: &Transfer| peer.map_or(true, |p| t.peer.id == *p);
        if self
            .uploads
            .get(id)
            .map_or(false, |u| !u.sealed && owned(&u.transfer))
        {
            let upload = self.uploads.remove(id)?;
            if let Some(task) = upload.task {
                task.abort();
            }
            return Some(upload.transfer);
        }
        if self.downloads.get(id).map_or(false, |d| owned(&d.transfer)) {
            return self.downloads.remove(id).map(|d| d.transfer);
        }
        if self.storing.get(id).map_or(false, |s| owned(&s.transfer)) {
            let storing = self.storing.remove(id)?;
            if let Some(task) = storing.task {
                task.abort();
            }
            return Some(storing.transfer);
        }
        None
    }

    fn ids(&self, peer: Option<&PeerId>) -> Vec<TransferId> {
        let owned = |t: &Transfer| peer.map_or(true, |p| t.peer.id == *p);
        let uploads = self.uploads.iter().filter(|(_, u)| owned(&u.transfer));
        let downloads = self.downloads.iter().filter(|(_, d)| owned(&d.transfer));
        let storing = self.storing.iter().filter(|(_, s)| owned(&s.transfer));
        uploads
            .map(|(id, _)| *id)
            .chain(downloads.map(|(id, _)| *id))
            .chain(storing.map(|(id, _)| *id))
            .collect()
    }
}

pub struct ResourceEngine<M> {
    session: SessionManager,
    events: EventBus<M>,
    config: TransferConfig,
    inbox: PathBuf,
    registry: Arc<Mutex<Registry>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<M> ResourceEngine<M> {
    /// Abort every transfer task without reporting; used on teardown.
    pub fn abort(&self) {
        let mut guard = lock(&self.registry);
        let reg = &mut *guard;
        let uploads = reg.uploads.drain().filter_map(|(_, u)| u.task);
        let stores = reg.storing.drain().filter_map(|(_, s)| s.task);
        for task in uploads.chain(stores).collect::<Vec<_>>() {
            task.abort();
        }
        reg.downloads.clear();
    }
}

impl<M: Clone + Send + 'static> ResourceEngine<M> {
    pub fn new(
        session: SessionManager,
        events: EventBus<M>,
        config: TransferConfig,
        inbox: PathBuf,
    ) -> Self {
        Self {
            session,
            events,
            config,
            inbox,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    /// Start sending the file at `path` to `peer`. Returns once the transfer is registered;
    /// progress and the outcome arrive as events.
    pub fn send_resource(
        &self,
        peer: &PeerId,
        path: &Path,
        name: &str,
        kind: ResourceKind,
    ) -> Result<TransferId> {
        let link = self.session.sender(peer)?;
        let id = TransferId::new_random();
        let transfer = Transfer::new(
            id,
            link.peer().clone(),
            name,
            kind,
            Direction::Outgoing,
            0,
        );
        let mut reg = lock(&self.registry);
        reg.uploads.insert(
            id,
            Upload {
                transfer,
                task: None,
                sealed: false,
            },
        );
        let upload = UploadJob {
            registry: self.registry.clone(),
            events: self.events.clone(),
            link,
            id,
            path: path.to_path_buf(),
            name: name.to_string(),
            kind,
            chunk_size: self.config.chunk_size.max(1),
            window: self.config.window.max(1),
            max_bytes: self.config.max_resource_bytes,
        };
        let task = tokio::spawn(upload.run());
        if let Some(entry) = reg.uploads.get_mut(&id) {
            entry.task = Some(task);
        }
        debug!("queued {:?} for {:?} as {}", name, peer, id);
        Ok(id)
    }

    /// Cancel a transfer in either direction. The peer is told; the local side gets one
    /// `TransferFailed(Cancelled)`.
    pub fn cancel_transfer(&self, id: &TransferId) -> Result<()> {
        let transfer = lock(&self.registry)
            .take(id, None)
            .ok_or(Error::Transfer(TransferError::Finished))?;
        let _ = self.session.queue(
            &transfer.peer.id,
            Message::ResourceCancel {
                transfer_id: *id,
                reason: "cancelled".into(),
            },
            Ticket::None,
        );
        self.finish_failed(transfer, TransferError::Cancelled);
        Ok(())
    }

    /// Fail every transfer with `peer`.
    pub fn fail_peer(&self, peer: &PeerId, error: TransferError) {
        self.fail_matching(Some(peer), error);
    }

    /// Fail every transfer; used when the node disconnects.
    pub fn fail_all(&self, error: TransferError) {
        self.fail_matching(None, error);
    }

    fn fail_matching(&self, peer: Option<&PeerId>, error: TransferError) {
        let taken: Vec<Transfer> = {
            let mut reg = lock(&self.registry);
            let ids = reg.ids(peer);
            ids.iter().filter_map(|id| reg.take(id, peer)).collect()
        };
        for transfer in taken {
            self.finish_failed(transfer, error.clone());
        }
    }

    pub fn in_flight(&self) -> usize {
        let reg = lock(&self.registry);
        reg.uploads.len() + reg.downloads.len() + reg.storing.len()
    }

    fn finish_failed(&self, mut transfer: Transfer, error: TransferError) {
        transfer.finish(error.terminal_state());
        info!("transfer {} with {} failed: {}", transfer.id, transfer.peer, error);
        self.events.emit(Event::TransferFailed {
            peer: transfer.peer,
            transfer_id: transfer.id,
            error,
        });
    }

    /// Refuse an incoming transfer: tell the sender and report locally.
    fn refuse(&self, transfer: Transfer, error: TransferError) {
        let _ = self.session.queue(
            &transfer.peer.id,
            Message::ResourceCancel {
                transfer_id: transfer.id,
                reason: error.to_string(),
            },
            Ticket::None,
        );
        self.finish_failed(transfer, error);
    }

    pub fn on_offer(
        &self,
        peer: PeerIdentity,
        transfer_id: TransferId,
        name: String,
        kind: ResourceKind,
        total_bytes: u64,
        digest: [u8; 32],
    ) {
        let transfer = Transfer::new(
            transfer_id,
            peer.clone(),
            name.clone(),
            kind,
            Direction::Incoming,
            total_bytes,
        );
        let mut reg = lock(&self.registry);
        if reg.downloads.contains_key(&transfer_id)
            || reg.uploads.contains_key(&transfer_id)
            || reg.storing.contains_key(&transfer_id)
        {
            debug!("duplicate offer {} from {}", transfer_id, peer);
            return;
        }
        match IncomingResource::new(transfer.clone(), digest, self.config.max_resource_bytes) {
            Ok(resource) => {
                reg.downloads.insert(transfer_id, resource);
                drop(reg);
                info!("receiving {:?} ({} bytes) from {}", name, total_bytes, peer);
                self.events.emit(Event::TransferStarted {
                    peer,
                    transfer_id,
                    name,
                    kind,
                    direction: Direction::Incoming,
                    total_bytes,
                });
            }
            Err(e) => {
                drop(reg);
                self.refuse(transfer, e);
            }
        }
    }

    pub fn on_chunk(
        &self,
        peer: &PeerIdentity,
        transfer_id: TransferId,
        offset: u64,
        bytes: &[u8],
    ) {
        let mut reg = lock(&self.registry);
        let Some(resource) = reg.downloads.get_mut(&transfer_id) else {
            debug!("chunk for unknown transfer {}", transfer_id);
            return;
        };
        if resource.transfer.peer.id != peer.id {
            return;
        }
        match resource.push_chunk(offset, bytes) {
            Ok(done) => {
                let total_bytes = resource.transfer.total_bytes;
                drop(reg);
                if !crosses_percent(done - bytes.len() as u64, done, total_bytes) {
                    return;
                }
                self.events.emit(Event::TransferProgress {
                    peer: peer.clone(),
                    transfer_id,
                    bytes_transferred: done,
                    total_bytes,
                });
            }
            Err(e) => {
                let transfer = reg.take(&transfer_id, Some(&peer.id));
                drop(reg);
                if let Some(transfer) = transfer {
                    self.refuse(transfer, e);
                }
            }
        }
    }

    /// Verify the whole resource, then decode and store it off the dispatch path. The transfer
    /// stays cancellable until the inbox write is done.
    pub fn on_end(&self, peer: &PeerIdentity, transfer_id: TransferId) {
        let mut reg = lock(&self.registry);
        let resource = match reg.downloads.get(&transfer_id) {
            Some(r) if r.transfer.peer.id == peer.id => reg.downloads.remove(&transfer_id),
            _ => None,
        };
        let Some(mut resource) = resource else {
            debug!("end for unknown transfer {}", transfer_id);
            return;
        };
        let bytes = match resource.finish() {
            Ok(b) => b,
            Err(e) => {
                drop(reg);
                self.refuse(resource.transfer, e);
                return;
            }
        };
        let store = StoreJob {
            registry: self.registry.clone(),
            events: self.events.clone(),
            session: self.session.clone(),
            inbox: self.inbox.clone(),
            digest: *resource.digest(),
            transfer: resource.transfer.clone(),
            bytes,
        };
        reg.storing.insert(
            transfer_id,
            Storing {
                transfer: resource.transfer,
                task: None,
            },
        );
        let task = tokio::spawn(store.run());
        if let Some(entry) = reg.storing.get_mut(&transfer_id) {
            entry.task = Some(task);
        }
    }

    pub fn on_cancel(&self, peer: &PeerIdentity, transfer_id: TransferId, reason: String) {
        let transfer = lock(&self.registry).take(&transfer_id, Some(&peer.id));
        if let Some(transfer) = transfer {
            self.finish_failed(transfer, TransferError::CancelledByPeer(reason));
        }
    }
}

/// Decode according to `kind` and write the bytes into the inbox.
async fn materialize(
    inbox: &Path,
    transfer: &Transfer,
    bytes: Vec<u8>,
    digest: [u8; 32],
) -> std::result::Result<ReceivedResource, TransferError> {
    let (bytes, image) = match transfer.kind {
        ResourceKind::Binary => (bytes, None),
        ResourceKind::Image => tokio::task::spawn_blocking(move || {
            let decoded =
                image::load_from_memory(&bytes).map_err(|e| TransferError::Decode(e.to_string()))?;
            let (width, height) = GenericImageView::dimensions(&decoded);
            Ok::<_, TransferError>((bytes, Some(ImageInfo { width, height })))
        })
        .await
        .map_err(|e| TransferError::Decode(e.to_string()))??,
    };
    tokio::fs::create_dir_all(inbox)
        .await
        .map_err(|e| TransferError::Io(e.to_string()))?;
    let id = transfer.id.to_string();
    let path = inbox.join(format!("{}-{}", &id[..8], sanitize_name(&transfer.name)));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| TransferError::Io(e.to_string()))?;
    Ok(ReceivedResource {
        transfer_id: transfer.id,
        name: transfer.name.clone(),
        kind: transfer.kind,
        path,
        len: bytes.len() as u64,
        digest,
        image,
    })
}

struct StoreJob<M> {
    registry: Arc<Mutex<Registry>>,
    events: EventBus<M>,
    session: SessionManager,
    inbox: PathBuf,
    transfer: Transfer,
    bytes: Vec<u8>,
    digest: [u8; 32],
}

impl<M: Clone + Send + 'static> StoreJob<M> {
    async fn run(self) {
        let id = self.transfer.id;
        let result = materialize(&self.inbox, &self.transfer, self.bytes, self.digest).await;
        let Some(mut entry) = lock(&self.registry).storing.remove(&id) else {
            // Cancelled after the write finished; the failure is already reported.
            if let Ok(received) = &result {
                let _ = std::fs::remove_file(&received.path);
            }
            return;
        };
        let peer = entry.transfer.peer.clone();
        match result {
            Ok(received) => {
                entry.transfer.finish(TransferState::Completed);
                info!("received {:?} into {}", entry.transfer.name, received.path.display());
                self.events.emit(Event::TransferCompleted {
                    peer,
                    transfer_id: id,
                    result: TransferResult::Received(received),
                });
            }
            Err(error) => {
                entry.transfer.finish(TransferState::Failed);
                warn!("could not store {:?}: {}", entry.transfer.name, error);
                let _ = self.session.queue(
                    &peer.id,
                    Message::ResourceCancel {
                        transfer_id: id,
                        reason: error.to_string(),
                    },
                    Ticket::None,
                );
                self.events.emit(Event::TransferFailed {
                    peer,
                    transfer_id: id,
                    error,
                });
            }
        }
    }
}

struct UploadJob<M> {
    registry: Arc<Mutex<Registry>>,
    events: EventBus<M>,
    link: LinkSender,
    id: TransferId,
    path: PathBuf,
    name: String,
    kind: ResourceKind,
    chunk_size: usize,
    window: usize,
    max_bytes: u64,
}

impl<M: Clone + Send + 'static> UploadJob<M> {
    async fn run(self) {
        match self.send().await {
            Ok(len) => {
                let Some(mut upload) = lock(&self.registry).uploads.remove(&self.id) else {
                    return;
                };
                upload.transfer.finish(TransferState::Completed);
                info!("sent {:?} to {}", self.name, self.link.peer());
                self.events.emit(Event::TransferCompleted {
                    peer: self.link.peer().clone(),
                    transfer_id: self.id,
                    result: TransferResult::Sent {
                        name: self.name.clone(),
                        len,
                    },
                });
            }
            Err(error) => {
                let Some(mut upload) = lock(&self.registry).uploads.remove(&self.id) else {
                    return;
                };
                upload.transfer.finish(error.terminal_state());
                if !matches!(error, TransferError::Transport(_)) {
                    let _ = self.link.send(
                        Message::ResourceCancel {
                            transfer_id: self.id,
                            reason: error.to_string(),
                        },
                        Ticket::None,
                    );
                }
                warn!("sending {:?} to {} failed: {}", self.name, self.link.peer(), error);
                self.events.emit(Event::TransferFailed {
                    peer: self.link.peer().clone(),
                    transfer_id: self.id,
                    error,
                });
            }
        }
    }

    fn queue(&self, message: Message, ticket: Ticket) -> std::result::Result<(), TransferError> {
        self.link
            .send(message, ticket)
            .map_err(|e| TransferError::Transport(e.to_string()))
    }

    /// Record `n` written bytes. Fails if the transfer was cancelled meanwhile.
    fn advance(&self, n: u64) -> std::result::Result<(u64, u64), TransferError> {
        let mut reg = lock(&self.registry);
        let upload = reg
            .uploads
            .get_mut(&self.id)
            .ok_or(TransferError::Cancelled)?;
        let done = upload.transfer.advance(n)?;
        Ok((done, upload.transfer.total_bytes))
    }

    async fn written(
        &self,
        ack: oneshot::Receiver<()>,
        n: u64,
    ) -> std::result::Result<(), TransferError> {
        ack.await
            .map_err(|_| TransferError::Transport("link closed".into()))?;
        let (done, total_bytes) = self.advance(n)?;
        if !crosses_percent(done - n, done, total_bytes) {
            return Ok(());
        }
        self.events.emit(Event::TransferProgress {
            peer: self.link.peer().clone(),
            transfer_id: self.id,
            bytes_transferred: done,
            total_bytes,
        });
        Ok(())
    }

    fn io_error(&self, e: std::io::Error) -> TransferError {
        TransferError::Io(format!("{}: {}", self.path.display(), e))
    }

    /// Hash the first `total_bytes` of `file` and rewind it.
    async fn digest(
        &self,
        file: &mut File,
        total_bytes: u64,
    ) -> std::result::Result<[u8; 32], TransferError> {
        let mut hasher = ResourceHasher::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut limited = (&mut *file).take(total_bytes);
        loop {
            let n = limited.read(&mut buf).await.map_err(|e| self.io_error(e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(hasher.finalize())
    }

    async fn send(&self) -> std::result::Result<u64, TransferError> {
        let mut file = File::open(&self.path).await.map_err(|e| self.io_error(e))?;
        let total_bytes = file
            .metadata()
            .await
            .map_err(|e| self.io_error(e))?
            .len();
        if total_bytes > self.max_bytes {
            return Err(TransferError::TooLarge {
                size: total_bytes,
                max: self.max_bytes,
            });
        }
        let digest = self.digest(&mut file, total_bytes).await?;
        {
            let mut reg = lock(&self.registry);
            let upload = reg
                .uploads
                .get_mut(&self.id)
                .ok_or(TransferError::Cancelled)?;
            upload.transfer.total_bytes = total_bytes;
        }
        self.events.emit(Event::TransferStarted {
            peer: self.link.peer().clone(),
            transfer_id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            direction: Direction::Outgoing,
            total_bytes,
        });
        self.queue(
            Message::ResourceOffer {
                transfer_id: self.id,
                name: self.name.clone(),
                kind: self.kind,
                total_bytes,
                digest,
            },
            Ticket::None,
        )?;

        let mut in_flight: VecDeque<(oneshot::Receiver<()>, u64)> = VecDeque::new();
        for range in split_into_chunks(total_bytes, self.chunk_size) {
            if in_flight.len() >= self.window {
                if let Some((ack, n)) = in_flight.pop_front() {
                    self.written(ack, n).await?;
                }
            }
            let (tx, rx) = oneshot::channel();
            let mut chunk = vec![0u8; (range.end - range.start) as usize];
            file.read_exact(&mut chunk)
                .await
                .map_err(|e| self.io_error(e))?;
            self.queue(
                Message::ResourceChunk {
                    transfer_id: self.id,
                    offset: range.start,
                    bytes: chunk,
                },
                Ticket::Written(tx),
            )?;
            in_flight.push_back((rx, range.end - range.start));
        }
        while let Some((ack, n)) = in_flight.pop_front() {
            self.written(ack, n).await?;
        }

        {
            let mut reg = lock(&self.registry);
            let upload = reg
                .uploads
                .get_mut(&self.id)
                .ok_or(TransferError::Cancelled)?;
            upload.sealed = true;
        }
        let (tx, rx) = oneshot::channel();
        self.queue(Message::ResourceEnd { transfer_id: self.id }, Ticket::Written(tx))?;
        rx.await
            .map_err(|_| TransferError::Transport("link closed".into()))?;
        Ok(total_bytes)
    }
}
