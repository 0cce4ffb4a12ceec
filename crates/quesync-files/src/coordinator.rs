use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use quesync_protocol::error::ErrorKind;
use quesync_protocol::events::{Event, EventSink};
use quesync_protocol::types::{FileChunk, FileId, FileInfo, SessionId, UserId};
use quesync_protocol::wire::{self, Packet};

use crate::chunks::ChunkStore;

/// Progress events for the same file are coalesced and flushed on this
/// cadence, so a fast transfer does not flood the event sink.
const EVENT_BATCH_MS: u64 = 50;

const OUTBOUND_QUEUE: usize = 64;

struct Upload {
    info: FileInfo,
    store: ChunkStore,
}

struct Download {
    info: FileInfo,
    store: ChunkStore,
    dest: PathBuf,
}

#[derive(Default)]
struct TransferState {
    uploads: HashMap<FileId, Upload>,
    downloads: HashMap<FileId, Download>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives every in-flight upload and download over one dedicated transfer
/// connection.
///
/// Outbound frames go through an mpsc queue drained by the connection's
/// writer task; inbound frames are fed in by [`FileTransferCoordinator::run`].
/// Control responses (auth, metadata, initiation acks) are matched to their
/// requests in FIFO order, which the single sequential peer guarantees.
pub struct FileTransferCoordinator {
    user_id: UserId,
    chunk_size: usize,
    sink: Arc<dyn EventSink>,
    outbound: mpsc::Sender<Vec<u8>>,
    state: Mutex<TransferState>,
    pending: Mutex<VecDeque<oneshot::Sender<Packet>>>,
    events: Mutex<HashMap<FileId, Event>>,
    stopping: AtomicBool,
    finished: AtomicBool,
    notify: Notify,
}

impl FileTransferCoordinator {
    /// Returns the coordinator and the receiver for outbound frames, which
    /// the caller forwards to the connection's write half.
    pub fn new(
        user_id: UserId,
        chunk_size: usize,
        sink: Arc<dyn EventSink>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let coordinator = Arc::new(Self {
            user_id,
            chunk_size,
            sink,
            outbound: tx,
            state: Mutex::new(TransferState::default()),
            pending: Mutex::new(VecDeque::new()),
            events: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            notify: Notify::new(),
        });
        (coordinator, rx)
    }

    pub fn active_uploads(&self) -> usize {
        lock(&self.state).uploads.len()
    }

    pub fn active_downloads(&self) -> usize {
        lock(&self.state).downloads.len()
    }

    fn idle(&self) -> bool {
        let state = lock(&self.state);
        state.uploads.is_empty() && state.downloads.is_empty()
    }

    /// Request shutdown. [`run`](Self::run) keeps processing until every
    /// in-flight transfer has finished, then exits.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), ErrorKind> {
        let frame = wire::encode_frame(packet).map_err(|_| ErrorKind::TransientIo)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ErrorKind::TransientIo)
    }

    async fn request(&self, packet: Packet) -> Result<Packet, ErrorKind> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).push_back(tx);
        self.send_packet(&packet).await?;
        rx.await.map_err(|_| ErrorKind::TransientIo)
    }

    /// Present the session id; must complete before any transfer is started.
    pub async fn authenticate(&self, session_id: SessionId) -> Result<(), ErrorKind> {
        match self.request(Packet::SessionAuth { session_id }).await? {
            Packet::Authenticated => Ok(()),
            Packet::Error { kind } => Err(kind),
            other => {
                warn!(packet_type = ?other.packet_type(), "unexpected auth response");
                Err(ErrorKind::TransientIo)
            }
        }
    }

    /// Read a local file, announce the upload, and send the first chunk.
    /// Subsequent chunks are sent as acks arrive.
    pub async fn start_upload(&self, path: &Path) -> Result<FileInfo, ErrorKind> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|_| ErrorKind::FileNotFound)?;
        if data.is_empty() {
            return Err(ErrorKind::EmptyFile);
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let file = match self
            .request(Packet::UploadFile { name, size: data.len() as u64 })
            .await?
        {
            Packet::FileUploadInitiated { file } => file,
            Packet::Error { kind } => return Err(kind),
            _ => return Err(ErrorKind::TransientIo),
        };

        let store = ChunkStore::from_bytes(&data, self.chunk_size);
        let first = store.chunk(0).cloned();
        lock(&self.state)
            .uploads
            .insert(file.id, Upload { info: file.clone(), store });

        if let Some(chunk) = first {
            self.send_packet(&Packet::FileChunk { file_id: file.id, chunk })
                .await?;
        }
        Ok(file)
    }

    /// Fetch the file's metadata, then ask the peer to start streaming
    /// chunks. The reconstructed file is written to `dest` on completion.
    pub async fn start_download(
        &self,
        file_id: FileId,
        dest: PathBuf,
    ) -> Result<FileInfo, ErrorKind> {
        if lock(&self.state).downloads.contains_key(&file_id) {
            return Err(ErrorKind::InvalidInput);
        }

        let file = match self.request(Packet::GetFileInfo { file_id }).await? {
            Packet::FileInfo { file } => file,
            Packet::Error { kind } => return Err(kind),
            _ => return Err(ErrorKind::TransientIo),
        };

        lock(&self.state).downloads.insert(
            file_id,
            Download {
                info: file.clone(),
                store: ChunkStore::new(file.size, self.chunk_size),
                dest,
            },
        );

        match self.request(Packet::DownloadFile { file_id }).await? {
            Packet::FileDownloadInitiated { .. } => Ok(file),
            Packet::Error { kind } => {
                lock(&self.state).downloads.remove(&file_id);
                Err(kind)
            }
            _ => {
                lock(&self.state).downloads.remove(&file_id);
                Err(ErrorKind::TransientIo)
            }
        }
    }

    fn queue_event(&self, file_id: FileId, event: Event) {
        lock(&self.events).insert(file_id, event);
    }

    /// Deliver all queued events to the sink.
    pub fn drain_events(&self) {
        let batch: Vec<Event> = {
            let mut events = lock(&self.events);
            events.drain().map(|(_, event)| event).collect()
        };
        for event in batch {
            self.sink.deliver(event, self.user_id);
        }
    }

    /// Periodically flush batched progress events. Exits once the inbound
    /// loop has finished and the queue is drained.
    pub async fn run_event_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(EVENT_BATCH_MS));
        loop {
            ticker.tick().await;
            self.drain_events();
            if self.finished.load(Ordering::SeqCst) && lock(&self.events).is_empty() {
                break;
            }
        }
    }

    /// Inbound loop: read frames from the connection, decode, dispatch.
    /// Exits on EOF, on a framing error, or once [`stop`](Self::stop) was
    /// requested and no transfer remains in flight.
    pub async fn run<R: AsyncRead + Unpin>(&self, mut reader: R) {
        let mut buf = BytesMut::with_capacity(8192);
        'outer: loop {
            if self.stopping.load(Ordering::SeqCst) && self.idle() {
                break;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(_) => loop {
                            match wire::try_decode_frame(&mut buf) {
                                Ok(Some(payload)) => match Packet::decode(&payload) {
                                    Some(packet) => self.handle_packet(packet).await,
                                    None => warn!("discarding malformed packet"),
                                },
                                Ok(None) => break,
                                Err(error) => {
                                    warn!(%error, "closing transfer connection");
                                    break 'outer;
                                }
                            }
                        },
                        Err(error) => {
                            warn!(%error, "transfer connection read failed");
                            break;
                        }
                    }
                }
            }
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Authenticated
            | Packet::FileInfo { .. }
            | Packet::FileUploadInitiated { .. }
            | Packet::FileDownloadInitiated { .. }
            | Packet::Error { .. } => {
                let waiter = lock(&self.pending).pop_front();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(packet);
                    }
                    None => warn!(?packet, "control response with no pending request"),
                }
            }
            Packet::FileChunk { file_id, chunk } => self.handle_chunk(file_id, chunk).await,
            Packet::FileChunkAck { file_id, next_index, done } => {
                self.handle_ack(file_id, next_index, done).await
            }
            other => {
                debug!(packet_type = ?other.packet_type(), "ignoring unexpected packet")
            }
        }
    }

    async fn handle_chunk(&self, file_id: FileId, chunk: FileChunk) {
        let index = chunk.index;
        let (reply, event, persist) = {
            let mut state = lock(&self.state);
            // Take the entry out, so completion evicts it and hands the
            // reconstructed bytes to the persistence task within the same
            // critical section.
            match state.downloads.remove(&file_id) {
                None => (
                    Some(Packet::Error { kind: ErrorKind::FileNotFound }),
                    None,
                    None,
                ),
                Some(mut download) => {
                    if !download.store.insert(chunk) {
                        warn!(%file_id, index, "chunk index out of range");
                        state.downloads.insert(file_id, download);
                        (None, None, None)
                    } else if download.store.is_complete() {
                        let bytes = download.store.reconstruct().unwrap_or_default();
                        let size = download.info.size;
                        let total = download.store.total_chunks();
                        (
                            Some(Packet::FileChunkAck {
                                file_id,
                                next_index: total,
                                done: true,
                            }),
                            Some(Event::FileTransferProgress { file_id, bytes: size }),
                            Some((download.dest, bytes)),
                        )
                    } else {
                        let size = download.info.size;
                        let received = download.store.received();
                        let next = download.store.next_missing_index().unwrap_or(0);
                        state.downloads.insert(file_id, download);
                        (
                            Some(Packet::FileChunkAck {
                                file_id,
                                next_index: next,
                                done: false,
                            }),
                            Some(Event::FileTransferProgress {
                                file_id,
                                bytes: (received * self.chunk_size as u64).min(size),
                            }),
                            None,
                        )
                    }
                }
            }
        };

        if let Some((dest, bytes)) = persist {
            tokio::spawn(async move {
                if let Err(error) = tokio::fs::write(&dest, &bytes).await {
                    warn!(%error, path = %dest.display(), "failed to persist downloaded file");
                }
            });
        }
        if let Some(event) = event {
            self.queue_event(file_id, event);
        }
        if let Some(reply) = reply {
            if self.send_packet(&reply).await.is_err() {
                warn!(%file_id, "outbound queue closed");
            }
        }
    }

    async fn handle_ack(&self, file_id: FileId, next_index: u64, done: bool) {
        let (reply, event) = {
            let mut state = lock(&self.state);
            if !state.uploads.contains_key(&file_id) {
                (Some(Packet::Error { kind: ErrorKind::FileNotFound }), None)
            } else if done {
                let size = state
                    .uploads
                    .remove(&file_id)
                    .map(|u| u.info.size)
                    .unwrap_or(0);
                (None, Some(Event::FileTransferProgress { file_id, bytes: size }))
            } else {
                match state.uploads.get(&file_id) {
                    Some(upload) if next_index < upload.store.total_chunks() => {
                        let size = upload.info.size;
                        match upload.store.chunk(next_index) {
                            Some(chunk) => (
                                Some(Packet::FileChunk { file_id, chunk: chunk.clone() }),
                                Some(Event::FileTransferProgress {
                                    file_id,
                                    bytes: (next_index * self.chunk_size as u64).min(size),
                                }),
                            ),
                            None => (None, None),
                        }
                    }
                    _ => {
                        warn!(%file_id, next_index, "ack index out of range");
                        (None, None)
                    }
                }
            }
        };

        if let Some(event) = event {
            self.queue_event(file_id, event);
        }
        if let Some(reply) = reply {
            if self.send_packet(&reply).await.is_err() {
                warn!(%file_id, "outbound queue closed");
            }
        }
    }
}
