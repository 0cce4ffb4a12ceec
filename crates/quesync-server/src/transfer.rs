use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use quesync_files::ChunkStore;
use quesync_protocol::error::ErrorKind;
use quesync_protocol::types::{FileId, FileInfo, SessionId, UserId};
use quesync_protocol::wire::{self, Packet};

/// How long a fresh connection gets to present its session id.
const AUTH_TIMEOUT_SECS: u64 = 5;

/// Maps a presented session id to a user. Authentication itself lives in
/// the external control plane; this only validates what it issued.
pub trait SessionAuthorizer: Send + Sync {
    fn authorize(&self, session_id: SessionId) -> Option<UserId>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Completed uploads: metadata in memory, bytes on disk under the
/// configured directory, one file per id.
pub struct FileLibrary {
    root: PathBuf,
    inner: Mutex<HashMap<FileId, FileInfo>>,
}

impl FileLibrary {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Assign an id and record the metadata of an announced upload.
    pub fn register(&self, name: String, size: u64, uploader_id: UserId) -> FileInfo {
        let info = FileInfo {
            id: Uuid::new_v4(),
            name,
            size,
            uploader_id,
        };
        lock(&self.inner).insert(info.id, info.clone());
        info
    }

    pub fn info(&self, file_id: FileId) -> Option<FileInfo> {
        lock(&self.inner).get(&file_id).cloned()
    }

    fn path_of(&self, file_id: FileId) -> PathBuf {
        self.root.join(file_id.to_string())
    }

    pub async fn save(&self, file_id: FileId, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.path_of(file_id), bytes).await
    }

    pub async fn load(&self, file_id: FileId) -> Result<Vec<u8>, ErrorKind> {
        if !lock(&self.inner).contains_key(&file_id) {
            return Err(ErrorKind::FileNotFound);
        }
        tokio::fs::read(self.path_of(file_id))
            .await
            .map_err(|_| ErrorKind::FileNotFound)
    }
}

/// Responder side of the file-transfer protocol: one instance serves all
/// connections, each connection carrying its own in-flight chunk state.
pub struct TransferServer {
    library: Arc<FileLibrary>,
    auth: Arc<dyn SessionAuthorizer>,
    chunk_size: usize,
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> std::io::Result<()> {
    let frame = wire::encode_frame(packet).map_err(std::io::Error::other)?;
    writer.write_all(&frame).await
}

/// Read the next well-formed packet, skipping malformed ones. `None` on
/// EOF, read error, or an oversized frame.
async fn next_packet<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Option<Packet> {
    loop {
        match wire::try_decode_frame(buf) {
            Ok(Some(payload)) => match Packet::decode(&payload) {
                Some(packet) => return Some(packet),
                None => {
                    warn!("discarding malformed packet");
                    continue;
                }
            },
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "closing transfer connection");
                return None;
            }
        }
        match reader.read_buf(buf).await {
            Ok(0) => return None,
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "transfer connection read failed");
                return None;
            }
        }
    }
}

impl TransferServer {
    pub fn new(
        library: Arc<FileLibrary>,
        auth: Arc<dyn SessionAuthorizer>,
        chunk_size: usize,
    ) -> Self {
        Self { library, auth, chunk_size }
    }

    /// Serve one transfer connection to completion.
    ///
    /// The peer must authenticate within the timeout; afterwards requests
    /// are handled strictly in order, so every response the peer awaits
    /// matches its oldest outstanding request.
    pub async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: S) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = BytesMut::with_capacity(8192);

        let auth = tokio::time::timeout(
            Duration::from_secs(AUTH_TIMEOUT_SECS),
            next_packet(&mut reader, &mut buf),
        )
        .await;
        let user_id = match auth {
            Ok(Some(Packet::SessionAuth { session_id })) => {
                match self.auth.authorize(session_id) {
                    Some(user_id) => user_id,
                    None => {
                        let _ = send(
                            &mut writer,
                            &Packet::Error { kind: ErrorKind::NotAuthenticated },
                        )
                        .await;
                        return;
                    }
                }
            }
            Ok(Some(_)) | Ok(None) | Err(_) => {
                let _ = send(
                    &mut writer,
                    &Packet::Error { kind: ErrorKind::NotAuthenticated },
                )
                .await;
                return;
            }
        };
        if send(&mut writer, &Packet::Authenticated).await.is_err() {
            return;
        }
        debug!(%user_id, "transfer connection authenticated");

        // Per-connection in-flight state; dropped with the connection.
        let mut uploads: HashMap<FileId, ChunkStore> = HashMap::new();
        let mut downloads: HashMap<FileId, ChunkStore> = HashMap::new();

        while let Some(packet) = next_packet(&mut reader, &mut buf).await {
            let result = self
                .handle_packet(packet, user_id, &mut uploads, &mut downloads, &mut writer)
                .await;
            if result.is_err() {
                break;
            }
        }
        debug!(%user_id, "transfer connection closed");
    }

    async fn handle_packet<W: AsyncWrite + Unpin>(
        &self,
        packet: Packet,
        user_id: UserId,
        uploads: &mut HashMap<FileId, ChunkStore>,
        downloads: &mut HashMap<FileId, ChunkStore>,
        writer: &mut W,
    ) -> std::io::Result<()> {
        match packet {
            Packet::UploadFile { name, size } => {
                if size == 0 {
                    return send(writer, &Packet::Error { kind: ErrorKind::EmptyFile }).await;
                }
                let file = self.library.register(name, size, user_id);
                uploads.insert(file.id, ChunkStore::new(size, self.chunk_size));
                info!(%user_id, file_id = %file.id, size, "upload initiated");
                send(writer, &Packet::FileUploadInitiated { file }).await
            }

            Packet::FileChunk { file_id, chunk } => {
                let Some(store) = uploads.get_mut(&file_id) else {
                    return send(writer, &Packet::Error { kind: ErrorKind::FileNotFound }).await;
                };
                let index = chunk.index;
                if !store.insert(chunk) {
                    warn!(%file_id, index, "chunk index out of range");
                    return Ok(());
                }
                if store.is_complete() {
                    let total = store.total_chunks();
                    let bytes = store.reconstruct().unwrap_or_default();
                    uploads.remove(&file_id);
                    if let Err(error) = self.library.save(file_id, &bytes).await {
                        warn!(%file_id, %error, "failed to persist upload");
                        return send(writer, &Packet::Error { kind: ErrorKind::TransientIo })
                            .await;
                    }
                    info!(%file_id, size = bytes.len(), "upload complete");
                    send(
                        writer,
                        &Packet::FileChunkAck { file_id, next_index: total, done: true },
                    )
                    .await
                } else {
                    let next = store.next_missing_index().unwrap_or(0);
                    send(
                        writer,
                        &Packet::FileChunkAck { file_id, next_index: next, done: false },
                    )
                    .await
                }
            }

            Packet::GetFileInfo { file_id } => match self.library.info(file_id) {
                Some(file) => send(writer, &Packet::FileInfo { file }).await,
                None => send(writer, &Packet::Error { kind: ErrorKind::FileNotFound }).await,
            },

            Packet::DownloadFile { file_id } => {
                let Some(file) = self.library.info(file_id) else {
                    return send(writer, &Packet::Error { kind: ErrorKind::FileNotFound }).await;
                };
                let bytes = match self.library.load(file_id).await {
                    Ok(bytes) => bytes,
                    Err(kind) => return send(writer, &Packet::Error { kind }).await,
                };
                let store = ChunkStore::from_bytes(&bytes, self.chunk_size);
                let first = store.chunk(0).cloned();
                downloads.insert(file_id, store);
                info!(%user_id, %file_id, "download initiated");
                send(writer, &Packet::FileDownloadInitiated { file }).await?;
                match first {
                    Some(chunk) => send(writer, &Packet::FileChunk { file_id, chunk }).await,
                    None => Ok(()),
                }
            }

            Packet::FileChunkAck { file_id, next_index, done } => {
                let Some(store) = downloads.get(&file_id) else {
                    return send(writer, &Packet::Error { kind: ErrorKind::FileNotFound }).await;
                };
                if done {
                    downloads.remove(&file_id);
                    debug!(%file_id, "download complete");
                    Ok(())
                } else if next_index < store.total_chunks() {
                    match store.chunk(next_index).cloned() {
                        Some(chunk) => send(writer, &Packet::FileChunk { file_id, chunk }).await,
                        None => Ok(()),
                    }
                } else {
                    warn!(%file_id, next_index, "ack index out of range");
                    Ok(())
                }
            }

            other => {
                debug!(packet_type = ?other.packet_type(), "ignoring unexpected packet");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quesync_protocol::types::FileChunk;
    use tokio::io::DuplexStream;

    const CS: usize = 256;

    /// Authorizes every session, mapping the session id onto the user id.
    struct AllowAll;

    impl SessionAuthorizer for AllowAll {
        fn authorize(&self, session_id: SessionId) -> Option<UserId> {
            Some(session_id)
        }
    }

    struct DenyAll;

    impl SessionAuthorizer for DenyAll {
        fn authorize(&self, _session_id: SessionId) -> Option<UserId> {
            None
        }
    }

    fn server(dir: &tempfile::TempDir, auth: Arc<dyn SessionAuthorizer>) -> Arc<TransferServer> {
        let library = Arc::new(FileLibrary::new(dir.path().to_path_buf()));
        Arc::new(TransferServer::new(library, auth, CS))
    }

    async fn write_packet(stream: &mut DuplexStream, packet: &Packet) {
        let frame = wire::encode_frame(packet).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_packet(stream: &mut DuplexStream, buf: &mut BytesMut) -> Packet {
        loop {
            if let Some(payload) = wire::try_decode_frame(buf).unwrap() {
                return Packet::decode(&payload).unwrap();
            }
            let n = stream.read_buf(buf).await.unwrap();
            assert!(n > 0, "connection closed");
        }
    }

    #[tokio::test]
    async fn first_packet_must_be_session_auth() {
        let dir = tempfile::tempdir().unwrap();
        let srv = server(&dir, Arc::new(AllowAll));
        let (mut client, peer) = tokio::io::duplex(4096);
        tokio::spawn(async move { srv.handle_connection(peer).await });

        write_packet(&mut client, &Packet::GetFileInfo { file_id: Uuid::new_v4() }).await;
        let mut buf = BytesMut::new();
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::Error { kind: ErrorKind::NotAuthenticated }
        );
    }

    #[tokio::test]
    async fn rejected_session_gets_not_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let srv = server(&dir, Arc::new(DenyAll));
        let (mut client, peer) = tokio::io::duplex(4096);
        tokio::spawn(async move { srv.handle_connection(peer).await });

        write_packet(&mut client, &Packet::SessionAuth { session_id: Uuid::new_v4() }).await;
        let mut buf = BytesMut::new();
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::Error { kind: ErrorKind::NotAuthenticated }
        );
    }

    #[tokio::test]
    async fn upload_then_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let srv = server(&dir, Arc::new(AllowAll));
        let (mut client, peer) = tokio::io::duplex(65536);
        tokio::spawn(async move { srv.handle_connection(peer).await });
        let mut buf = BytesMut::new();

        write_packet(&mut client, &Packet::SessionAuth { session_id: Uuid::new_v4() }).await;
        assert_eq!(read_packet(&mut client, &mut buf).await, Packet::Authenticated);

        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        write_packet(
            &mut client,
            &Packet::UploadFile { name: "notes.txt".into(), size: 300 },
        )
        .await;
        let file = match read_packet(&mut client, &mut buf).await {
            Packet::FileUploadInitiated { file } => file,
            other => panic!("expected FileUploadInitiated, got {:?}", other),
        };
        assert_eq!(file.size, 300);

        let chunks = quesync_files::split_into_chunks(&data, CS);
        write_packet(
            &mut client,
            &Packet::FileChunk { file_id: file.id, chunk: chunks[&0].clone() },
        )
        .await;
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::FileChunkAck { file_id: file.id, next_index: 1, done: false }
        );
        write_packet(
            &mut client,
            &Packet::FileChunk { file_id: file.id, chunk: chunks[&1].clone() },
        )
        .await;
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::FileChunkAck { file_id: file.id, next_index: 2, done: true }
        );

        // Bytes are on disk, truncated to the declared size.
        let stored = std::fs::read(dir.path().join(file.id.to_string())).unwrap();
        assert_eq!(stored, data);

        // Metadata query and download of the same file.
        write_packet(&mut client, &Packet::GetFileInfo { file_id: file.id }).await;
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::FileInfo { file: file.clone() }
        );

        write_packet(&mut client, &Packet::DownloadFile { file_id: file.id }).await;
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::FileDownloadInitiated { file: file.clone() }
        );
        let first = match read_packet(&mut client, &mut buf).await {
            Packet::FileChunk { chunk, .. } => chunk,
            other => panic!("expected FileChunk, got {:?}", other),
        };
        assert_eq!(first.index, 0);
        write_packet(
            &mut client,
            &Packet::FileChunkAck { file_id: file.id, next_index: 1, done: false },
        )
        .await;
        let second = match read_packet(&mut client, &mut buf).await {
            Packet::FileChunk { chunk, .. } => chunk,
            other => panic!("expected FileChunk, got {:?}", other),
        };
        assert_eq!(second.index, 1);
        assert_eq!(&second.data[..44], &data[256..]);
        write_packet(
            &mut client,
            &Packet::FileChunkAck { file_id: file.id, next_index: 2, done: true },
        )
        .await;
    }

    #[tokio::test]
    async fn empty_upload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let srv = server(&dir, Arc::new(AllowAll));
        let (mut client, peer) = tokio::io::duplex(4096);
        tokio::spawn(async move { srv.handle_connection(peer).await });
        let mut buf = BytesMut::new();

        write_packet(&mut client, &Packet::SessionAuth { session_id: Uuid::new_v4() }).await;
        assert_eq!(read_packet(&mut client, &mut buf).await, Packet::Authenticated);

        write_packet(&mut client, &Packet::UploadFile { name: "x".into(), size: 0 }).await;
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::Error { kind: ErrorKind::EmptyFile }
        );
    }

    #[tokio::test]
    async fn unknown_file_requests_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let srv = server(&dir, Arc::new(AllowAll));
        let (mut client, peer) = tokio::io::duplex(4096);
        tokio::spawn(async move { srv.handle_connection(peer).await });
        let mut buf = BytesMut::new();

        write_packet(&mut client, &Packet::SessionAuth { session_id: Uuid::new_v4() }).await;
        assert_eq!(read_packet(&mut client, &mut buf).await, Packet::Authenticated);

        write_packet(&mut client, &Packet::GetFileInfo { file_id: Uuid::new_v4() }).await;
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::Error { kind: ErrorKind::FileNotFound }
        );

        write_packet(&mut client, &Packet::DownloadFile { file_id: Uuid::new_v4() }).await;
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::Error { kind: ErrorKind::FileNotFound }
        );

        write_packet(
            &mut client,
            &Packet::FileChunk {
                file_id: Uuid::new_v4(),
                chunk: FileChunk { index: 0, data: vec![0; CS] },
            },
        )
        .await;
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::Error { kind: ErrorKind::FileNotFound }
        );
    }
}
