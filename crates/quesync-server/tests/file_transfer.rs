//! Full transfer-protocol exercise: the initiator-side coordinator talking
//! to the responder over an in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use quesync_files::FileTransferCoordinator;
use quesync_protocol::error::ErrorKind;
use quesync_protocol::events::{Event, MemorySink};
use quesync_protocol::types::{FileId, SessionId, UserId};
use quesync_server::transfer::{FileLibrary, SessionAuthorizer, TransferServer};

const CHUNK: usize = 256;

struct IdentityAuthorizer;

impl SessionAuthorizer for IdentityAuthorizer {
    fn authorize(&self, session_id: SessionId) -> Option<UserId> {
        Some(session_id)
    }
}

struct Harness {
    coordinator: Arc<FileTransferCoordinator>,
    sink: Arc<MemorySink>,
    user: UserId,
}

/// Wire a coordinator to a responder over a duplex pipe and spawn the
/// run/writer/event tasks.
fn harness(store_dir: std::path::PathBuf) -> Harness {
    let library = Arc::new(FileLibrary::new(store_dir));
    let server = Arc::new(TransferServer::new(
        library,
        Arc::new(IdentityAuthorizer),
        CHUNK,
    ));

    let (client_io, server_io) = tokio::io::duplex(65536);
    tokio::spawn(async move { server.handle_connection(server_io).await });

    let sink = Arc::new(MemorySink::new());
    let user = Uuid::new_v4();
    let (coordinator, mut outbound) = FileTransferCoordinator::new(user, CHUNK, sink.clone());

    let (read_half, mut write_half) = tokio::io::split(client_io);
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });
    let runner = coordinator.clone();
    tokio::spawn(async move { runner.run(read_half).await });
    tokio::spawn(coordinator.clone().run_event_loop());

    Harness { coordinator, sink, user }
}

/// Poll until the sink has delivered a completion event for the file.
async fn await_completion(sink: &MemorySink, file_id: FileId, size: u64) {
    for _ in 0..200 {
        let done = sink.snapshot().iter().any(|(event, _)| {
            matches!(
                event,
                Event::FileTransferProgress { file_id: id, bytes }
                    if *id == file_id && *bytes == size
            )
        });
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no completion event for {}", file_id);
}

#[tokio::test]
async fn upload_then_download_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let h = harness(store_dir.clone());

    h.coordinator.authenticate(h.user).await.unwrap();

    // 300 bytes with chunk size 256: one full chunk plus one padded chunk.
    let data: Vec<u8> = (0..300u32).map(|i| (i * 7 % 256) as u8).collect();
    let src = dir.path().join("upload.bin");
    std::fs::write(&src, &data).unwrap();

    let file = h.coordinator.start_upload(&src).await.unwrap();
    assert_eq!(file.size, 300);
    assert_eq!(file.name, "upload.bin");
    assert_eq!(file.uploader_id, h.user);

    await_completion(&h.sink, file.id, 300).await;
    assert_eq!(h.coordinator.active_uploads(), 0);

    // Exactly one completion event, delivered to the transferring user.
    let events = h.sink.take();
    let completions: Vec<_> = events
        .iter()
        .filter(|(event, _)| {
            matches!(
                event,
                Event::FileTransferProgress { file_id, bytes }
                    if *file_id == file.id && *bytes == 300
            )
        })
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(events.iter().all(|(_, target)| *target == h.user));

    // The responder persisted the exact original bytes, unpadded.
    let stored = std::fs::read(store_dir.join(file.id.to_string())).unwrap();
    assert_eq!(stored, data);

    // Download the same file back through the protocol.
    let dest = dir.path().join("download.bin");
    let info = h
        .coordinator
        .start_download(file.id, dest.clone())
        .await
        .unwrap();
    assert_eq!(info.size, 300);

    await_completion(&h.sink, file.id, 300).await;
    assert_eq!(h.coordinator.active_downloads(), 0);

    for _ in 0..200 {
        if dest.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn download_of_unknown_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().join("store"));

    h.coordinator.authenticate(h.user).await.unwrap();

    let result = h
        .coordinator
        .start_download(Uuid::new_v4(), dir.path().join("nope.bin"))
        .await;
    assert_eq!(result.unwrap_err(), ErrorKind::FileNotFound);
    assert_eq!(h.coordinator.active_downloads(), 0);
}

#[tokio::test]
async fn larger_file_with_out_of_order_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let h = harness(store_dir.clone());

    h.coordinator.authenticate(h.user).await.unwrap();

    // Ten full chunks plus a remainder.
    let data: Vec<u8> = (0..10 * CHUNK + 17).map(|i| (i % 251) as u8).collect();
    let src = dir.path().join("big.bin");
    std::fs::write(&src, &data).unwrap();

    let file = h.coordinator.start_upload(&src).await.unwrap();
    await_completion(&h.sink, file.id, data.len() as u64).await;

    let stored = std::fs::read(store_dir.join(file.id.to_string())).unwrap();
    assert_eq!(stored, data);
}
