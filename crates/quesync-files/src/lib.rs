//! Chunked, resumable file transfer: chunk math, the in-memory chunk
//! store, and the initiator-side transfer coordinator.

pub mod chunks;
pub mod coordinator;

pub use chunks::{chunk_count, split_into_chunks, ChunkStore, CHUNK_SIZE};
pub use coordinator::FileTransferCoordinator;
