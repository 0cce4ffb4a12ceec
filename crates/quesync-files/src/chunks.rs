use std::collections::HashMap;

use quesync_protocol::types::FileChunk;

/// Default chunk size on the wire. Every chunk of a file carries exactly
/// this many bytes; the final chunk is zero-padded and the pad removed at
/// reconstruction using the file's declared size.
pub const CHUNK_SIZE: usize = 65_536;

/// Number of chunks needed for `file_size` bytes: `ceil(size / chunk_size)`.
pub fn chunk_count(file_size: u64, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size as u64;
    file_size / chunk_size + u64::from(file_size % chunk_size != 0)
}

/// Split a byte buffer into indexed chunks, padding the final chunk.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> HashMap<u64, FileChunk> {
    let mut chunks = HashMap::new();
    for (index, piece) in data.chunks(chunk_size).enumerate() {
        let mut chunk_data = piece.to_vec();
        chunk_data.resize(chunk_size, 0);
        chunks.insert(
            index as u64,
            FileChunk { index: index as u64, data: chunk_data },
        );
    }
    chunks
}

/// In-memory chunk set for one in-flight file.
///
/// Chunks are addressed by their explicit index, never by arrival order,
/// so retransmitted or out-of-order chunks cannot corrupt the store.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    file_size: u64,
    chunk_size: usize,
    chunks: HashMap<u64, FileChunk>,
}

impl ChunkStore {
    /// An empty store expecting `chunk_count(file_size, chunk_size)` chunks.
    pub fn new(file_size: u64, chunk_size: usize) -> Self {
        Self {
            file_size,
            chunk_size,
            chunks: HashMap::new(),
        }
    }

    /// A pre-filled store for uploading a local buffer.
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Self {
        Self {
            file_size: data.len() as u64,
            chunk_size,
            chunks: split_into_chunks(data, chunk_size),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn total_chunks(&self) -> u64 {
        chunk_count(self.file_size, self.chunk_size)
    }

    /// Number of distinct chunks received so far.
    pub fn received(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Insert a chunk. Returns `false` (and stores nothing) for an index
    /// beyond the file's chunk count. Duplicate inserts are idempotent.
    pub fn insert(&mut self, chunk: FileChunk) -> bool {
        if chunk.index >= self.total_chunks() {
            return false;
        }
        self.chunks.insert(chunk.index, chunk);
        true
    }

    pub fn chunk(&self, index: u64) -> Option<&FileChunk> {
        self.chunks.get(&index)
    }

    /// The lowest index not yet present, or `None` once complete.
    pub fn next_missing_index(&self) -> Option<u64> {
        (0..self.total_chunks()).find(|index| !self.chunks.contains_key(index))
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total_chunks()
    }

    /// Merge chunks by ascending index and truncate to the declared file
    /// size. `None` while any chunk is missing.
    pub fn reconstruct(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut content = Vec::with_capacity(self.total_chunks() as usize * self.chunk_size);
        for index in 0..self.total_chunks() {
            content.extend_from_slice(&self.chunks.get(&index)?.data);
        }
        content.truncate(self.file_size as usize);
        Some(content)
    }
}
