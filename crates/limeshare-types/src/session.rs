use crate::ids::SessionId;

/// Chunk size used by the relay path and the keystream provider: 16 KB.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Which side of a transfer this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Receiver,
}

/// Immutable description of one transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub total_chunks: u32,
    pub role: Role,
}

impl SessionInfo {
    /// `None` if the layout cannot be described: a zero chunk size, or more
    /// chunks than a `u32` index can address.
    pub fn new(id: SessionId, name: impl Into<String>, total_size: u64, chunk_size: usize, role: Role) -> Option<Self> {
        Some(Self {
            id,
            name: name.into(),
            total_size,
            chunk_size,
            total_chunks: chunk_count(total_size, chunk_size)?,
            role,
        })
    }

    /// Plaintext length of chunk `index`.
    pub fn chunk_len(&self, index: u32) -> usize {
        chunk_len(index, self.total_size, self.chunk_size)
    }

    /// Byte range of chunk `index` within the file.
    pub fn chunk_range(&self, index: u32) -> std::ops::Range<usize> {
        let start = index as usize * self.chunk_size;
        start..start + self.chunk_len(index)
    }
}

/// Number of chunks needed to cover `size` bytes.
///
/// `None` for a zero chunk size or when the count does not fit in a `u32`.
pub fn chunk_count(size: u64, chunk_size: usize) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(size.div_ceil(chunk_size as u64)).ok()
}

/// Length of chunk `index`; the last chunk carries the remainder.
/// Returns 0 for indices past the end.
pub fn chunk_len(index: u32, size: u64, chunk_size: usize) -> usize {
    let start = u64::from(index).saturating_mul(chunk_size as u64);
    if start >= size {
        return 0;
    }
    (size - start).min(chunk_size as u64) as usize
}
