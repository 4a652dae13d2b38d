use std::collections::VecDeque;

/// Undecoded byte chunks of one speech stream, in arrival order.
///
/// Chunks are only ever appended at the back and the queue is always drained
/// as a whole, so a decode never sees a partially consumed chunk.
#[derive(Debug, Default)]
pub struct AudioChunkBuffer {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
}

impl AudioChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Total buffered length in bytes
    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether enough bytes are buffered to attempt a decode
    pub fn reached(&self, threshold: usize) -> bool {
        !self.is_empty() && self.total_bytes >= threshold
    }

    /// Remove every chunk and return them as one contiguous region
    pub fn drain_all(&mut self) -> Vec<u8> {
        let mut joined = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks.drain(..) {
            joined.extend_from_slice(&chunk);
        }
        self.total_bytes = 0;
        joined
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let mut buffer = AudioChunkBuffer::new();
        buffer.push(vec![1, 2]);
        buffer.push(vec![3]);
        buffer.push(vec![4, 5, 6]);

        assert_eq!(buffer.len_bytes(), 6);
        assert_eq!(buffer.chunk_count(), 3);
        assert_eq!(buffer.drain_all(), vec![1, 2, 3, 4, 5, 6]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len_bytes(), 0);
    }

    #[test]
    fn test_threshold() {
        let mut buffer = AudioChunkBuffer::new();
        assert!(!buffer.reached(0));

        buffer.push(vec![0; 10]);
        assert!(!buffer.reached(16));

        buffer.push(vec![0; 6]);
        assert!(buffer.reached(16));
    }

    #[test]
    fn test_empty_chunks_ignored() {
        let mut buffer = AudioChunkBuffer::new();
        buffer.push(Vec::new());
        assert!(buffer.is_empty());
        assert_eq!(buffer.chunk_count(), 0);
    }

    #[test]
    fn test_clear() {
        let mut buffer = AudioChunkBuffer::new();
        buffer.push(vec![1; 100]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len_bytes(), 0);
    }
}
