use bytes::{Bytes, BytesMut};
use std::cmp;

/// A fixed-capacity byte ring addressed by absolute stream offsets.
///
/// `written` counts every byte ever pushed. Only the last `capacity` of them
/// are retained, so offsets below `oldest()` are gone for good. Backing
/// storage grows lazily up to `capacity`.
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    written: u64,
}

/// Result of reading from an absolute offset.
pub struct ReadSlice {
    /// Bytes that were overwritten between the requested offset and `start`.
    pub missed: u64,
    /// Absolute offset of the first byte in `data`.
    pub start: u64,
    pub data: Bytes,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            buf: Vec::new(),
            capacity,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Absolute offset of the oldest byte still retained.
    pub fn oldest(&self) -> u64 {
        self.written.saturating_sub(self.capacity as u64)
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        // Only the tail of an oversized write can survive.
        let skip = data.len().saturating_sub(self.capacity);
        let tail = &data[skip..];

        let needed = cmp::min(self.capacity as u64, self.written + data.len() as u64) as usize;
        if self.buf.len() < needed {
            self.buf.resize(needed, 0);
        }

        let start = self.index_of(self.written + skip as u64);
        let first = cmp::min(tail.len(), self.capacity - start);
        self.buf[start..start + first].copy_from_slice(&tail[..first]);
        let rest = tail.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&tail[first..]);
        }
        self.written += data.len() as u64;
    }

    /// Copy at most `max` bytes starting at `from`, skipping forward to the
    /// oldest retained byte if `from` has already been overwritten.
    pub fn read_from(&self, from: u64, max: usize) -> ReadSlice {
        let from = cmp::min(from, self.written);
        let oldest = self.oldest();
        let (missed, start) = if from < oldest {
            (oldest - from, oldest)
        } else {
            (0, from)
        };

        let len = cmp::min((self.written - start) as usize, max);
        let mut out = BytesMut::with_capacity(len);
        if len > 0 {
            let begin = self.index_of(start);
            let first = cmp::min(len, self.capacity - begin);
            out.extend_from_slice(&self.buf[begin..begin + first]);
            out.extend_from_slice(&self.buf[..len - first]);
        }
        ReadSlice {
            missed,
            start,
            data: out.freeze(),
        }
    }

    fn index_of(&self, offset: u64) -> usize {
        (offset % self.capacity as u64) as usize
    }
}
