//! Bounded, concurrency-safe audio byte buffer.
//!
//! Writes past capacity evict the oldest bytes so the newest audio always
//! fits; reads are strict (all-or-nothing). Both eviction and odd-length
//! writes are aligned to the 2-byte sample boundary, so the buffer length is
//! a sample multiple after every operation.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::SAMPLE_WIDTH;

pub struct AudioBuffer {
    max_size: usize,
    inner: Mutex<VecDeque<u8>>,
}

impl AudioBuffer {
    /// Create a buffer holding at most `max_size` bytes (rounded down to a
    /// whole sample).
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size - (max_size % SAMPLE_WIDTH),
            inner: Mutex::new(VecDeque::with_capacity(max_size.min(64 * 1024))),
        }
    }

    /// Append bytes, evicting the oldest bytes when capacity is exceeded.
    /// Never fails. A trailing odd byte is dropped to keep sample alignment.
    pub fn write(&self, data: &[u8]) {
        let data = &data[..data.len() - (data.len() % SAMPLE_WIDTH)];
        let mut buf = self.inner.lock().unwrap();
        if data.len() >= self.max_size {
            // Incoming data alone fills the buffer; keep only its tail
            buf.clear();
            buf.extend(&data[data.len() - self.max_size..]);
            return;
        }
        let total = buf.len() + data.len();
        if total > self.max_size {
            let mut excess = total - self.max_size;
            excess += excess % SAMPLE_WIDTH;
            let buf_len = buf.len();
            buf.drain(..excess.min(buf_len));
        }
        buf.extend(data);
    }

    /// Read exactly `n` bytes, or nothing if fewer are buffered.
    pub fn read(&self, n: usize) -> Vec<u8> {
        let mut buf = self.inner.lock().unwrap();
        if buf.len() < n {
            return Vec::new();
        }
        buf.drain(..n).collect()
    }

    /// Drain the whole buffer.
    pub fn read_all(&self) -> Vec<u8> {
        let mut buf = self.inner.lock().unwrap();
        buf.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}
