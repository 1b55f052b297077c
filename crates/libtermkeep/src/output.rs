use std::sync::{Mutex, MutexGuard};

use termkeep_protocol::DEFAULT_OUTPUT_BUFFER_SIZE;

/// Fixed-capacity circular byte store holding a session's most recent output.
///
/// The backing store is allocated once at construction and never grows.
/// Writes past capacity overwrite the oldest retained bytes. All methods take
/// `&self`; a single mutex owned by the buffer serializes access so the
/// session reader and a reattaching connection can use it concurrently.
#[derive(Debug)]
pub struct OutputBuffer {
    inner: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    data: Vec<u8>,
    write_pos: usize,
    total_written: u64,
}

impl OutputBuffer {
    /// A zero capacity is bumped to one byte.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                data: vec![0; capacity.max(1)],
                write_pos: 0,
                total_written: 0,
            }),
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut ring = self.lock();
        let cap = ring.data.len();
        ring.total_written = ring.total_written.saturating_add(bytes.len() as u64);

        // Only the newest `cap` bytes can survive.
        let bytes = if bytes.len() > cap {
            &bytes[bytes.len() - cap..]
        } else {
            bytes
        };

        let start = ring.write_pos;
        let first = bytes.len().min(cap - start);
        ring.data[start..start + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            ring.data[..rest].copy_from_slice(&bytes[first..]);
        }
        ring.write_pos = (start + bytes.len()) % cap;
    }

    /// Linear copy of the retained bytes, oldest first.
    pub fn read_all(&self) -> Vec<u8> {
        let ring = self.lock();
        let len = ring.retained();
        let cap = ring.data.len();
        if len < cap {
            // Never wrapped: valid bytes are data[..write_pos].
            return ring.data[..len].to_vec();
        }
        let mut out = Vec::with_capacity(cap);
        out.extend_from_slice(&ring.data[ring.write_pos..]);
        out.extend_from_slice(&ring.data[..ring.write_pos]);
        out
    }

    pub fn len(&self) -> usize {
        self.lock().retained()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().data.len()
    }

    pub fn total_written(&self) -> u64 {
        self.lock().total_written
    }

    /// Whether any byte has ever been evicted.
    pub fn has_overflowed(&self) -> bool {
        let ring = self.lock();
        ring.total_written > ring.data.len() as u64
    }

    pub fn reset(&self) {
        let mut ring = self.lock();
        ring.write_pos = 0;
        ring.total_written = 0;
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Ring {
    fn retained(&self) -> usize {
        self.total_written.min(self.data.len() as u64) as usize
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_BUFFER_SIZE)
    }
}
