// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Fixed-capacity byte ring retaining the tail of a stream.
///
/// Writes beyond capacity discard the *oldest* bytes, so a snapshot is
/// always the most recent `capacity` bytes of the logical write stream.
/// The total-bytes-written counter is monotonic and includes discarded
/// bytes, which lets readers detect how much output scrolled past.
#[derive(Debug)]
pub struct BoundedBuffer {
    capacity: usize,
    data: VecDeque<u8>,
    total_written: u64,
}

impl BoundedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            total_written: 0,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.total_written += bytes.len() as u64;
        if bytes.len() >= self.capacity {
            // A single write larger than the ring: only its tail survives.
            self.data.clear();
            self.data
                .extend(&bytes[bytes.len() - self.capacity..]);
            return;
        }
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
        }
        self.data.extend(bytes);
    }

    /// The retained bytes, in write order.
    pub fn snapshot(&self) -> Vec<u8> {
        let (a, b) = self.data.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    /// Lossy UTF-8 view of the retained bytes.
    pub fn snapshot_lossy(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_written
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop the retained bytes.  The total-written counter is preserved.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// A buffer shared between one producer task and concurrent snapshotters.
pub type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

pub fn shared_buffer(capacity: usize) -> SharedBuffer {
    Arc::new(Mutex::new(BoundedBuffer::new(capacity)))
}

/// Snapshot helper that tolerates a poisoned lock (the producer panicked;
/// the bytes already written are still valid).
pub fn snapshot_lossy(buf: &SharedBuffer) -> String {
    buf.lock()
        .unwrap_or_else(|e| e.into_inner())
        .snapshot_lossy()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
