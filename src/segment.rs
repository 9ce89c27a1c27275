//! Seam to the reliable-segment layer that sits above this transport.
//!
//! That layer fragments application messages, schedules retransmission, and
//! reassembles what arrives here as decrypted chunks. This crate only needs
//! the inbound half of its contract: a sink for plaintext chunks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::Microseconds;

/// Receives the plaintext of every data packet that survives decryption
pub trait SegmentLayer: Send {
    /// Process one decrypted chunk.
    ///
    /// `full_seq` is the reconstructed 64-bit packet sequence. Returning
    /// false tells the transport to stop processing the rest of the packet
    /// (the piggybacked stats blob is dropped with it).
    fn process_plaintext_chunk(
        &mut self,
        full_seq: u64,
        plain: &[u8],
        now: Microseconds,
    ) -> bool;
}

/// Sink for connections that have nowhere to deliver yet (e.g. accepted but
/// not yet claimed by the application); chunks are dropped on the floor.
pub struct Discard;

impl SegmentLayer for Discard {
    fn process_plaintext_chunk(&mut self, _full_seq: u64, _plain: &[u8], _now: Microseconds) -> bool {
        true
    }
}

/// A [`SegmentLayer`] that buffers chunks for the application to drain.
///
/// The handle half stays with the caller while the queue half is installed
/// into a connection.
pub struct ChunkQueue {
    inner: Arc<Mutex<VecDeque<(u64, Bytes)>>>,
}

impl ChunkQueue {
    pub fn new() -> (Self, ChunkQueueHandle) {
        let inner = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                inner: inner.clone(),
            },
            ChunkQueueHandle { inner },
        )
    }
}

impl SegmentLayer for ChunkQueue {
    fn process_plaintext_chunk(&mut self, full_seq: u64, plain: &[u8], _now: Microseconds) -> bool {
        self.inner
            .lock()
            .unwrap()
            .push_back((full_seq, Bytes::copy_from_slice(plain)));
        true
    }
}

/// Application-side view of a [`ChunkQueue`]
#[derive(Clone)]
pub struct ChunkQueueHandle {
    inner: Arc<Mutex<VecDeque<(u64, Bytes)>>>,
}

impl ChunkQueueHandle {
    /// Take the oldest delivered chunk, if any
    pub fn pop(&self) -> Option<(u64, Bytes)> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
