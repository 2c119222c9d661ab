//! Bounded chunk FIFO between the decode stage and the audio output stage.
//!
//! Chunk ownership moves through the queue: the producer never touches a
//! chunk again after a successful enqueue, and the consumer frees it after
//! writing it to the sink. Watermark policy lives with the orchestrator;
//! this type only provides the bounded FIFO plus timed operations.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

/// Interleaved signed 16-bit PCM, one decode/filter step's worth.
pub type PcmChunk = Vec<i16>;

#[derive(Clone)]
pub struct PlaybackRingBuffer {
    tx: Sender<PcmChunk>,
    rx: Receiver<PcmChunk>,
    capacity: usize,
}

impl PlaybackRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Enqueue with a bounded wait. Returns the chunk back on timeout so
    /// the producer can re-check its cancel flag and retry.
    pub fn try_enqueue(&self, chunk: PcmChunk, timeout: Duration) -> Result<(), PcmChunk> {
        match self.tx.send_timeout(chunk, timeout) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::SendTimeoutError::Timeout(chunk)) => Err(chunk),
            Err(crossbeam_channel::SendTimeoutError::Disconnected(chunk)) => Err(chunk),
        }
    }

    /// Non-blocking enqueue, used only in tests and drain paths.
    pub fn try_enqueue_now(&self, chunk: PcmChunk) -> Result<(), PcmChunk> {
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(chunk)) | Err(TrySendError::Disconnected(chunk)) => Err(chunk),
        }
    }

    /// Dequeue with a bounded wait.
    pub fn dequeue(&self, timeout: Duration) -> Option<PcmChunk> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Some(chunk),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drop all queued chunks without playing them. Returns the count.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}
