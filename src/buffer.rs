//! Reassembly buffer between the background receive loop and the reader.
//!
//! A strictly ordered byte queue terminated by a single end-of-stream
//! sentinel. The connection's receive loop is the only producer; the stream
//! consumer is the only reader. Payloads arrive as whole segments but are
//! consumed as a byte stream, so the reader keeps a partial-segment
//! carry-over between calls.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// One entry in the reassembly queue.
#[derive(Debug)]
enum Segment {
    /// In-order payload bytes, ready for the consumer.
    Data(Bytes),
    /// End-of-stream sentinel. Nothing follows it.
    End,
}

/// Producer half, owned by the connection's receive loop.
#[derive(Debug)]
pub struct BufferWriter {
    tx: mpsc::UnboundedSender<Segment>,
    finished: bool,
}

/// Consumer half, owned by the stream.
#[derive(Debug)]
pub struct BufferReader {
    rx: mpsc::UnboundedReceiver<Segment>,
    /// Remainder of a segment only partially consumed by `read_exactly`.
    carry: Bytes,
    ended: bool,
}

/// Create a connected writer/reader pair.
pub fn reassembly_buffer() -> (BufferWriter, BufferReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        BufferWriter {
            tx,
            finished: false,
        },
        BufferReader {
            rx,
            carry: Bytes::new(),
            ended: false,
        },
    )
}

impl BufferWriter {
    /// Append in-order payload bytes for the consumer.
    ///
    /// A send failure means the reader was dropped; the bytes have nowhere
    /// to go and are discarded.
    pub fn push(&self, data: Bytes) {
        if data.is_empty() || self.finished {
            return;
        }
        let _ = self.tx.send(Segment::Data(data));
    }

    /// Mark end-of-stream. Idempotent; later pushes are dropped.
    pub fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.tx.send(Segment::End);
        }
    }
}

impl BufferReader {
    /// Read up to `n` bytes, stopping early at the end-of-stream sentinel.
    ///
    /// Suspends while no bytes are available and the stream has not ended.
    /// Once the sentinel has been observed, returns an empty buffer.
    pub async fn read_exactly(&mut self, n: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(n.min(MAX_PREALLOC));
        while out.len() < n {
            if !self.carry.is_empty() {
                let take = self.carry.split_to((n - out.len()).min(self.carry.len()));
                out.extend_from_slice(&take);
                continue;
            }
            if !self.fill().await {
                break;
            }
        }
        out.freeze()
    }

    /// Read everything up to the end-of-stream sentinel.
    pub async fn read_all(&mut self) -> Bytes {
        let mut out = BytesMut::new();
        loop {
            if !self.carry.is_empty() {
                let take = self.carry.split_to(self.carry.len());
                out.extend_from_slice(&take);
                continue;
            }
            if !self.fill().await {
                break;
            }
        }
        out.freeze()
    }

    /// Wait for the next segment. Returns false at end-of-stream.
    async fn fill(&mut self) -> bool {
        if self.ended {
            return false;
        }
        match self.rx.recv().await {
            Some(Segment::Data(data)) => {
                self.carry = data;
                true
            }
            // A closed channel means the producer vanished without sending
            // the sentinel; treat it as end-of-stream rather than hanging.
            Some(Segment::End) | None => {
                self.ended = true;
                false
            }
        }
    }
}

const MAX_PREALLOC: usize = 64 * 1024;
