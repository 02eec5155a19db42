//! Generic in-order byte-stream reassembly for channel payloads.
//!
//! Channel data arrives chopped twice: once into SSH records and once
//! into TCP segments. By the time it reaches this module the chunks are
//! in non-decreasing byte-offset order (per-connection processing is
//! strictly serialized), so the job left is to concatenate, hand the
//! consumer progressively larger views, and buffer whatever it has not
//! consumed yet. The consumer's own framing decides the logical unit
//! boundaries; this code is deliberately ignorant of them.

/// Consumer verdict over the currently buffered view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Consume {
    /// The first `n` buffered bytes form a complete unit and are done.
    Consumed(usize),
    /// The unit is incomplete; do not call again until at least `n`
    /// more bytes were buffered.
    NeedMore(usize),
}

/// Receives reassembled channel bytes.
pub trait ChannelConsumer {
    /// Called with the full pending view for a channel. Returning
    /// `Consumed(n)` drops `n` bytes and retries with the remainder;
    /// `NeedMore(n)` suspends until more data arrives.
    fn on_channel_bytes(&mut self, channel: u32, data: &[u8]) -> Consume;
}

/// Per-channel reassembly buffer.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    pending: Vec<u8>,
    /// Stream offset of `pending[0]`.
    base_offset: u64,
    /// Bytes the consumer asked to see beyond what it was last shown.
    outstanding: usize,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset the next pushed chunk is expected to start at.
    pub fn next_offset(&self) -> u64 {
        self.base_offset + self.pending.len() as u64
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one `(byte_offset, data)` chunk and drive the consumer.
    ///
    /// Overlap with already-buffered bytes is trimmed; a forward jump
    /// (which cannot arise from counter-derived offsets, but guards
    /// against counter resets) abandons the pending buffer and treats
    /// the new chunk as authoritative.
    pub fn push(
        &mut self,
        channel: u32,
        byte_offset: u64,
        data: &[u8],
        consumer: &mut dyn ChannelConsumer,
    ) {
        let expected = self.next_offset();
        let data = if byte_offset < expected {
            let overlap = (expected - byte_offset) as usize;
            if overlap >= data.len() {
                return;
            }
            &data[overlap..]
        } else {
            if byte_offset > expected {
                warn!(
                    "channel {}: byte offset jumped from {} to {}, resynchronizing",
                    channel, expected, byte_offset
                );
                self.pending.clear();
                self.base_offset = byte_offset;
                self.outstanding = 0;
            }
            data
        };
        let grown = data.len();
        self.pending.extend_from_slice(data);

        if self.outstanding > grown {
            self.outstanding -= grown;
            return;
        }
        self.outstanding = 0;
        self.run_consumer(channel, consumer);
    }

    fn run_consumer(&mut self, channel: u32, consumer: &mut dyn ChannelConsumer) {
        while !self.pending.is_empty() {
            match consumer.on_channel_bytes(channel, &self.pending) {
                Consume::Consumed(n) => {
                    let n = n.min(self.pending.len());
                    self.pending.drain(..n);
                    self.base_offset += n as u64;
                    if n == 0 {
                        break;
                    }
                }
                Consume::NeedMore(n) => {
                    self.outstanding = n;
                    break;
                }
            }
        }
    }
}
