//! Ring of audio buffers between the parser and the playback sink.
//!
//! Parsed packets accumulate in a pending buffer; when a packet no longer
//! fits (or the descriptor list is full) the pending buffer is committed
//! and the ring advances. If the next buffer is still held by the sink the
//! ring is saturated: packets overflow into a FIFO and the caller is told
//! to unschedule the network reader. Freed buffers trigger a drain that
//! moves the FIFO back into the ring and reschedules the reader once it is
//! empty. This is the entire back-pressure story: saturation stops the
//! reader, the TCP window fills, and the remote slows down.

use crate::audio::parser::PacketDesc;
use crate::errors::{StreamError, StreamResult};
use std::collections::VecDeque;
use tracing::trace;

/// Most packet descriptors one committed buffer may carry.
pub const MAX_PACKET_DESCS: usize = 512;

/// A packet parked in the overflow FIFO while the ring is saturated.
#[derive(Debug)]
pub struct QueuedPacket {
    pub data: Vec<u8>,
}

/// What the caller must do after a ring operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingAction {
    /// Hand buffer `index` to the playback sink
    Enqueue { index: usize },
    /// The ring saturated: stop the network reader
    UnscheduleReader,
}

/// Result of draining the overflow FIFO.
#[derive(Debug)]
pub struct DrainResult {
    pub actions: Vec<RingAction>,
    /// True when the FIFO emptied and the reader may be rescheduled
    pub drained_all: bool,
}

/// Fixed-count ring of fixed-capacity byte buffers.
pub struct BufferRing {
    buffer_size: usize,
    buffers: Vec<Vec<u8>>,
    /// Descriptor lists for committed buffers
    descs: Vec<Vec<PacketDesc>>,
    /// Descriptors staged for the pending buffer
    staged: Vec<PacketDesc>,
    in_use: Vec<bool>,
    fill_index: usize,
    buffers_used: usize,
    waiting_on_buffer: bool,
    queued: VecDeque<QueuedPacket>,
    /// Never unschedule the reader; the FIFO absorbs everything
    infinite: bool,
}

impl BufferRing {
    pub fn new(buffer_count: usize, buffer_size: usize, infinite: bool) -> Self {
        Self {
            buffer_size,
            buffers: (0..buffer_count)
                .map(|_| Vec::with_capacity(buffer_size))
                .collect(),
            descs: vec![Vec::new(); buffer_count],
            staged: Vec::new(),
            in_use: vec![false; buffer_count],
            fill_index: 0,
            buffers_used: 0,
            waiting_on_buffer: false,
            queued: VecDeque::new(),
            infinite,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently held by the sink.
    pub fn buffers_used(&self) -> usize {
        self.buffers_used
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_on_buffer
    }

    /// True when every buffer is committed and the ring cannot advance.
    pub fn is_saturated(&self) -> bool {
        self.in_use[self.fill_index]
    }

    /// True when nothing is committed, staged, or parked in the FIFO.
    pub fn is_empty(&self) -> bool {
        self.buffers_used == 0 && self.queued.is_empty() && self.buffers[self.fill_index].is_empty()
    }

    /// Bytes and descriptors of a committed buffer.
    pub fn committed(&self, index: usize) -> (&[u8], &[PacketDesc]) {
        (&self.buffers[index], &self.descs[index])
    }

    /// Add one parsed packet.
    ///
    /// Packets arriving while the overflow FIFO is non-empty are appended
    /// to it: the FIFO drains strictly in order before new packets are
    /// accepted into the ring.
    pub fn push_packet(&mut self, data: &[u8]) -> StreamResult<Vec<RingAction>> {
        if data.len() > self.buffer_size {
            return Err(StreamError::AudioBufferTooSmall {
                packet_len: data.len(),
                buffer_size: self.buffer_size,
            });
        }

        if self.waiting_on_buffer || !self.queued.is_empty() {
            self.queued.push_back(QueuedPacket {
                data: data.to_vec(),
            });
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        if !self.try_stage(data) {
            actions.push(self.commit_pending());
            if self.in_use[self.fill_index] {
                // ring saturated mid-callback: park the packet
                self.waiting_on_buffer = true;
                self.queued.push_back(QueuedPacket {
                    data: data.to_vec(),
                });
                if !self.infinite {
                    actions.push(RingAction::UnscheduleReader);
                }
                return Ok(actions);
            }
            let staged = self.try_stage(data);
            debug_assert!(staged, "packet must fit an empty buffer");
        }
        self.check_invariants();
        Ok(actions)
    }

    /// Copy the packet into the pending buffer if there is room for both
    /// the bytes and one more descriptor.
    fn try_stage(&mut self, data: &[u8]) -> bool {
        let pending = &mut self.buffers[self.fill_index];
        if pending.len() + data.len() > self.buffer_size || self.staged.len() >= MAX_PACKET_DESCS {
            return false;
        }
        self.staged.push(PacketDesc {
            offset: pending.len(),
            len: data.len(),
        });
        pending.extend_from_slice(data);
        true
    }

    /// Commit the pending buffer and advance the fill cursor.
    fn commit_pending(&mut self) -> RingAction {
        debug_assert!(!self.buffers[self.fill_index].is_empty());
        let index = self.fill_index;
        self.in_use[index] = true;
        self.buffers_used += 1;
        self.descs[index] = std::mem::take(&mut self.staged);
        self.fill_index = (self.fill_index + 1) % self.buffers.len();
        trace!(
            index,
            used = self.buffers_used,
            "committed audio buffer"
        );
        RingAction::Enqueue { index }
    }

    /// Commit whatever is staged, even a partial buffer. Used at end of
    /// stream so trailing audio is not lost.
    pub fn flush_pending(&mut self) -> Option<RingAction> {
        if self.buffers[self.fill_index].is_empty() || self.in_use[self.fill_index] {
            return None;
        }
        let action = self.commit_pending();
        self.check_invariants();
        Some(action)
    }

    /// The sink is done with buffer `index`.
    ///
    /// Returns true when a drain should be posted to the control loop.
    pub fn mark_free(&mut self, index: usize) -> StreamResult<bool> {
        if index >= self.buffers.len() || !self.in_use[index] {
            return Err(StreamError::AudioQueueBufferMismatch);
        }
        self.in_use[index] = false;
        self.buffers[index].clear();
        self.descs[index].clear();
        self.buffers_used -= 1;
        self.check_invariants();
        Ok(self.waiting_on_buffer)
    }

    /// Move parked packets back into the ring until the FIFO empties or
    /// the ring saturates again.
    pub fn drain_queued(&mut self) -> StreamResult<DrainResult> {
        let mut actions = Vec::new();

        while let Some(data) = self.queued.front().map(|packet| packet.data.clone()) {
            if self.in_use[self.fill_index] {
                // still saturated, try again on the next free
                return Ok(DrainResult {
                    actions,
                    drained_all: false,
                });
            }
            if self.try_stage(&data) {
                self.queued.pop_front();
            } else {
                actions.push(self.commit_pending());
            }
        }

        self.waiting_on_buffer = false;
        self.check_invariants();
        Ok(DrainResult {
            actions,
            drained_all: true,
        })
    }

    /// Drop everything: committed buffers, staging, and the FIFO.
    pub fn clear(&mut self) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        for descs in &mut self.descs {
            descs.clear();
        }
        self.staged.clear();
        self.in_use.iter_mut().for_each(|b| *b = false);
        self.fill_index = 0;
        self.buffers_used = 0;
        self.waiting_on_buffer = false;
        self.queued.clear();
    }

    fn check_invariants(&self) {
        debug_assert_eq!(
            self.buffers_used,
            self.in_use.iter().filter(|&&b| b).count(),
            "buffers_used must agree with the in_use population"
        );
        debug_assert!(self.staged.len() <= MAX_PACKET_DESCS);
        debug_assert!(self.buffers[self.fill_index].len() <= self.buffer_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_free(ring: &mut BufferRing, index: usize) -> Vec<RingAction> {
        let wants_drain = ring.mark_free(index).unwrap();
        if wants_drain {
            ring.drain_queued().unwrap().actions
        } else {
            Vec::new()
        }
    }

    #[test]
    fn test_packets_pack_into_one_buffer() {
        let mut ring = BufferRing::new(4, 100, false);
        assert!(ring.push_packet(&[1u8; 40]).unwrap().is_empty());
        assert!(ring.push_packet(&[2u8; 40]).unwrap().is_empty());
        assert_eq!(ring.buffers_used(), 0);

        // third packet does not fit: first buffer commits
        let actions = ring.push_packet(&[3u8; 40]).unwrap();
        assert_eq!(actions, vec![RingAction::Enqueue { index: 0 }]);
        assert_eq!(ring.buffers_used(), 1);

        let (bytes, descs) = ring.committed(0);
        assert_eq!(bytes.len(), 80);
        assert_eq!(
            descs,
            &[
                PacketDesc { offset: 0, len: 40 },
                PacketDesc {
                    offset: 40,
                    len: 40
                }
            ]
        );
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut ring = BufferRing::new(4, 100, false);
        let err = ring.push_packet(&[0u8; 101]).unwrap_err();
        assert!(matches!(
            err,
            StreamError::AudioBufferTooSmall {
                packet_len: 101,
                buffer_size: 100
            }
        ));
    }

    #[test]
    fn test_saturation_unschedules_and_queues() {
        let mut ring = BufferRing::new(2, 10, false);
        // each packet fills a whole buffer
        assert!(ring.push_packet(&[1u8; 10]).unwrap().is_empty());
        let actions = ring.push_packet(&[2u8; 10]).unwrap();
        assert_eq!(actions, vec![RingAction::Enqueue { index: 0 }]);

        // committing buffer 1 leaves the ring with nowhere to go
        let actions = ring.push_packet(&[3u8; 10]).unwrap();
        assert_eq!(
            actions,
            vec![
                RingAction::Enqueue { index: 1 },
                RingAction::UnscheduleReader
            ]
        );
        assert!(ring.is_waiting());
        assert!(ring.is_saturated());
        assert_eq!(ring.queued_len(), 1);

        // further packets park in FIFO order without new actions
        assert!(ring.push_packet(&[4u8; 10]).unwrap().is_empty());
        assert_eq!(ring.queued_len(), 2);
    }

    #[test]
    fn test_infinite_buffering_never_unschedules() {
        let mut ring = BufferRing::new(2, 10, true);
        ring.push_packet(&[1u8; 10]).unwrap();
        ring.push_packet(&[2u8; 10]).unwrap();
        let actions = ring.push_packet(&[3u8; 10]).unwrap();
        assert_eq!(actions, vec![RingAction::Enqueue { index: 1 }]);
        assert!(ring.is_waiting());
    }

    #[test]
    fn test_drain_after_free_restores_order() {
        let mut ring = BufferRing::new(2, 10, false);
        ring.push_packet(&[1u8; 10]).unwrap();
        ring.push_packet(&[2u8; 10]).unwrap();
        ring.push_packet(&[3u8; 10]).unwrap(); // saturates, queues packet 3
        ring.push_packet(&[4u8; 10]).unwrap(); // queues packet 4

        // freeing buffer 0 lets the drain place packet 3 there
        let actions = drain_free(&mut ring, 0);
        // packet 3 fills buffer 0 completely; packet 4 forces its commit,
        // then saturates again
        assert_eq!(actions, vec![RingAction::Enqueue { index: 0 }]);
        assert!(ring.is_waiting());
        assert_eq!(ring.queued_len(), 1);

        let (bytes, _) = ring.committed(0);
        assert_eq!(bytes, &[3u8; 10]);

        // freeing buffer 1 drains the rest
        let actions = drain_free(&mut ring, 1);
        assert!(actions.is_empty()); // packet 4 staged, nothing committed yet
        assert!(!ring.is_waiting());
        assert_eq!(ring.queued_len(), 0);

        // flush commits the trailing partial buffer
        let action = ring.flush_pending().unwrap();
        assert_eq!(action, RingAction::Enqueue { index: 1 });
        let (bytes, _) = ring.committed(1);
        assert_eq!(bytes, &[4u8; 10]);
    }

    #[test]
    fn test_mark_free_validates_index() {
        let mut ring = BufferRing::new(2, 10, false);
        assert!(matches!(
            ring.mark_free(0),
            Err(StreamError::AudioQueueBufferMismatch)
        ));
        assert!(matches!(
            ring.mark_free(5),
            Err(StreamError::AudioQueueBufferMismatch)
        ));
    }

    #[test]
    fn test_flush_pending_partial_buffer() {
        let mut ring = BufferRing::new(4, 100, false);
        ring.push_packet(&[7u8; 30]).unwrap();
        let action = ring.flush_pending().unwrap();
        assert_eq!(action, RingAction::Enqueue { index: 0 });
        assert_eq!(ring.buffers_used(), 1);
        assert!(ring.flush_pending().is_none());
    }

    #[test]
    fn test_descriptor_limit_forces_commit() {
        // buffer large enough that only the descriptor limit can trigger
        let mut ring = BufferRing::new(2, MAX_PACKET_DESCS * 2, false);
        for _ in 0..MAX_PACKET_DESCS {
            assert!(ring.push_packet(&[0u8; 1]).unwrap().is_empty());
        }
        let actions = ring.push_packet(&[0u8; 1]).unwrap();
        assert_eq!(actions, vec![RingAction::Enqueue { index: 0 }]);
        let (_, descs) = ring.committed(0);
        assert_eq!(descs.len(), MAX_PACKET_DESCS);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut ring = BufferRing::new(2, 10, false);
        ring.push_packet(&[1u8; 10]).unwrap();
        ring.push_packet(&[2u8; 10]).unwrap();
        ring.push_packet(&[3u8; 10]).unwrap();
        assert!(!ring.is_empty());

        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.buffers_used(), 0);
        assert_eq!(ring.queued_len(), 0);
        assert!(!ring.is_waiting());
    }

    #[test]
    fn test_bytes_preserved_in_order_across_backpressure() {
        // total ordering property: everything committed, in order
        let mut ring = BufferRing::new(2, 8, false);
        let packets: Vec<Vec<u8>> = (0u8..12).map(|i| vec![i; 4]).collect();

        let mut committed = Vec::new();
        let mut next_free: VecDeque<usize> = VecDeque::new();
        for packet in &packets {
            for action in ring.push_packet(packet).unwrap() {
                if let RingAction::Enqueue { index } = action {
                    committed.extend_from_slice(ring.committed(index).0);
                    next_free.push_back(index);
                }
            }
            // free one outstanding buffer per push, like a fast sink
            if let Some(index) = next_free.pop_front() {
                for action in drain_free(&mut ring, index) {
                    if let RingAction::Enqueue { index } = action {
                        committed.extend_from_slice(ring.committed(index).0);
                        next_free.push_back(index);
                    }
                }
            }
        }
        while let Some(index) = next_free.pop_front() {
            for action in drain_free(&mut ring, index) {
                if let RingAction::Enqueue { index } = action {
                    committed.extend_from_slice(ring.committed(index).0);
                    next_free.push_back(index);
                }
            }
        }
        if let Some(RingAction::Enqueue { index }) = ring.flush_pending() {
            committed.extend_from_slice(ring.committed(index).0);
        }

        let expected: Vec<u8> = packets.concat();
        assert_eq!(committed, expected);
    }
}
