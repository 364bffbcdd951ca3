//! # Packet Queue
//!
//! Per-track FIFO of compressed packets waiting for decode. The demux gate
//! pushes, the owning track pops. Unbounded: a track throttles itself by only
//! pulling from the demuxer when its own queue is empty.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::backend::Packet;

pub struct PacketQueue {
    packets: Mutex<VecDeque<Packet>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            packets: Mutex::new(VecDeque::with_capacity(32)),
        }
    }

    pub fn push(&self, packet: Packet) {
        self.packets.lock().push_back(packet);
    }

    /// Oldest packet, or `None` when empty.
    pub fn pop(&self) -> Option<Packet> {
        self.packets.lock().pop_front()
    }

    /// Drop every queued packet. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut packets = self.packets.lock();
        let count = packets.len();
        packets.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
