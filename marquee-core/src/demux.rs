//! Demux gate: the one place that reads from the container.
//!
//! Both the audio pull path and the video decode thread call
//! [`DemuxGate::read_next_packet`] when their queue runs dry. The container's
//! read position is not thread-safe, so every read, seek and the end flag sit
//! behind a single lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{Container, StreamInfo};
use crate::error::{MediaError, Result};
use crate::packet_queue::PacketQueue;

struct GateState {
    container: Option<Box<dyn Container>>,
    at_end: bool,
    packets_read: u64,
    packets_discarded: u64,
}

pub struct DemuxGate {
    state: Mutex<GateState>,
    routes: Vec<(u32, Arc<PacketQueue>)>,
    streams: Vec<StreamInfo>,
    duration: Option<Duration>,
}

impl DemuxGate {
    pub fn new(container: Box<dyn Container>) -> Self {
        let streams = container.streams().to_vec();
        let duration = container.duration();
        Self {
            state: Mutex::new(GateState {
                container: Some(container),
                at_end: false,
                packets_read: 0,
                packets_discarded: 0,
            }),
            routes: Vec::new(),
            streams,
            duration,
        }
    }

    /// Route packets of `stream_id` into `queue`. Must happen before the gate is shared.
    pub fn register(&mut self, stream_id: u32, queue: Arc<PacketQueue>) {
        self.routes.retain(|(id, _)| *id != stream_id);
        self.routes.push((stream_id, queue));
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Read one packet and route it. Returns `false` once the container is
    /// exhausted (or closed); packets of unrouted streams are dropped but
    /// still count as a successful read.
    pub fn read_next_packet(&self) -> bool {
        let mut state = self.state.lock();
        if state.at_end {
            return false;
        }
        let Some(container) = state.container.as_mut() else {
            state.at_end = true;
            return false;
        };

        match container.read_packet() {
            Ok(Some(packet)) => {
                state.packets_read += 1;
                match self.routes.iter().find(|(id, _)| *id == packet.stream_id) {
                    Some((_, queue)) => queue.push(packet),
                    None => state.packets_discarded += 1,
                }
                true
            }
            Ok(None) => {
                tracing::debug!(
                    "End of container after {} packets ({} discarded)",
                    state.packets_read,
                    state.packets_discarded
                );
                state.at_end = true;
                false
            }
            Err(e) => {
                // The read position can no longer be trusted.
                tracing::warn!("Container read error, treating as end: {}", e);
                state.at_end = true;
                false
            }
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.state.lock().at_end
    }

    /// Coarse reposition. Clears the end flag and every routed queue.
    pub fn seek(&self, position: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let container = state
            .container
            .as_mut()
            .ok_or_else(|| MediaError::resource("Seek on a closed container"))?;
        container.seek(position)?;
        state.at_end = false;
        for (_, queue) in &self.routes {
            queue.clear();
        }
        tracing::debug!("Seeked to {:?}", position);
        Ok(())
    }

    pub fn metadata(&self, tag: &str) -> Option<String> {
        self.state.lock().container.as_ref().and_then(|c| c.metadata(tag))
    }

    /// Release the container. Later reads report end of container.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.container = None;
        state.at_end = true;
        for (_, queue) in &self.routes {
            queue.clear();
        }
    }

    /// (packets read, packets discarded)
    pub fn stats(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.packets_read, state.packets_discarded)
    }
}
