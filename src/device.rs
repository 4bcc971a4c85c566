//! The loopback virtio-net device personality: packets pulled off the
//! transmit ring are handed back out on the receive ring, in FIFO order.

use std::collections::VecDeque;

use crate::pcap::PacketSink;

/// Upper bound on packets buffered between a transmit kick and the matching
/// receive kick. Bounds memory if the front-end kicks TX far more often than
/// RX; excess packets are dropped oldest-first.
const MAX_QUEUED_PACKETS: usize = 256;

/// Loopback personality: every transmitted frame is queued for the next
/// receive poll of the same session. No MAC/ARP/ICMP handling, no bridging —
/// echo, and nothing else.
pub struct LoopbackDevice {
    pending: VecDeque<Vec<u8>>,
    sink: Option<PacketSink>,
}

impl LoopbackDevice {
    pub fn new(sink: Option<PacketSink>) -> Self {
        Self {
            pending: VecDeque::new(),
            sink,
        }
    }

    /// Queues a packet pulled off the transmit ring to be echoed back.
    pub fn enqueue(&mut self, packet: Vec<u8>) {
        if let Some(sink) = self.sink.as_mut() {
            sink.record(&packet);
        }

        if self.pending.len() >= MAX_QUEUED_PACKETS {
            tracing::warn!("loopback queue full, dropping oldest packet");
            self.pending.pop_front();
        }
        self.pending.push_back(packet);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn dequeue(&mut self) -> Option<Vec<u8>> {
        let packet = self.pending.pop_front();
        if let (Some(sink), Some(packet)) = (self.sink.as_mut(), packet.as_ref()) {
            sink.record(packet);
        }
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_in_fifo_order() {
        let mut dev = LoopbackDevice::new(None);
        dev.enqueue(vec![1]);
        dev.enqueue(vec![2]);
        assert_eq!(dev.dequeue(), Some(vec![1]));
        assert_eq!(dev.dequeue(), Some(vec![2]));
        assert_eq!(dev.dequeue(), None);
    }

    #[test]
    fn drops_oldest_when_full() {
        let mut dev = LoopbackDevice::new(None);
        for i in 0..MAX_QUEUED_PACKETS + 1 {
            dev.enqueue(vec![i as u8]);
        }
        assert_eq!(dev.dequeue(), Some(vec![1]));
    }
}
