//! Shared throughput counters, read by the acceptor thread for periodic
//! logging and updated by each session's reactor thread.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Debug, Default)]
struct Counters {
    tx_packets: u64,
    tx_bytes: u64,
    rx_packets: u64,
    rx_bytes: u64,
}

/// A cheap-to-clone handle to one session's traffic counters.
#[derive(Clone)]
pub struct Stats {
    inner: Arc<Mutex<Counters>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Counters::default())),
        }
    }
}

impl Stats {
    pub fn record_tx(&self, bytes: usize) {
        let mut c = self.inner.lock();
        c.tx_packets += 1;
        c.tx_bytes += bytes as u64;
    }

    pub fn record_rx(&self, bytes: usize) {
        let mut c = self.inner.lock();
        c.rx_packets += 1;
        c.rx_bytes += bytes as u64;
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        let c = self.inner.lock();
        (c.tx_packets, c.tx_bytes, c.rx_packets, c.rx_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_across_clones() {
        let stats = Stats::default();
        let other = stats.clone();
        stats.record_tx(10);
        other.record_tx(5);
        stats.record_rx(1);

        let (tx_packets, tx_bytes, rx_packets, rx_bytes) = stats.snapshot();
        assert_eq!(tx_packets, 2);
        assert_eq!(tx_bytes, 15);
        assert_eq!(rx_packets, 1);
        assert_eq!(rx_bytes, 1);
    }
}
