//! Connection latency tracking over ping/pong packets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::packet::{unix_millis, PacketPing, PacketPong};

/// Correlates outgoing pings with incoming pongs and keeps latency
/// statistics for the connection.
///
/// The ping task writes the pending map and the receive task drains it;
/// outstanding pings never block either side. All counters reset on
/// reconnect.
pub struct LatencyMonitor {
    pending: Mutex<HashMap<u32, Instant>>,
    sequence: AtomicU32,
    last_latency_ms: AtomicI64,
    average_latency_ms: AtomicI64,
    pings_sent: AtomicU32,
    pongs_received: AtomicU32,
}

impl LatencyMonitor {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            sequence: AtomicU32::new(0),
            last_latency_ms: AtomicI64::new(-1),
            average_latency_ms: AtomicI64::new(-1),
            pings_sent: AtomicU32::new(0),
            pongs_received: AtomicU32::new(0),
        }
    }

    /// Assigns the next sequence id and records the departure time.
    ///
    /// The caller sends the returned packet; on a send failure it must
    /// call [`LatencyMonitor::abort_ping`] so the probe does not count as
    /// loss.
    pub fn next_ping(&self) -> PacketPing {
        let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending
            .lock()
            .expect("pending ping map poisoned")
            .insert(sequence_id, Instant::now());
        self.pings_sent.fetch_add(1, Ordering::SeqCst);
        PacketPing {
            timestamp: unix_millis(),
            sequence_id,
        }
    }

    /// Forgets a ping whose send failed.
    pub fn abort_ping(&self, sequence_id: u32) {
        self.pending
            .lock()
            .expect("pending ping map poisoned")
            .remove(&sequence_id);
        self.pings_sent.fetch_sub(1, Ordering::SeqCst);
    }

    /// Correlates a pong with its ping and updates the latency estimate.
    ///
    /// Unknown or duplicate sequence ids are dropped silently.
    pub fn record_pong(&self, pong: &PacketPong) {
        let sent_at = self
            .pending
            .lock()
            .expect("pending ping map poisoned")
            .remove(&pong.sequence_id);
        let Some(sent_at) = sent_at else {
            return;
        };

        let latency_ms = sent_at.elapsed().as_millis() as i64;
        self.last_latency_ms.store(latency_ms, Ordering::SeqCst);
        self.pongs_received.fetch_add(1, Ordering::SeqCst);

        // Exponential moving average with weight 1/8 for the new sample;
        // the first sample seeds the average.
        let average = self.average_latency_ms.load(Ordering::SeqCst);
        let updated = if average < 0 {
            latency_ms
        } else {
            (average * 7 + latency_ms) / 8
        };
        self.average_latency_ms.store(updated, Ordering::SeqCst);
    }

    /// The most recent round-trip time, if any pong arrived yet.
    pub fn last_latency(&self) -> Option<Duration> {
        duration_from(self.last_latency_ms.load(Ordering::SeqCst))
    }

    /// The smoothed round-trip time, if any pong arrived yet.
    pub fn average_latency(&self) -> Option<Duration> {
        duration_from(self.average_latency_ms.load(Ordering::SeqCst))
    }

    pub fn pings_sent(&self) -> u32 {
        self.pings_sent.load(Ordering::SeqCst)
    }

    pub fn pongs_received(&self) -> u32 {
        self.pongs_received.load(Ordering::SeqCst)
    }

    /// Fraction of pings without a matching pong, in `0.0..=1.0`.
    pub fn packet_loss(&self) -> f64 {
        let sent = self.pings_sent() as f64;
        if sent == 0.0 {
            return 0.0;
        }
        (sent - self.pongs_received() as f64) / sent
    }

    /// Clears all statistics and outstanding pings.
    pub fn reset(&self) {
        self.pending
            .lock()
            .expect("pending ping map poisoned")
            .clear();
        self.sequence.store(0, Ordering::SeqCst);
        self.last_latency_ms.store(-1, Ordering::SeqCst);
        self.average_latency_ms.store(-1, Ordering::SeqCst);
        self.pings_sent.store(0, Ordering::SeqCst);
        self.pongs_received.store(0, Ordering::SeqCst);
    }
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_from(millis: i64) -> Option<Duration> {
    (millis >= 0).then(|| Duration::from_millis(millis as u64))
}
