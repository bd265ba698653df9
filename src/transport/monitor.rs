//! Rolling latency and throughput statistics.
//!
//! The monitor is a passive observer: the connection manager reports sends,
//! acks, receipts and byte counts, and [`PerformanceMonitor::snapshot`]
//! aggregates them on demand. Samples live in a bounded window (the last
//! [`SAMPLE_WINDOW_CAPACITY`] samples or the last [`SAMPLE_WINDOW_SPAN`],
//! whichever is smaller).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::MessageId;
use crate::core::constants::{
    MAX_PENDING_ACKS, SAMPLE_WINDOW_CAPACITY, SAMPLE_WINDOW_SPAN, THROUGHPUT_WINDOW_CAPACITY,
};

/// One latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    /// Send to ack round trip.
    pub latency: Duration,
    /// When the ack arrived.
    pub recorded_at: Instant,
}

/// Aggregated view of a [`PerformanceMonitor`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MonitorSnapshot {
    /// Mean latency over the window, 0 without samples.
    pub avg_latency_ms: f64,
    /// Smallest latency in the window.
    pub min_latency_ms: f64,
    /// Largest latency in the window.
    pub max_latency_ms: f64,
    /// Messages sent plus received per second over the window.
    pub throughput_msgs_per_sec: f64,
    /// Bytes written since creation.
    pub bytes_sent: u64,
    /// Bytes read since creation.
    pub bytes_received: u64,
    /// Messages sent since creation.
    pub messages_sent: u64,
    /// Messages received since creation.
    pub messages_received: u64,
    /// Open transport streams.
    pub active_streams: u32,
    /// Samples currently in the window.
    pub samples: usize,
}

impl MonitorSnapshot {
    /// Bytes sent plus bytes received.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    samples: VecDeque<LatencySample>,
    latency_sum: Duration,
    pending: HashMap<MessageId, Instant>,
    pending_order: VecDeque<MessageId>,
    events: VecDeque<Instant>,
    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
    active_streams: u32,
}

impl Window {
    fn new(started: Instant) -> Self {
        Self {
            started,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW_CAPACITY),
            latency_sum: Duration::ZERO,
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            events: VecDeque::new(),
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            active_streams: 0,
        }
    }

    fn push_sample(&mut self, sample: LatencySample) {
        if self.samples.len() == SAMPLE_WINDOW_CAPACITY {
            self.pop_sample();
        }
        self.latency_sum += sample.latency;
        self.samples.push_back(sample);
    }

    fn pop_sample(&mut self) {
        if let Some(old) = self.samples.pop_front() {
            self.latency_sum = self.latency_sum.saturating_sub(old.latency);
        }
    }

    fn push_event(&mut self, at: Instant) {
        if self.events.len() == THROUGHPUT_WINDOW_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(at);
    }

    fn expire(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(SAMPLE_WINDOW_SPAN) else {
            return;
        };
        while self.samples.front().is_some_and(|s| s.recorded_at < cutoff) {
            self.pop_sample();
        }
        while self.events.front().is_some_and(|at| *at < cutoff) {
            self.events.pop_front();
        }
    }

    fn track_pending(&mut self, id: MessageId, at: Instant) {
        while self.pending.len() >= MAX_PENDING_ACKS {
            match self.pending_order.pop_front() {
                Some(old) => {
                    self.pending.remove(&old);
                }
                None => break,
            }
        }
        // Acked ids linger in `pending_order`; compact when it doubles.
        if self.pending_order.len() >= MAX_PENDING_ACKS * 2 {
            let pending = &self.pending;
            self.pending_order.retain(|id| pending.contains_key(id));
        }
        self.pending_order.push_back(id.clone());
        self.pending.insert(id, at);
    }
}

/// Passive latency/throughput observer for one connection.
#[derive(Debug)]
pub struct PerformanceMonitor {
    window: Mutex<Window>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    /// Empty monitor starting now.
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window::new(Instant::now())),
        }
    }

    /// Note that `id` was sent at `at`.
    pub fn record_send(&self, id: MessageId, at: Instant) {
        let mut w = self.window.lock();
        w.messages_sent += 1;
        w.push_event(at);
        w.track_pending(id, at);
    }

    /// Correlate an ack with its send. Returns the measured latency, or
    /// `None` for an unknown or already acknowledged id.
    pub fn record_ack(&self, id: &MessageId, at: Instant) -> Option<Duration> {
        let mut w = self.window.lock();
        let sent = w.pending.remove(id)?;
        let latency = at.saturating_duration_since(sent);
        w.push_sample(LatencySample {
            latency,
            recorded_at: at,
        });
        Some(latency)
    }

    /// Note an inbound message.
    pub fn record_receive(&self, at: Instant) {
        let mut w = self.window.lock();
        w.messages_received += 1;
        w.push_event(at);
    }

    /// Count bytes written to the link.
    pub fn add_bytes_sent(&self, n: usize) {
        let mut w = self.window.lock();
        w.bytes_sent = w.bytes_sent.saturating_add(n as u64);
    }

    /// Count bytes read from the link.
    pub fn add_bytes_received(&self, n: usize) {
        let mut w = self.window.lock();
        w.bytes_received = w.bytes_received.saturating_add(n as u64);
    }

    /// A transport stream was opened.
    pub fn stream_opened(&self) {
        let mut w = self.window.lock();
        w.active_streams = w.active_streams.saturating_add(1);
    }

    /// A transport stream was closed.
    pub fn stream_closed(&self) {
        let mut w = self.window.lock();
        w.active_streams = w.active_streams.saturating_sub(1);
    }

    /// Forget unacknowledged sends (their link is gone).
    pub fn reset_pending(&self) {
        let mut w = self.window.lock();
        w.pending.clear();
        w.pending_order.clear();
    }

    /// Sends still waiting for an ack.
    pub fn pending_acks(&self) -> usize {
        self.window.lock().pending.len()
    }

    /// Aggregate the window as of now.
    pub fn snapshot(&self) -> MonitorSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Aggregate the window as of `now`. Never fails; zeros without data.
    pub fn snapshot_at(&self, now: Instant) -> MonitorSnapshot {
        let mut w = self.window.lock();
        w.expire(now);

        let samples = w.samples.len();
        let (avg, min, max) = if samples == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let avg = w.latency_sum.as_secs_f64() * 1000.0 / samples as f64;
            let (min, max) = w.samples.iter().fold((Duration::MAX, Duration::ZERO), |(lo, hi), s| {
                (lo.min(s.latency), hi.max(s.latency))
            });
            (avg, millis(min), millis(max))
        };

        let span = now
            .saturating_duration_since(w.started)
            .min(SAMPLE_WINDOW_SPAN)
            .as_secs_f64()
            .max(1.0);
        let throughput = w.events.len() as f64 / span;

        MonitorSnapshot {
            avg_latency_ms: avg,
            min_latency_ms: min,
            max_latency_ms: max,
            throughput_msgs_per_sec: throughput,
            bytes_sent: w.bytes_sent,
            bytes_received: w.bytes_received,
            messages_sent: w.messages_sent,
            messages_received: w.messages_received,
            active_streams: w.active_streams,
            samples,
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> MessageId {
        MessageId::new(format!("m-{n}"))
    }

    #[test]
    fn test_empty_snapshot_is_zero() {
        let monitor = PerformanceMonitor::new();
        let snap = monitor.snapshot();
        assert_eq!(snap.avg_latency_ms, 0.0);
        assert_eq!(snap.throughput_msgs_per_sec, 0.0);
        assert_eq!(snap.bytes_transferred(), 0);
        assert_eq!(snap.samples, 0);
    }

    #[test]
    fn test_ack_latency() {
        let monitor = PerformanceMonitor::new();
        let t0 = Instant::now();
        monitor.record_send(id(1), t0);
        monitor.record_send(id(2), t0);

        assert_eq!(
            monitor.record_ack(&id(1), t0 + Duration::from_millis(10)),
            Some(Duration::from_millis(10))
        );
        assert_eq!(
            monitor.record_ack(&id(2), t0 + Duration::from_millis(30)),
            Some(Duration::from_millis(30))
        );
        assert_eq!(monitor.record_ack(&id(2), t0 + Duration::from_millis(40)), None);

        let snap = monitor.snapshot_at(t0 + Duration::from_millis(50));
        assert!((snap.avg_latency_ms - 20.0).abs() < 1e-6);
        assert!((snap.min_latency_ms - 10.0).abs() < 1e-6);
        assert!((snap.max_latency_ms - 30.0).abs() < 1e-6);
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(monitor.pending_acks(), 0);
    }

    #[test]
    fn test_window_is_bounded_by_count() {
        let monitor = PerformanceMonitor::new();
        let t0 = Instant::now();
        for n in 0..(SAMPLE_WINDOW_CAPACITY as u32 + 10) {
            monitor.record_send(id(n), t0);
            monitor.record_ack(&id(n), t0 + Duration::from_millis(u64::from(n)));
        }
        let snap = monitor.snapshot_at(t0 + Duration::from_secs(2));
        assert_eq!(snap.samples, SAMPLE_WINDOW_CAPACITY);
        assert!((snap.min_latency_ms - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_is_bounded_by_age() {
        let monitor = PerformanceMonitor::new();
        let t0 = Instant::now();
        monitor.record_send(id(1), t0);
        monitor.record_ack(&id(1), t0 + Duration::from_millis(5));

        let later = t0 + SAMPLE_WINDOW_SPAN + Duration::from_secs(1);
        let snap = monitor.snapshot_at(later);
        assert_eq!(snap.samples, 0);
        assert_eq!(snap.avg_latency_ms, 0.0);
        assert_eq!(snap.throughput_msgs_per_sec, 0.0);
        assert_eq!(snap.messages_sent, 1);
    }

    #[test]
    fn test_pending_is_bounded() {
        let monitor = PerformanceMonitor::new();
        let t0 = Instant::now();
        for n in 0..(MAX_PENDING_ACKS as u32 + 5) {
            monitor.record_send(id(n), t0);
        }
        assert_eq!(monitor.pending_acks(), MAX_PENDING_ACKS);
        assert_eq!(monitor.record_ack(&id(0), t0), None);

        monitor.reset_pending();
        assert_eq!(monitor.pending_acks(), 0);
    }

    #[test]
    fn test_counters_and_streams() {
        let monitor = PerformanceMonitor::new();
        monitor.add_bytes_sent(100);
        monitor.add_bytes_received(50);
        monitor.record_receive(Instant::now());
        monitor.stream_opened();
        monitor.stream_closed();
        monitor.stream_closed();

        let snap = monitor.snapshot();
        assert_eq!(snap.bytes_transferred(), 150);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.active_streams, 0);
        assert!(snap.throughput_msgs_per_sec > 0.0);
    }
}
