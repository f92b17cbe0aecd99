//! Counters for connections, messages and handler latency.
//!
//! The core only ever increments through [`MetricsSink`]; nothing in the
//! server reads the values back. [`Metrics`] is the default in-process sink.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Destination for server counters.
pub trait MetricsSink: Send + Sync {
    fn connection_opened(&self);
    fn connection_closed(&self);
    fn message_received(&self);
    fn message_sent(&self);
    fn error(&self);
    fn handling_time(&self, elapsed: Duration);
}

/// Lock-free counter set.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    connections_current: AtomicU64,
    connections_closed: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    handling_nanos: AtomicU64,
    handling_count: AtomicU64,
    errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_current: self.connections_current.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            handling_time: Duration::from_nanos(self.handling_nanos.load(Ordering::Relaxed)),
            handling_count: self.handling_count.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for Metrics {
    fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_current.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        // Saturate at zero
        let _ = self
            .connections_current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn handling_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.handling_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.handling_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Values captured by [`Metrics::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_current: u64,
    pub connections_closed: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub handling_time: Duration,
    pub handling_count: u64,
    pub errors: u64,
}

impl MetricsSnapshot {
    /// Mean handler latency, zero when nothing has been handled.
    pub fn average_handling_time(&self) -> Duration {
        if self.handling_count == 0 {
            return Duration::ZERO;
        }
        let count = u32::try_from(self.handling_count).unwrap_or(u32::MAX);
        self.handling_time / count
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connections:")?;
        writeln!(f, "  total:     {}", self.connections_total)?;
        writeln!(f, "  current:   {}", self.connections_current)?;
        writeln!(f, "  closed:    {}", self.connections_closed)?;
        writeln!(f, "Messages:")?;
        writeln!(f, "  received:  {}", self.messages_received)?;
        writeln!(f, "  sent:      {}", self.messages_sent)?;
        writeln!(f, "Handling:")?;
        writeln!(f, "  total:     {:?}", self.handling_time)?;
        writeln!(f, "  average:   {:?}", self.average_handling_time())?;
        writeln!(f, "Errors:")?;
        write!(f, "  total:     {}", self.errors)
    }
}
