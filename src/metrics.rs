//! Lock-free metrics registry with Prometheus text rendering
//!
//! Counters and histogram buckets are plain atomics; a render is a
//! best-effort snapshot, not a consistent cut. The registry is a lazy
//! process singleton reached through [`global_metrics`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;

const PREFIX: &str = "wirestorm";

/// Cumulative histogram with fixed bucket bounds
pub struct Histogram {
    name: &'static str,
    bounds: &'static [u64],
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(name: &'static str, bounds: &'static [u64]) -> Self {
        Self {
            name,
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# TYPE {PREFIX}_{} histogram", self.name);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{PREFIX}_{}_bucket{{le=\"{bound}\"}} {}",
                self.name,
                bucket.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(
            out,
            "{PREFIX}_{}_bucket{{le=\"+Inf\"}} {}",
            self.name,
            self.count.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "{PREFIX}_{}_sum {}", self.name, self.sum.load(Ordering::Relaxed));
        let _ = writeln!(out, "{PREFIX}_{}_count {}", self.name, self.count.load(Ordering::Relaxed));
    }
}

/// Process-wide counters, gauges and histograms
pub struct MetricsRegistry {
    pub active_sessions: AtomicI64,
    pub bytes_upstream_total: AtomicU64,
    pub bytes_downstream_total: AtomicU64,
    pub packets_dropped_total: AtomicU64,
    pub packets_delayed_total: AtomicU64,
    pub stall_events_total: AtomicU64,
    pub half_close_events_total: AtomicU64,
    pub connect_failures_total: AtomicU64,

    pub latency_injected_ms: Histogram,
    pub session_lifetime_seconds: Histogram,
    pub buffer_occupancy_bytes: Histogram,
}

impl MetricsRegistry {
    fn new() -> Self {
        Self {
            active_sessions: AtomicI64::new(0),
            bytes_upstream_total: AtomicU64::new(0),
            bytes_downstream_total: AtomicU64::new(0),
            packets_dropped_total: AtomicU64::new(0),
            packets_delayed_total: AtomicU64::new(0),
            stall_events_total: AtomicU64::new(0),
            half_close_events_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            latency_injected_ms: Histogram::new(
                "latency_injected_ms",
                &[10, 50, 100, 500, 1000, 5000, 30000],
            ),
            session_lifetime_seconds: Histogram::new(
                "session_lifetime_seconds",
                &[1, 5, 30, 60, 300, 3600],
            ),
            buffer_occupancy_bytes: Histogram::new(
                "buffer_occupancy_bytes",
                &[1024, 8192, 32768, 65536, 262144, 1048576],
            ),
        }
    }

    /// Count forwarded bytes in the given direction
    pub fn add_bytes(&self, dir: crate::types::Direction, n: usize) {
        match dir {
            crate::types::Direction::ClientToServer => {
                self.bytes_upstream_total.fetch_add(n as u64, Ordering::Relaxed)
            }
            crate::types::Direction::ServerToClient => {
                self.bytes_downstream_total.fetch_add(n as u64, Ordering::Relaxed)
            }
        };
    }

    /// Prometheus text exposition
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        let _ = writeln!(out, "# HELP {PREFIX}_active_sessions Current number of active sessions");
        let _ = writeln!(out, "# TYPE {PREFIX}_active_sessions gauge");
        let _ = writeln!(
            out,
            "{PREFIX}_active_sessions {}\n",
            self.active_sessions.load(Ordering::Relaxed)
        );

        let counters: &[(&str, &str, &AtomicU64)] = &[
            ("bytes_upstream_total", "Total bytes forwarded upstream", &self.bytes_upstream_total),
            ("bytes_downstream_total", "Total bytes forwarded downstream", &self.bytes_downstream_total),
            ("packets_dropped_total", "Total packets dropped", &self.packets_dropped_total),
            ("packets_delayed_total", "Total packets delayed", &self.packets_delayed_total),
            ("stall_events_total", "Total stall events", &self.stall_events_total),
            ("half_close_events_total", "Total half-close events", &self.half_close_events_total),
            ("connect_failures_total", "Total upstream connect failures", &self.connect_failures_total),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
            let _ = writeln!(out, "# TYPE {PREFIX}_{name} counter");
            let _ = writeln!(out, "{PREFIX}_{name} {}\n", value.load(Ordering::Relaxed));
        }

        self.latency_injected_ms.render(&mut out);
        self.session_lifetime_seconds.render(&mut out);
        self.buffer_occupancy_bytes.render(&mut out);
        out
    }
}

/// Lazy process singleton
pub fn global_metrics() -> &'static MetricsRegistry {
    static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();
    REGISTRY.get_or_init(MetricsRegistry::new)
}
