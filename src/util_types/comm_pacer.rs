use std::time::Duration;
use std::time::Instant;

/// Estimated time, in milliseconds, to push `num_bytes` through a link of
/// `bandwidth_mbps`.
pub fn trans_time_millis(num_bytes: usize, bandwidth_mbps: f64) -> f64 {
    num_bytes as f64 * 8.0 / bandwidth_mbps / 1000.0
}

/// Decides when a background thread may start its next early send and how
/// long it may sleep in between.
pub trait CommPacer: Send + std::fmt::Debug {
    /// True when no previous send is still estimated to be on the wire.
    fn allow_send(&self) -> bool;

    /// Record a send of `num_bytes`.
    fn on_sent(&mut self, num_bytes: usize);

    /// Next idle wait: the default interval, shortened so the thread wakes up
    /// when the current send window closes.
    fn idle_millis(&self, default_idle: u64) -> u64;
}

/// Paces sends by the transmission-time estimate of the previous send.
#[derive(Debug, Clone)]
pub struct BandwidthPacer {
    bandwidth_mbps: f64,
    busy_until: Option<Instant>,
}

impl BandwidthPacer {
    pub fn new(bandwidth_mbps: f64) -> Self {
        Self {
            bandwidth_mbps,
            busy_until: None,
        }
    }

    fn remaining(&self) -> Duration {
        self.busy_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }
}

impl CommPacer for BandwidthPacer {
    fn allow_send(&self) -> bool {
        self.remaining().is_zero()
    }

    fn on_sent(&mut self, num_bytes: usize) {
        let millis = trans_time_millis(num_bytes, self.bandwidth_mbps);
        let base = match self.busy_until {
            Some(until) if until > Instant::now() => until,
            _ => Instant::now(),
        };
        let window = Duration::try_from_secs_f64(millis / 1000.0).unwrap_or_default();
        self.busy_until = Some(base + window);
    }

    fn idle_millis(&self, default_idle: u64) -> u64 {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return default_idle;
        }
        let remaining_millis = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
        remaining_millis.clamp(1, default_idle.max(1))
    }
}

/// Never defers a send. Used by the pull and plain push models.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacer;

impl CommPacer for NoPacer {
    fn allow_send(&self) -> bool {
        true
    }

    fn on_sent(&mut self, _num_bytes: usize) {}

    fn idle_millis(&self, default_idle: u64) -> u64 {
        default_idle
    }
}
