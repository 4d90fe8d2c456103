//! Memory-pressure policy, sources, and the polling monitor.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, warn};

/// Default interval between memory samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Thresholds and targets applied when the system reports memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressurePolicy {
    /// System memory utilisation (percent) at which the budget shrinks.
    pub high_percent: u8,
    /// Utilisation at which the cache is drained down to `floor_bytes`.
    pub emergency_percent: u8,
    /// Fraction of the configured budget kept under high pressure.
    pub shrink_factor: f32,
    pub floor_bytes: usize,
}

impl Default for PressurePolicy {
    fn default() -> Self {
        Self { high_percent: 85, emergency_percent: 95, shrink_factor: 0.5, floor_bytes: 16 << 20 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PressureLevel {
    Normal,
    High,
    Emergency,
}

impl PressurePolicy {
    pub fn level(&self, percent: u8) -> PressureLevel {
        if percent >= self.emergency_percent {
            PressureLevel::Emergency
        } else if percent >= self.high_percent {
            PressureLevel::High
        } else {
            PressureLevel::Normal
        }
    }

    /// Budget the cache should hold at `level`, given its configured budget.
    pub fn budget_for(&self, level: PressureLevel, base: usize) -> usize {
        match level {
            PressureLevel::Normal => base,
            PressureLevel::High => {
                let shrunk = (base as f64 * self.shrink_factor.clamp(0.0, 1.0) as f64) as usize;
                shrunk.max(self.floor_bytes).min(base)
            }
            PressureLevel::Emergency => self.floor_bytes.min(base),
        }
    }
}

/// Result of feeding a pressure sample to the cache.
///
/// `Unrelieved` is advisory: pinned entries kept resident size above the target. Callers may
/// pause insertions or warn the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PressureOutcome {
    Normal { budget_bytes: usize },
    Relieved { level: PressureLevel, budget_bytes: usize, freed_bytes: usize },
    Unrelieved { level: PressureLevel, resident_bytes: usize, target_bytes: usize, pinned_bytes: usize },
}

/// Reports system memory utilisation as a percentage.
pub trait PressureSource: Send {
    fn sample(&mut self) -> Option<u8>;
}

/// Samples physical memory through `sysinfo`.
#[derive(Debug)]
pub struct SystemMemory {
    system: System,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self { system: System::new() }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PressureSource for SystemMemory {
    fn sample(&mut self) -> Option<u8> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        let used = self.system.used_memory().min(total);
        Some((used.saturating_mul(100) / total) as u8)
    }
}

/// Background thread polling a [`PressureSource`] and forwarding samples to a sink.
///
/// The sink returns `false` once its receiver is gone, which ends the thread. Dropping the
/// monitor stops it as well.
#[derive(Debug)]
pub struct PressureMonitor {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PressureMonitor {
    pub fn spawn<S, F>(mut source: S, interval: Duration, sink: F) -> std::io::Result<Self>
    where
        S: PressureSource + 'static,
        F: Fn(u8) -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name("wselector-pressure".into()).spawn(move || {
            loop {
                if let Some(percent) = source.sample() {
                    debug!(percent, "memory sample");
                    if !sink(percent) {
                        break;
                    }
                } else {
                    warn!("memory pressure source returned no sample");
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        Ok(Self { stop: Some(stop_tx), handle: Some(handle) })
    }
}

impl Drop for PressureMonitor {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Scripted(Vec<u8>);

    impl PressureSource for Scripted {
        fn sample(&mut self) -> Option<u8> {
            if self.0.is_empty() { None } else { Some(self.0.remove(0)) }
        }
    }

    #[test]
    fn classifies_levels() {
        let policy = PressurePolicy::default();
        assert_eq!(policy.level(40), PressureLevel::Normal);
        assert_eq!(policy.level(85), PressureLevel::High);
        assert_eq!(policy.level(97), PressureLevel::Emergency);
    }

    #[test]
    fn budgets_never_exceed_the_configured_base() {
        let policy = PressurePolicy { floor_bytes: 100, ..PressurePolicy::default() };
        assert_eq!(policy.budget_for(PressureLevel::High, 1000), 500);
        assert_eq!(policy.budget_for(PressureLevel::High, 150), 100);
        assert_eq!(policy.budget_for(PressureLevel::Emergency, 1000), 100);
        assert_eq!(policy.budget_for(PressureLevel::Emergency, 50), 50);
    }

    #[test]
    fn monitor_forwards_samples_until_sink_closes() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let (tx, rx) = mpsc::channel();
        let monitor = PressureMonitor::spawn(
            Scripted(vec![50, 90]),
            Duration::from_millis(1),
            move |percent| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(percent).is_ok()
            },
        )
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 50);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 90);
        drop(monitor);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn system_memory_reports_a_percentage() {
        if let Some(percent) = SystemMemory::new().sample() {
            assert!(percent <= 100);
        }
    }
}
