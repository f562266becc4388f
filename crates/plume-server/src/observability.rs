//! Per-method call metrics
//!
//! Counters are recorded from call state transitions and exported in
//! Prometheus text format.

use plume_core::Code;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Call metrics shared by every call of a service
#[derive(Clone, Default)]
pub struct CallMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    calls_in_flight: AtomicU64,
    methods: Mutex<BTreeMap<String, MethodStats>>,
}

/// Snapshot of one method's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub started: u64,
    pub completed: BTreeMap<Code, u64>,
    pub cancelled: u64,
    pub violations: u64,
}

impl MethodStats {
    pub fn completed_total(&self) -> u64 {
        self.completed.values().sum()
    }

    pub fn completed_with(&self, code: Code) -> u64 {
        self.completed.get(&code).copied().unwrap_or(0)
    }
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, method: &str) {
        self.inner.calls_in_flight.fetch_add(1, Ordering::Relaxed);
        self.update(method, |stats| stats.started += 1);
    }

    pub fn record_close(&self, method: &str, code: Code) {
        self.inner.calls_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.update(method, |stats| *stats.completed.entry(code).or_insert(0) += 1);
    }

    pub fn record_cancel(&self, method: &str) {
        self.update(method, |stats| stats.cancelled += 1);
    }

    /// A peer broke the protocol (credit overrun, oversized message, ...)
    pub fn record_violation(&self, method: &str) {
        self.update(method, |stats| stats.violations += 1);
    }

    pub fn calls_in_flight(&self) -> u64 {
        self.inner.calls_in_flight.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, method: &str) -> MethodStats {
        self.lock().get(method).cloned().unwrap_or_default()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP plume_calls_in_flight Calls started and not yet closed\n");
        output.push_str("# TYPE plume_calls_in_flight gauge\n");
        output.push_str(&format!("plume_calls_in_flight {}\n", self.calls_in_flight()));

        let methods = self.lock();
        if methods.is_empty() {
            return output;
        }

        output.push_str("# HELP plume_calls_started_total Calls started per method\n");
        output.push_str("# TYPE plume_calls_started_total counter\n");
        for (method, stats) in methods.iter() {
            output.push_str(&format!(
                "plume_calls_started_total{{method=\"{}\"}} {}\n",
                method, stats.started
            ));
        }

        output.push_str("# HELP plume_calls_completed_total Calls closed per method and status code\n");
        output.push_str("# TYPE plume_calls_completed_total counter\n");
        for (method, stats) in methods.iter() {
            for (code, count) in &stats.completed {
                output.push_str(&format!(
                    "plume_calls_completed_total{{method=\"{}\",code=\"{}\"}} {}\n",
                    method, code, count
                ));
            }
        }

        output.push_str("# HELP plume_calls_cancelled_total Calls cancelled by the peer\n");
        output.push_str("# TYPE plume_calls_cancelled_total counter\n");
        for (method, stats) in methods.iter() {
            output.push_str(&format!(
                "plume_calls_cancelled_total{{method=\"{}\"}} {}\n",
                method, stats.cancelled
            ));
        }

        output.push_str("# HELP plume_protocol_violations_total Calls closed for breaking the protocol\n");
        output.push_str("# TYPE plume_protocol_violations_total counter\n");
        for (method, stats) in methods.iter() {
            output.push_str(&format!(
                "plume_protocol_violations_total{{method=\"{}\"}} {}\n",
                method, stats.violations
            ));
        }

        output
    }

    fn update(&self, method: &str, f: impl FnOnce(&mut MethodStats)) {
        let mut methods = self.lock();
        if !methods.contains_key(method) {
            methods.insert(method.to_string(), MethodStats::default());
        }
        if let Some(stats) = methods.get_mut(method) {
            f(stats);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MethodStats>> {
        self.inner
            .methods
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
