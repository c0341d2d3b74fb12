//! Admission counters. Cheap process-local tallies the operator can scrape;
//! shared across tasks, so counts live in atomics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub admitted: u64,
    pub rejected_too_large: u64,
    pub rejected_quota: u64,
    pub usage_recorded: u64,
    pub ledger_degraded: u64,
    pub webhook_applied: u64,
    pub webhook_unmatched: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    admitted: AtomicU64,
    rejected_too_large: AtomicU64,
    rejected_quota: AtomicU64,
    usage_recorded: AtomicU64,
    ledger_degraded: AtomicU64,
    webhook_applied: AtomicU64,
    webhook_unmatched: AtomicU64,
}

impl Observability {
    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_too_large(&self) {
        self.rejected_too_large.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_quota(&self) {
        self.rejected_quota.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usage_recorded(&self) {
        self.usage_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ledger_degraded(&self) {
        self.ledger_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_webhook_applied(&self) {
        self.webhook_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_webhook_unmatched(&self) {
        self.webhook_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_too_large: self.rejected_too_large.load(Ordering::Relaxed),
            rejected_quota: self.rejected_quota.load(Ordering::Relaxed),
            usage_recorded: self.usage_recorded.load(Ordering::Relaxed),
            ledger_degraded: self.ledger_degraded.load(Ordering::Relaxed),
            webhook_applied: self.webhook_applied.load(Ordering::Relaxed),
            webhook_unmatched: self.webhook_unmatched.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let observability = Observability::default();
        observability.record_admitted();
        observability.record_admitted();
        observability.record_rejected_quota();
        observability.record_webhook_unmatched();

        let snapshot = observability.snapshot();
        assert_eq!(snapshot.admitted, 2);
        assert_eq!(snapshot.rejected_quota, 1);
        assert_eq!(snapshot.rejected_too_large, 0);
        assert_eq!(snapshot.webhook_unmatched, 1);
    }
}
