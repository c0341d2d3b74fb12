//! Admission control: decide whether a request may proceed, and record usage
//! once the caller's downstream call has succeeded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entitlement::EntitlementStore;
use crate::identity::{self, PrincipalId, RequestContext};
use crate::ledger::{ActionKind, UsageLedger, UtcDay};
use crate::observability::Observability;
use crate::policy::{PolicyTable, Tier};

#[derive(Debug, Error)]
pub enum QuotaError {
    /// A durable store could not be reached. For the entitlement store this
    /// fails the admission check closed; the usage ledger degrades instead.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    RequestTooLarge,
    QuotaExceeded,
}

/// Rejection payload. Carries the limit and tier so the calling layer can
/// render an upgrade prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub limit: u64,
    pub tier: Tier,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Admitted,
    Rejected(Rejection),
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
            .as_secs()
    }
}

/// The admission orchestrator. `check` admits or rejects; `record_usage` is
/// invoked by the caller only after the downstream call succeeded, so a
/// failed or aborted call never consumes quota.
///
/// The window between `check` and `record_usage` is deliberately not
/// serialized: racing requests near the limit may over-admit by at most the
/// number of in-flight peers. The daily limit is a soft limit.
pub struct QuotaGate {
    entitlements: Arc<dyn EntitlementStore>,
    ledger: Arc<dyn UsageLedger>,
    policies: PolicyTable,
    observability: Arc<Observability>,
    clock: Box<dyn Clock>,
}

impl QuotaGate {
    pub fn new(
        entitlements: Arc<dyn EntitlementStore>,
        ledger: Arc<dyn UsageLedger>,
        policies: PolicyTable,
    ) -> Self {
        Self::with_clock(entitlements, ledger, policies, Box::new(SystemClock))
    }

    pub fn with_clock(
        entitlements: Arc<dyn EntitlementStore>,
        ledger: Arc<dyn UsageLedger>,
        policies: PolicyTable,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            entitlements,
            ledger,
            policies,
            observability: Arc::new(Observability::default()),
            clock,
        }
    }

    pub fn with_observability(mut self, observability: Arc<Observability>) -> Self {
        self.observability = observability;
        self
    }

    pub fn observability(&self) -> Arc<Observability> {
        Arc::clone(&self.observability)
    }

    pub fn today(&self) -> UtcDay {
        UtcDay::from_epoch_seconds(self.clock.now_epoch_seconds())
    }

    /// Resolves the principal this request is accounted against.
    pub fn resolve_principal(&self, ctx: &RequestContext) -> PrincipalId {
        identity::resolve(ctx, self.today())
    }

    /// Admits or rejects one request of `action` kind with a body of
    /// `request_chars` characters. An entitlement-store failure is returned
    /// as an error, never silently mapped to a default tier: guessing the
    /// tier could both over- and under-admit.
    pub async fn check(
        &self,
        ctx: &RequestContext,
        action: ActionKind,
        request_chars: usize,
    ) -> Result<Decision, QuotaError> {
        let day = self.today();
        let principal_id = identity::resolve(ctx, day);
        let principal = self.entitlements.get_or_create(&principal_id).await?;
        let limits = self.policies.resolve(principal.tier);

        // Size check comes first: an oversized request must not consume quota
        // and does not need a ledger read.
        if request_chars > limits.max_request_chars {
            self.observability.record_rejected_too_large();
            tracing::debug!(
                principal = %principal_id,
                tier = %principal.tier,
                request_chars,
                limit = limits.max_request_chars,
                "request rejected: too large"
            );
            return Ok(Decision::Rejected(Rejection {
                reason: RejectReason::RequestTooLarge,
                limit: limits.max_request_chars as u64,
                tier: principal.tier,
            }));
        }

        let usage = self.ledger.get_today(&principal_id, day).await?;
        let limit = limits.max_actions(action);
        if usage.count(action) >= limit {
            self.observability.record_rejected_quota();
            tracing::info!(
                principal = %principal_id,
                tier = %principal.tier,
                action = %action,
                count = usage.count(action),
                limit,
                "request rejected: daily quota exceeded"
            );
            return Ok(Decision::Rejected(Rejection {
                reason: RejectReason::QuotaExceeded,
                limit,
                tier: principal.tier,
            }));
        }

        self.observability.record_admitted();
        Ok(Decision::Admitted)
    }

    /// Records one completed action against today's counters. Call only
    /// after the downstream call confirmed success. Fire-and-forget-safe:
    /// ledger failures are logged, not surfaced.
    pub async fn record_usage(&self, ctx: &RequestContext, action: ActionKind, tokens: u64) {
        let day = self.today();
        let principal_id = identity::resolve(ctx, day);
        match self
            .ledger
            .increment(&principal_id, day, action, 1, tokens)
            .await
        {
            Ok(()) => self.observability.record_usage_recorded(),
            Err(err) => {
                self.observability.record_ledger_degraded();
                tracing::warn!(
                    principal = %principal_id,
                    action = %action,
                    error = %err,
                    "failed to record usage"
                );
            }
        }
    }
}
