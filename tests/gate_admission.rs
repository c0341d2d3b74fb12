use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tollgate::{
    ActionKind, Clock, Decision, DegradingLedger, EntitlementStore, EntitlementUpdater,
    MemoryEntitlements, MemoryLedger, PolicyTable, QuotaError, QuotaGate, RejectReason,
    RequestContext, Tier, Transition, UsageLedger, UsageRecord, UtcDay, WebhookEvent,
};

// 2024-01-01T12:00:00Z
const DAY_ONE_NOON: u64 = 1_704_110_400;

#[derive(Clone)]
struct SettableClock(Arc<AtomicU64>);

impl SettableClock {
    fn at(epoch: u64) -> Self {
        Self(Arc::new(AtomicU64::new(epoch)))
    }

    fn advance_days(&self, days: u64) {
        self.0.fetch_add(days * 86_400, Ordering::SeqCst);
    }
}

impl Clock for SettableClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct Harness {
    gate: QuotaGate,
    entitlements: Arc<MemoryEntitlements>,
    ledger: Arc<MemoryLedger>,
    clock: SettableClock,
}

fn harness() -> Harness {
    let entitlements = Arc::new(MemoryEntitlements::new());
    let ledger = Arc::new(MemoryLedger::new());
    let clock = SettableClock::at(DAY_ONE_NOON);
    let gate = QuotaGate::with_clock(
        entitlements.clone(),
        ledger.clone(),
        PolicyTable::default(),
        Box::new(clock.clone()),
    );
    Harness {
        gate,
        entitlements,
        ledger,
        clock,
    }
}

async fn admit_and_record(gate: &QuotaGate, ctx: &RequestContext, n: usize) {
    for _ in 0..n {
        let decision = gate.check(ctx, ActionKind::Chat, 50).await.expect("check");
        assert!(decision.is_admitted());
        gate.record_usage(ctx, ActionKind::Chat, 100).await;
    }
}

#[tokio::test]
async fn free_tier_is_cut_off_after_the_daily_chat_limit() {
    let h = harness();
    let ctx = RequestContext::authenticated("p1");

    admit_and_record(&h.gate, &ctx, 5).await;

    let decision = h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check");
    let Decision::Rejected(rejection) = decision else {
        panic!("sixth call should be rejected");
    };
    assert_eq!(rejection.reason, RejectReason::QuotaExceeded);
    assert_eq!(rejection.limit, 5);
    assert_eq!(rejection.tier, Tier::Free);
}

#[tokio::test]
async fn a_new_utc_day_starts_a_fresh_counter() {
    let h = harness();
    let ctx = RequestContext::authenticated("p1");

    admit_and_record(&h.gate, &ctx, 5).await;
    assert!(matches!(
        h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check"),
        Decision::Rejected(_)
    ));

    h.clock.advance_days(1);
    let decision = h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check");
    assert!(decision.is_admitted());
}

#[tokio::test]
async fn action_kinds_are_metered_independently() {
    let h = harness();
    let ctx = RequestContext::authenticated("p1");

    admit_and_record(&h.gate, &ctx, 5).await;

    // Chat is exhausted, web search is not.
    assert!(matches!(
        h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check"),
        Decision::Rejected(_)
    ));
    assert!(
        h.gate
            .check(&ctx, ActionKind::WebSearch, 50)
            .await
            .expect("check")
            .is_admitted()
    );
}

#[tokio::test]
async fn unconfirmed_calls_consume_no_quota() {
    let h = harness();
    let ctx = RequestContext::authenticated("p1");

    // Three admissions, but one downstream call failed, so only two are
    // confirmed with record_usage.
    for confirmed in [true, false, true] {
        let decision = h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check");
        assert!(decision.is_admitted());
        if confirmed {
            h.gate.record_usage(&ctx, ActionKind::Chat, 100).await;
        }
    }

    let principal = h.gate.resolve_principal(&ctx);
    let record = h
        .ledger
        .get_today(&principal, h.gate.today())
        .await
        .expect("usage");
    assert_eq!(record.chat, 2);
    assert_eq!(record.tokens, 200);
}

#[tokio::test]
async fn checkout_webhook_unlocks_the_premium_policy() {
    let h = harness();
    let ctx = RequestContext::authenticated("p1");

    admit_and_record(&h.gate, &ctx, 5).await;
    assert!(matches!(
        h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check"),
        Decision::Rejected(_)
    ));

    let principal = h.gate.resolve_principal(&ctx);
    h.entitlements
        .link_customer_ref(&principal, "cus_1")
        .await
        .expect("link");

    let updater = EntitlementUpdater::new(h.entitlements.clone());
    let outcome = updater
        .handle_event(WebhookEvent::CheckoutCompleted {
            customer_ref: "cus_1".to_string(),
        })
        .await
        .expect("webhook");
    assert_eq!(outcome, Transition::Applied);

    // Same day, same counters: the premium limit now applies.
    let decision = h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check");
    assert!(decision.is_admitted());

    // Premium also raises the size ceiling.
    let decision = h.gate.check(&ctx, ActionKind::Chat, 5_000).await.expect("check");
    assert!(decision.is_admitted());
}

#[tokio::test]
async fn unknown_customer_webhook_changes_nothing() {
    let h = harness();
    let ctx = RequestContext::authenticated("p1");
    h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check");

    let updater = EntitlementUpdater::new(h.entitlements.clone());
    let outcome = updater
        .handle_event(WebhookEvent::SubscriptionDeleted {
            customer_ref: "cus_unknown".to_string(),
        })
        .await
        .expect("webhook");
    assert_eq!(outcome, Transition::NoMatch);

    let principal = h.entitlements
        .get_or_create(&h.gate.resolve_principal(&ctx))
        .await
        .expect("principal");
    assert_eq!(principal.tier, Tier::Free);
}

#[tokio::test]
async fn anonymous_buckets_reset_at_utc_midnight() {
    let h = harness();
    let ctx = RequestContext::anonymous("203.0.113.7".parse().unwrap());

    admit_and_record(&h.gate, &ctx, 5).await;
    assert!(matches!(
        h.gate.check(&ctx, ActionKind::Chat, 50).await.expect("check"),
        Decision::Rejected(_)
    ));

    // A different address is an independent bucket on the same day.
    let other = RequestContext::anonymous("203.0.113.8".parse().unwrap());
    assert!(
        h.gate
            .check(&other, ActionKind::Chat, 50)
            .await
            .expect("check")
            .is_admitted()
    );

    h.clock.advance_days(1);
    assert!(
        h.gate
            .check(&ctx, ActionKind::Chat, 50)
            .await
            .expect("check")
            .is_admitted()
    );
}

struct DownLedger;

#[async_trait::async_trait]
impl UsageLedger for DownLedger {
    async fn get_today(
        &self,
        _principal: &tollgate::PrincipalId,
        _day: UtcDay,
    ) -> Result<UsageRecord, QuotaError> {
        Err(QuotaError::StoreUnavailable("ledger down".to_string()))
    }

    async fn increment(
        &self,
        _principal: &tollgate::PrincipalId,
        _day: UtcDay,
        _kind: ActionKind,
        _amount: u64,
        _tokens: u64,
    ) -> Result<(), QuotaError> {
        Err(QuotaError::StoreUnavailable("ledger down".to_string()))
    }
}

#[tokio::test]
async fn quota_still_enforced_in_memory_while_the_durable_ledger_is_down() {
    let clock = SettableClock::at(DAY_ONE_NOON);
    let gate = QuotaGate::with_clock(
        Arc::new(MemoryEntitlements::new()),
        Arc::new(DegradingLedger::new(DownLedger)),
        PolicyTable::default(),
        Box::new(clock),
    );
    let ctx = RequestContext::authenticated("p1");

    admit_and_record(&gate, &ctx, 5).await;
    let decision = gate.check(&ctx, ActionKind::Chat, 50).await.expect("check");
    assert!(matches!(decision, Decision::Rejected(_)));
}
