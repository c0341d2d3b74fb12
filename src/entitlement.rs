//! Durable entitlement records: who is on which tier, and how payment-provider
//! state maps onto them.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gate::QuotaError;
use crate::identity::PrincipalId;
use crate::policy::Tier;

/// Subscription lifecycle status as reported by the payment provider.
/// Stored verbatim; tier derivation only treats `Active`/`Trialing` as
/// entitled. Unknown provider strings deserialize to `Inactive`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl Serialize for SubscriptionStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SubscriptionStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" | "cancelled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Inactive,
        }
    }

    pub fn is_entitled(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One billable identity. Rows are created lazily on first sight and never
/// deleted; tier and status are mutated only by entitlement transitions.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub tier: Tier,
    pub subscription_status: SubscriptionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_customer_ref: Option<String>,
    pub created_at_ms: u64,
}

impl Principal {
    pub fn new_free(principal_id: PrincipalId, created_at_ms: u64) -> Self {
        Self {
            principal_id,
            tier: Tier::Free,
            subscription_status: SubscriptionStatus::Inactive,
            payment_customer_ref: None,
            created_at_ms,
        }
    }
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Principal")
            .field("principal_id", &self.principal_id)
            .field("tier", &self.tier)
            .field("subscription_status", &self.subscription_status)
            .field("payment_customer_ref", &"<redacted>")
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

/// Outcome of an entitlement transition. `NoMatch` is a logged no-op, not an
/// error: replayed or out-of-order events for unknown customers are expected
/// under at-least-once webhook delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Applied,
    NoMatch,
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Returns the existing record or inserts a default free row. Idempotent
    /// under concurrent calls for the same principal.
    async fn get_or_create(&self, principal: &PrincipalId) -> Result<Principal, QuotaError>;

    /// Applies an absolute tier/status write to the principal matched by
    /// `customer_ref`. Last-write-wins per field; applying the same
    /// transition twice yields the same end state.
    async fn apply_transition(
        &self,
        customer_ref: &str,
        tier: Tier,
        status: SubscriptionStatus,
    ) -> Result<Transition, QuotaError>;

    /// Associates a payment-provider customer record with a principal.
    /// Subsequent webhook events key off `customer_ref` because the provider
    /// only knows that side.
    async fn link_customer_ref(
        &self,
        principal: &PrincipalId,
        customer_ref: &str,
    ) -> Result<(), QuotaError>;
}

/// In-memory entitlement store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryEntitlements {
    principals: Mutex<HashMap<PrincipalId, Principal>>,
}

impl MemoryEntitlements {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlements {
    async fn get_or_create(&self, principal: &PrincipalId) -> Result<Principal, QuotaError> {
        let mut principals = self.principals.lock().unwrap_or_else(|e| e.into_inner());
        let record = principals
            .entry(principal.clone())
            .or_insert_with(|| Principal::new_free(principal.clone(), now_millis()));
        Ok(record.clone())
    }

    async fn apply_transition(
        &self,
        customer_ref: &str,
        tier: Tier,
        status: SubscriptionStatus,
    ) -> Result<Transition, QuotaError> {
        let mut principals = self.principals.lock().unwrap_or_else(|e| e.into_inner());
        let matched = principals
            .values_mut()
            .find(|p| p.payment_customer_ref.as_deref() == Some(customer_ref));
        match matched {
            Some(principal) => {
                principal.tier = tier;
                principal.subscription_status = status;
                Ok(Transition::Applied)
            }
            None => Ok(Transition::NoMatch),
        }
    }

    async fn link_customer_ref(
        &self,
        principal: &PrincipalId,
        customer_ref: &str,
    ) -> Result<(), QuotaError> {
        let mut principals = self.principals.lock().unwrap_or_else(|e| e.into_inner());
        principals
            .entry(principal.clone())
            .or_insert_with(|| Principal::new_free(principal.clone(), now_millis()))
            .payment_customer_ref = Some(customer_ref.to_string());
        Ok(())
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_defaults_to_free_inactive() {
        let store = MemoryEntitlements::new();
        let id = PrincipalId::from("user:1");

        let first = store.get_or_create(&id).await.unwrap();
        assert_eq!(first.tier, Tier::Free);
        assert_eq!(first.subscription_status, SubscriptionStatus::Inactive);
        assert!(first.payment_customer_ref.is_none());

        let second = store.get_or_create(&id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn transition_requires_a_linked_customer_ref() {
        let store = MemoryEntitlements::new();
        let id = PrincipalId::from("user:1");
        store.get_or_create(&id).await.unwrap();

        let outcome = store
            .apply_transition("cus_1", Tier::Premium, SubscriptionStatus::Active)
            .await
            .unwrap();
        assert_eq!(outcome, Transition::NoMatch);

        store.link_customer_ref(&id, "cus_1").await.unwrap();
        let outcome = store
            .apply_transition("cus_1", Tier::Premium, SubscriptionStatus::Active)
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Applied);

        let principal = store.get_or_create(&id).await.unwrap();
        assert_eq!(principal.tier, Tier::Premium);
        assert_eq!(principal.subscription_status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn transitions_are_idempotent() {
        let store = MemoryEntitlements::new();
        let id = PrincipalId::from("user:1");
        store.link_customer_ref(&id, "cus_1").await.unwrap();

        for _ in 0..2 {
            let outcome = store
                .apply_transition("cus_1", Tier::Free, SubscriptionStatus::Canceled)
                .await
                .unwrap();
            assert_eq!(outcome, Transition::Applied);
        }

        let principal = store.get_or_create(&id).await.unwrap();
        assert_eq!(principal.tier, Tier::Free);
        assert_eq!(principal.subscription_status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn unknown_status_strings_parse_conservatively() {
        assert_eq!(
            SubscriptionStatus::parse("paused?!"),
            SubscriptionStatus::Inactive
        );
        assert!(!SubscriptionStatus::parse("paused?!").is_entitled());
        assert!(SubscriptionStatus::parse("trialing").is_entitled());
    }
}
