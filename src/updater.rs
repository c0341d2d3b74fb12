//! Applies payment-provider lifecycle events to the entitlement store.
//!
//! Signature verification belongs to the webhook-receiving layer; by the
//! time an event reaches this module it is trusted. Delivery is
//! at-least-once and possibly out of order, so every write is an absolute
//! tier/status state, never a delta, and replays are harmless.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entitlement::{EntitlementStore, SubscriptionStatus, Transition};
use crate::gate::QuotaError;
use crate::observability::Observability;
use crate::policy::Tier;

/// One payment-provider lifecycle notification, already verified upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WebhookEvent {
    CheckoutCompleted {
        customer_ref: String,
    },
    SubscriptionCreated {
        customer_ref: String,
        status: SubscriptionStatus,
    },
    SubscriptionUpdated {
        customer_ref: String,
        status: SubscriptionStatus,
    },
    SubscriptionDeleted {
        customer_ref: String,
    },
}

impl WebhookEvent {
    pub fn customer_ref(&self) -> &str {
        match self {
            WebhookEvent::CheckoutCompleted { customer_ref }
            | WebhookEvent::SubscriptionCreated { customer_ref, .. }
            | WebhookEvent::SubscriptionUpdated { customer_ref, .. }
            | WebhookEvent::SubscriptionDeleted { customer_ref } => customer_ref,
        }
    }

    /// The absolute entitlement state this event maps to.
    fn target_state(&self) -> (Tier, SubscriptionStatus) {
        match self {
            WebhookEvent::CheckoutCompleted { .. } => (Tier::Premium, SubscriptionStatus::Active),
            WebhookEvent::SubscriptionCreated { status, .. }
            | WebhookEvent::SubscriptionUpdated { status, .. } => {
                (Tier::for_status(*status), *status)
            }
            WebhookEvent::SubscriptionDeleted { .. } => {
                (Tier::Free, SubscriptionStatus::Canceled)
            }
        }
    }
}

pub struct EntitlementUpdater {
    store: Arc<dyn EntitlementStore>,
    observability: Arc<Observability>,
}

impl EntitlementUpdater {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self {
            store,
            observability: Arc::new(Observability::default()),
        }
    }

    pub fn with_observability(mut self, observability: Arc<Observability>) -> Self {
        self.observability = observability;
        self
    }

    /// Applies one event. An unmatched customer ref returns
    /// `Transition::NoMatch` and never raises; a store write failure is
    /// surfaced so the delivery mechanism's redelivery can retry it, which
    /// is safe because the write is idempotent.
    pub async fn handle_event(&self, event: WebhookEvent) -> Result<Transition, QuotaError> {
        let (tier, status) = event.target_state();
        let customer_ref = event.customer_ref();
        let transition = self
            .store
            .apply_transition(customer_ref, tier, status)
            .await?;

        match transition {
            Transition::Applied => {
                self.observability.record_webhook_applied();
                tracing::info!(
                    customer_ref = %customer_ref,
                    tier = %tier,
                    status = %status,
                    "entitlement transition applied"
                );
            }
            Transition::NoMatch => {
                self.observability.record_webhook_unmatched();
                tracing::warn!(
                    customer_ref = %customer_ref,
                    "webhook for unknown customer ref ignored"
                );
            }
        }
        Ok(transition)
    }
}
