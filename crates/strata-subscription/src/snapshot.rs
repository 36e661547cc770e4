//! Read-only view of the orchestrator, published after every event.

use serde::Serialize;

use crate::model::{SlotId, Subscription};
use crate::table::CurrentSubscriptionRecord;

/// Persisted default/voice/SMS/data selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Selectors {
    pub default: Option<SlotId>,
    pub voice: Option<SlotId>,
    pub sms: Option<SlotId>,
    pub data: Option<SlotId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    pub records: Vec<CurrentSubscriptionRecord>,
    /// Slot currently carrying data traffic.
    pub dds: Option<SlotId>,
    pub radio_on: Vec<bool>,
    /// Card info cached, by physical slot.
    pub card_present: Vec<bool>,
    pub new_card: Vec<bool>,
    pub set_subscription_in_progress: bool,
    pub dds_switch_in_progress: bool,
    pub command_outstanding: bool,
    pub subscription_mode: Option<usize>,
    pub selectors: Selectors,
}

impl SubscriptionSnapshot {
    pub fn current_subscription(&self, slot: SlotId) -> Option<&Subscription> {
        self.records.get(slot).map(|r| &r.subscription)
    }

    pub fn is_sub_active(&self, slot: SlotId) -> bool {
        self.records.get(slot).is_some_and(|r| r.is_active())
    }

    pub fn active_subscriptions_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_active()).count()
    }
}
