//! Per-slot state table.

use serde::Serialize;

use crate::model::{Cause, SlotId, Subscription, SubscriptionStatus};

/// Current state of one logical slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentSubscriptionRecord {
    pub subscription: Subscription,
    /// Modem confirmed both activation and readiness.
    pub ready: bool,
    /// Outcome of the last transition.
    pub cause: Option<Cause>,
}

impl CurrentSubscriptionRecord {
    fn new(slot: SlotId) -> Self {
        Self {
            subscription: Subscription::empty(slot),
            ready: false,
            cause: None,
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.subscription.status
    }

    pub fn is_active(&self) -> bool {
        self.status() == SubscriptionStatus::Activated
    }

    pub fn is_ready(&self) -> bool {
        self.is_active() && self.ready
    }
}

/// Fixed-size table of records indexed by logical slot.
///
/// Accessors panic on an out-of-range slot; callers check bounds at the
/// API/event boundary.
#[derive(Debug, Clone)]
pub struct SubscriptionTable {
    records: Vec<CurrentSubscriptionRecord>,
}

impl SubscriptionTable {
    pub fn new(slot_count: usize) -> Self {
        Self {
            records: (0..slot_count).map(CurrentSubscriptionRecord::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        slot < self.records.len()
    }

    pub fn get(&self, slot: SlotId) -> &CurrentSubscriptionRecord {
        &self.records[slot]
    }

    pub fn records(&self) -> &[CurrentSubscriptionRecord] {
        &self.records
    }

    /// Store `subscription` with `status`. Readiness is dropped unless the
    /// new status is `Activated`.
    pub fn update(
        &mut self,
        slot: SlotId,
        subscription: Subscription,
        status: SubscriptionStatus,
        cause: Option<Cause>,
    ) {
        let record = &mut self.records[slot];
        record.subscription = Subscription {
            sub_id: slot,
            status,
            ..subscription
        };
        if status != SubscriptionStatus::Activated {
            record.ready = false;
        }
        if cause.is_some() {
            record.cause = cause;
        }
    }

    /// Back to an empty `Deactivated` slot. The last cause is kept.
    pub fn reset(&mut self, slot: SlotId) {
        let record = &mut self.records[slot];
        record.subscription = Subscription::empty(slot);
        record.ready = false;
    }

    pub fn set_cause(&mut self, slot: SlotId, cause: Cause) {
        self.records[slot].cause = Some(cause);
    }

    /// Set readiness; `true` only sticks on an `Activated` slot. Returns
    /// the effective value.
    pub fn set_ready(&mut self, slot: SlotId, ready: bool) -> bool {
        let record = &mut self.records[slot];
        record.ready = ready && record.is_active();
        record.ready
    }

    pub fn active_slots(&self) -> Vec<SlotId> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_active())
            .map(|(slot, _)| slot)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppType;

    fn usim(slot: SlotId) -> Subscription {
        Subscription {
            sub_id: slot,
            slot_id: Some(slot),
            app_index: Some(0),
            icc_id: Some(format!("89000000000000000{slot}")),
            app_type: AppType::Usim,
            app_id: Some("A0000000871002".into()),
            status: SubscriptionStatus::Activated,
        }
    }

    #[test]
    fn starts_deactivated() {
        let table = SubscriptionTable::new(2);
        assert_eq!(table.len(), 2);
        for r in table.records() {
            assert_eq!(r.status(), SubscriptionStatus::Deactivated);
            assert!(!r.ready);
            assert!(r.cause.is_none());
        }
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn ready_requires_activated() {
        let mut table = SubscriptionTable::new(2);
        assert!(!table.set_ready(0, true), "deactivated slot must not become ready");

        table.update(0, usim(0), SubscriptionStatus::Activate, None);
        assert!(!table.set_ready(0, true), "pending activation must not become ready");

        table.update(0, usim(0), SubscriptionStatus::Activated, Some(Cause::ActivateSuccess));
        assert!(table.set_ready(0, true));
        assert!(table.get(0).is_ready());
    }

    #[test]
    fn update_away_from_activated_drops_ready() {
        let mut table = SubscriptionTable::new(1);
        table.update(0, usim(0), SubscriptionStatus::Activated, None);
        table.set_ready(0, true);
        table.update(0, usim(0), SubscriptionStatus::Deactivate, None);
        assert!(!table.get(0).ready);
    }

    #[test]
    fn update_pins_sub_id_to_slot() {
        let mut table = SubscriptionTable::new(2);
        table.update(1, usim(0), SubscriptionStatus::Activated, None);
        assert_eq!(table.get(1).subscription.sub_id, 1);
    }

    #[test]
    fn reset_keeps_cause() {
        let mut table = SubscriptionTable::new(2);
        table.update(1, usim(1), SubscriptionStatus::Activated, Some(Cause::ActivateSuccess));
        table.set_ready(1, true);
        table.set_cause(1, Cause::RadioOff);
        table.reset(1);

        let r = table.get(1);
        assert_eq!(r.subscription, Subscription::empty(1));
        assert!(!r.ready);
        assert_eq!(r.cause, Some(Cause::RadioOff));
    }

    #[test]
    fn active_slots_lists_activated_only() {
        let mut table = SubscriptionTable::new(3);
        table.update(0, usim(0), SubscriptionStatus::Activated, None);
        table.update(1, usim(1), SubscriptionStatus::Activate, None);
        table.update(2, usim(2), SubscriptionStatus::Activated, None);
        assert_eq!(table.active_slots(), vec![0, 2]);
        assert_eq!(table.active_count(), 2);
    }
}
