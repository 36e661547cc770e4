//! Radio power, card hot-plug and unsolicited modem status.

use crate::model::{
    CardInfo, CardUnavailableReason, Cause, SlotId, Subscription, SubscriptionStatus,
};
use crate::preference::UserPreference;
use crate::registrants::Notice;

use super::SubscriptionManager;

/// Stored preference names an application that is on the card, same type.
fn preference_matches(pref: &UserPreference, card: &CardInfo) -> bool {
    if !pref.is_valid() || pref.icc_id.is_none() || pref.icc_id != card.icc_id {
        return false;
    }
    pref.preferred_app_index()
        .and_then(|i| card.apps.get(i))
        .is_some_and(|app| app.app_type == pref.app_type)
}

impl SubscriptionManager {
    pub(super) fn on_radio_on(&mut self, slot: SlotId) {
        let Some(on) = self.radio_on.get_mut(slot) else {
            tracing::warn!(slot, "radio on for unknown slot");
            return;
        };
        if !*on {
            tracing::info!(slot, "radio on");
        }
        *on = true;
        if self.cards[slot].is_some() {
            self.update_activate_pending(slot);
        }
        self.process_next();
    }

    pub(super) fn on_radio_off(&mut self, slot: SlotId) {
        if !self.table.contains(slot) {
            tracing::warn!(slot, "radio off for unknown slot");
            return;
        }
        let was_on = std::mem::replace(&mut self.radio_on[slot], false);
        let status = self.table.get(slot).status();
        tracing::info!(slot, was_on, %status, "radio off");
        let notify = was_on || status != SubscriptionStatus::Deactivated;
        self.drop_outstanding_for(slot);
        self.reset_slot(slot, Cause::RadioOff, notify);
        self.settle();
    }

    pub(super) fn on_card_info_available(&mut self, card_slot: usize) {
        if card_slot >= self.cards.len() {
            tracing::warn!(card_slot, "card info for unknown slot");
            return;
        }
        let card = CardInfo {
            icc_id: self.card_inventory.get_icc_id(card_slot),
            apps: self.card_inventory.get_card_applications(card_slot),
        };
        tracing::info!(
            card_slot,
            icc_id = card.icc_id.as_deref().unwrap_or("-"),
            apps = card.apps.len(),
            "card info available"
        );
        self.cards[card_slot] = Some(card);
        // Logical and physical slots are 1:1 for card-driven activation.
        self.update_activate_pending(card_slot);
        self.process_next();
    }

    pub(super) fn on_card_info_unavailable(
        &mut self,
        card_slot: usize,
        reason: CardUnavailableReason,
    ) {
        if card_slot >= self.cards.len() {
            tracing::warn!(card_slot, %reason, "card unavailable for unknown slot");
            return;
        }
        tracing::info!(card_slot, %reason, "card info unavailable");
        self.cards[card_slot] = None;
        self.new_card[card_slot] = false;

        // A slot bound to another card keeps its subscription.
        let affected: Vec<SlotId> = (0..self.table.len())
            .filter(|&slot| {
                let sub = &self.table.get(slot).subscription;
                sub.lives_on(card_slot) || (slot == card_slot && sub.slot_id.is_none())
            })
            .collect();
        for &slot in &affected {
            self.reset_slot(slot, Cause::CardUnavailable, true);
        }
        for dropped in self.pending.take_targeting(card_slot) {
            let slot = dropped.slot();
            tracing::info!(slot, card_slot, direction = %dropped.direction, "pending request for removed card dropped");
            self.record_cause(slot, Cause::CardUnavailable);
        }
        self.settle();
    }

    pub(super) fn on_subscription_status_changed(&mut self, slot: SlotId, activated: bool) {
        if !self.table.contains(slot) {
            tracing::warn!(slot, "status change for unknown slot");
            return;
        }
        if !self.radio_on[slot] {
            tracing::debug!(slot, activated, "status change ignored, radio off");
            return;
        }
        let record = self.table.get(slot);
        match (activated, record.status()) {
            (true, SubscriptionStatus::Activated) => {
                if record.ready {
                    return;
                }
                self.table.set_ready(slot, true);
                tracing::info!(slot, "subscription ready");
                self.settle();
            }
            (true, SubscriptionStatus::Activate) => {
                tracing::debug!(slot, "modem ready before activation completed");
                self.modem_ready_hint[slot] = true;
            }
            (false, SubscriptionStatus::Activated) => {
                tracing::warn!(slot, "modem dropped active subscription");
                self.reset_slot(slot, Cause::ModemDeactivated, true);
                self.settle();
            }
            (false, SubscriptionStatus::Activate) => {
                self.modem_ready_hint[slot] = false;
            }
            (activated, status) => {
                tracing::debug!(slot, activated, %status, "status change ignored");
            }
        }
    }

    /// Recompute the card-driven activation for `slot` from the user
    /// preference and the cached card.
    pub(super) fn update_activate_pending(&mut self, slot: SlotId) {
        if !self.radio_on[slot] {
            tracing::debug!(slot, "radio off, not recomputing activation");
            return;
        }
        if self.table.get(slot).status() != SubscriptionStatus::Deactivated
            || self.pending.has_pending(slot)
        {
            return;
        }
        let Some(card) = self.cards[slot].clone() else {
            return;
        };

        let pref = self.prefs.get_user_preference(slot);
        if preference_matches(&pref, &card) {
            self.new_card[slot] = false;
            match (pref.status, pref.preferred_app_index()) {
                (SubscriptionStatus::Activated, Some(index)) => {
                    let sub =
                        Subscription::for_app(slot, slot, index, &card, SubscriptionStatus::Deactivated);
                    tracing::info!(slot, app_index = index, app_type = %sub.app_type, "queueing preferred application");
                    self.pending.enqueue_activate(&sub);
                }
                _ => tracing::debug!(slot, status = %pref.status, "user keeps slot deactivated"),
            }
            return;
        }

        self.new_card[slot] = true;
        tracing::info!(slot, icc_id = card.icc_id.as_deref().unwrap_or("-"), "new card");
        self.notify(Notice::NewCardAvailable {
            slot,
            icc_id: card.icc_id.clone(),
        });
        if !self.config.auto_activate_new_cards {
            return;
        }
        let Some(index) = card.default_app_index() else {
            tracing::warn!(slot, "new card has no 3GPP or 3GPP2 application");
            return;
        };
        let sub = Subscription::for_app(slot, slot, index, &card, SubscriptionStatus::Deactivated);
        let pref = UserPreference::from_subscription(&sub, SubscriptionStatus::Activated);
        if let Err(e) = self.prefs.set_user_preference(slot, &pref) {
            tracing::warn!(slot, error = %e, "failed to persist new card preference");
        }
        tracing::info!(slot, app_index = index, app_type = %sub.app_type, "auto-activating new card");
        self.pending.enqueue_activate(&sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppDescriptor, AppType};

    fn card() -> CardInfo {
        CardInfo {
            icc_id: Some("8901".into()),
            apps: vec![
                AppDescriptor {
                    app_type: AppType::Csim,
                    app_id: "A0000003431002".into(),
                },
                AppDescriptor {
                    app_type: AppType::Usim,
                    app_id: "A0000000871002".into(),
                },
            ],
        }
    }

    #[test]
    fn preference_match_needs_icc_and_type() {
        let card = card();
        let sub = Subscription::for_app(0, 0, 1, &card, SubscriptionStatus::Activated);
        let pref = UserPreference::from_subscription(&sub, SubscriptionStatus::Activated);
        assert!(preference_matches(&pref, &card));

        let mut other_card = card.clone();
        other_card.icc_id = Some("8902".into());
        assert!(!preference_matches(&pref, &other_card));

        let mut swapped = card.clone();
        swapped.apps.swap(0, 1);
        assert!(!preference_matches(&pref, &swapped));

        assert!(!preference_matches(&UserPreference::default(), &card));
    }

    #[test]
    fn cdma_preference_uses_3gpp2_index() {
        let card = card();
        let sub = Subscription::for_app(0, 0, 0, &card, SubscriptionStatus::Activated);
        let pref = UserPreference::from_subscription(&sub, SubscriptionStatus::Deactivated);
        assert_eq!(pref.app_index_3gpp2, Some(0));
        assert!(preference_matches(&pref, &card));
    }
}
