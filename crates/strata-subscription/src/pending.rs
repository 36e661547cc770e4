//! Pending activate/deactivate queues.
//!
//! One fixed array per direction, indexed by logical slot. A slot holds at
//! most one pending request across both arrays: enqueuing in one direction
//! evicts the other. The command already on the wire is not a pending
//! request; the orchestrator tracks it separately.

use thiserror::Error;

use crate::model::{CardInfo, Direction, SlotId, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub subscription: Subscription,
    pub direction: Direction,
}

impl PendingRequest {
    pub fn new(subscription: &Subscription, direction: Direction) -> Self {
        Self {
            subscription: subscription.with_status(direction.pending_status()),
            direction,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.subscription.sub_id
    }
}

#[derive(Debug, Clone)]
pub struct PendingQueues {
    activate: Vec<Option<PendingRequest>>,
    deactivate: Vec<Option<PendingRequest>>,
}

impl PendingQueues {
    pub fn new(slot_count: usize) -> Self {
        Self {
            activate: vec![None; slot_count],
            deactivate: vec![None; slot_count],
        }
    }

    /// Queue an activation; returns whatever entry it displaced for the slot.
    /// Out-of-range slots are refused and handed back.
    pub fn enqueue_activate(&mut self, sub: &Subscription) -> Option<PendingRequest> {
        self.enqueue(PendingRequest::new(sub, Direction::Activate))
    }

    pub fn enqueue_deactivate(&mut self, sub: &Subscription) -> Option<PendingRequest> {
        self.enqueue(PendingRequest::new(sub, Direction::Deactivate))
    }

    fn enqueue(&mut self, request: PendingRequest) -> Option<PendingRequest> {
        let slot = request.slot();
        if slot >= self.activate.len() {
            return Some(request);
        }
        let (same, other) = match request.direction {
            Direction::Activate => (&mut self.activate, &mut self.deactivate),
            Direction::Deactivate => (&mut self.deactivate, &mut self.activate),
        };
        let evicted = other[slot].take();
        let stale = same[slot].replace(request);
        evicted.or(stale)
    }

    pub fn activate(&self, slot: SlotId) -> Option<&PendingRequest> {
        self.activate.get(slot).and_then(Option::as_ref)
    }

    pub fn deactivate(&self, slot: SlotId) -> Option<&PendingRequest> {
        self.deactivate.get(slot).and_then(Option::as_ref)
    }

    pub fn take_activate(&mut self, slot: SlotId) -> Option<PendingRequest> {
        self.activate.get_mut(slot).and_then(Option::take)
    }

    pub fn take_deactivate(&mut self, slot: SlotId) -> Option<PendingRequest> {
        self.deactivate.get_mut(slot).and_then(Option::take)
    }

    pub fn has_pending(&self, slot: SlotId) -> bool {
        self.activate(slot).is_some() || self.deactivate(slot).is_some()
    }

    /// Drop both entries for a slot.
    pub fn clear_slot(&mut self, slot: SlotId) -> Vec<PendingRequest> {
        self.take_activate(slot)
            .into_iter()
            .chain(self.take_deactivate(slot))
            .collect()
    }

    /// Drop every request whose subscription lives on `card_slot`.
    pub fn take_targeting(&mut self, card_slot: usize) -> Vec<PendingRequest> {
        let mut dropped = Vec::new();
        for entry in self.activate.iter_mut().chain(self.deactivate.iter_mut()) {
            if matches!(entry, Some(r) if r.subscription.lives_on(card_slot)) {
                dropped.extend(entry.take());
            }
        }
        dropped
    }

    /// First slot, in ascending order, with a pending deactivation.
    pub fn next_deactivate_slot(&self) -> Option<SlotId> {
        self.deactivate.iter().position(Option::is_some)
    }

    pub fn next_activate_slot(&self) -> Option<SlotId> {
        self.activate.iter().position(Option::is_some)
    }

    pub fn activate_count(&self) -> usize {
        self.activate.iter().filter(|e| e.is_some()).count()
    }

    pub fn deactivate_count(&self) -> usize {
        self.deactivate.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.activate_count() == 0 && self.deactivate_count() == 0
    }
}

// ── Validation ──────────────────────────────────────────────────────

/// Why a pending request was dropped instead of dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    #[error("subscription id {0} out of range")]
    SubIdOutOfRange(SlotId),
    #[error("card slot {0:?} out of range")]
    CardSlotOutOfRange(Option<usize>),
    #[error("app index {index:?} out of range (max {max})")]
    AppIndexOutOfRange { index: Option<usize>, max: usize },
    #[error("radio off for subscription {0}")]
    RadioOff(SlotId),
    #[error("no card info for slot {0}")]
    CardUnavailable(usize),
    #[error("application {0} no longer on card")]
    AppMissing(usize),
    #[error("application {0} changed on card")]
    AppChanged(usize),
}

/// Card location of a request that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardTarget {
    pub card_slot: usize,
    pub app_index: usize,
}

/// Limits and hardware view a request is checked against.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub slot_count: usize,
    pub max_apps: usize,
    /// Radio state by logical slot.
    pub radio_on: &'a [bool],
    /// Card info by physical slot.
    pub cards: &'a [Option<CardInfo>],
}

pub fn validate(
    request: &PendingRequest,
    ctx: &ValidationContext<'_>,
) -> Result<CardTarget, InvalidRequest> {
    let sub = &request.subscription;
    if sub.sub_id >= ctx.slot_count {
        return Err(InvalidRequest::SubIdOutOfRange(sub.sub_id));
    }
    let card_slot = match sub.slot_id {
        Some(s) if s < ctx.cards.len() => s,
        other => return Err(InvalidRequest::CardSlotOutOfRange(other)),
    };
    let app_index = match sub.app_index {
        Some(i) if i < ctx.max_apps => i,
        other => {
            return Err(InvalidRequest::AppIndexOutOfRange {
                index: other,
                max: ctx.max_apps,
            })
        }
    };
    if !ctx.radio_on.get(sub.sub_id).copied().unwrap_or(false) {
        return Err(InvalidRequest::RadioOff(sub.sub_id));
    }
    let Some(card) = ctx.cards[card_slot].as_ref() else {
        return Err(InvalidRequest::CardUnavailable(card_slot));
    };
    let Some(app) = card.apps.get(app_index) else {
        return Err(InvalidRequest::AppMissing(app_index));
    };
    if app.app_type != sub.app_type || (sub.icc_id.is_some() && sub.icc_id != card.icc_id) {
        return Err(InvalidRequest::AppChanged(app_index));
    }
    Ok(CardTarget {
        card_slot,
        app_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppDescriptor, AppType, SubscriptionStatus};

    fn card() -> CardInfo {
        CardInfo {
            icc_id: Some("8901".into()),
            apps: vec![AppDescriptor {
                app_type: AppType::Usim,
                app_id: "A0000000871002".into(),
            }],
        }
    }

    fn sub(slot: SlotId) -> Subscription {
        Subscription::for_app(slot, slot, 0, &card(), SubscriptionStatus::Deactivated)
    }

    #[test]
    fn enqueue_sets_pending_status() {
        let mut q = PendingQueues::new(2);
        assert!(q.enqueue_activate(&sub(0)).is_none());
        let req = q.activate(0).unwrap();
        assert_eq!(req.subscription.status, SubscriptionStatus::Activate);
        assert_eq!(req.direction, Direction::Activate);
    }

    #[test]
    fn opposite_direction_evicts() {
        let mut q = PendingQueues::new(2);
        q.enqueue_activate(&sub(1));
        let evicted = q.enqueue_deactivate(&sub(1)).unwrap();
        assert_eq!(evicted.direction, Direction::Activate);
        assert!(q.activate(1).is_none());
        assert!(q.deactivate(1).is_some());
    }

    #[test]
    fn same_direction_overwrites() {
        let mut q = PendingQueues::new(2);
        q.enqueue_activate(&sub(0));
        let stale = q.enqueue_activate(&sub(0)).unwrap();
        assert_eq!(stale.direction, Direction::Activate);
        assert_eq!(q.activate_count(), 1);
    }

    #[test]
    fn out_of_range_enqueue_is_refused() {
        let mut q = PendingQueues::new(2);
        let refused = q.enqueue_activate(&sub(5)).unwrap();
        assert_eq!(refused.slot(), 5);
        assert!(q.is_empty());
    }

    #[test]
    fn scans_lowest_slot_first() {
        let mut q = PendingQueues::new(3);
        q.enqueue_deactivate(&sub(2));
        q.enqueue_deactivate(&sub(1));
        q.enqueue_activate(&sub(0));
        assert_eq!(q.next_deactivate_slot(), Some(1));
        assert_eq!(q.next_activate_slot(), Some(0));
        assert_eq!(q.clear_slot(1).len(), 1);
        assert_eq!(q.next_deactivate_slot(), Some(2));
    }

    #[test]
    fn take_targeting_drops_only_that_card() {
        let mut q = PendingQueues::new(3);
        q.enqueue_activate(&Subscription::for_app(0, 1, 0, &card(), SubscriptionStatus::Deactivated));
        q.enqueue_activate(&sub(1));
        q.enqueue_deactivate(&sub(2));

        let dropped = q.take_targeting(1);
        assert_eq!(dropped.len(), 2);
        assert!(dropped.iter().all(|r| r.subscription.lives_on(1)));
        assert!(q.activate(0).is_none());
        assert!(q.activate(1).is_none());
        assert!(q.deactivate(2).is_some());
    }

    #[test]
    fn validate_accepts_matching_app() {
        let cards = vec![Some(card()), None];
        let ctx = ValidationContext {
            slot_count: 2,
            max_apps: 8,
            radio_on: &[true, true],
            cards: &cards,
        };
        let req = PendingRequest::new(&sub(0), Direction::Activate);
        assert_eq!(
            validate(&req, &ctx),
            Ok(CardTarget {
                card_slot: 0,
                app_index: 0
            })
        );
    }

    #[test]
    fn validate_rejects_bounds_and_missing_apps() {
        let cards = vec![Some(card()), None];
        let ctx = ValidationContext {
            slot_count: 2,
            max_apps: 8,
            radio_on: &[true, false],
            cards: &cards,
        };

        let mut s = sub(0);
        s.app_index = Some(3);
        assert_eq!(
            validate(&PendingRequest::new(&s, Direction::Activate), &ctx),
            Err(InvalidRequest::AppMissing(3))
        );

        s.app_index = Some(9);
        assert!(matches!(
            validate(&PendingRequest::new(&s, Direction::Activate), &ctx),
            Err(InvalidRequest::AppIndexOutOfRange { .. })
        ));

        s = sub(0);
        s.app_type = AppType::Csim;
        assert_eq!(
            validate(&PendingRequest::new(&s, Direction::Activate), &ctx),
            Err(InvalidRequest::AppChanged(0))
        );

        assert_eq!(
            validate(&PendingRequest::new(&sub(1), Direction::Activate), &ctx),
            Err(InvalidRequest::RadioOff(1))
        );

        let mut far = sub(0);
        far.slot_id = Some(7);
        assert_eq!(
            validate(&PendingRequest::new(&far, Direction::Deactivate), &ctx),
            Err(InvalidRequest::CardSlotOutOfRange(Some(7)))
        );
    }

    #[test]
    fn validate_rejects_absent_card() {
        let cards = vec![Some(card()), None];
        let ctx = ValidationContext {
            slot_count: 2,
            max_apps: 8,
            radio_on: &[true, true],
            cards: &cards,
        };
        let s = Subscription::for_app(1, 1, 0, &card(), SubscriptionStatus::Deactivated);
        assert_eq!(
            validate(&PendingRequest::new(&s, Direction::Activate), &ctx),
            Err(InvalidRequest::CardUnavailable(1))
        );
    }
}
