//! Simulated collaborators for local runs and runtime tests.
//!
//! The radio answers every command after a configurable delay (plus random
//! jitter) and reports the subscription ready after a successful
//! activation. Data drains complete immediately.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::config::SimulationConfig;
use crate::event::{CommandError, Completion, DataNotifier, Event, EventSender};
use crate::model::{AppDescriptor, CardInfo, Direction, SlotId};
use crate::ports::{
    CardInventory, Collaborators, DataConnectivityCoordinator, RadioCommandChannel,
    UiccSubscriptionRequest,
};
use crate::preference::PreferenceStore;

// ── Card inventory ──────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StaticCardInventory {
    cards: Mutex<Vec<Option<CardInfo>>>,
}

impl StaticCardInventory {
    pub fn new(slot_count: usize) -> Self {
        Self {
            cards: Mutex::new(vec![None; slot_count]),
        }
    }

    pub fn from_config(config: &SimulationConfig, slot_count: usize) -> Self {
        let inventory = Self::new(slot_count);
        for card in &config.cards {
            inventory.insert(card.slot, card.card.clone());
        }
        inventory
    }

    /// Place a card. Returns false for an out-of-range slot.
    pub fn insert(&self, slot: usize, card: CardInfo) -> bool {
        let mut cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        match cards.get_mut(slot) {
            Some(entry) => {
                *entry = Some(card);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, slot: usize) -> Option<CardInfo> {
        let mut cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        cards.get_mut(slot).and_then(Option::take)
    }

    /// Physical slots that currently hold a card.
    pub fn occupied_slots(&self) -> Vec<usize> {
        let cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        cards
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(slot, _)| slot)
            .collect()
    }

    fn with_card<T>(&self, slot: usize, f: impl FnOnce(&CardInfo) -> T) -> Option<T> {
        let cards = self.cards.lock().unwrap_or_else(|e| e.into_inner());
        cards.get(slot).and_then(Option::as_ref).map(f)
    }
}

impl CardInventory for StaticCardInventory {
    fn get_icc_id(&self, slot: usize) -> Option<String> {
        self.with_card(slot, |c| c.icc_id.clone()).flatten()
    }

    fn get_card_applications(&self, slot: usize) -> Vec<AppDescriptor> {
        self.with_card(slot, |c| c.apps.clone()).unwrap_or_default()
    }
}

// ── Radio ───────────────────────────────────────────────────────────

/// Modem stand-in that answers on a tokio timer.
///
/// Must be driven from inside a tokio runtime.
#[derive(Debug)]
pub struct SimulatedRadio {
    reply_delay: Duration,
    reply_jitter: Duration,
    /// Physical slots whose activations fail.
    fail_activation: Mutex<HashSet<usize>>,
    events: EventSender,
}

impl SimulatedRadio {
    pub fn new(config: &SimulationConfig, events: EventSender) -> Self {
        let fail_activation = config
            .cards
            .iter()
            .filter(|c| c.fail_activation)
            .map(|c| c.slot)
            .collect();
        Self {
            reply_delay: config.reply_delay,
            reply_jitter: config.reply_jitter,
            fail_activation: Mutex::new(fail_activation),
            events,
        }
    }

    pub fn set_fail_activation(&self, card_slot: usize, fail: bool) {
        let mut set = self.fail_activation.lock().unwrap_or_else(|e| e.into_inner());
        if fail {
            set.insert(card_slot);
        } else {
            set.remove(&card_slot);
        }
    }

    fn fails(&self, card_slot: usize) -> bool {
        self.fail_activation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&card_slot)
    }

    fn delay(&self) -> Duration {
        let jitter_ms = self.reply_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.reply_delay;
        }
        self.reply_delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    fn reply_later(&self, done: Completion, result: Result<(), CommandError>, then: Option<Event>) {
        let delay = self.delay();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            done.complete(result);
            if let Some(event) = then {
                events.send(event);
            }
        });
    }
}

impl RadioCommandChannel for SimulatedRadio {
    fn set_uicc_subscription(&self, request: UiccSubscriptionRequest, done: Completion) {
        let activate = request.direction == Direction::Activate;
        if activate && self.fails(request.slot_id) {
            tracing::debug!(card_slot = request.slot_id, "simulated activation failure");
            self.reply_later(done, Err(CommandError::GenericFailure), None);
            return;
        }
        let ready = activate.then_some(Event::SubscriptionStatusChanged {
            slot: request.sub_id,
            activated: true,
        });
        self.reply_later(done, Ok(()), ready);
    }

    fn set_data_subscription(&self, _sub_id: SlotId, done: Completion) {
        self.reply_later(done, Ok(()), None);
    }

    fn set_subscription_mode(&self, _count: usize, done: Completion) {
        self.reply_later(done, Ok(()), None);
    }
}

// ── Data connectivity ───────────────────────────────────────────────

/// Data stack stand-in with no sessions to tear down.
#[derive(Debug, Default)]
pub struct ImmediateDataCoordinator {
    enabled: Mutex<HashSet<SlotId>>,
}

impl ImmediateDataCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, slot: SlotId) -> bool {
        self.enabled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&slot)
    }
}

impl DataConnectivityCoordinator for ImmediateDataCoordinator {
    fn disable_data_connectivity(&self, sub_id: SlotId, on_cleanup: DataNotifier) {
        self.enabled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&sub_id);
        on_cleanup.notify();
    }

    fn enable_data_connectivity(&self, sub_id: SlotId) {
        self.enabled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sub_id);
    }

    fn register_for_all_data_disconnected(&self, _sub_id: SlotId, notify: DataNotifier) {
        notify.notify();
    }
}

// ── Wiring ──────────────────────────────────────────────────────────

/// Simulated collaborators plus typed handles to the card and data stand-ins.
pub struct SimulatedCollaborators {
    pub cards: Arc<StaticCardInventory>,
    pub radio: Arc<SimulatedRadio>,
    pub data: Arc<ImmediateDataCoordinator>,
}

impl SimulatedCollaborators {
    pub fn new(config: &SimulationConfig, slot_count: usize, events: EventSender) -> Self {
        Self {
            cards: Arc::new(StaticCardInventory::from_config(config, slot_count)),
            radio: Arc::new(SimulatedRadio::new(config, events)),
            data: Arc::new(ImmediateDataCoordinator::new()),
        }
    }

    pub fn collaborators(&self, preferences: Box<dyn PreferenceStore>) -> Collaborators {
        Collaborators {
            cards: self.cards.clone(),
            radio: self.radio.clone(),
            data: self.data.clone(),
            preferences,
        }
    }
}
