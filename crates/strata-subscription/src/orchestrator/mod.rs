//! # Subscription Orchestrator
//!
//! Owns the per-slot state table, the pending request queues and the DDS
//! switch. Everything runs on one consumer: [`SubscriptionManager::handle_event`]
//! and the public entry points take `&mut self`, so no state is shared and
//! nothing is locked.
//!
//! At most one modem command is outstanding at a time. A data drain holds
//! the dispatcher as well, so a deactivation of the data slot never reaches
//! the modem before its sessions are gone.
//!
//! Submodules split the work:
//! - `card`: radio power, card hot-plug, unsolicited status reports
//! - `dispatch`: queue scan, command issue, completions, request cycles
//! - `dds`: data subscription arbitration and data drains

mod card;
mod dds;
mod dispatch;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::ManagerConfig;
use crate::error::SubscriptionError;
use crate::event::{CommandToken, Event, EventSender};
use crate::model::{CardInfo, Cause, SlotId, Subscription, SubscriptionData};
use crate::pending::{CardTarget, PendingQueues, PendingRequest, ValidationContext};
use crate::ports::{CardInventory, Collaborators, DataConnectivityCoordinator, RadioCommandChannel};
use crate::preference::{PreferenceError, PreferenceStore};
use crate::registrants::{ListenerId, Notice, NoticeKind, NoticeReceiver, Registrants};
use crate::snapshot::{Selectors, SubscriptionSnapshot};
use crate::table::{CurrentSubscriptionRecord, SubscriptionTable};

/// Per-slot causes of a finished `set_subscription` cycle. `None` for slots
/// the caller did not ask about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SetSubscriptionOutcome {
    pub causes: Vec<Option<Cause>>,
}

impl SetSubscriptionOutcome {
    pub fn cause(&self, slot: SlotId) -> Option<Cause> {
        self.causes.get(slot).copied().flatten()
    }

    pub fn all_succeeded(&self) -> bool {
        self.causes.iter().flatten().all(|c| c.is_success())
    }
}

pub type SetSubscriptionReply = oneshot::Sender<Result<SetSubscriptionOutcome, SubscriptionError>>;
pub type DataSubscriptionReply = oneshot::Sender<Result<(), SubscriptionError>>;

// ── In-flight bookkeeping ───────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Uicc {
        request: PendingRequest,
        /// Slot held the DDS before its drain; restored if deactivation fails.
        was_dds: bool,
        was_ready: bool,
    },
    DataSubscription {
        slot: SlotId,
    },
    SubscriptionMode {
        count: usize,
    },
}

#[derive(Debug)]
struct Outstanding {
    token: CommandToken,
    command: Command,
    issued_at: Instant,
    /// The slot it targeted was reset while the modem still holds the
    /// command. Its completion only releases the dispatcher.
    abandoned: bool,
}

impl Outstanding {
    fn slot(&self) -> Option<SlotId> {
        match &self.command {
            Command::Uicc { request, .. } => Some(request.slot()),
            Command::DataSubscription { slot } => Some(*slot),
            Command::SubscriptionMode { .. } => None,
        }
    }
}

#[derive(Debug)]
enum DrainPurpose {
    Deactivate {
        request: PendingRequest,
        target: CardTarget,
    },
    DdsSwitch,
}

#[derive(Debug)]
struct Drain {
    slot: SlotId,
    purpose: DrainPurpose,
    started_at: Instant,
    disconnected: bool,
    cleaned_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchPhase {
    /// Not started; the dispatcher was busy.
    Waiting,
    /// Data on the previous DDS is being torn down.
    Draining,
    /// Previous DDS is drained (or there was none).
    Drained,
    /// `set_data_subscription` is on the wire.
    Commanded,
}

#[derive(Debug)]
struct DdsSwitch {
    target: SlotId,
    previous: Option<SlotId>,
    phase: SwitchPhase,
    reply: Option<DataSubscriptionReply>,
}

#[derive(Debug)]
struct Cycle {
    desired: Vec<Option<Subscription>>,
    causes: Vec<Option<Cause>>,
    reply: Option<SetSubscriptionReply>,
}

#[derive(Debug, Clone, Copy)]
enum Selector {
    Default,
    Voice,
    Sms,
    Data,
}

impl Selector {
    const ALL: [Selector; 4] = [
        Selector::Default,
        Selector::Voice,
        Selector::Sms,
        Selector::Data,
    ];

    fn name(self) -> &'static str {
        match self {
            Selector::Default => "default",
            Selector::Voice => "voice",
            Selector::Sms => "sms",
            Selector::Data => "data",
        }
    }

    fn get(self, prefs: &dyn PreferenceStore) -> Option<SlotId> {
        match self {
            Selector::Default => prefs.get_default_subscription(),
            Selector::Voice => prefs.get_voice_subscription(),
            Selector::Sms => prefs.get_sms_subscription(),
            Selector::Data => prefs.get_data_subscription(),
        }
    }

    fn set(self, prefs: &mut dyn PreferenceStore, slot: SlotId) -> Result<(), PreferenceError> {
        match self {
            Selector::Default => prefs.set_default_subscription(slot),
            Selector::Voice => prefs.set_voice_subscription(slot),
            Selector::Sms => prefs.set_sms_subscription(slot),
            Selector::Data => prefs.set_data_subscription(slot),
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────

pub struct SubscriptionManager {
    config: ManagerConfig,
    table: SubscriptionTable,
    pending: PendingQueues,
    registrants: Registrants,

    card_inventory: Arc<dyn CardInventory>,
    radio: Arc<dyn RadioCommandChannel>,
    data: Arc<dyn DataConnectivityCoordinator>,
    prefs: Box<dyn PreferenceStore>,
    events: EventSender,

    radio_on: Vec<bool>,
    /// Cached card info by physical slot.
    cards: Vec<Option<CardInfo>>,
    /// Modem reported the slot active before the activation completed.
    modem_ready_hint: Vec<bool>,
    new_card: Vec<bool>,

    outstanding: Option<Outstanding>,
    drain: Option<Drain>,
    dds: Option<SlotId>,
    dds_switch: Option<DdsSwitch>,
    subscription_mode: Option<usize>,
    cycle: Option<Cycle>,
    next_token: u64,
}

impl SubscriptionManager {
    /// `events` must feed back into [`handle_event`](Self::handle_event);
    /// completions handed to collaborators post through it.
    pub fn new(config: ManagerConfig, collaborators: Collaborators, events: EventSender) -> Self {
        let n = config.slot_count;
        tracing::info!(
            slots = n,
            auto_activate = config.auto_activate_new_cards,
            "subscription manager created"
        );
        Self {
            table: SubscriptionTable::new(n),
            pending: PendingQueues::new(n),
            registrants: Registrants::new(),
            card_inventory: collaborators.cards,
            radio: collaborators.radio,
            data: collaborators.data,
            prefs: collaborators.preferences,
            events,
            radio_on: vec![config.radio_on_at_start; n],
            cards: vec![None; n],
            modem_ready_hint: vec![false; n],
            new_card: vec![false; n],
            outstanding: None,
            drain: None,
            dds: None,
            dds_switch: None,
            subscription_mode: None,
            cycle: None,
            next_token: 0,
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn slot_count(&self) -> usize {
        self.table.len()
    }

    /// Process one event from the queue.
    pub fn handle_event(&mut self, event: Event) {
        tracing::trace!(event = event.name(), "handling event");
        match event {
            Event::RadioOn { slot } => self.on_radio_on(slot),
            Event::RadioOff { slot } => self.on_radio_off(slot),
            Event::CardInfoAvailable { slot } => self.on_card_info_available(slot),
            Event::CardInfoUnavailable { slot, reason } => {
                self.on_card_info_unavailable(slot, reason)
            }
            Event::SubscriptionStatusChanged { slot, activated } => {
                self.on_subscription_status_changed(slot, activated)
            }
            Event::SetUiccSubscriptionDone {
                slot,
                direction,
                token,
                result,
            } => self.on_uicc_done(slot, direction, token, result),
            Event::SetDataSubscriptionDone {
                slot,
                token,
                result,
            } => self.on_data_subscription_done(slot, token, result),
            Event::SetSubscriptionModeDone {
                count,
                token,
                result,
            } => self.on_subscription_mode_done(count, token, result),
            Event::AllDataDisconnected { slot } => self.on_drain_notice(slot, true),
            Event::CleanupDataConnectionDone { slot } => self.on_drain_notice(slot, false),
        }
    }

    // ── Caller API ──────────────────────────────────────────────────

    /// Start a request cycle towards `desired`. Returns false when a cycle
    /// is already running or a subscription id is out of range.
    pub fn set_subscription(
        &mut self,
        desired: SubscriptionData,
        reply: Option<SetSubscriptionReply>,
    ) -> bool {
        self.try_set_subscription(desired, reply).is_ok()
    }

    pub fn register(&mut self, slot: SlotId, kind: NoticeKind) -> (ListenerId, NoticeReceiver) {
        self.registrants.register(slot, kind)
    }

    pub fn register_for_subscription_activated(
        &mut self,
        slot: SlotId,
    ) -> (ListenerId, NoticeReceiver) {
        self.register(slot, NoticeKind::Activated)
    }

    pub fn register_for_subscription_deactivated(
        &mut self,
        slot: SlotId,
    ) -> (ListenerId, NoticeReceiver) {
        self.register(slot, NoticeKind::Deactivated)
    }

    pub fn unregister(&mut self, id: ListenerId) -> bool {
        self.registrants.unregister(id)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get_current_subscription(&self, slot: SlotId) -> Option<&Subscription> {
        self.table
            .contains(slot)
            .then(|| &self.table.get(slot).subscription)
    }

    pub fn record(&self, slot: SlotId) -> Option<&CurrentSubscriptionRecord> {
        self.table.contains(slot).then(|| self.table.get(slot))
    }

    pub fn is_sub_active(&self, slot: SlotId) -> bool {
        self.table.contains(slot) && self.table.get(slot).is_active()
    }

    pub fn get_active_subscriptions_count(&self) -> usize {
        self.table.active_count()
    }

    pub fn table(&self) -> &SubscriptionTable {
        &self.table
    }

    pub fn pending(&self) -> &PendingQueues {
        &self.pending
    }

    pub fn dds(&self) -> Option<SlotId> {
        self.dds
    }

    pub fn is_dds_switch_in_progress(&self) -> bool {
        self.dds_switch.is_some()
    }

    pub fn is_set_subscription_in_progress(&self) -> bool {
        self.cycle.is_some()
    }

    /// A command or data drain holds the dispatcher.
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some() || self.drain.is_some()
    }

    pub fn is_draining(&self, slot: SlotId) -> bool {
        self.drain.as_ref().is_some_and(|d| d.slot == slot)
    }

    pub fn preferences(&self) -> &dyn PreferenceStore {
        self.prefs.as_ref()
    }

    pub fn preferences_mut(&mut self) -> &mut dyn PreferenceStore {
        self.prefs.as_mut()
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        let prefs = self.prefs.as_ref();
        SubscriptionSnapshot {
            records: self.table.records().to_vec(),
            dds: self.dds,
            radio_on: self.radio_on.clone(),
            card_present: self.cards.iter().map(Option::is_some).collect(),
            new_card: self.new_card.clone(),
            set_subscription_in_progress: self.cycle.is_some(),
            dds_switch_in_progress: self.dds_switch.is_some(),
            command_outstanding: self.outstanding.is_some(),
            subscription_mode: self.subscription_mode,
            selectors: Selectors {
                default: prefs.get_default_subscription(),
                voice: prefs.get_voice_subscription(),
                sms: prefs.get_sms_subscription(),
                data: prefs.get_data_subscription(),
            },
        }
    }

    // ── Shared helpers ──────────────────────────────────────────────

    fn next_token(&mut self) -> CommandToken {
        self.next_token += 1;
        CommandToken(self.next_token)
    }

    fn validation_context(&self) -> ValidationContext<'_> {
        ValidationContext {
            slot_count: self.table.len(),
            max_apps: self.config.max_apps_per_card,
            radio_on: &self.radio_on,
            cards: &self.cards,
        }
    }

    fn notify(&mut self, notice: Notice) {
        let delivered = self.registrants.notify(&notice);
        tracing::debug!(slot = notice.slot(), kind = ?notice.kind(), delivered, "notice sent");
    }

    /// Record a cause against the running cycle, if the caller asked about the slot.
    fn record_cause(&mut self, slot: SlotId, cause: Cause) {
        if let Some(cycle) = self.cycle.as_mut() {
            if cycle.desired.get(slot).is_some_and(Option::is_some) {
                cycle.causes[slot] = Some(cause);
            }
        }
    }

    /// Re-check selectors and DDS after a table change, then dispatch.
    fn settle(&mut self) {
        self.converge_selectors();
        self.evaluate_dds();
        self.process_next();
    }

    /// Point selectors at active subscriptions. A sole active subscription
    /// takes all four.
    fn converge_selectors(&mut self) {
        let active = self.table.active_slots();
        let Some(&first) = active.first() else {
            return;
        };
        let sole = active.len() == 1;
        for selector in Selector::ALL {
            let current = selector.get(self.prefs.as_ref());
            let stale = if sole {
                current != Some(first)
            } else {
                !current.is_some_and(|s| active.contains(&s))
            };
            if !stale {
                continue;
            }
            match selector.set(self.prefs.as_mut(), first) {
                Ok(()) => tracing::info!(
                    selector = selector.name(),
                    slot = first,
                    previous = ?current,
                    "subscription selector updated"
                ),
                Err(e) => tracing::warn!(
                    selector = selector.name(),
                    slot = first,
                    error = %e,
                    "failed to persist subscription selector"
                ),
            }
        }
    }

    /// Forget the command in flight for `slot` without waiting for it. The
    /// modem drops commands for a slot that lost radio power.
    fn drop_outstanding_for(&mut self, slot: SlotId) {
        if self.outstanding.as_ref().and_then(Outstanding::slot) == Some(slot) {
            if let Some(out) = self.outstanding.take() {
                tracing::debug!(slot, token = %out.token, "dropping in-flight command, radio off");
            }
        }
    }

    /// Force a slot back to an empty `Deactivated` record.
    ///
    /// Pending requests for the slot are dropped and any drain on it ends. A
    /// command in flight for it is marked abandoned but keeps the dispatcher
    /// until the modem answers or it times out; only radio power loss
    /// ([`drop_outstanding_for`](Self::drop_outstanding_for)) forgets it
    /// outright. Callers follow up with [`settle`](Self::settle).
    fn reset_slot(&mut self, slot: SlotId, cause: Cause, notify: bool) {
        for dropped in self.pending.clear_slot(slot) {
            tracing::debug!(slot, direction = %dropped.direction, "pending request dropped on reset");
        }
        self.record_cause(slot, cause);

        if let Some(out) = self
            .outstanding
            .as_mut()
            .filter(|o| o.slot() == Some(slot) && !o.abandoned)
        {
            out.abandoned = true;
            tracing::debug!(slot, token = %out.token, "abandoning in-flight command, awaiting its completion");
        }

        if self.drain.as_ref().is_some_and(|d| d.slot == slot) {
            if let Some(drain) = self.drain.take() {
                if matches!(drain.purpose, DrainPurpose::DdsSwitch) {
                    if let Some(switch) = self.dds_switch.as_mut() {
                        switch.phase = SwitchPhase::Drained;
                    }
                }
            }
        }

        if self.dds == Some(slot) {
            tracing::info!(slot, "data subscription lost");
            self.dds = None;
        }
        if let Some(switch) = self.dds_switch.as_mut() {
            if switch.previous == Some(slot) {
                switch.previous = None;
            }
        }
        if self.dds_switch.as_ref().is_some_and(|s| s.target == slot) {
            self.cancel_dds_switch(SubscriptionError::NotActive(slot));
        }

        self.table.reset(slot);
        self.table.set_cause(slot, cause);
        self.modem_ready_hint[slot] = false;
        tracing::info!(slot, %cause, "subscription reset");

        if notify {
            self.notify(Notice::Deactivated { slot, cause });
        }
    }
}
