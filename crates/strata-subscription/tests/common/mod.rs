//! Shared harness: a manager wired to recording mock collaborators, with
//! the event queue pumped synchronously.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use strata_subscription::event::EventReceiver;
use strata_subscription::preference::MemoryPreferenceStore;
use strata_subscription::sim::StaticCardInventory;
use strata_subscription::{
    AppDescriptor, AppType, CardInfo, CommandError, Collaborators, Completion, DataNotifier,
    DataConnectivityCoordinator, Direction, Event, EventSender, ManagerConfig,
    RadioCommandChannel, SetSubscriptionOutcome, SlotId, Subscription, SubscriptionData,
    SubscriptionError, SubscriptionManager, SubscriptionStatus, UiccSubscriptionRequest,
};
use tokio::sync::oneshot;

pub type CycleReply = oneshot::Receiver<Result<SetSubscriptionOutcome, SubscriptionError>>;
pub type DataReply = oneshot::Receiver<Result<(), SubscriptionError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Uicc(UiccSubscriptionRequest),
    DataSubscription(SlotId),
    SubscriptionMode(usize),
}

impl RadioCall {
    /// Logical slot the command acts on; `None` for the mode command.
    pub fn slot(&self) -> Option<SlotId> {
        match self {
            RadioCall::Uicc(request) => Some(request.sub_id),
            RadioCall::DataSubscription(slot) => Some(*slot),
            RadioCall::SubscriptionMode(_) => None,
        }
    }
}

/// Radio that records every command and holds its completion until the
/// test answers it. Commands the manager has stopped waiting for (timed out,
/// or dropped on radio off) can be moved aside into `expired` so `waiting`
/// counts only the ones still owed an answer.
#[derive(Default)]
pub struct MockRadio {
    calls: Mutex<Vec<RadioCall>>,
    waiting: Mutex<VecDeque<(RadioCall, Completion)>>,
    expired: Mutex<VecDeque<(RadioCall, Completion)>>,
}

impl MockRadio {
    fn push(&self, call: RadioCall, done: Completion) {
        self.calls.lock().unwrap().push(call.clone());
        self.waiting.lock().unwrap().push_back((call, done));
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.lock().unwrap().len()
    }

    pub fn peek(&self) -> Option<RadioCall> {
        self.waiting.lock().unwrap().front().map(|(c, _)| c.clone())
    }

    fn pop(&self) -> Option<(RadioCall, Completion)> {
        self.waiting.lock().unwrap().pop_front()
    }

    /// Move every waiting command aside.
    pub fn expire_waiting(&self) {
        let mut waiting = self.waiting.lock().unwrap();
        self.expired.lock().unwrap().extend(waiting.drain(..));
    }

    /// Move aside the waiting commands that act on `slot`.
    pub fn expire_slot(&self, slot: SlotId) {
        let mut waiting = self.waiting.lock().unwrap();
        let mut expired = self.expired.lock().unwrap();
        let mut kept = VecDeque::new();
        for (call, done) in waiting.drain(..) {
            if call.slot() == Some(slot) {
                expired.push_back((call, done));
            } else {
                kept.push_back((call, done));
            }
        }
        *waiting = kept;
    }

    fn pop_expired(&self) -> Option<(RadioCall, Completion)> {
        self.expired.lock().unwrap().pop_front()
    }
}

impl RadioCommandChannel for MockRadio {
    fn set_uicc_subscription(&self, request: UiccSubscriptionRequest, done: Completion) {
        self.push(RadioCall::Uicc(request), done);
    }

    fn set_data_subscription(&self, sub_id: SlotId, done: Completion) {
        self.push(RadioCall::DataSubscription(sub_id), done);
    }

    fn set_subscription_mode(&self, count: usize, done: Completion) {
        self.push(RadioCall::SubscriptionMode(count), done);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCall {
    Disable(SlotId),
    Enable(SlotId),
    WatchDisconnected(SlotId),
}

/// Data coordinator that either answers drains at once or holds the
/// notifiers for the test to release.
pub struct MockData {
    auto_drain: Mutex<bool>,
    calls: Mutex<Vec<DataCall>>,
    cleanup: Mutex<Vec<DataNotifier>>,
    disconnected: Mutex<Vec<DataNotifier>>,
}

impl Default for MockData {
    fn default() -> Self {
        Self {
            auto_drain: Mutex::new(true),
            calls: Mutex::new(Vec::new()),
            cleanup: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        }
    }
}

impl MockData {
    pub fn set_auto_drain(&self, auto: bool) {
        *self.auto_drain.lock().unwrap() = auto;
    }

    pub fn calls(&self) -> Vec<DataCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn auto(&self) -> bool {
        *self.auto_drain.lock().unwrap()
    }

    pub fn held_notifiers(&self) -> usize {
        self.cleanup.lock().unwrap().len() + self.disconnected.lock().unwrap().len()
    }

    pub fn release_cleanup(&self) {
        for n in self.cleanup.lock().unwrap().drain(..) {
            n.notify();
        }
    }

    pub fn release_disconnected(&self) {
        for n in self.disconnected.lock().unwrap().drain(..) {
            n.notify();
        }
    }
}

impl DataConnectivityCoordinator for MockData {
    fn disable_data_connectivity(&self, sub_id: SlotId, on_cleanup: DataNotifier) {
        self.calls.lock().unwrap().push(DataCall::Disable(sub_id));
        if self.auto() {
            on_cleanup.notify();
        } else {
            self.cleanup.lock().unwrap().push(on_cleanup);
        }
    }

    fn enable_data_connectivity(&self, sub_id: SlotId) {
        self.calls.lock().unwrap().push(DataCall::Enable(sub_id));
    }

    fn register_for_all_data_disconnected(&self, sub_id: SlotId, notify: DataNotifier) {
        self.calls
            .lock()
            .unwrap()
            .push(DataCall::WatchDisconnected(sub_id));
        if self.auto() {
            notify.notify();
        } else {
            self.disconnected.lock().unwrap().push(notify);
        }
    }
}

pub struct Harness {
    pub mgr: SubscriptionManager,
    rx: EventReceiver,
    pub events: EventSender,
    pub cards: Arc<StaticCardInventory>,
    pub radio: Arc<MockRadio>,
    pub data: Arc<MockData>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(ManagerConfig::default(), MemoryPreferenceStore::new())
    }

    pub fn with(config: ManagerConfig, prefs: MemoryPreferenceStore) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let cards = Arc::new(StaticCardInventory::new(config.slot_count));
        let radio = Arc::new(MockRadio::default());
        let data = Arc::new(MockData::default());
        let (events, rx) = EventSender::channel();
        let mgr = SubscriptionManager::new(
            config,
            Collaborators {
                cards: cards.clone(),
                radio: radio.clone(),
                data: data.clone(),
                preferences: Box::new(prefs),
            },
            events.clone(),
        );
        Self {
            mgr,
            rx,
            events,
            cards,
            radio,
            data,
        }
    }

    /// Feed queued events into the manager until the queue is empty.
    pub fn pump(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.mgr.handle_event(event);
        }
    }

    pub fn post(&mut self, event: Event) {
        self.mgr.handle_event(event);
        self.pump();
    }

    pub fn insert_card(&mut self, slot: usize, card: CardInfo) {
        assert!(self.cards.insert(slot, card));
        self.post(Event::CardInfoAvailable { slot });
    }

    /// Answer the oldest waiting radio command.
    pub fn complete_next(&mut self, result: Result<(), CommandError>) -> RadioCall {
        let (call, done) = self.radio.pop().expect("no radio command waiting");
        done.complete(result);
        self.pump();
        call
    }

    /// Answer the oldest waiting radio command, if any.
    pub fn try_complete_next(&mut self, result: Result<(), CommandError>) -> Option<RadioCall> {
        let (call, done) = self.radio.pop()?;
        done.complete(result);
        self.pump();
        Some(call)
    }

    /// Deliver a late answer for the oldest expired command, if any.
    pub fn complete_expired(&mut self, result: Result<(), CommandError>) -> Option<RadioCall> {
        let (call, done) = self.radio.pop_expired()?;
        done.complete(result);
        self.pump();
        Some(call)
    }

    /// Answer every radio command with success until none is left. A
    /// successful activation is followed by the modem's ready report.
    pub fn drive(&mut self) -> Vec<RadioCall> {
        let mut answered = Vec::new();
        for _ in 0..64 {
            let Some((call, done)) = self.radio.pop() else {
                return answered;
            };
            done.complete(Ok(()));
            self.pump();
            if let RadioCall::Uicc(UiccSubscriptionRequest {
                sub_id,
                direction: Direction::Activate,
                ..
            }) = &call
            {
                self.post(Event::SubscriptionStatusChanged {
                    slot: *sub_id,
                    activated: true,
                });
            }
            answered.push(call);
        }
        panic!("radio commands did not settle");
    }

    /// Start a request cycle and pump whatever it set off.
    pub fn set_subscription(&mut self, subs: Vec<Subscription>) -> CycleReply {
        let (tx, rx) = oneshot::channel();
        self.mgr.set_subscription(SubscriptionData::new(subs), Some(tx));
        self.pump();
        rx
    }

    pub fn set_data_subscription(
        &mut self,
        slot: SlotId,
    ) -> (Result<(), SubscriptionError>, DataReply) {
        let (tx, rx) = oneshot::channel();
        let accepted = self.mgr.set_data_subscription(slot, Some(tx));
        self.pump();
        (accepted, rx)
    }

    /// Bring up `slot` with `card` and its default application, active,
    /// ready and settled.
    pub fn activate_slot(&mut self, slot: usize, card: CardInfo) {
        self.insert_card(slot, card);
        self.drive();
        assert!(self.mgr.table().get(slot).is_ready(), "slot {slot} not ready");
    }
}

pub fn usim_card(icc: &str) -> CardInfo {
    CardInfo {
        icc_id: Some(icc.into()),
        apps: vec![AppDescriptor {
            app_type: AppType::Usim,
            app_id: "A0000000871002".into(),
        }],
    }
}

/// CSIM at index 0, USIM at index 1.
pub fn dual_card(icc: &str) -> CardInfo {
    CardInfo {
        icc_id: Some(icc.into()),
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

pub fn desired(
    slot: usize,
    app_index: usize,
    card: &CardInfo,
    status: SubscriptionStatus,
) -> Subscription {
    Subscription::for_app(slot, slot, app_index, card, status)
}
