//! Collaborator interfaces the orchestrator drives.
//!
//! None of these may block. Radio commands and data-drain requests answer
//! later through the [`Completion`] / [`DataNotifier`] they are handed.

use std::sync::Arc;

use crate::event::{Completion, DataNotifier};
use crate::model::{AppDescriptor, Direction, SlotId};
use crate::preference::PreferenceStore;

/// Reports which applications the inserted card carries.
pub trait CardInventory: Send + Sync {
    fn get_icc_id(&self, slot: usize) -> Option<String>;
    fn get_card_applications(&self, slot: usize) -> Vec<AppDescriptor>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiccSubscriptionRequest {
    /// Physical card slot.
    pub slot_id: usize,
    pub app_index: usize,
    pub sub_id: SlotId,
    pub direction: Direction,
}

/// Opaque asynchronous command channel to the modem.
pub trait RadioCommandChannel: Send + Sync {
    fn set_uicc_subscription(&self, request: UiccSubscriptionRequest, done: Completion);
    fn set_data_subscription(&self, sub_id: SlotId, done: Completion);
    fn set_subscription_mode(&self, count: usize, done: Completion);
}

/// Owner of the data-session stack.
pub trait DataConnectivityCoordinator: Send + Sync {
    /// Tear down data on `sub_id`; `on_cleanup` fires once teardown was issued.
    fn disable_data_connectivity(&self, sub_id: SlotId, on_cleanup: DataNotifier);
    fn enable_data_connectivity(&self, sub_id: SlotId);
    /// `notify` fires once no data session remains on `sub_id`
    /// (immediately if none is up).
    fn register_for_all_data_disconnected(&self, sub_id: SlotId, notify: DataNotifier);
}

/// Everything the orchestrator needs from the outside world.
pub struct Collaborators {
    pub cards: Arc<dyn CardInventory>,
    pub radio: Arc<dyn RadioCommandChannel>,
    pub data: Arc<dyn DataConnectivityCoordinator>,
    pub preferences: Box<dyn PreferenceStore>,
}
