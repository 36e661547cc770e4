//! Errors surfaced through the public API.

use thiserror::Error;

use crate::event::CommandError;
use crate::model::SlotId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscription slot {0} out of range")]
    InvalidSlot(SlotId),
    #[error("subscription {0} not active")]
    NotActive(SlotId),
    #[error("DDS switch in progress")]
    SwitchInProgress,
    #[error("set subscription already in progress")]
    SetSubscriptionInProgress,
    #[error("modem command failed: {0}")]
    CommandFailed(#[from] CommandError),
    #[error("subscription service stopped")]
    ServiceStopped,
}
