//! Typed events consumed by the dispatch loop, and the completion handles
//! collaborators use to post their answers back into it.
//!
//! Every modem command carries a [`Completion`]. Whoever talks to the modem
//! calls [`Completion::complete`] once the response arrives, from any
//! thread; the result re-enters the loop as the matching [`Event`] variant.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{CardUnavailableReason, Direction, SlotId};

/// Identifies one issued modem command. Completions whose token does not
/// match the outstanding command are stale and get discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandToken(pub u64);

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Failure reported by the modem for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("request not supported")]
    NotSupported,
    #[error("generic failure")]
    GenericFailure,
    #[error("radio not available")]
    RadioNotAvailable,
}

pub type CommandResult = Result<(), CommandError>;

/// Everything the dispatch loop reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RadioOn {
        slot: SlotId,
    },
    RadioOff {
        slot: SlotId,
    },
    /// Physical card slot has fresh application info.
    CardInfoAvailable {
        slot: usize,
    },
    CardInfoUnavailable {
        slot: usize,
        reason: CardUnavailableReason,
    },
    /// Unsolicited modem report.
    SubscriptionStatusChanged {
        slot: SlotId,
        activated: bool,
    },
    SetUiccSubscriptionDone {
        slot: SlotId,
        direction: Direction,
        token: CommandToken,
        result: CommandResult,
    },
    SetDataSubscriptionDone {
        slot: SlotId,
        token: CommandToken,
        result: CommandResult,
    },
    SetSubscriptionModeDone {
        count: usize,
        token: CommandToken,
        result: CommandResult,
    },
    AllDataDisconnected {
        slot: SlotId,
    },
    CleanupDataConnectionDone {
        slot: SlotId,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RadioOn { .. } => "radio_on",
            Event::RadioOff { .. } => "radio_off",
            Event::CardInfoAvailable { .. } => "card_info_available",
            Event::CardInfoUnavailable { .. } => "card_info_unavailable",
            Event::SubscriptionStatusChanged { .. } => "subscription_status_changed",
            Event::SetUiccSubscriptionDone { .. } => "set_uicc_subscription_done",
            Event::SetDataSubscriptionDone { .. } => "set_data_subscription_done",
            Event::SetSubscriptionModeDone { .. } => "set_subscription_mode_done",
            Event::AllDataDisconnected { .. } => "all_data_disconnected",
            Event::CleanupDataConnectionDone { .. } => "cleanup_data_connection_done",
        }
    }
}

// ── Event channel ───────────────────────────────────────────────────

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Cloneable sending side of the dispatch loop's event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn channel() -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, rx)
    }

    /// Queue an event. Returns false once the loop has gone away.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

// ── Completions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionKind {
    Uicc { slot: SlotId, direction: Direction },
    DataSubscription { slot: SlotId },
    SubscriptionMode { count: usize },
}

/// One-shot answer handle attached to a modem command.
#[derive(Debug)]
#[must_use = "a dropped completion leaves the command outstanding until it times out"]
pub struct Completion {
    tx: EventSender,
    token: CommandToken,
    kind: CompletionKind,
}

impl Completion {
    pub(crate) fn uicc(
        tx: EventSender,
        token: CommandToken,
        slot: SlotId,
        direction: Direction,
    ) -> Self {
        Self {
            tx,
            token,
            kind: CompletionKind::Uicc { slot, direction },
        }
    }

    pub(crate) fn data_subscription(tx: EventSender, token: CommandToken, slot: SlotId) -> Self {
        Self {
            tx,
            token,
            kind: CompletionKind::DataSubscription { slot },
        }
    }

    pub(crate) fn subscription_mode(tx: EventSender, token: CommandToken, count: usize) -> Self {
        Self {
            tx,
            token,
            kind: CompletionKind::SubscriptionMode { count },
        }
    }

    pub fn token(&self) -> CommandToken {
        self.token
    }

    /// Post the modem's answer back into the dispatch loop.
    pub fn complete(self, result: CommandResult) {
        let token = self.token;
        let event = match self.kind {
            CompletionKind::Uicc { slot, direction } => Event::SetUiccSubscriptionDone {
                slot,
                direction,
                token,
                result,
            },
            CompletionKind::DataSubscription { slot } => Event::SetDataSubscriptionDone {
                slot,
                token,
                result,
            },
            CompletionKind::SubscriptionMode { count } => Event::SetSubscriptionModeDone {
                count,
                token,
                result,
            },
        };
        if !self.tx.send(event) {
            tracing::debug!(%token, "completion dropped, dispatch loop gone");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataNotice {
    CleanupDone,
    AllDisconnected,
}

/// Callback handle given to the data connectivity coordinator.
#[derive(Debug)]
pub struct DataNotifier {
    tx: EventSender,
    slot: SlotId,
    notice: DataNotice,
}

impl DataNotifier {
    pub(crate) fn cleanup_done(tx: EventSender, slot: SlotId) -> Self {
        Self {
            tx,
            slot,
            notice: DataNotice::CleanupDone,
        }
    }

    pub(crate) fn all_disconnected(tx: EventSender, slot: SlotId) -> Self {
        Self {
            tx,
            slot,
            notice: DataNotice::AllDisconnected,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn notify(self) {
        let event = match self.notice {
            DataNotice::CleanupDone => Event::CleanupDataConnectionDone { slot: self.slot },
            DataNotice::AllDisconnected => Event::AllDataDisconnected { slot: self.slot },
        };
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_posts_matching_event() {
        let (tx, mut rx) = EventSender::channel();
        let done = Completion::uicc(tx.clone(), CommandToken(7), 1, Direction::Deactivate);
        assert_eq!(done.token(), CommandToken(7));
        done.complete(Err(CommandError::NotSupported));

        assert_eq!(
            rx.try_recv().unwrap(),
            Event::SetUiccSubscriptionDone {
                slot: 1,
                direction: Direction::Deactivate,
                token: CommandToken(7),
                result: Err(CommandError::NotSupported),
            }
        );

        Completion::subscription_mode(tx, CommandToken(8), 2).complete(Ok(()));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::SetSubscriptionModeDone { count: 2, .. }
        ));
    }

    #[test]
    fn data_notifier_posts_slot_event() {
        let (tx, mut rx) = EventSender::channel();
        DataNotifier::all_disconnected(tx.clone(), 0).notify();
        DataNotifier::cleanup_done(tx, 0).notify();
        assert_eq!(rx.try_recv().unwrap(), Event::AllDataDisconnected { slot: 0 });
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::CleanupDataConnectionDone { slot: 0 }
        );
    }

    #[test]
    fn send_after_receiver_drop_reports_false() {
        let (tx, rx) = EventSender::channel();
        drop(rx);
        assert!(!tx.send(Event::RadioOn { slot: 0 }));
    }
}
