//! Typed listener registry: one registration per (slot, notice kind).

use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::{Cause, SlotId, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Activated,
    Deactivated,
    NewCardAvailable,
    DataSubscriptionChanged,
}

/// Notification delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Activated {
        slot: SlotId,
        subscription: Subscription,
    },
    Deactivated {
        slot: SlotId,
        cause: Cause,
    },
    NewCardAvailable {
        slot: SlotId,
        icc_id: Option<String>,
    },
    DataSubscriptionChanged {
        slot: SlotId,
    },
}

impl Notice {
    pub fn kind(&self) -> NoticeKind {
        match self {
            Notice::Activated { .. } => NoticeKind::Activated,
            Notice::Deactivated { .. } => NoticeKind::Deactivated,
            Notice::NewCardAvailable { .. } => NoticeKind::NewCardAvailable,
            Notice::DataSubscriptionChanged { .. } => NoticeKind::DataSubscriptionChanged,
        }
    }

    pub fn slot(&self) -> SlotId {
        match self {
            Notice::Activated { slot, .. }
            | Notice::Deactivated { slot, .. }
            | Notice::NewCardAvailable { slot, .. }
            | Notice::DataSubscriptionChanged { slot } => *slot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

#[derive(Debug)]
struct Registrant {
    id: ListenerId,
    slot: SlotId,
    kind: NoticeKind,
    tx: mpsc::UnboundedSender<Notice>,
}

#[derive(Debug, Default)]
pub struct Registrants {
    next_id: u64,
    entries: Vec<Registrant>,
}

impl Registrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, slot: SlotId, kind: NoticeKind) -> (ListenerId, NoticeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register_sender(slot, kind, tx), rx)
    }

    pub fn register_sender(
        &mut self,
        slot: SlotId,
        kind: NoticeKind,
        tx: mpsc::UnboundedSender<Notice>,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push(Registrant { id, slot, kind, tx });
        id
    }

    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|r| r.id != id);
        self.entries.len() != before
    }

    /// Deliver to every listener of the notice's (slot, kind). Listeners
    /// whose receiver is gone are pruned.
    pub fn notify(&mut self, notice: &Notice) -> usize {
        let (slot, kind) = (notice.slot(), notice.kind());
        let mut delivered = 0;
        self.entries.retain(|r| {
            if r.slot != slot || r.kind != kind {
                return true;
            }
            match r.tx.send(notice.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn count(&self, slot: SlotId, kind: NoticeKind) -> usize {
        self.entries
            .iter()
            .filter(|r| r.slot == slot && r.kind == kind)
            .count()
    }
}
