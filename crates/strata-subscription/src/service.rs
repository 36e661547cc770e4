//! Async front end: runs a [`SubscriptionManager`] on one tokio task.
//!
//! Events and caller requests arrive on separate channels; the task owns
//! the manager and handles one message at a time. A periodic tick checks
//! command and drain timeouts. After each message a fresh
//! [`SubscriptionSnapshot`] is published on a `watch` channel, so queries
//! never round-trip through the task.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ManagerConfig;
use crate::error::SubscriptionError;
use crate::event::{Event, EventReceiver, EventSender};
use crate::model::{SlotId, Subscription, SubscriptionData};
use crate::orchestrator::{SetSubscriptionOutcome, SubscriptionManager};
use crate::ports::Collaborators;
use crate::registrants::{ListenerId, NoticeKind, NoticeReceiver};
use crate::snapshot::SubscriptionSnapshot;

const REQUEST_QUEUE_DEPTH: usize = 64;

enum Request {
    SetSubscription {
        desired: SubscriptionData,
        reply: oneshot::Sender<Result<SetSubscriptionOutcome, SubscriptionError>>,
    },
    SetDataSubscription {
        slot: SlotId,
        reply: oneshot::Sender<Result<(), SubscriptionError>>,
    },
    Register {
        slot: SlotId,
        kind: NoticeKind,
        reply: oneshot::Sender<(ListenerId, NoticeReceiver)>,
    },
    Unregister {
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
}

pub struct SubscriptionService;

impl SubscriptionService {
    /// Spawn the service task. Must be called inside a tokio runtime.
    pub fn spawn(config: ManagerConfig, collaborators: Collaborators) -> (SubscriptionHandle, ServiceTask) {
        let (events, event_rx) = EventSender::channel();
        Self::spawn_with_events(config, collaborators, events, event_rx)
    }

    /// Spawn on an existing event channel, for collaborators that need to
    /// post events of their own (unsolicited status, radio power).
    pub fn spawn_with_events(
        config: ManagerConfig,
        collaborators: Collaborators,
        events: EventSender,
        event_rx: EventReceiver,
    ) -> (SubscriptionHandle, ServiceTask) {
        let tick_interval = config.tick_interval;
        let manager = SubscriptionManager::new(config, collaborators, events.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(manager.snapshot());
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(run(
            manager,
            event_rx,
            request_rx,
            snapshot_tx,
            shutdown_rx,
            tick_interval,
        ));

        let handle = SubscriptionHandle {
            events,
            requests: request_tx,
            snapshots: snapshot_rx,
        };
        let task = ServiceTask {
            shutdown: shutdown_tx,
            join,
        };
        (handle, task)
    }
}

async fn run(
    mut manager: SubscriptionManager,
    mut events: EventReceiver,
    mut requests: mpsc::Receiver<Request>,
    snapshots: watch::Sender<SubscriptionSnapshot>,
    mut shutdown: watch::Receiver<bool>,
    tick_interval: Duration,
) {
    let mut tick = tokio::time::interval(tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(slots = manager.slot_count(), "subscription service started");

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(event) = events.recv() => manager.handle_event(event),
            request = requests.recv() => match request {
                Some(request) => handle_request(&mut manager, request),
                None => {
                    tracing::debug!("all handles dropped");
                    break;
                }
            },
            _ = tick.tick() => manager.poll_timeouts(Instant::now()),
        }

        snapshots.send_if_modified(|current| {
            let next = manager.snapshot();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    tracing::info!("subscription service stopped");
}

fn handle_request(manager: &mut SubscriptionManager, request: Request) {
    match request {
        Request::SetSubscription { desired, reply } => {
            // Rejections are answered through `reply`.
            let _ = manager.try_set_subscription(desired, Some(reply));
        }
        Request::SetDataSubscription { slot, reply } => {
            let _ = manager.set_data_subscription(slot, Some(reply));
        }
        Request::Register { slot, kind, reply } => {
            let _ = reply.send(manager.register(slot, kind));
        }
        Request::Unregister { id, reply } => {
            let _ = reply.send(manager.unregister(id));
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cloneable handle to a running service.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    events: EventSender,
    requests: mpsc::Sender<Request>,
    snapshots: watch::Receiver<SubscriptionSnapshot>,
}

impl SubscriptionHandle {
    /// Queue an event (radio power, card hot-plug, unsolicited status).
    /// Returns false once the service is gone.
    pub fn post(&self, event: Event) -> bool {
        self.events.send(event)
    }

    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, SubscriptionError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| SubscriptionError::ServiceStopped)?;
        rx.await.map_err(|_| SubscriptionError::ServiceStopped)
    }

    /// Run a request cycle and wait for its per-slot causes.
    pub async fn set_subscription(
        &self,
        desired: SubscriptionData,
    ) -> Result<SetSubscriptionOutcome, SubscriptionError> {
        self.request(|reply| Request::SetSubscription { desired, reply })
            .await?
    }

    /// Switch data to `slot` and wait for the modem's answer.
    pub async fn set_data_subscription(&self, slot: SlotId) -> Result<(), SubscriptionError> {
        self.request(|reply| Request::SetDataSubscription { slot, reply })
            .await?
    }

    pub async fn register(
        &self,
        slot: SlotId,
        kind: NoticeKind,
    ) -> Result<(ListenerId, NoticeReceiver), SubscriptionError> {
        self.request(|reply| Request::Register { slot, kind, reply })
            .await
    }

    pub async fn unregister(&self, id: ListenerId) -> Result<bool, SubscriptionError> {
        self.request(|reply| Request::Unregister { id, reply }).await
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<SubscriptionSnapshot> {
        self.snapshots.clone()
    }

    pub fn current_subscription(&self, slot: SlotId) -> Option<Subscription> {
        self.snapshots.borrow().current_subscription(slot).cloned()
    }

    pub fn is_sub_active(&self, slot: SlotId) -> bool {
        self.snapshots.borrow().is_sub_active(slot)
    }

    pub fn active_subscriptions_count(&self) -> usize {
        self.snapshots.borrow().active_subscriptions_count()
    }

    /// Wait until a published snapshot satisfies `pred`.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&SubscriptionSnapshot) -> bool,
    ) -> Result<SubscriptionSnapshot, SubscriptionError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(pred)
            .await
            .map_err(|_| SubscriptionError::ServiceStopped)?;
        Ok(snapshot.clone())
    }
}

/// Owner side of the service task. Dropping it stops the service.
pub struct ServiceTask {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ServiceTask {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "subscription service task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
