//! Queue scan, command issue and completion handling.
//!
//! After every state change [`SubscriptionManager::process_next`] picks the
//! next unit of work, in this order:
//!
//! 1. pending deactivations (draining data first on the DDS slot)
//! 2. a DDS switch
//! 3. a subscription mode change ahead of activations
//! 4. pending activations
//!
//! Once nothing is queued or in flight the caller's cycle completes.

use std::time::Instant;

use crate::error::SubscriptionError;
use crate::event::{CommandError, CommandResult, CommandToken, Completion, Event};
use crate::model::{Cause, Direction, SlotId, Subscription, SubscriptionData, SubscriptionStatus};
use crate::pending::{validate, CardTarget, PendingRequest};
use crate::ports::UiccSubscriptionRequest;
use crate::preference::UserPreference;
use crate::registrants::Notice;

use super::{
    Command, Cycle, DrainPurpose, Outstanding, SetSubscriptionOutcome, SetSubscriptionReply,
    SubscriptionManager,
};

impl SubscriptionManager {
    /// Queue the work needed to reach `desired`.
    ///
    /// Slots already in the desired state report `NoChange`. A slot asked to
    /// move to a different application is deactivated first; the new
    /// application is queued once that succeeds. Rejections are sent through
    /// `reply` as well as returned.
    pub fn try_set_subscription(
        &mut self,
        desired: SubscriptionData,
        reply: Option<SetSubscriptionReply>,
    ) -> Result<(), SubscriptionError> {
        let rejection = if self.cycle.is_some() {
            Some(SubscriptionError::SetSubscriptionInProgress)
        } else {
            desired
                .subscriptions
                .iter()
                .find(|s| !self.table.contains(s.sub_id))
                .map(|s| SubscriptionError::InvalidSlot(s.sub_id))
        };
        if let Some(err) = rejection {
            tracing::warn!(error = %err, "set_subscription rejected");
            if let Some(reply) = reply {
                let _ = reply.send(Err(err.clone()));
            }
            return Err(err);
        }

        let n = self.table.len();
        let mut cycle = Cycle {
            desired: vec![None; n],
            causes: vec![None; n],
            reply,
        };
        let mut waiting = false;

        for sub in desired.subscriptions {
            let slot = sub.sub_id;
            let Some(direction) = sub.status.desired_direction() else {
                continue;
            };
            let record = self.table.get(slot);
            let current = record.subscription.clone();
            let status = record.status();
            cycle.desired[slot] = Some(sub.clone());

            match direction {
                Direction::Activate => {
                    let same_app = current.is_same_app(&sub);
                    let queued_same = self
                        .pending
                        .activate(slot)
                        .is_some_and(|p| p.subscription.is_same_app(&sub));
                    if status == SubscriptionStatus::Activated && same_app {
                        cycle.causes[slot] = Some(Cause::NoChange);
                    } else if (status == SubscriptionStatus::Activate && same_app) || queued_same {
                        tracing::debug!(slot, "activation already under way");
                        waiting = true;
                    } else if matches!(
                        status,
                        SubscriptionStatus::Activated | SubscriptionStatus::Activate
                    ) {
                        tracing::info!(slot, "switching application, deactivating current first");
                        self.pending.enqueue_deactivate(&current);
                        waiting = true;
                    } else {
                        if let Some(evicted) = self.pending.enqueue_activate(&sub) {
                            tracing::debug!(slot, direction = %evicted.direction, "replaced pending request");
                        }
                        waiting = true;
                    }
                }
                Direction::Deactivate => {
                    if matches!(
                        status,
                        SubscriptionStatus::Activated | SubscriptionStatus::Activate
                    ) {
                        self.pending.enqueue_deactivate(&current);
                        waiting = true;
                    } else if status == SubscriptionStatus::Deactivate {
                        tracing::debug!(slot, "deactivation already under way");
                        waiting = true;
                    } else if self.pending.take_activate(slot).is_some() {
                        tracing::debug!(slot, "pending activation withdrawn");
                        cycle.causes[slot] = Some(Cause::DeactivateSuccess);
                    } else {
                        cycle.causes[slot] = Some(Cause::NoChange);
                    }
                }
            }
        }

        if !waiting {
            tracing::info!("set_subscription: nothing to do");
            if let Some(reply) = cycle.reply.take() {
                let _ = reply.send(Ok(SetSubscriptionOutcome {
                    causes: cycle.causes,
                }));
            }
            return Ok(());
        }

        tracing::info!(
            activates = self.pending.activate_count(),
            deactivates = self.pending.deactivate_count(),
            "set_subscription cycle started"
        );
        self.cycle = Some(cycle);
        self.process_next();
        Ok(())
    }

    pub(super) fn process_next(&mut self) {
        if self.is_busy() {
            return;
        }
        if self.start_next_pending_deactivate() {
            return;
        }
        if self.advance_dds_switch() {
            return;
        }
        if self.update_subscription_mode() {
            return;
        }
        if self.start_next_pending_activate() {
            return;
        }
        self.finish_cycle_if_idle();
    }

    /// Take the next valid deactivation, lowest slot first. Returns true
    /// once a command or drain was started.
    fn start_next_pending_deactivate(&mut self) -> bool {
        while let Some(slot) = self.pending.next_deactivate_slot() {
            let Some(request) = self.pending.take_deactivate(slot) else {
                break;
            };
            if self.table.get(slot).status() != SubscriptionStatus::Activated {
                tracing::debug!(slot, "nothing active to deactivate");
                self.record_cause(slot, Cause::NoChange);
                continue;
            }
            let target = match validate(&request, &self.validation_context()) {
                Ok(target) => target,
                Err(reason) => {
                    tracing::warn!(slot, %reason, "dropping invalid deactivate request");
                    self.record_cause(slot, Cause::SubscriptionInvalid);
                    continue;
                }
            };
            if self.dds == Some(slot) {
                self.start_drain(slot, DrainPurpose::Deactivate { request, target });
            } else {
                self.issue_uicc(request, target, false);
            }
            return true;
        }
        false
    }

    fn start_next_pending_activate(&mut self) -> bool {
        while let Some(slot) = self.pending.next_activate_slot() {
            let Some(request) = self.pending.take_activate(slot) else {
                break;
            };
            if self.table.get(slot).status() != SubscriptionStatus::Deactivated {
                tracing::warn!(slot, status = %self.table.get(slot).status(), "dropping activate request for busy slot");
                self.record_cause(slot, Cause::SubscriptionInvalid);
                continue;
            }
            let target = match validate(&request, &self.validation_context()) {
                Ok(target) => target,
                Err(reason) => {
                    tracing::warn!(slot, %reason, "dropping invalid activate request");
                    self.record_cause(slot, Cause::SubscriptionInvalid);
                    continue;
                }
            };
            self.issue_uicc(request, target, false);
            return true;
        }
        false
    }

    /// Tell the modem how many subscriptions will be active before the
    /// activations go out.
    ///
    /// The count is taken from the queues when the dispatcher is free, so
    /// requests queued together get one mode command. A card that shows up
    /// while an older mode is on the wire costs one corrective mode command
    /// once that answer is in, still ahead of any activation.
    fn update_subscription_mode(&mut self) -> bool {
        let activates = self.pending.activate_count();
        if activates == 0 {
            return false;
        }
        let wanted = (self.table.active_count() + activates).clamp(1, self.table.len());
        if self.subscription_mode == Some(wanted) {
            return false;
        }
        let token = self.next_token();
        tracing::info!(count = wanted, %token, "setting subscription mode");
        self.outstanding = Some(Outstanding {
            token,
            command: Command::SubscriptionMode { count: wanted },
            issued_at: Instant::now(),
            abandoned: false,
        });
        self.radio.set_subscription_mode(
            wanted,
            Completion::subscription_mode(self.events.clone(), token, wanted),
        );
        true
    }

    /// Put a validated request on the wire. The slot moves to the pending
    /// status of the request's direction.
    pub(super) fn issue_uicc(&mut self, request: PendingRequest, target: CardTarget, was_dds: bool) {
        let slot = request.slot();
        let direction = request.direction;
        let was_ready = self.table.get(slot).ready;
        self.table.update(
            slot,
            request.subscription.clone(),
            direction.pending_status(),
            None,
        );
        if direction == Direction::Activate {
            self.modem_ready_hint[slot] = false;
        }

        let token = self.next_token();
        tracing::info!(
            slot,
            %token,
            %direction,
            card_slot = target.card_slot,
            app_index = target.app_index,
            "issuing uicc subscription"
        );
        self.outstanding = Some(Outstanding {
            token,
            command: Command::Uicc {
                request,
                was_dds,
                was_ready,
            },
            issued_at: Instant::now(),
            abandoned: false,
        });
        self.radio.set_uicc_subscription(
            UiccSubscriptionRequest {
                slot_id: target.card_slot,
                app_index: target.app_index,
                sub_id: slot,
                direction,
            },
            Completion::uicc(self.events.clone(), token, slot, direction),
        );
    }

    /// Take the outstanding command if `token` answers it.
    ///
    /// An abandoned command is consumed without touching state: it only
    /// frees the dispatcher for the next unit of work, and `None` is returned.
    pub(super) fn take_outstanding(&mut self, token: CommandToken) -> Option<Command> {
        match self.outstanding.as_ref() {
            Some(out) if out.token == token && out.abandoned => {
                self.outstanding = None;
                tracing::debug!(%token, "abandoned command answered, dispatcher released");
                self.process_next();
                None
            }
            Some(out) if out.token == token => self.outstanding.take().map(|o| o.command),
            _ => {
                tracing::debug!(%token, "discarding stale completion");
                None
            }
        }
    }

    pub(super) fn on_uicc_done(
        &mut self,
        slot: SlotId,
        direction: Direction,
        token: CommandToken,
        result: CommandResult,
    ) {
        if !self.radio_on.get(slot).copied().unwrap_or(false) {
            tracing::debug!(slot, %token, "discarding completion, radio off");
            return;
        }
        let Some(command) = self.take_outstanding(token) else {
            return;
        };
        let Command::Uicc {
            request,
            was_dds,
            was_ready,
        } = command
        else {
            tracing::warn!(slot, %token, "completion kind does not match command");
            self.process_next();
            return;
        };
        debug_assert_eq!(direction, request.direction);

        match (request.direction, result) {
            (Direction::Activate, Ok(())) => self.activation_succeeded(request),
            (Direction::Activate, Err(e)) => self.activation_failed(request, e),
            (Direction::Deactivate, Ok(())) => self.deactivation_succeeded(request),
            (Direction::Deactivate, Err(e)) => {
                self.deactivation_failed(request, e, was_dds, was_ready)
            }
        }
        self.settle();
    }

    fn activation_succeeded(&mut self, request: PendingRequest) {
        let slot = request.slot();
        self.table.update(
            slot,
            request.subscription,
            SubscriptionStatus::Activated,
            Some(Cause::ActivateSuccess),
        );
        if std::mem::take(&mut self.modem_ready_hint[slot]) {
            self.table.set_ready(slot, true);
        }
        self.new_card[slot] = false;
        self.record_cause(slot, Cause::ActivateSuccess);

        let subscription = self.table.get(slot).subscription.clone();
        let pref = UserPreference::from_subscription(&subscription, SubscriptionStatus::Activated);
        if let Err(e) = self.prefs.set_user_preference(slot, &pref) {
            tracing::warn!(slot, error = %e, "failed to persist user preference");
        }
        tracing::info!(
            slot,
            app_type = %subscription.app_type,
            ready = self.table.get(slot).ready,
            "subscription activated"
        );
        self.notify(Notice::Activated { slot, subscription });
    }

    fn activation_failed(&mut self, request: PendingRequest, error: CommandError) {
        let slot = request.slot();
        let cause = match error {
            CommandError::NotSupported => Cause::ActivateNotSupported,
            _ => Cause::ActivateFailed,
        };
        tracing::warn!(slot, %error, %cause, "activation failed");
        // A deactivate queued behind the failed activation has nothing left to do.
        let collapsed = self.pending.deactivate(slot).is_some();
        self.reset_slot(slot, cause, false);
        if !collapsed {
            return;
        }
        match self.desired_activation(slot) {
            Some(next) => {
                tracing::info!(slot, "promoting desired application");
                self.pending.enqueue_activate(&next);
            }
            None => {
                tracing::debug!(slot, "queued deactivation collapsed");
                self.record_cause(slot, Cause::DeactivateSuccess);
            }
        }
    }

    /// The running cycle's desired activation for `slot`, if any.
    fn desired_activation(&self, slot: SlotId) -> Option<Subscription> {
        self.cycle
            .as_ref()
            .and_then(|c| c.desired.get(slot).cloned().flatten())
            .filter(|s| s.status.desired_direction() == Some(Direction::Activate))
    }

    fn deactivation_succeeded(&mut self, request: PendingRequest) {
        let slot = request.slot();
        let desired = self
            .cycle
            .as_ref()
            .and_then(|c| c.desired.get(slot).cloned().flatten());

        self.reset_slot(slot, Cause::DeactivateSuccess, true);

        match desired {
            Some(next) if next.status.desired_direction() == Some(Direction::Activate) => {
                tracing::info!(slot, "promoting desired application");
                self.pending.enqueue_activate(&next);
            }
            Some(_) => {
                let pref = UserPreference::from_subscription(
                    &request.subscription,
                    SubscriptionStatus::Deactivated,
                );
                if let Err(e) = self.prefs.set_user_preference(slot, &pref) {
                    tracing::warn!(slot, error = %e, "failed to persist user preference");
                }
            }
            None => {}
        }
    }

    fn deactivation_failed(
        &mut self,
        request: PendingRequest,
        error: CommandError,
        was_dds: bool,
        was_ready: bool,
    ) {
        let slot = request.slot();
        let cause = match error {
            CommandError::NotSupported => Cause::DeactivateNotSupported,
            _ => Cause::DeactivateFailed,
        };
        tracing::warn!(slot, %error, %cause, "deactivation failed");
        self.table.update(
            slot,
            request.subscription,
            SubscriptionStatus::Activated,
            Some(cause),
        );
        if was_ready {
            self.table.set_ready(slot, true);
        }
        self.record_cause(slot, cause);
        if was_dds && self.table.get(slot).is_ready() {
            self.restore_dds(slot);
        }
    }

    pub(super) fn on_subscription_mode_done(
        &mut self,
        count: usize,
        token: CommandToken,
        result: CommandResult,
    ) {
        if self.take_outstanding(token).is_none() {
            return;
        }
        match result {
            Ok(()) => tracing::info!(count, "subscription mode set"),
            Err(e) => tracing::warn!(count, error = %e, "subscription mode failed, continuing"),
        }
        self.subscription_mode = Some(count);
        self.process_next();
    }

    fn finish_cycle_if_idle(&mut self) {
        if !self.pending.is_empty() || self.dds_switch.is_some() {
            return;
        }
        let Some(mut cycle) = self.cycle.take() else {
            return;
        };
        let outcome = SetSubscriptionOutcome {
            causes: std::mem::take(&mut cycle.causes),
        };
        tracing::info!(causes = ?outcome.causes, "set_subscription cycle complete");
        if let Some(reply) = cycle.reply.take() {
            if reply.send(Ok(outcome)).is_err() {
                tracing::debug!("set_subscription caller went away");
            }
        }
    }

    /// Fail commands and end drains that have been waiting too long.
    pub fn poll_timeouts(&mut self, now: Instant) {
        let expired = self.outstanding.as_ref().and_then(|out| {
            (now.saturating_duration_since(out.issued_at) >= self.config.command_timeout)
                .then(|| timeout_event(out))
        });
        if let Some(event) = expired {
            tracing::warn!(event = event.name(), "modem command timed out");
            self.handle_event(event);
        }

        let drain_expired = self
            .drain
            .as_ref()
            .is_some_and(|d| now.saturating_duration_since(d.started_at) >= self.config.drain_timeout);
        if drain_expired {
            if let Some(slot) = self.drain.as_ref().map(|d| d.slot) {
                tracing::warn!(slot, "data drain timed out, treating as drained");
            }
            self.finish_drain();
        }
    }
}

/// Synthetic failure completion for a timed-out command.
fn timeout_event(out: &Outstanding) -> Event {
    let token = out.token;
    let result = Err(CommandError::GenericFailure);
    match &out.command {
        Command::Uicc { request, .. } => Event::SetUiccSubscriptionDone {
            slot: request.slot(),
            direction: request.direction,
            token,
            result,
        },
        Command::DataSubscription { slot } => Event::SetDataSubscriptionDone {
            slot: *slot,
            token,
            result,
        },
        Command::SubscriptionMode { count } => Event::SetSubscriptionModeDone {
            count: *count,
            token,
            result,
        },
    }
}
