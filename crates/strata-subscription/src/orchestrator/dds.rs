//! Designated data subscription (DDS) arbitration.
//!
//! A switch drains data on the previous DDS before the modem is told about
//! the new one. Success persists the new data selector and enables data on
//! the target; failure re-enables data on the previous DDS.

use std::time::Instant;

use crate::error::SubscriptionError;
use crate::event::{CommandResult, CommandToken, Completion, DataNotifier};
use crate::model::SlotId;
use crate::registrants::Notice;

use super::{
    Command, DataSubscriptionReply, DdsSwitch, Drain, DrainPurpose, Outstanding,
    SubscriptionManager, SwitchPhase,
};

fn reply_with(reply: Option<DataSubscriptionReply>, result: Result<(), SubscriptionError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

impl SubscriptionManager {
    /// Make `slot` the data subscription. The slot must be active and ready.
    ///
    /// Errors are sent through `reply` as well as returned. An accepted
    /// switch answers through `reply` once the modem confirmed it.
    pub fn set_data_subscription(
        &mut self,
        slot: SlotId,
        reply: Option<DataSubscriptionReply>,
    ) -> Result<(), SubscriptionError> {
        let check = if !self.table.contains(slot) {
            Err(SubscriptionError::InvalidSlot(slot))
        } else if self.dds_switch.is_some() {
            Err(SubscriptionError::SwitchInProgress)
        } else if !self.table.get(slot).is_ready() {
            Err(SubscriptionError::NotActive(slot))
        } else {
            Ok(())
        };
        if let Err(err) = check {
            tracing::warn!(slot, error = %err, "set_data_subscription rejected");
            reply_with(reply, Err(err.clone()));
            return Err(err);
        }

        if self.dds == Some(slot) {
            if let Err(e) = self.prefs.set_data_subscription(slot) {
                tracing::warn!(slot, error = %e, "failed to persist data subscription");
            }
            reply_with(reply, Ok(()));
            return Ok(());
        }

        tracing::info!(slot, previous = ?self.dds, "data subscription switch requested");
        self.dds_switch = Some(DdsSwitch {
            target: slot,
            previous: self.dds,
            phase: SwitchPhase::Waiting,
            reply,
        });
        self.process_next();
        Ok(())
    }

    /// Start a switch when the slot that should carry data is ready and
    /// does not yet.
    pub(super) fn evaluate_dds(&mut self) {
        if self.dds_switch.is_some() {
            return;
        }
        let active = self.table.active_slots();
        let desired = match active.as_slice() {
            [] => None,
            [sole] => Some(*sole),
            _ => self
                .prefs
                .get_data_subscription()
                .filter(|s| active.contains(s)),
        };
        let Some(target) = desired else {
            return;
        };
        if self.dds == Some(target) || !self.table.get(target).is_ready() {
            return;
        }
        tracing::info!(slot = target, previous = ?self.dds, "data subscription needs to move");
        self.dds_switch = Some(DdsSwitch {
            target,
            previous: self.dds,
            phase: SwitchPhase::Waiting,
            reply: None,
        });
    }

    /// Move the current switch one step. Returns true while it holds the
    /// dispatcher.
    pub(super) fn advance_dds_switch(&mut self) -> bool {
        let Some((target, phase, previous)) = self
            .dds_switch
            .as_ref()
            .map(|s| (s.target, s.phase, s.previous))
        else {
            return false;
        };
        if !self.table.get(target).is_ready() {
            tracing::warn!(slot = target, "data subscription target no longer ready");
            self.cancel_dds_switch(SubscriptionError::NotActive(target));
            return false;
        }
        match (phase, previous) {
            (SwitchPhase::Waiting, Some(previous)) if previous != target => {
                self.start_drain(previous, DrainPurpose::DdsSwitch);
                if let Some(switch) = self.dds_switch.as_mut() {
                    switch.phase = SwitchPhase::Draining;
                }
                true
            }
            (SwitchPhase::Waiting, _) | (SwitchPhase::Drained, _) => {
                self.issue_data_subscription(target);
                true
            }
            (SwitchPhase::Draining, _) | (SwitchPhase::Commanded, _) => true,
        }
    }

    fn issue_data_subscription(&mut self, slot: SlotId) {
        let token = self.next_token();
        tracing::info!(slot, %token, "issuing data subscription");
        if let Some(switch) = self.dds_switch.as_mut() {
            switch.phase = SwitchPhase::Commanded;
        }
        self.outstanding = Some(Outstanding {
            token,
            command: Command::DataSubscription { slot },
            issued_at: Instant::now(),
            abandoned: false,
        });
        self.radio.set_data_subscription(
            slot,
            Completion::data_subscription(self.events.clone(), token, slot),
        );
    }

    pub(super) fn on_data_subscription_done(
        &mut self,
        slot: SlotId,
        token: CommandToken,
        result: CommandResult,
    ) {
        if self.take_outstanding(token).is_none() {
            return;
        }
        let Some(switch) = self.dds_switch.take() else {
            tracing::debug!(slot, "data subscription completion without a switch");
            self.process_next();
            return;
        };

        match result {
            Ok(()) if self.table.get(switch.target).is_ready() => {
                let target = switch.target;
                self.dds = Some(target);
                if let Err(e) = self.prefs.set_data_subscription(target) {
                    tracing::warn!(slot = target, error = %e, "failed to persist data subscription");
                }
                self.data.enable_data_connectivity(target);
                tracing::info!(slot = target, previous = ?switch.previous, "data subscription changed");
                self.notify(Notice::DataSubscriptionChanged { slot: target });
                reply_with(switch.reply, Ok(()));
            }
            Ok(()) => {
                self.rollback_switch(switch.previous);
                reply_with(switch.reply, Err(SubscriptionError::NotActive(switch.target)));
            }
            Err(e) => {
                tracing::warn!(slot = switch.target, error = %e, "data subscription switch failed");
                self.rollback_switch(switch.previous);
                reply_with(switch.reply, Err(SubscriptionError::CommandFailed(e)));
            }
        }
        self.process_next();
    }

    /// Drop the current switch, re-enabling data on the previous DDS if its
    /// drain had started.
    pub(super) fn cancel_dds_switch(&mut self, error: SubscriptionError) {
        let Some(switch) = self.dds_switch.take() else {
            return;
        };
        if self
            .drain
            .as_ref()
            .is_some_and(|d| matches!(d.purpose, DrainPurpose::DdsSwitch))
        {
            self.drain = None;
        }
        if let Some(out) = self
            .outstanding
            .as_mut()
            .filter(|o| matches!(o.command, Command::DataSubscription { .. }))
        {
            out.abandoned = true;
        }
        if switch.phase != SwitchPhase::Waiting {
            self.rollback_switch(switch.previous);
        }
        tracing::info!(slot = switch.target, error = %error, "data subscription switch cancelled");
        reply_with(switch.reply, Err(error));
    }

    fn rollback_switch(&mut self, previous: Option<SlotId>) {
        if let Some(previous) = previous {
            if self.table.get(previous).is_ready() {
                tracing::info!(slot = previous, "re-enabling data on previous subscription");
                self.data.enable_data_connectivity(previous);
            }
        }
    }

    /// Put the DDS back on `slot` after its deactivation failed.
    pub(super) fn restore_dds(&mut self, slot: SlotId) {
        tracing::info!(slot, "restoring data subscription");
        self.dds = Some(slot);
        self.data.enable_data_connectivity(slot);
        if let Some(switch) = self.dds_switch.as_mut() {
            if switch.previous.is_none() && switch.target != slot {
                switch.previous = Some(slot);
            }
        }
    }

    // ── Data drains ─────────────────────────────────────────────────

    pub(super) fn start_drain(&mut self, slot: SlotId, purpose: DrainPurpose) {
        tracing::info!(slot, "draining data sessions");
        self.drain = Some(Drain {
            slot,
            purpose,
            started_at: Instant::now(),
            disconnected: false,
            cleaned_up: false,
        });
        self.data
            .disable_data_connectivity(slot, DataNotifier::cleanup_done(self.events.clone(), slot));
        self.data.register_for_all_data_disconnected(
            slot,
            DataNotifier::all_disconnected(self.events.clone(), slot),
        );
    }

    /// `all_disconnected` distinguishes the two notices a drain waits for.
    pub(super) fn on_drain_notice(&mut self, slot: SlotId, all_disconnected: bool) {
        let Some(drain) = self.drain.as_mut().filter(|d| d.slot == slot) else {
            tracing::debug!(slot, all_disconnected, "data notice without a matching drain");
            return;
        };
        if all_disconnected {
            drain.disconnected = true;
        } else {
            drain.cleaned_up = true;
        }
        if drain.disconnected && drain.cleaned_up {
            self.finish_drain();
        }
    }

    pub(super) fn finish_drain(&mut self) {
        let Some(drain) = self.drain.take() else {
            return;
        };
        let slot = drain.slot;
        tracing::info!(slot, "data drained");
        match drain.purpose {
            DrainPurpose::Deactivate { request, target } => {
                // The slot gives up data before the modem drops it.
                self.dds = None;
                if let Some(switch) = self.dds_switch.as_mut() {
                    if switch.previous == Some(slot) {
                        switch.previous = None;
                    }
                }
                self.issue_uicc(request, target, true);
            }
            DrainPurpose::DdsSwitch => {
                if let Some(switch) = self.dds_switch.as_mut() {
                    switch.phase = SwitchPhase::Drained;
                }
            }
        }
        self.process_next();
    }
}
