//! Delegation recall.
//!
//! A recall is a chain of short steps on the executor: send a CB_RECALL,
//! wait for its reply in its own task, then either retry, re-check liveness
//! later or revoke. Every step starts by looking the delegation up again by
//! its stateid; if it is gone (returned, or its client or export went
//! away) the chain ends.
//! The context owns a lease reservation for its whole life, so the client
//! cannot be reaped while a recall is outstanding.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::LiveRefs;
use crate::callback::{CallbackCompound, CallbackOp, CallbackOutcome, SubmitError};
use crate::client::{ClientRecord, LeaseReservation};
use crate::engine::RecallEngine;
use crate::error::{
    nfs4_status_name, RecallError, Result, NFS4ERR_BADHANDLE, NFS4ERR_BAD_STATEID,
    NFS4ERR_DELAY, NFS4_OK,
};
use crate::executor::task;
use crate::state::{DelegPhase, DelegationProgress};
use crate::types::{ExportId, FileHandle, StateOther};

/// Per-delegation recall context, owned by whichever step runs next.
#[derive(Debug)]
pub(crate) struct DelegRecallContext {
    other: StateOther,
    lease: LeaseReservation,
    /// CB_RECALLs handed to the transport
    attempts: u32,
    /// SendRecall invocations, successful or not
    sends: u32,
}

impl DelegRecallContext {
    fn new(other: StateOther, lease: LeaseReservation) -> Self {
        Self {
            other,
            lease,
            attempts: 0,
            sends: 0,
        }
    }

    fn client(&self) -> &Arc<ClientRecord> {
        self.lease.client()
    }
}

/// What a CB_RECALL reply asks for next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyAction {
    /// Send the recall again
    Retry,
    /// Acknowledged; watch for the DELEGRETURN
    AwaitReturn,
}

fn classify_reply(outcome: &CallbackOutcome) -> ReplyAction {
    match outcome {
        CallbackOutcome::Reply { status: NFS4_OK } => ReplyAction::AwaitReturn,
        _ => ReplyAction::Retry,
    }
}

/// Whether the recall deadline of a delegation has passed.
///
/// An acknowledged recall gets one lease period from the acknowledgement; an
/// unacknowledged one gets two from the first attempt.
pub fn should_revoke(progress: &DelegationProgress, now: Instant, lease: Duration) -> bool {
    match (progress.recall_acked, progress.first_recall) {
        (Some(acked), _) => now.saturating_duration_since(acked) >= lease,
        (None, Some(first)) => now.saturating_duration_since(first) >= lease * 2,
        (None, None) => false,
    }
}

impl RecallEngine {
    /// Recalls every delegation held on a file.
    ///
    /// Returns once the recalls are under way. A file this node cannot
    /// resolve, or one on a removed export, is left alone.
    pub fn delegrecall(self: &Arc<Self>, export: ExportId, handle: &FileHandle) -> Result<()> {
        if handle.as_bytes().is_empty() {
            return Err(RecallError::invalid("empty file handle"));
        }

        if !self.config.allow_delegations {
            info!(%export, "delegation recall requested with delegations disabled");
            return Ok(());
        }

        if self.exports.get_export(export).is_none() {
            debug!(%export, "recall on removed export, skipping");
            return Ok(());
        }

        let file = match self.store.resolve(export, handle) {
            Ok(file) => file,
            Err(e) if e.is_absent() => {
                debug!(%export, error = %e, "recall on unresolvable file, skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let mut to_recall = Vec::new();
        {
            let mut states = file.write_states();
            for state in states.grants().iter().filter(|s| s.is_delegation()) {
                if !state.advance_phase(DelegPhase::RecallInProgress) {
                    debug!(stateid = %state.other().as_hex(), "recall already under way");
                    continue;
                }
                to_recall.push((state.other(), state.client_id()));
            }
            if !to_recall.is_empty() {
                states.stamp_deleg_recall(now);
            }
        }

        for (other, client_id) in to_recall {
            let Some(client) = self.clients.get(client_id) else {
                debug!(client = %client_id, "client going stale, not recalling");
                continue;
            };
            let Some(lease) = client.reserve_lease() else {
                // the reaper cleans up the expired client's delegations
                continue;
            };
            let Some(refs) = self.states.acquire(&other) else {
                debug!(stateid = %other.as_hex(), "delegation gone before recall");
                continue;
            };
            let ctx = DelegRecallContext::new(other, lease);
            self.send_recall(&refs, ctx);
        }
        Ok(())
    }

    /// Looks the delegation up again, or ends the chain if it is gone.
    fn reacquire(&self, ctx: &DelegRecallContext) -> Option<LiveRefs> {
        let refs = self.states.acquire(&ctx.other);
        let live = refs.filter(|r| r.state.deleg_phase().is_some_and(|p| !p.is_terminal()));
        if live.is_none() {
            debug!(
                stateid = %ctx.other.as_hex(),
                client = %ctx.client().id(),
                "delegation or its export gone, ending recall"
            );
            self.stats.record_deleg_abandoned();
        }
        live
    }

    fn send_recall(self: &Arc<Self>, refs: &LiveRefs, mut ctx: DelegRecallContext) {
        let now = self.clock.now();
        refs.state.note_recall_attempt(now);
        let first_send = ctx.sends == 0;
        ctx.sends += 1;

        let client = Arc::clone(ctx.client());
        client.record_recall();

        let submitted = if client.cb_chan_down() {
            Err(SubmitError::ChannelDown)
        } else {
            match refs.file.handle().to_nfs4(refs.export.id()) {
                Ok(fh) => {
                    let op = CallbackOp::Recall {
                        stateid: refs.state.stateid(),
                        truncate: false,
                        fh,
                    };
                    self.transport
                        .submit(&client, CallbackCompound::for_client(&client, op))
                }
                Err(e) => Err(SubmitError::Rejected {
                    reason: e.to_string(),
                }),
            }
        };

        let pending = match submitted {
            Ok(pending) => pending,
            Err(e) => {
                self.recall_send_failed(refs, ctx, e, first_send);
                return;
            }
        };

        ctx.attempts += 1;
        self.stats.record_deleg_recall_sent();
        debug!(
            stateid = %ctx.other.as_hex(),
            client = %client.id(),
            export = refs.export.path(),
            deleg_type = ?refs.state.delegation_type(),
            attempt = ctx.attempts,
            "CB_RECALL sent"
        );

        let engine = Arc::clone(self);
        let waiter = task(async move {
            let outcome = pending.wait().await;
            engine.recall_completed(ctx, outcome);
        });
        if let Err(e) = self.executor.schedule(Duration::ZERO, waiter) {
            error!(client = %client.id(), error = %e, "cannot wait for CB_RECALL reply");
            self.revoke(refs, &client, "reply wait not schedulable");
        }
    }

    fn recall_send_failed(
        self: &Arc<Self>,
        refs: &LiveRefs,
        ctx: DelegRecallContext,
        err: SubmitError,
        first_send: bool,
    ) {
        let client = Arc::clone(ctx.client());
        client.record_failed_recall();
        self.stats.record_deleg_send_failure();
        if err == SubmitError::NoChannel {
            client.set_cb_chan_down(true);
        }
        info!(
            stateid = %ctx.other.as_hex(),
            client = %client.id(),
            error = %err,
            "CB_RECALL not sent"
        );

        if first_send {
            // one immediate retry before the deadline applies
            self.schedule_recall(ctx, Duration::ZERO);
            return;
        }
        self.retry_or_revoke(refs, ctx);
    }

    fn recall_completed(self: &Arc<Self>, ctx: DelegRecallContext, outcome: CallbackOutcome) {
        let Some(refs) = self.reacquire(&ctx) else {
            return;
        };
        let client = Arc::clone(ctx.client());

        match &outcome {
            CallbackOutcome::Reply { status: NFS4_OK } => {
                refs.state.note_recall_acked(self.clock.now());
                self.stats.record_deleg_ack();
                debug!(stateid = %ctx.other.as_hex(), client = %client.id(), "CB_RECALL acknowledged");
            }
            CallbackOutcome::Reply {
                status: status @ (NFS4ERR_BADHANDLE | NFS4ERR_BAD_STATEID | NFS4ERR_DELAY),
            } => {
                debug!(
                    stateid = %ctx.other.as_hex(),
                    status = nfs4_status_name(*status),
                    "CB_RECALL refused, retrying"
                );
            }
            CallbackOutcome::Reply { status } => {
                info!(
                    stateid = %ctx.other.as_hex(),
                    client = %client.id(),
                    status = nfs4_status_name(*status),
                    "unexpected CB_RECALL reply"
                );
            }
            CallbackOutcome::TransportFailure { reason } => {
                info!(client = %client.id(), reason = %reason, "CB_RECALL transport failure");
                client.set_cb_chan_down(true);
            }
        }

        match classify_reply(&outcome) {
            ReplyAction::AwaitReturn => {
                let engine = Arc::clone(self);
                let check = task(async move { engine.revoke_check(ctx) });
                if let Err(e) = self
                    .executor
                    .schedule(self.config.deleg_retry_interval(), check)
                {
                    // the context went down with the rejected task
                    error!(stateid = %refs.state.other().as_hex(), error = %e, "cannot schedule revoke check");
                    self.revoke(&refs, &client, "revoke check not schedulable");
                }
            }
            ReplyAction::Retry => self.retry_or_revoke(&refs, ctx),
        }
    }

    /// Revokes if the deadline passed, otherwise sends again after one
    /// retry interval.
    fn retry_or_revoke(self: &Arc<Self>, refs: &LiveRefs, ctx: DelegRecallContext) {
        if self.deadline_passed(refs) {
            let client = Arc::clone(ctx.client());
            drop(ctx);
            self.revoke(refs, &client, "recall deadline passed");
            return;
        }
        self.stats.record_deleg_retry();
        self.schedule_recall(ctx, self.config.deleg_retry_interval());
    }

    fn schedule_recall(self: &Arc<Self>, ctx: DelegRecallContext, delay: Duration) {
        let other = ctx.other;
        let client = Arc::clone(ctx.client());
        let engine = Arc::clone(self);
        let step = task(async move {
            if let Some(refs) = engine.reacquire(&ctx) {
                engine.send_recall(&refs, ctx);
            }
        });
        if let Err(e) = self.executor.schedule(delay, step) {
            error!(stateid = %other.as_hex(), error = %e, "cannot schedule CB_RECALL retry");
            if let Some(refs) = self.states.acquire(&other) {
                self.revoke(&refs, &client, "retry not schedulable");
            }
        }
    }

    fn revoke_check(self: &Arc<Self>, ctx: DelegRecallContext) {
        let Some(refs) = self.reacquire(&ctx) else {
            return;
        };
        if self.deadline_passed(&refs) {
            let client = Arc::clone(ctx.client());
            drop(ctx);
            self.revoke(&refs, &client, "delegation not returned after recall");
            return;
        }

        let engine = Arc::clone(self);
        let client = Arc::clone(ctx.client());
        let check = task(async move { engine.revoke_check(ctx) });
        if let Err(e) = self
            .executor
            .schedule(self.config.deleg_retry_interval(), check)
        {
            error!(stateid = %refs.state.other().as_hex(), error = %e, "cannot reschedule revoke check");
            self.revoke(&refs, &client, "revoke check not schedulable");
        }
    }

    fn deadline_passed(&self, refs: &LiveRefs) -> bool {
        refs.state.delegation_progress().is_some_and(|p| {
            should_revoke(&p, self.clock.now(), self.config.lease_lifetime())
        })
    }

    fn revoke(&self, refs: &LiveRefs, client: &ClientRecord, why: &str) {
        warn!(
            stateid = %refs.state.other().as_hex(),
            client = %client.id(),
            reason = why,
            "revoking delegation"
        );
        match self.store.revoke_delegation(&refs.file, &refs.state) {
            Ok(()) => {
                client.record_revoke();
                self.stats.record_deleg_revoke();
            }
            Err(e) if e.is_absent() => {
                debug!(stateid = %refs.state.other().as_hex(), "delegation returned during revoke");
            }
            Err(e) => {
                error!(stateid = %refs.state.other().as_hex(), error = %e, "delegation revoke failed");
                self.stats.record_revoke_failure();
            }
        }
    }
}
