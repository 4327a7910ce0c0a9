//! pNFS layout recall.
//!
//! A trigger scans the file's layout states under its write lock, files a
//! work item for the states that match, then sends one CB_LAYOUTRECALL per
//! state with the lock released. Each state gets its own context and goes
//! through send, reply and backoff on its own; one client's answer never
//! touches another client's recall.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::LiveRefs;
use crate::callback::{
    CallbackCompound, CallbackOp, CallbackOutcome, LayoutRecallFile, SubmitError,
};
use crate::engine::RecallEngine;
use crate::error::{
    nfs4_status_name, RecallError, Result, NFS4ERR_DELAY, NFS4ERR_NOMATCHING_LAYOUT, NFS4_OK,
};
use crate::executor::task;
use crate::state::LayoutRecallWorkItem;
use crate::types::{
    ClientFilter, ExportId, FileHandle, LayoutType, RecallCookie, ReturnCircumstance, Segment,
    StateOther,
};

/// Delay before re-sending a CB_LAYOUTRECALL the client answered with
/// NFS4ERR_DELAY. `answered` is the zero-based index of that attempt.
pub fn layout_backoff(answered: u32, max: Duration) -> Duration {
    match answered {
        0..=4 => Duration::ZERO,
        5..=9 => Duration::from_millis(1),
        10..=19 => Duration::from_millis(10),
        20..=29 => Duration::from_millis(100),
        _ => max,
    }
}

/// Per-state layout recall context
#[derive(Debug)]
pub(crate) struct LayoutRecallContext {
    other: StateOther,
    segment: Segment,
    op: CallbackOp,
    attempts: u32,
    first_attempt: Option<Instant>,
}

impl RecallEngine {
    /// Recalls the layouts of `layout_type` on a file that overlap
    /// `segment` and whose owner passes `filter`.
    ///
    /// `NotFound` when the export is gone, the file does not resolve or no
    /// layout matches.
    #[allow(clippy::too_many_arguments)]
    pub fn layoutrecall(
        self: &Arc<Self>,
        export: ExportId,
        handle: &FileHandle,
        layout_type: LayoutType,
        changed: bool,
        segment: Segment,
        cookie: RecallCookie,
        filter: ClientFilter,
    ) -> Result<()> {
        segment.validate()?;
        if self.exports.get_export(export).is_none() {
            debug!(%export, "layout recall on removed export");
            return Err(RecallError::NotFound);
        }
        let file = self.store.resolve(export, handle)?;

        let (recall_id, matched) = {
            let mut states = file.write_states();
            let matched: Vec<StateOther> = states
                .grants()
                .iter()
                .filter(|s| s.layout_type() == Some(layout_type))
                .filter(|s| filter.matches(s.client_id()))
                .filter(|s| s.layout_overlaps(&segment))
                .map(|s| s.other())
                .collect();
            if matched.is_empty() {
                debug!(%export, ?layout_type, ?segment, "no layouts to recall");
                return Err(RecallError::NotFound);
            }
            let id = states.register_layout_recall(LayoutRecallWorkItem {
                id: 0,
                layout_type,
                segment,
                cookie,
                filter,
                states: matched.clone(),
            });
            (id, matched)
        };

        let mut result = Ok(());
        for other in matched {
            let Some(refs) = self.states.acquire(&other) else {
                debug!(stateid = %other.as_hex(), "layout owner going stale, skipping");
                continue;
            };
            let fh = match file.handle().to_nfs4(refs.export.id()) {
                Ok(fh) => fh,
                Err(e) => {
                    error!(%export, error = %e, "cannot encode handle for CB_LAYOUTRECALL");
                    result = Err(e);
                    break;
                }
            };
            let stateid = refs.state.bump_seqid();
            let op = CallbackOp::LayoutRecall {
                layout_type,
                iomode: segment.iomode,
                changed,
                recall: LayoutRecallFile {
                    fh,
                    offset: segment.offset,
                    length: segment.length,
                    stateid,
                },
            };
            let ctx = LayoutRecallContext {
                other,
                segment,
                op,
                attempts: 0,
                first_attempt: None,
            };
            self.send_layout_recall(&refs, ctx);
        }

        file.write_states().remove_layout_recall(recall_id);
        result
    }

    fn send_layout_recall(self: &Arc<Self>, refs: &LiveRefs, mut ctx: LayoutRecallContext) {
        if ctx.attempts == 0 {
            ctx.first_attempt = Some(self.clock.now());
        }
        let client = Arc::clone(&refs.client);
        client.record_recall();

        let submitted = if client.cb_chan_down() {
            Err(SubmitError::ChannelDown)
        } else {
            let compound = CallbackCompound::for_client(&client, ctx.op.clone());
            self.transport.submit(&client, compound)
        };

        let pending = match submitted {
            Ok(pending) => pending,
            Err(e) => {
                client.record_failed_recall();
                info!(
                    stateid = %ctx.other.as_hex(),
                    client = %client.id(),
                    error = %e,
                    "CB_LAYOUTRECALL not sent, returning layout"
                );
                if ctx.attempts == 0 {
                    self.schedule_forced_return(ctx);
                } else {
                    self.finish_layout_recall(refs, &ctx, ReturnCircumstance::Revoke);
                }
                return;
            }
        };

        ctx.attempts += 1;
        self.stats.record_layout_recall_sent();
        debug!(
            stateid = %ctx.other.as_hex(),
            client = %client.id(),
            attempt = ctx.attempts,
            "CB_LAYOUTRECALL sent"
        );

        let segment = ctx.segment;
        let engine = Arc::clone(self);
        let waiter = task(async move {
            let outcome = pending.wait().await;
            engine.layout_recall_completed(ctx, outcome);
        });
        if let Err(e) = self.executor.schedule(Duration::ZERO, waiter) {
            error!(client = %client.id(), error = %e, "cannot wait for CB_LAYOUTRECALL reply");
            self.return_layout(refs, &segment, ReturnCircumstance::Revoke);
        }
    }

    /// Hands the layout back from a fresh task instead of the caller's.
    fn schedule_forced_return(self: &Arc<Self>, ctx: LayoutRecallContext) {
        let other = ctx.other;
        let segment = ctx.segment;
        let engine = Arc::clone(self);
        let step = task(async move {
            if let Some(refs) = engine.states.acquire(&ctx.other) {
                engine.finish_layout_recall(&refs, &ctx, ReturnCircumstance::Revoke);
            }
        });
        if let Err(e) = self.executor.schedule(Duration::ZERO, step) {
            warn!(stateid = %other.as_hex(), error = %e, "returning layout inline");
            if let Some(refs) = self.states.acquire(&other) {
                self.return_layout(&refs, &segment, ReturnCircumstance::Revoke);
            }
        }
    }

    fn layout_recall_completed(self: &Arc<Self>, ctx: LayoutRecallContext, outcome: CallbackOutcome) {
        match outcome {
            CallbackOutcome::Reply { status: NFS4_OK } => {
                // the client answers with LAYOUTRETURN
                debug!(stateid = %ctx.other.as_hex(), "CB_LAYOUTRECALL acknowledged");
            }
            CallbackOutcome::Reply {
                status: NFS4ERR_NOMATCHING_LAYOUT,
            } => {
                debug!(stateid = %ctx.other.as_hex(), "client holds no matching layout");
                self.stats.record_layout_nomatch();
                if let Some(refs) = self.states.acquire(&ctx.other) {
                    self.finish_layout_recall(&refs, &ctx, ReturnCircumstance::Client);
                }
            }
            CallbackOutcome::Reply {
                status: NFS4ERR_DELAY,
            } => self.layout_delayed(ctx),
            CallbackOutcome::Reply { status } => {
                info!(
                    stateid = %ctx.other.as_hex(),
                    status = nfs4_status_name(status),
                    "CB_LAYOUTRECALL failed, revoking layout"
                );
                if let Some(refs) = self.states.acquire(&ctx.other) {
                    self.finish_layout_recall(&refs, &ctx, ReturnCircumstance::Revoke);
                }
            }
            CallbackOutcome::TransportFailure { reason } => {
                info!(stateid = %ctx.other.as_hex(), reason = %reason, "CB_LAYOUTRECALL transport failure, revoking layout");
                if let Some(refs) = self.states.acquire(&ctx.other) {
                    refs.client.set_cb_chan_down(true);
                    self.finish_layout_recall(&refs, &ctx, ReturnCircumstance::Revoke);
                }
            }
        }
    }

    fn layout_delayed(self: &Arc<Self>, ctx: LayoutRecallContext) {
        let now = self.clock.now();
        let elapsed = ctx
            .first_attempt
            .map_or(Duration::ZERO, |first| now.saturating_duration_since(first));
        if elapsed > self.config.lease_lifetime() {
            info!(stateid = %ctx.other.as_hex(), ?elapsed, "client delayed CB_LAYOUTRECALL past the lease, revoking");
            if let Some(refs) = self.states.acquire(&ctx.other) {
                self.finish_layout_recall(&refs, &ctx, ReturnCircumstance::Revoke);
            }
            return;
        }

        let delay = layout_backoff(
            ctx.attempts.saturating_sub(1),
            self.config.layout_backoff_max(),
        );
        self.stats.record_layout_delay_retry();
        debug!(stateid = %ctx.other.as_hex(), ?delay, "CB_LAYOUTRECALL delayed, retrying");

        let other = ctx.other;
        let segment = ctx.segment;
        let engine = Arc::clone(self);
        let retry = task(async move {
            match engine.states.acquire(&ctx.other) {
                Some(refs) => engine.send_layout_recall(&refs, ctx),
                None => debug!(stateid = %ctx.other.as_hex(), "layout or its export gone, ending recall"),
            }
        });
        if let Err(e) = self.executor.schedule(delay, retry) {
            error!(stateid = %other.as_hex(), error = %e, "cannot schedule CB_LAYOUTRECALL retry");
            if let Some(refs) = self.states.acquire(&other) {
                self.return_layout(&refs, &segment, ReturnCircumstance::Revoke);
            }
        }
    }

    fn finish_layout_recall(
        &self,
        refs: &LiveRefs,
        ctx: &LayoutRecallContext,
        circumstance: ReturnCircumstance,
    ) {
        self.return_layout(refs, &ctx.segment, circumstance);
    }

    fn return_layout(&self, refs: &LiveRefs, segment: &Segment, circumstance: ReturnCircumstance) {
        let revoking = circumstance == ReturnCircumstance::Revoke;
        if revoking {
            warn!(
                stateid = %refs.state.other().as_hex(),
                client = %refs.client.id(),
                "revoking layout"
            );
        }
        match self
            .store
            .return_layout(&refs.file, &refs.state, segment, circumstance)
        {
            Ok(()) if revoking => {
                refs.client.record_revoke();
                self.stats.record_layout_revoke();
            }
            Ok(()) => {}
            Err(e) if e.is_absent() => {
                debug!(stateid = %refs.state.other().as_hex(), "layout already returned");
            }
            Err(e) => {
                error!(stateid = %refs.state.other().as_hex(), error = %e, "layout return failed");
                self.stats.record_revoke_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_ladder() {
        let max = Duration::from_secs(1);
        let delays: Vec<Duration> = (0..6).map(|n| layout_backoff(n, max)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                Duration::ZERO,
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_millis(1),
            ]
        );
        assert_eq!(layout_backoff(10, max), Duration::from_millis(10));
        assert_eq!(layout_backoff(29, max), Duration::from_millis(100));
        assert_eq!(layout_backoff(30, max), max);
    }

    proptest! {
        #[test]
        fn prop_backoff_never_shrinks(n in 0u32..1000) {
            let max = Duration::from_secs(1);
            prop_assert!(layout_backoff(n, max) <= layout_backoff(n + 1, max));
            prop_assert!(layout_backoff(n, max) <= max);
        }
    }
}
