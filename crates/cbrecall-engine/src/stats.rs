//! Recall engine statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Engine-wide recall counters
#[derive(Debug, Default)]
pub struct RecallStats {
    deleg_recalls_sent: AtomicU64,
    deleg_send_failures: AtomicU64,
    deleg_acks: AtomicU64,
    deleg_retries: AtomicU64,
    deleg_revokes: AtomicU64,
    deleg_abandoned: AtomicU64,
    layout_recalls_sent: AtomicU64,
    layout_delay_retries: AtomicU64,
    layout_nomatch_returns: AtomicU64,
    layout_revokes: AtomicU64,
    revoke_failures: AtomicU64,
    device_notifications: AtomicU64,
}

/// Serializable copy of [`RecallStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallStatsSnapshot {
    pub deleg_recalls_sent: u64,
    pub deleg_send_failures: u64,
    pub deleg_acks: u64,
    pub deleg_retries: u64,
    pub deleg_revokes: u64,
    pub deleg_abandoned: u64,
    pub layout_recalls_sent: u64,
    pub layout_delay_retries: u64,
    pub layout_nomatch_returns: u64,
    pub layout_revokes: u64,
    pub revoke_failures: u64,
    pub device_notifications: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RecallStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_deleg_recall_sent(&self) {
        bump(&self.deleg_recalls_sent);
    }

    pub fn record_deleg_send_failure(&self) {
        bump(&self.deleg_send_failures);
    }

    pub fn record_deleg_ack(&self) {
        bump(&self.deleg_acks);
    }

    pub fn record_deleg_retry(&self) {
        bump(&self.deleg_retries);
    }

    pub fn record_deleg_revoke(&self) {
        bump(&self.deleg_revokes);
    }

    pub fn record_deleg_abandoned(&self) {
        bump(&self.deleg_abandoned);
    }

    pub fn record_layout_recall_sent(&self) {
        bump(&self.layout_recalls_sent);
    }

    pub fn record_layout_delay_retry(&self) {
        bump(&self.layout_delay_retries);
    }

    pub fn record_layout_nomatch(&self) {
        bump(&self.layout_nomatch_returns);
    }

    pub fn record_layout_revoke(&self) {
        bump(&self.layout_revokes);
    }

    pub fn record_revoke_failure(&self) {
        bump(&self.revoke_failures);
    }

    pub fn record_device_notification(&self) {
        bump(&self.device_notifications);
    }

    pub fn snapshot(&self) -> RecallStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RecallStatsSnapshot {
            deleg_recalls_sent: load(&self.deleg_recalls_sent),
            deleg_send_failures: load(&self.deleg_send_failures),
            deleg_acks: load(&self.deleg_acks),
            deleg_retries: load(&self.deleg_retries),
            deleg_revokes: load(&self.deleg_revokes),
            deleg_abandoned: load(&self.deleg_abandoned),
            layout_recalls_sent: load(&self.layout_recalls_sent),
            layout_delay_retries: load(&self.layout_delay_retries),
            layout_nomatch_returns: load(&self.layout_nomatch_returns),
            layout_revokes: load(&self.layout_revokes),
            revoke_failures: load(&self.revoke_failures),
            device_notifications: load(&self.device_notifications),
        }
    }
}
