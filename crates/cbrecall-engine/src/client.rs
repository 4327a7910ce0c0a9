//! Client records and lease tracking.
//!
//! A recall keeps the owning client's lease pinned for as long as it is
//! outstanding: a client with a reservation cannot be expired by the lease
//! reaper, and a client that has already been expired cannot be reserved.
//! The per-client mutex guarding this is never taken while a file's state
//! lock is held across a callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::ClientId;

#[derive(Debug)]
struct LeaseState {
    reservations: u32,
    expired: bool,
    cb_chan_down: bool,
}

/// Cumulative per-client recall counters
#[derive(Debug, Default)]
pub struct ClientCounters {
    recalls: AtomicU64,
    failed_recalls: AtomicU64,
    revokes: AtomicU64,
}

/// Point-in-time copy of [`ClientCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCountersSnapshot {
    pub recalls: u64,
    pub failed_recalls: u64,
    pub revokes: u64,
}

/// One registered NFSv4 client as the recall engine sees it.
#[derive(Debug)]
pub struct ClientRecord {
    id: ClientId,
    minor_version: u32,
    callback_ident: u32,
    lease: Mutex<LeaseState>,
    counters: ClientCounters,
}

impl ClientRecord {
    pub fn new(id: ClientId, minor_version: u32, callback_ident: u32) -> Self {
        Self {
            id,
            minor_version,
            callback_ident,
            lease: Mutex::new(LeaseState {
                reservations: 0,
                expired: false,
                cb_chan_down: false,
            }),
            counters: ClientCounters::default(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn minor_version(&self) -> u32 {
        self.minor_version
    }

    pub fn callback_ident(&self) -> u32 {
        self.callback_ident
    }

    /// Pins the lease until the returned guard is dropped.
    ///
    /// Returns `None` when the lease has already expired; the reaper owns
    /// the client's state from then on.
    pub fn reserve_lease(self: &Arc<Self>) -> Option<LeaseReservation> {
        let mut lease = self.lease.lock().unwrap();
        if lease.expired {
            debug!(client = %self.id, "lease already expired, not reserving");
            return None;
        }
        lease.reservations += 1;
        Some(LeaseReservation {
            client: Arc::clone(self),
        })
    }

    fn release_lease(&self) {
        let mut lease = self.lease.lock().unwrap();
        lease.reservations = lease.reservations.saturating_sub(1);
    }

    pub fn lease_reservations(&self) -> u32 {
        self.lease.lock().unwrap().reservations
    }

    /// Marks the lease expired unless a recall holds a reservation.
    pub fn expire(&self) -> bool {
        let mut lease = self.lease.lock().unwrap();
        if lease.reservations > 0 {
            return false;
        }
        lease.expired = true;
        true
    }

    pub fn is_expired(&self) -> bool {
        self.lease.lock().unwrap().expired
    }

    pub fn cb_chan_down(&self) -> bool {
        self.lease.lock().unwrap().cb_chan_down
    }

    pub fn set_cb_chan_down(&self, down: bool) {
        let mut lease = self.lease.lock().unwrap();
        if lease.cb_chan_down != down {
            info!(client = %self.id, down, "callback channel state changed");
        }
        lease.cb_chan_down = down;
    }

    pub fn record_recall(&self) {
        self.counters.recalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_recall(&self) {
        self.counters.failed_recalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revoke(&self) {
        self.counters.revokes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> ClientCountersSnapshot {
        ClientCountersSnapshot {
            recalls: self.counters.recalls.load(Ordering::Relaxed),
            failed_recalls: self.counters.failed_recalls.load(Ordering::Relaxed),
            revokes: self.counters.revokes.load(Ordering::Relaxed),
        }
    }
}

/// Lease pin held by an outstanding recall. Dropping it releases the pin.
#[derive(Debug)]
pub struct LeaseReservation {
    client: Arc<ClientRecord>,
}

impl LeaseReservation {
    pub fn client(&self) -> &Arc<ClientRecord> {
        &self.client
    }
}

impl Drop for LeaseReservation {
    fn drop(&mut self) {
        self.client.release_lease();
    }
}
