//! Granted state and the file objects it hangs off.
//!
//! A `FileObject` owns one read-write lock over its grant list and its
//! in-flight layout recall work items. Delegation phase changes and layout
//! match scans happen with that lock held for write; nothing that talks to a
//! client ever runs with it held. Scheduled work never keeps an
//! `Arc<GrantedState>`: it carries the state's [`StateOther`] key and looks
//! the state up again when it runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::{
    ClientFilter, ClientId, ExportId, FileHandle, LayoutType, RecallCookie, Segment, StateId,
    StateOther,
};

/// Delegation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegationType {
    /// Read delegation allows caching for read operations
    Read,
    /// Write delegation allows caching for read/write operations
    Write,
}

/// Delegation lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegPhase {
    Granted,
    RecallInProgress,
    Returned,
    Revoked,
}

impl DelegPhase {
    fn rank(self) -> u8 {
        match self {
            DelegPhase::Granted => 0,
            DelegPhase::RecallInProgress => 1,
            DelegPhase::Returned | DelegPhase::Revoked => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DelegPhase::Returned | DelegPhase::Revoked)
    }

    pub fn can_advance_to(self, next: DelegPhase) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for DelegPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelegPhase::Granted => write!(f, "GRANTED"),
            DelegPhase::RecallInProgress => write!(f, "RECALL_IN_PROGRESS"),
            DelegPhase::Returned => write!(f, "RETURNED"),
            DelegPhase::Revoked => write!(f, "REVOKED"),
        }
    }
}

/// Recall bookkeeping of one delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationProgress {
    pub phase: DelegPhase,
    /// When the first CB_RECALL was attempted
    pub first_recall: Option<Instant>,
    /// When the client last acknowledged a CB_RECALL
    pub recall_acked: Option<Instant>,
}

impl DelegationProgress {
    fn granted() -> Self {
        Self {
            phase: DelegPhase::Granted,
            first_recall: None,
            recall_acked: None,
        }
    }
}

#[derive(Debug)]
enum Grant {
    Delegation {
        deleg_type: DelegationType,
        progress: Mutex<DelegationProgress>,
    },
    Layout {
        layout_type: LayoutType,
        segments: Mutex<Vec<Segment>>,
    },
}

/// One delegation or layout held by one client on one file.
#[derive(Debug)]
pub struct GrantedState {
    other: StateOther,
    seqid: AtomicU32,
    client: ClientId,
    export: ExportId,
    grant: Grant,
}

impl GrantedState {
    pub fn delegation(client: ClientId, export: ExportId, deleg_type: DelegationType) -> Self {
        Self {
            other: StateOther::generate(),
            seqid: AtomicU32::new(1),
            client,
            export,
            grant: Grant::Delegation {
                deleg_type,
                progress: Mutex::new(DelegationProgress::granted()),
            },
        }
    }

    pub fn layout(
        client: ClientId,
        export: ExportId,
        layout_type: LayoutType,
        segments: Vec<Segment>,
    ) -> Self {
        Self {
            other: StateOther::generate(),
            seqid: AtomicU32::new(1),
            client,
            export,
            grant: Grant::Layout {
                layout_type,
                segments: Mutex::new(segments),
            },
        }
    }

    pub fn other(&self) -> StateOther {
        self.other
    }

    pub fn stateid(&self) -> StateId {
        StateId {
            seqid: self.seqid.load(Ordering::Acquire),
            other: self.other,
        }
    }

    /// Advances the seqid and returns the new stateid.
    pub fn bump_seqid(&self) -> StateId {
        let prev = self
            .seqid
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                // seqid 0 is reserved on the wire
                Some(if s == u32::MAX { 1 } else { s + 1 })
            })
            .unwrap_or(0);
        StateId {
            seqid: if prev == u32::MAX { 1 } else { prev + 1 },
            other: self.other,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn export_id(&self) -> ExportId {
        self.export
    }

    pub fn delegation_type(&self) -> Option<DelegationType> {
        match &self.grant {
            Grant::Delegation { deleg_type, .. } => Some(*deleg_type),
            Grant::Layout { .. } => None,
        }
    }

    pub fn is_delegation(&self) -> bool {
        matches!(self.grant, Grant::Delegation { .. })
    }

    pub fn layout_type(&self) -> Option<LayoutType> {
        match &self.grant {
            Grant::Layout { layout_type, .. } => Some(*layout_type),
            Grant::Delegation { .. } => None,
        }
    }

    /// Granted layout segments; empty for delegations.
    pub fn segments(&self) -> Vec<Segment> {
        match &self.grant {
            Grant::Layout { segments, .. } => segments.lock().unwrap().clone(),
            Grant::Delegation { .. } => Vec::new(),
        }
    }

    /// Replaces the layout segments; returns how many remain. No-op on a
    /// delegation.
    pub fn set_segments(&self, new: Vec<Segment>) -> usize {
        match &self.grant {
            Grant::Layout { segments, .. } => {
                let mut segs = segments.lock().unwrap();
                *segs = new;
                segs.len()
            }
            Grant::Delegation { .. } => 0,
        }
    }

    /// True when any granted segment overlaps `segment`.
    pub fn layout_overlaps(&self, segment: &Segment) -> bool {
        match &self.grant {
            Grant::Layout { segments, .. } => {
                segments.lock().unwrap().iter().any(|g| g.overlaps(segment))
            }
            Grant::Delegation { .. } => false,
        }
    }

    pub fn delegation_progress(&self) -> Option<DelegationProgress> {
        match &self.grant {
            Grant::Delegation { progress, .. } => Some(*progress.lock().unwrap()),
            Grant::Layout { .. } => None,
        }
    }

    pub fn deleg_phase(&self) -> Option<DelegPhase> {
        self.delegation_progress().map(|p| p.phase)
    }

    /// Moves a delegation forward. Returns false (and changes nothing) for
    /// backward or repeated transitions, and for layouts.
    ///
    /// Callers hold the owning file's state lock for write.
    pub fn advance_phase(&self, next: DelegPhase) -> bool {
        match &self.grant {
            Grant::Delegation { progress, .. } => {
                let mut p = progress.lock().unwrap();
                if !p.phase.can_advance_to(next) {
                    return false;
                }
                p.phase = next;
                true
            }
            Grant::Layout { .. } => false,
        }
    }

    /// Stamps the first recall attempt; later calls keep the first stamp.
    pub fn note_recall_attempt(&self, now: Instant) {
        if let Grant::Delegation { progress, .. } = &self.grant {
            let mut p = progress.lock().unwrap();
            if p.first_recall.is_none() {
                p.first_recall = Some(now);
            }
        }
    }

    pub fn note_recall_acked(&self, now: Instant) {
        if let Grant::Delegation { progress, .. } = &self.grant {
            progress.lock().unwrap().recall_acked = Some(now);
        }
    }
}

/// A layout recall in flight on a file: what was asked for and which states
/// matched. Holds keys only.
#[derive(Debug, Clone)]
pub struct LayoutRecallWorkItem {
    pub id: u64,
    pub layout_type: LayoutType,
    pub segment: Segment,
    pub cookie: RecallCookie,
    pub filter: ClientFilter,
    pub states: Vec<StateOther>,
}

/// Everything a file's state lock guards
#[derive(Debug, Default)]
pub struct FileStates {
    grants: Vec<Arc<GrantedState>>,
    layout_recalls: Vec<LayoutRecallWorkItem>,
    last_deleg_recall: Option<Instant>,
    next_recall_id: u64,
}

impl FileStates {
    pub fn grants(&self) -> &[Arc<GrantedState>] {
        &self.grants
    }

    pub fn add_grant(&mut self, state: Arc<GrantedState>) {
        self.grants.push(state);
    }

    pub fn find(&self, other: &StateOther) -> Option<&Arc<GrantedState>> {
        self.grants.iter().find(|s| s.other() == *other)
    }

    pub fn remove_grant(&mut self, other: &StateOther) -> Option<Arc<GrantedState>> {
        let pos = self.grants.iter().position(|s| s.other() == *other)?;
        Some(self.grants.remove(pos))
    }

    pub fn layout_recalls(&self) -> &[LayoutRecallWorkItem] {
        &self.layout_recalls
    }

    /// Registers a work item and returns the id it was filed under.
    pub fn register_layout_recall(&mut self, mut item: LayoutRecallWorkItem) -> u64 {
        self.next_recall_id += 1;
        item.id = self.next_recall_id;
        self.layout_recalls.push(item);
        self.next_recall_id
    }

    pub fn remove_layout_recall(&mut self, id: u64) -> Option<LayoutRecallWorkItem> {
        let pos = self.layout_recalls.iter().position(|r| r.id == id)?;
        Some(self.layout_recalls.remove(pos))
    }

    pub fn stamp_deleg_recall(&mut self, now: Instant) {
        self.last_deleg_recall = Some(now);
    }
}

/// A file (or other object) that grants are held on.
#[derive(Debug)]
pub struct FileObject {
    export: ExportId,
    handle: FileHandle,
    states: RwLock<FileStates>,
}

impl FileObject {
    pub fn new(export: ExportId, handle: FileHandle) -> Self {
        Self {
            export,
            handle,
            states: RwLock::new(FileStates::default()),
        }
    }

    pub fn export_id(&self) -> ExportId {
        self.export
    }

    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    /// Shared access to the state list.
    pub fn read_states(&self) -> RwLockReadGuard<'_, FileStates> {
        self.states.read().unwrap()
    }

    /// Exclusive access to the state list.
    pub fn write_states(&self) -> RwLockWriteGuard<'_, FileStates> {
        self.states.write().unwrap()
    }

    pub fn last_delegation_recall(&self) -> Option<Instant> {
        self.read_states().last_deleg_recall
    }

    pub fn grant_count(&self) -> usize {
        self.read_states().grants.len()
    }

    pub fn state(&self, other: &StateOther) -> Option<Arc<GrantedState>> {
        self.read_states().find(other).cloned()
    }
}
