//! In-memory object store, state table, export and client registries.
//!
//! Backs the simulator binary and the tests. Revokes and layout returns are
//! applied to the file's grant list and recorded as [`BackendEvent`]s with
//! the time they happened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::{
    ClientRegistry, Export, ExportRegistry, LiveRefs, LockOwner, LockParam, LockUpcalls,
    ObjectStore, StateTable,
};
use crate::client::ClientRecord;
use crate::clock::Clock;
use crate::error::{RecallError, Result};
use crate::state::{DelegPhase, DelegationType, FileObject, GrantedState};
use crate::types::{
    ClientId, ExportId, FileHandle, LayoutType, ReturnCircumstance, Segment, StateOther,
    NFS4_UINT64_MAX,
};

/// Something the storage layer was told to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BackendEvent {
    DelegationRevoked {
        other: StateOther,
        client: ClientId,
    },
    DelegationReturned {
        other: StateOther,
        client: ClientId,
    },
    LayoutReturned {
        other: StateOther,
        client: ClientId,
        segment: Segment,
        circumstance: ReturnCircumstance,
    },
    LockGranted {
        owner: LockOwner,
        lock: LockParam,
    },
    LockAvailable {
        owner: LockOwner,
        lock: LockParam,
    },
}

/// A [`BackendEvent`] and when it happened
#[derive(Debug, Clone)]
pub struct TimedEvent {
    pub at: Instant,
    pub event: BackendEvent,
}

type FileKey = (ExportId, FileHandle);

/// In-memory back-end
pub struct MemoryBackend {
    clock: Arc<dyn Clock>,
    default_callback_ident: u32,
    exports: RwLock<HashMap<ExportId, Arc<Export>>>,
    files: RwLock<HashMap<FileKey, Arc<FileObject>>>,
    stale: RwLock<Vec<FileKey>>,
    states: RwLock<HashMap<StateOther, (Arc<GrantedState>, Arc<FileObject>)>>,
    clients: RwLock<HashMap<ClientId, Arc<ClientRecord>>>,
    events: Mutex<Vec<TimedEvent>>,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>, default_callback_ident: u32) -> Self {
        Self {
            clock,
            default_callback_ident,
            exports: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
            stale: RwLock::new(Vec::new()),
            states: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, event: BackendEvent) {
        self.events.lock().unwrap().push(TimedEvent {
            at: self.clock.now(),
            event,
        });
    }

    /// Registers a client using the default callback program.
    pub fn add_client(&self, id: ClientId, minor_version: u32) -> Arc<ClientRecord> {
        let client = Arc::new(ClientRecord::new(
            id,
            minor_version,
            self.default_callback_ident,
        ));
        self.clients
            .write()
            .unwrap()
            .insert(id, Arc::clone(&client));
        client
    }

    pub fn add_export(&self, id: ExportId, path: impl Into<String>) -> Arc<Export> {
        let export = Arc::new(Export::new(id, path));
        self.exports
            .write()
            .unwrap()
            .insert(id, Arc::clone(&export));
        export
    }

    /// Unexports: states granted under `id` stop resolving.
    pub fn remove_export(&self, id: ExportId) -> Option<Arc<Export>> {
        let removed = self.exports.write().unwrap().remove(&id);
        if removed.is_some() {
            info!(export = %id, "export removed");
        }
        removed
    }

    /// Lease reaper entry: expires the client unless a recall pins it.
    pub fn expire_client(&self, id: ClientId) -> bool {
        match self.clients.read().unwrap().get(&id) {
            Some(client) => client.expire(),
            None => false,
        }
    }

    pub fn add_file(&self, export: ExportId, handle: FileHandle) -> Arc<FileObject> {
        let file = Arc::new(FileObject::new(export, handle.clone()));
        self.files
            .write()
            .unwrap()
            .insert((export, handle), Arc::clone(&file));
        file
    }

    /// Makes a file resolve as stale, as when another node took it over.
    pub fn mark_stale(&self, export: ExportId, handle: &FileHandle) {
        let key = (export, handle.clone());
        self.files.write().unwrap().remove(&key);
        self.stale.write().unwrap().push(key);
    }

    fn insert_state(&self, file: &Arc<FileObject>, state: GrantedState) -> StateOther {
        let state = Arc::new(state);
        let other = state.other();
        file.write_states().add_grant(Arc::clone(&state));
        self.states
            .write()
            .unwrap()
            .insert(other, (state, Arc::clone(file)));
        other
    }

    pub fn grant_delegation(
        &self,
        file: &Arc<FileObject>,
        client: ClientId,
        deleg_type: DelegationType,
    ) -> StateOther {
        let state = GrantedState::delegation(client, file.export_id(), deleg_type);
        self.insert_state(file, state)
    }

    pub fn grant_layout(
        &self,
        file: &Arc<FileObject>,
        client: ClientId,
        layout_type: LayoutType,
        segments: Vec<Segment>,
    ) -> StateOther {
        let state = GrantedState::layout(client, file.export_id(), layout_type, segments);
        self.insert_state(file, state)
    }

    /// DELEGRETURN from the client.
    pub fn return_delegation(&self, other: &StateOther) -> Result<()> {
        let (state, file) = self.lookup(other).ok_or(RecallError::NotFound)?;
        {
            let mut states = file.write_states();
            if !state.advance_phase(DelegPhase::Returned) {
                return Err(RecallError::NotFound);
            }
            states.remove_grant(other);
        }
        self.states.write().unwrap().remove(other);
        debug!(stateid = %other.as_hex(), "delegation returned");
        self.record(BackendEvent::DelegationReturned {
            other: *other,
            client: state.client_id(),
        });
        Ok(())
    }

    /// LAYOUTRETURN from the client.
    pub fn client_layout_return(&self, other: &StateOther, segment: &Segment) -> Result<()> {
        let (state, file) = self.lookup(other).ok_or(RecallError::NotFound)?;
        self.return_layout(&file, &state, segment, ReturnCircumstance::Client)
    }

    fn lookup(&self, other: &StateOther) -> Option<(Arc<GrantedState>, Arc<FileObject>)> {
        self.states.read().unwrap().get(other).cloned()
    }

    /// True while the state is still held.
    pub fn holds(&self, other: &StateOther) -> bool {
        self.states.read().unwrap().contains_key(other)
    }

    pub fn events(&self) -> Vec<TimedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// When `other` was revoked, if it was.
    pub fn revoked_at(&self, other: &StateOther) -> Option<Instant> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| match &e.event {
                BackendEvent::DelegationRevoked { other: o, .. } => o == other,
                BackendEvent::LayoutReturned {
                    other: o,
                    circumstance: ReturnCircumstance::Revoke,
                    ..
                } => o == other,
                _ => false,
            })
            .map(|e| e.at)
    }
}

/// What is left of `granted` once `returned` is taken out of it.
fn subtract(granted: &Segment, returned: &Segment) -> Vec<Segment> {
    if !granted.overlaps(returned) {
        return vec![*granted];
    }
    let mut left = Vec::new();
    if granted.offset < returned.offset {
        left.push(Segment::new(
            granted.offset,
            returned.offset - granted.offset,
            granted.iomode,
        ));
    }
    if let Some(ret_end) = returned.end() {
        match granted.end() {
            None => left.push(Segment::new(ret_end, NFS4_UINT64_MAX, granted.iomode)),
            Some(end) if end > ret_end => {
                left.push(Segment::new(ret_end, end - ret_end, granted.iomode))
            }
            Some(_) => {}
        }
    }
    left
}

impl ObjectStore for MemoryBackend {
    fn resolve(&self, export: ExportId, handle: &FileHandle) -> Result<Arc<FileObject>> {
        let key = (export, handle.clone());
        if let Some(file) = self.files.read().unwrap().get(&key) {
            return Ok(Arc::clone(file));
        }
        if self.stale.read().unwrap().contains(&key) {
            return Err(RecallError::Stale);
        }
        Err(RecallError::NotFound)
    }

    fn revoke_delegation(&self, file: &FileObject, state: &GrantedState) -> Result<()> {
        let other = state.other();
        {
            let mut states = file.write_states();
            if !state.advance_phase(DelegPhase::Revoked) {
                return Err(RecallError::NotFound);
            }
            states.remove_grant(&other);
        }
        self.states.write().unwrap().remove(&other);
        info!(stateid = %other.as_hex(), client = %state.client_id(), "delegation revoked");
        self.record(BackendEvent::DelegationRevoked {
            other,
            client: state.client_id(),
        });
        Ok(())
    }

    fn return_layout(
        &self,
        file: &FileObject,
        state: &GrantedState,
        segment: &Segment,
        circumstance: ReturnCircumstance,
    ) -> Result<()> {
        let other = state.other();
        let remaining = {
            let mut states = file.write_states();
            if states.find(&other).is_none() {
                return Err(RecallError::NotFound);
            }
            let left: Vec<Segment> = state
                .segments()
                .iter()
                .flat_map(|g| subtract(g, segment))
                .collect();
            let remaining = state.set_segments(left);
            if remaining == 0 {
                states.remove_grant(&other);
            }
            remaining
        };
        if remaining == 0 {
            self.states.write().unwrap().remove(&other);
        }
        debug!(stateid = %other.as_hex(), ?circumstance, remaining, "layout returned");
        self.record(BackendEvent::LayoutReturned {
            other,
            client: state.client_id(),
            segment: *segment,
            circumstance,
        });
        Ok(())
    }
}

impl StateTable for MemoryBackend {
    fn acquire(&self, other: &StateOther) -> Option<LiveRefs> {
        let (state, file) = self.lookup(other)?;
        let client = self.clients.read().unwrap().get(&state.client_id()).cloned()?;
        if client.is_expired() {
            return None;
        }
        let export = self.get_export(state.export_id())?;
        Some(LiveRefs {
            state,
            client,
            file,
            export,
        })
    }
}

impl ExportRegistry for MemoryBackend {
    fn get_export(&self, id: ExportId) -> Option<Arc<Export>> {
        self.exports.read().unwrap().get(&id).cloned()
    }
}

impl ClientRegistry for MemoryBackend {
    fn get(&self, id: ClientId) -> Option<Arc<ClientRecord>> {
        self.clients.read().unwrap().get(&id).cloned()
    }

    fn clients(&self) -> Vec<Arc<ClientRecord>> {
        let mut all: Vec<_> = self.clients.read().unwrap().values().cloned().collect();
        all.sort_by_key(|c| c.id());
        all
    }
}

impl LockUpcalls for MemoryBackend {
    fn grant_blocked(&self, file: &FileObject, owner: LockOwner, lock: &LockParam) -> Result<()> {
        debug!(export = %file.export_id(), ?owner, "blocked lock granted");
        self.record(BackendEvent::LockGranted { owner, lock: *lock });
        Ok(())
    }

    fn available_blocked(
        &self,
        file: &FileObject,
        owner: LockOwner,
        lock: &LockParam,
    ) -> Result<()> {
        debug!(export = %file.export_id(), ?owner, "blocked lock available");
        self.record(BackendEvent::LockAvailable { owner, lock: *lock });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::types::IoMode;

    fn backend() -> MemoryBackend {
        let b = MemoryBackend::new(Arc::new(TokioClock), 1);
        b.add_export(ExportId(1), "/export");
        b
    }

    fn handle() -> FileHandle {
        FileHandle::new(vec![1, 2, 3])
    }

    #[test]
    fn test_subtract_middle_splits() {
        let granted = Segment::new(0, 100, IoMode::ReadWrite);
        let left = subtract(&granted, &Segment::new(40, 20, IoMode::Any));
        assert_eq!(
            left,
            vec![
                Segment::new(0, 40, IoMode::ReadWrite),
                Segment::new(60, 40, IoMode::ReadWrite),
            ]
        );
    }

    #[test]
    fn test_subtract_whole_file_removes_everything() {
        let granted = Segment::new(10, NFS4_UINT64_MAX, IoMode::Read);
        assert!(subtract(&granted, &Segment::whole_file()).is_empty());
    }

    #[test]
    fn test_subtract_keeps_tail_to_eof() {
        let granted = Segment::new(0, NFS4_UINT64_MAX, IoMode::Read);
        let left = subtract(&granted, &Segment::new(0, 50, IoMode::Read));
        assert_eq!(left, vec![Segment::new(50, NFS4_UINT64_MAX, IoMode::Read)]);
    }

    #[test]
    fn test_subtract_disjoint_untouched() {
        let granted = Segment::new(0, 10, IoMode::Read);
        assert_eq!(
            subtract(&granted, &Segment::new(10, 10, IoMode::Read)),
            vec![granted]
        );
    }

    #[test]
    fn test_resolve_missing_and_stale() {
        let b = backend();
        assert!(matches!(
            b.resolve(ExportId(1), &handle()),
            Err(RecallError::NotFound)
        ));
        b.add_file(ExportId(1), handle());
        assert!(b.resolve(ExportId(1), &handle()).is_ok());
        b.mark_stale(ExportId(1), &handle());
        assert!(matches!(
            b.resolve(ExportId(1), &handle()),
            Err(RecallError::Stale)
        ));
    }

    #[tokio::test]
    async fn test_return_delegation_removes_state() {
        let b = backend();
        b.add_client(ClientId(1), 1);
        let file = b.add_file(ExportId(1), handle());
        let other = b.grant_delegation(&file, ClientId(1), DelegationType::Read);
        assert!(b.acquire(&other).is_some());
        b.return_delegation(&other).unwrap();
        assert!(b.acquire(&other).is_none());
        assert_eq!(file.grant_count(), 0);
        assert!(b.return_delegation(&other).is_err());
    }

    #[tokio::test]
    async fn test_revoke_after_return_is_not_found() {
        let b = backend();
        b.add_client(ClientId(1), 1);
        let file = b.add_file(ExportId(1), handle());
        let other = b.grant_delegation(&file, ClientId(1), DelegationType::Write);
        let state = file.state(&other).unwrap();
        b.return_delegation(&other).unwrap();
        assert!(matches!(
            b.revoke_delegation(&file, &state),
            Err(RecallError::NotFound)
        ));
        assert_eq!(state.deleg_phase(), Some(DelegPhase::Returned));
        assert!(b.revoked_at(&other).is_none());
    }

    #[tokio::test]
    async fn test_acquire_fails_once_export_removed() {
        let b = backend();
        b.add_client(ClientId(1), 1);
        let file = b.add_file(ExportId(1), handle());
        let other = b.grant_delegation(&file, ClientId(1), DelegationType::Read);
        assert_eq!(b.acquire(&other).unwrap().export.path(), "/export");
        assert!(b.remove_export(ExportId(1)).is_some());
        assert!(b.acquire(&other).is_none());
        assert!(b.holds(&other));
        assert!(b.remove_export(ExportId(1)).is_none());
    }

    #[tokio::test]
    async fn test_acquire_fails_for_expired_client() {
        let b = backend();
        b.add_client(ClientId(1), 1);
        let file = b.add_file(ExportId(1), handle());
        let other = b.grant_delegation(&file, ClientId(1), DelegationType::Read);
        assert!(b.expire_client(ClientId(1)));
        assert!(b.acquire(&other).is_none());
    }

    #[tokio::test]
    async fn test_partial_layout_return_keeps_state() {
        let b = backend();
        b.add_client(ClientId(1), 1);
        let file = b.add_file(ExportId(1), handle());
        let other = b.grant_layout(
            &file,
            ClientId(1),
            LayoutType::Files,
            vec![Segment::new(0, 100, IoMode::ReadWrite)],
        );
        b.client_layout_return(&other, &Segment::new(0, 50, IoMode::Any))
            .unwrap();
        assert!(b.holds(&other));
        assert_eq!(
            file.state(&other).unwrap().segments(),
            vec![Segment::new(50, 50, IoMode::ReadWrite)]
        );
        b.client_layout_return(&other, &Segment::whole_file())
            .unwrap();
        assert!(!b.holds(&other));
        assert_eq!(b.events().len(), 2);
    }
}
