//! Collaborator contracts consumed by the engine.
//!
//! The engine owns none of the registries it works against. File objects,
//! granted states, exports and client records come from these traits and
//! are only held for the duration of one step.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::ClientRecord;
use crate::error::Result;
use crate::state::{FileObject, GrantedState};
use crate::types::{ClientId, ExportId, FileHandle, ReturnCircumstance, Segment, StateOther};

/// A server export: the namespace a file handle is minted under.
#[derive(Debug)]
pub struct Export {
    id: ExportId,
    path: String,
}

impl Export {
    pub fn new(id: ExportId, path: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }

    pub fn id(&self) -> ExportId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Live objects behind a state key, acquired together for one step.
#[derive(Debug, Clone)]
pub struct LiveRefs {
    pub state: Arc<GrantedState>,
    pub client: Arc<ClientRecord>,
    pub file: Arc<FileObject>,
    /// Export the state was granted under; rebuilds the client's handle
    pub export: Arc<Export>,
}

/// Export registry.
pub trait ExportRegistry: Send + Sync + 'static {
    /// The export with this id, or `None` once it has been removed.
    fn get_export(&self, id: ExportId) -> Option<Arc<Export>>;
}

/// Storage back-end.
pub trait ObjectStore: Send + Sync + 'static {
    /// Looks a file up by export and back-end handle. `NotFound`/`Stale`
    /// when this node has no such object.
    fn resolve(&self, export: ExportId, handle: &FileHandle) -> Result<Arc<FileObject>>;

    /// Removes a delegation from the file and tells the storage layer.
    /// Takes the file's state lock itself.
    fn revoke_delegation(&self, file: &FileObject, state: &GrantedState) -> Result<()>;

    /// Returns `segment` of a layout state. Takes the file's state lock
    /// itself.
    fn return_layout(
        &self,
        file: &FileObject,
        state: &GrantedState,
        segment: &Segment,
        circumstance: ReturnCircumstance,
    ) -> Result<()>;
}

/// Stateid lookup.
pub trait StateTable: Send + Sync + 'static {
    /// State, owning client, file and export for `other`, or `None` once
    /// any of them is gone or going away.
    fn acquire(&self, other: &StateOther) -> Option<LiveRefs>;
}

/// Client registry.
pub trait ClientRegistry: Send + Sync + 'static {
    fn get(&self, id: ClientId) -> Option<Arc<ClientRecord>>;

    /// Every client currently registered.
    fn clients(&self) -> Vec<Arc<ClientRecord>>;
}

/// Opaque owner of a byte-range lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner(pub u64);

/// Byte-range lock kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    Read,
    Write,
}

/// Byte-range lock description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockParam {
    pub lock_type: LockType,
    pub start: u64,
    pub length: u64,
}

/// Lock manager entry points for blocked-lock upcalls.
pub trait LockUpcalls: Send + Sync + 'static {
    /// A blocked lock has been granted by the back-end.
    fn grant_blocked(&self, file: &FileObject, owner: LockOwner, lock: &LockParam) -> Result<()>;

    /// A blocked lock may now be obtainable.
    fn available_blocked(
        &self,
        file: &FileObject,
        owner: LockOwner,
        lock: &LockParam,
    ) -> Result<()>;
}

/// Attribute update pushed by a back-end
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrUpdate {
    pub size: Option<u64>,
    pub change: Option<u64>,
    pub mtime_ns: Option<u64>,
}
