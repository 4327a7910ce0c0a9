//! The recall engine and the upcall vector a storage back-end drives it
//! through.
//!
//! `RecallEngine` bundles the collaborators every step needs. The recall
//! entry points themselves live with their state machines
//! (`deleg_recall`, `layout_recall`, `device_notify`); this module wires
//! them together and adds the remaining upcalls.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{
    AttrUpdate, ClientRegistry, ExportRegistry, LockOwner, LockParam, LockUpcalls, ObjectStore,
    StateTable,
};
use crate::callback::CallbackTransport;
use crate::clock::Clock;
use crate::config::RecallConfig;
use crate::error::{RecallError, Result};
use crate::executor::TaskExecutor;
use crate::stats::RecallStats;
use crate::types::{
    ClientFilter, DeviceId, ExportId, FileHandle, LayoutType, NotifyDeviceType, RecallCookie,
    Segment,
};

/// Collaborators the engine is built from
#[derive(Clone)]
pub struct Collaborators {
    /// File resolution and the revoke / return primitives
    pub store: Arc<dyn ObjectStore>,
    /// Stateid lookup
    pub states: Arc<dyn StateTable>,
    pub exports: Arc<dyn ExportRegistry>,
    pub clients: Arc<dyn ClientRegistry>,
    /// Back-channel RPC submission
    pub transport: Arc<dyn CallbackTransport>,
    pub executor: Arc<dyn TaskExecutor>,
    pub clock: Arc<dyn Clock>,
}

/// Delegation and layout recall engine.
pub struct RecallEngine {
    pub(crate) config: RecallConfig,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) states: Arc<dyn StateTable>,
    pub(crate) exports: Arc<dyn ExportRegistry>,
    pub(crate) clients: Arc<dyn ClientRegistry>,
    pub(crate) transport: Arc<dyn CallbackTransport>,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stats: RecallStats,
}

impl RecallEngine {
    /// Validates `config` and builds the engine.
    pub fn new(config: RecallConfig, collab: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            store: collab.store,
            states: collab.states,
            exports: collab.exports,
            clients: collab.clients,
            transport: collab.transport,
            executor: collab.executor,
            clock: collab.clock,
            stats: RecallStats::new(),
        }))
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    pub fn stats(&self) -> &RecallStats {
        &self.stats
    }
}

/// The full upcall vector: recall entry points plus the lock and cache
/// upcalls a back-end may raise.
pub struct Upcalls {
    engine: Arc<RecallEngine>,
    locks: Arc<dyn LockUpcalls>,
}

impl Upcalls {
    pub fn new(engine: Arc<RecallEngine>, locks: Arc<dyn LockUpcalls>) -> Self {
        Self { engine, locks }
    }

    pub fn engine(&self) -> &Arc<RecallEngine> {
        &self.engine
    }

    /// Recall every delegation on a file.
    pub fn delegrecall(&self, export: ExportId, handle: &FileHandle) -> Result<()> {
        self.engine.delegrecall(export, handle)
    }

    /// Recall the layouts on a file that match a range.
    #[allow(clippy::too_many_arguments)]
    pub fn layoutrecall(
        &self,
        export: ExportId,
        handle: &FileHandle,
        layout_type: LayoutType,
        changed: bool,
        segment: Segment,
        cookie: RecallCookie,
        filter: ClientFilter,
    ) -> Result<()> {
        self.engine
            .layoutrecall(export, handle, layout_type, changed, segment, cookie, filter)
    }

    /// Tell every client a device changed or went away.
    pub fn notify_device(
        &self,
        notify_type: NotifyDeviceType,
        layout_type: LayoutType,
        device_id: DeviceId,
        immediate: bool,
    ) -> Result<()> {
        self.engine
            .notify_device(notify_type, layout_type, device_id, immediate)
    }

    /// A blocked byte-range lock was granted by the back-end.
    pub fn lock_grant(
        &self,
        export: ExportId,
        handle: &FileHandle,
        owner: LockOwner,
        lock: &LockParam,
    ) -> Result<()> {
        let file = self.engine.store.resolve(export, handle).map_err(|e| {
            debug!(%export, error = %e, "lock grant on unknown file");
            RecallError::NotFound
        })?;
        self.locks.grant_blocked(&file, owner, lock)
    }

    /// A blocked byte-range lock may now be available.
    pub fn lock_avail(
        &self,
        export: ExportId,
        handle: &FileHandle,
        owner: LockOwner,
        lock: &LockParam,
    ) -> Result<()> {
        let file = self.engine.store.resolve(export, handle).map_err(|e| {
            debug!(%export, error = %e, "lock available on unknown file");
            RecallError::NotFound
        })?;
        self.locks.available_blocked(&file, owner, lock)
    }

    /// Nothing is cached at this layer.
    pub fn invalidate(&self, _export: ExportId, _handle: &FileHandle, _flags: u32) -> Result<()> {
        Ok(())
    }

    /// Nothing is cached at this layer, and open files are the back-end's.
    pub fn invalidate_close(
        &self,
        _export: ExportId,
        _handle: &FileHandle,
        _flags: u32,
    ) -> Result<()> {
        Ok(())
    }

    /// Attributes are not cached at this layer.
    pub fn update(
        &self,
        _export: ExportId,
        _handle: &FileHandle,
        _attrs: &AttrUpdate,
        _flags: u32,
    ) -> Result<()> {
        Ok(())
    }
}
