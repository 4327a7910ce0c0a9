#![warn(missing_docs)]

//! Delegation and pNFS layout recall engine for an NFSv4.1 server: recalls
//! granted state from clients, waits for its return, and revokes what is
//! not given back within the lease.

pub mod backend;
pub mod callback;
pub mod client;
pub mod clock;
pub mod config;
pub mod deleg_recall;
pub mod device_notify;
pub mod engine;
pub mod error;
pub mod executor;
pub mod layout_recall;
pub mod memory;
pub mod scripted;
pub mod state;
pub mod stats;
pub mod types;

pub use backend::{
    ClientRegistry, Export, ExportRegistry, LiveRefs, LockUpcalls, ObjectStore, StateTable,
};
pub use callback::{CallbackCompound, CallbackOp, CallbackOutcome, CallbackTransport};
pub use client::ClientRecord;
pub use clock::{Clock, TokioClock};
pub use config::RecallConfig;
pub use deleg_recall::should_revoke;
pub use engine::{Collaborators, RecallEngine, Upcalls};
pub use error::{RecallError, Result};
pub use executor::{TaskExecutor, TokioExecutor};
pub use layout_recall::layout_backoff;
pub use memory::MemoryBackend;
pub use scripted::{ScriptedReply, ScriptedTransport};
pub use stats::{RecallStats, RecallStatsSnapshot};
