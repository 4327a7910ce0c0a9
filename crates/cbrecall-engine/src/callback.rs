//! Callback compounds and the transport that carries them.
//!
//! The engine never encodes RPCs. It builds a [`CallbackCompound`] with the
//! logical fields of CB_RECALL, CB_LAYOUTRECALL or CB_NOTIFY_DEVICEID and
//! hands it to a [`CallbackTransport`], which either refuses it up front or
//! returns a [`PendingReply`] that resolves exactly once.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::client::ClientRecord;
use crate::types::{DeviceId, IoMode, LayoutType, Nfs4FileHandle, NotifyDeviceType, StateId};

/// layoutrecall_file4
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutRecallFile {
    pub fh: Nfs4FileHandle,
    pub offset: u64,
    pub length: u64,
    pub stateid: StateId,
}

/// The single operation carried by a callback compound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackOp {
    /// CB_RECALL
    Recall {
        stateid: StateId,
        truncate: bool,
        fh: Nfs4FileHandle,
    },
    /// CB_LAYOUTRECALL of type LAYOUTRECALL4_FILE
    LayoutRecall {
        layout_type: LayoutType,
        iomode: IoMode,
        changed: bool,
        recall: LayoutRecallFile,
    },
    /// CB_NOTIFY_DEVICEID
    NotifyDeviceId {
        notify_type: NotifyDeviceType,
        layout_type: LayoutType,
        device_id: DeviceId,
        immediate: bool,
    },
}

impl CallbackOp {
    pub fn name(&self) -> &'static str {
        match self {
            CallbackOp::Recall { .. } => "CB_RECALL",
            CallbackOp::LayoutRecall { .. } => "CB_LAYOUTRECALL",
            CallbackOp::NotifyDeviceId { .. } => "CB_NOTIFY_DEVICEID",
        }
    }
}

/// One callback request to one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackCompound {
    pub callback_ident: u32,
    pub minor_version: u32,
    pub op: CallbackOp,
}

impl CallbackCompound {
    /// Compound addressed to `client`'s callback program.
    pub fn for_client(client: &ClientRecord, op: CallbackOp) -> Self {
        Self {
            callback_ident: client.callback_ident(),
            minor_version: client.minor_version(),
            op,
        }
    }
}

/// How a submitted callback ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackOutcome {
    /// The client answered with this NFSv4 status
    Reply { status: u32 },
    /// No answer: connection lost, RPC timeout, or reply undecodable
    TransportFailure { reason: String },
}

impl CallbackOutcome {
    pub fn reply(status: u32) -> Self {
        CallbackOutcome::Reply { status }
    }

    pub fn transport_failure(reason: impl Into<String>) -> Self {
        CallbackOutcome::TransportFailure {
            reason: reason.into(),
        }
    }
}

/// Transport side of a pending reply.
#[derive(Debug)]
pub struct ReplySender(oneshot::Sender<CallbackOutcome>);

impl ReplySender {
    /// Delivers the outcome. Returns false if nobody is waiting any more.
    pub fn send(self, outcome: CallbackOutcome) -> bool {
        self.0.send(outcome).is_ok()
    }
}

/// Engine side of a submitted callback.
#[derive(Debug)]
pub struct PendingReply(oneshot::Receiver<CallbackOutcome>);

impl PendingReply {
    pub fn channel() -> (ReplySender, PendingReply) {
        let (tx, rx) = oneshot::channel();
        (ReplySender(tx), PendingReply(rx))
    }

    /// Waits for the outcome. A transport that drops its sender without
    /// answering counts as a transport failure.
    pub async fn wait(self) -> CallbackOutcome {
        match self.0.await {
            Ok(outcome) => outcome,
            Err(_) => CallbackOutcome::transport_failure("reply dropped by transport"),
        }
    }
}

/// Why a callback could not be submitted at all
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The client's back channel is known to be down
    #[error("callback channel is down")]
    ChannelDown,
    /// No back channel could be obtained for the client
    #[error("no callback channel for client")]
    NoChannel,
    /// The transport refused the call
    #[error("callback submission rejected: {reason}")]
    Rejected {
        /// Transport's reason
        reason: String,
    },
}

/// Per-client callback RPC submission.
pub trait CallbackTransport: Send + Sync + 'static {
    /// Queues `compound` to `client`. Must not block on the client.
    fn submit(
        &self,
        client: &ClientRecord,
        compound: CallbackCompound,
    ) -> Result<PendingReply, SubmitError>;
}
