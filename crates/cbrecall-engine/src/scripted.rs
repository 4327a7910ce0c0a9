//! Scripted callback transport.
//!
//! Answers each client's callbacks from a per-client script and records
//! every submission with its time. Drives the simulator and the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::callback::{
    CallbackCompound, CallbackOutcome, CallbackTransport, PendingReply, ReplySender, SubmitError,
};
use crate::client::ClientRecord;
use crate::clock::Clock;
use crate::error::NFS4_OK;
use crate::types::ClientId;

/// How one callback is answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Reply with this NFSv4 status
    Status(u32),
    /// Never answer; report a transport failure after this long
    TimeOut(Duration),
    /// Refuse the submission outright
    Refuse(SubmitError),
    /// Keep the reply open until the test answers it
    Hold,
}

impl ScriptedReply {
    pub fn ok() -> Self {
        ScriptedReply::Status(NFS4_OK)
    }
}

#[derive(Debug, Clone)]
struct Script {
    queued: VecDeque<ScriptedReply>,
    then: ScriptedReply,
}

impl Script {
    fn next(&mut self) -> ScriptedReply {
        self.queued.pop_front().unwrap_or_else(|| self.then.clone())
    }
}

/// One submitted callback
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub client: ClientId,
    pub compound: CallbackCompound,
    pub accepted: bool,
}

type Observer = Arc<dyn Fn(ClientId, &CallbackCompound) + Send + Sync>;

/// [`CallbackTransport`] answering from scripts
pub struct ScriptedTransport {
    clock: Arc<dyn Clock>,
    default: ScriptedReply,
    scripts: Mutex<HashMap<ClientId, Script>>,
    calls: Mutex<Vec<RecordedCall>>,
    held: Mutex<Vec<(ClientId, ReplySender)>>,
    observer: Mutex<Option<Observer>>,
}

impl ScriptedTransport {
    /// Transport acknowledging every callback of unscripted clients.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_default(clock, ScriptedReply::ok())
    }

    pub fn with_default(clock: Arc<dyn Clock>, default: ScriptedReply) -> Self {
        Self {
            clock,
            default,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        }
    }

    /// Answers `client` with `replies` in order, then with `then` forever.
    pub fn script(
        &self,
        client: ClientId,
        replies: impl IntoIterator<Item = ScriptedReply>,
        then: ScriptedReply,
    ) {
        self.scripts.lock().unwrap().insert(
            client,
            Script {
                queued: replies.into_iter().collect(),
                then,
            },
        );
    }

    pub fn always(&self, client: ClientId, reply: ScriptedReply) {
        self.script(client, [], reply);
    }

    /// Called after every accepted submission, with no transport lock held.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(ClientId, &CallbackCompound) + Send + Sync + 'static,
    {
        *self.observer.lock().unwrap() = Some(Arc::new(observer));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Accepted submissions to `client`.
    pub fn calls_to(&self, client: ClientId) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.client == client && c.accepted)
            .cloned()
            .collect()
    }

    /// Answers the oldest held callback of `client`. False if none is held.
    pub fn answer_held(&self, client: ClientId, outcome: CallbackOutcome) -> bool {
        let sender = {
            let mut held = self.held.lock().unwrap();
            match held.iter().position(|(c, _)| *c == client) {
                Some(pos) => held.remove(pos).1,
                None => return false,
            }
        };
        sender.send(outcome)
    }

    fn next_reply(&self, client: ClientId) -> ScriptedReply {
        match self.scripts.lock().unwrap().get_mut(&client) {
            Some(script) => script.next(),
            None => self.default.clone(),
        }
    }
}

impl CallbackTransport for ScriptedTransport {
    fn submit(
        &self,
        client: &ClientRecord,
        compound: CallbackCompound,
    ) -> Result<PendingReply, SubmitError> {
        let id = client.id();
        let reply = self.next_reply(id);
        let accepted = !matches!(reply, ScriptedReply::Refuse(_));
        self.calls.lock().unwrap().push(RecordedCall {
            at: self.clock.now(),
            client: id,
            compound: compound.clone(),
            accepted,
        });
        debug!(client = %id, op = compound.op.name(), ?reply, "scripted callback");

        let (tx, rx) = PendingReply::channel();
        match reply {
            ScriptedReply::Status(status) => {
                tx.send(CallbackOutcome::reply(status));
            }
            ScriptedReply::TimeOut(after) => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    tx.send(CallbackOutcome::transport_failure("callback RPC timed out"));
                });
            }
            ScriptedReply::Refuse(err) => return Err(err),
            ScriptedReply::Hold => self.held.lock().unwrap().push((id, tx)),
        }

        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer(id, &compound);
        }
        Ok(rx)
    }
}
