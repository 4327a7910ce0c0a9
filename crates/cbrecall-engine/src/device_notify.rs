//! CB_NOTIFY_DEVICEID fan-out

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::callback::{CallbackCompound, CallbackOp};
use crate::engine::RecallEngine;
use crate::error::Result;
use crate::executor::task;
use crate::types::{DeviceId, LayoutType, NotifyDeviceType};

impl RecallEngine {
    /// Tells every NFSv4.1+ client that a device changed or went away.
    ///
    /// Best effort: clients that cannot be reached are skipped and replies
    /// are only logged.
    pub fn notify_device(
        self: &Arc<Self>,
        notify_type: NotifyDeviceType,
        layout_type: LayoutType,
        device_id: DeviceId,
        immediate: bool,
    ) -> Result<()> {
        let op = CallbackOp::NotifyDeviceId {
            notify_type,
            layout_type,
            device_id,
            immediate,
        };

        for client in self.clients.clients() {
            // no CB_NOTIFY_DEVICEID before 4.1
            if client.minor_version() < 1 {
                continue;
            }
            if client.is_expired() || client.cb_chan_down() {
                debug!(client = %client.id(), "skipping device notification");
                continue;
            }

            let compound = CallbackCompound::for_client(&client, op.clone());
            let pending = match self.transport.submit(&client, compound) {
                Ok(pending) => pending,
                Err(e) => {
                    debug!(client = %client.id(), error = %e, "CB_NOTIFY_DEVICEID not sent");
                    continue;
                }
            };
            self.stats.record_device_notification();

            let id = client.id();
            let waiter = task(async move {
                let outcome = pending.wait().await;
                debug!(client = %id, ?outcome, "CB_NOTIFY_DEVICEID completed");
            });
            if let Err(e) = self.executor.schedule(Duration::ZERO, waiter) {
                debug!(client = %id, error = %e, "not waiting for CB_NOTIFY_DEVICEID reply");
            }
        }
        Ok(())
    }
}
