use std::time::Duration;

use chainbox_instance::InstanceId;
use tokio::task::AbortHandle;

use crate::manager::{DestroyCause, InstanceManager};

/// Schedules the end of an instance's life.
///
/// After `ttl` the task re-checks the store and destroys the instance only if
/// it is still there; an earlier kill simply leaves nothing to do.
pub(crate) fn schedule(manager: InstanceManager, id: InstanceId, ttl: Duration) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;

        if !manager.is_live(&id).await {
            tracing::debug!(uuid = %id, "reaper: instance already gone");
            return;
        }

        match manager.destroy(&id, DestroyCause::Expired).await {
            Ok(true) => tracing::info!(uuid = %id, ttl_secs = ttl.as_secs(), "instance expired"),
            Ok(false) => tracing::debug!(uuid = %id, "reaper: lost race with kill"),
            Err(err) => tracing::warn!(uuid = %id, %err, "reaper: destroy failed"),
        }
    })
    .abort_handle()
}
