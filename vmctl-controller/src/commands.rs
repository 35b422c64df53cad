use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vmctl_common::bus::{ControllerCommand, CHANNEL_CONTROLLER_COMMANDS};

use crate::controller::enqueue_all;
use crate::queue::WorkQueue;
use crate::store::ResourceStore;

pub fn parse_command(payload: &str) -> Option<ControllerCommand> {
    match serde_json::from_str::<ControllerCommand>(payload) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            warn!(error = %e, payload, "ignoring unknown controller command");
            None
        }
    }
}

/// Applies one command. Commands only enqueue; reconciliation re-reads the record.
pub async fn handle_command(
    cmd: ControllerCommand,
    queue: &WorkQueue,
    store: &dyn ResourceStore,
) {
    match cmd {
        ControllerCommand::Reconcile { namespace, name } => {
            let key = vmctl_common::ResourceKey::new(namespace, name);
            info!(key = %key, "manual reconcile requested");
            queue.add(key).await;
        }
        ControllerCommand::Resync => match enqueue_all(store, queue).await {
            Ok(n) => info!(records = n, "manual resync requested"),
            Err(e) => warn!(error = %e, "manual resync failed"),
        },
    }
}

/// Subscribes to the command channel until `shutdown` fires.
pub async fn run(
    client: redis::Client,
    queue: Arc<WorkQueue>,
    store: Arc<dyn ResourceStore>,
    shutdown: CancellationToken,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL_CONTROLLER_COMMANDS).await?;
    info!(channel = CHANNEL_CONTROLLER_COMMANDS, "listening for controller commands");

    let mut messages = pubsub.on_message();
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = messages.next() => match msg {
                Some(msg) => msg,
                None => {
                    warn!("command channel closed");
                    break;
                }
            },
        };
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unreadable command payload");
                continue;
            }
        };
        if let Some(cmd) = parse_command(&payload) {
            handle_command(cmd, &queue, store.as_ref()).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use vmctl_common::{ResourceKey, VmSpec};

    #[tokio::test]
    async fn reconcile_command_enqueues_key() {
        let queue = WorkQueue::new();
        let store = MemoryStore::new();
        let cmd = parse_command(r#"{"type":"CMD:RECONCILE","namespace":"default","name":"vm-1"}"#)
            .unwrap();
        handle_command(cmd, &queue, &store).await;
        assert_eq!(queue.get().await, Some(ResourceKey::new("default", "vm-1")));
    }

    #[tokio::test]
    async fn resync_command_enqueues_every_record() {
        let queue = WorkQueue::new();
        let store = MemoryStore::new();
        let spec = VmSpec {
            cpu: 1,
            memory: 1024,
            storage_size: 10,
            zone: "fi-hel1".to_string(),
            plan: "custom".to_string(),
            timezone: None,
            storage_template: "template-uuid".to_string(),
            login_user: None,
            user_data: None,
        };
        for name in ["vm-1", "vm-2"] {
            store
                .create(&ResourceKey::new("default", name), spec.clone())
                .await
                .unwrap();
        }
        handle_command(ControllerCommand::Resync, &queue, &store).await;
        assert_eq!(queue.len().await, 2);
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(parse_command("not json").is_none());
        assert!(parse_command(r#"{"type":"CMD:TERMINATE"}"#).is_none());
    }
}
