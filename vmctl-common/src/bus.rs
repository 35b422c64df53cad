use serde::{Deserialize, Serialize};

use crate::ResourceKey;

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_CONTROLLER_COMMANDS: &str = "vm_controller_commands";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

/// Out-of-band triggers published by operators or tooling. The controller
/// never trusts a command's payload beyond the identity; it always re-reads
/// the record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControllerCommand {
    #[serde(rename = "CMD:RECONCILE")]
    Reconcile { namespace: String, name: String },
    #[serde(rename = "CMD:RESYNC")]
    Resync,
}

impl ControllerCommand {
    pub fn reconcile(key: &ResourceKey) -> Self {
        ControllerCommand::Reconcile {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerCommand::Reconcile { .. } => "CMD:RECONCILE",
            ControllerCommand::Resync => "CMD:RESYNC",
        }
    }

    pub fn key(&self) -> Option<ResourceKey> {
        match self {
            ControllerCommand::Reconcile { namespace, name } => {
                Some(ResourceKey::new(namespace, name))
            }
            ControllerCommand::Resync => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reconcile_payload() {
        let cmd: ControllerCommand = serde_json::from_str(
            r#"{"type":"CMD:RECONCILE","namespace":"default","name":"vm-1"}"#,
        )
        .unwrap();
        assert_eq!(cmd.key(), Some(ResourceKey::new("default", "vm-1")));
        assert_eq!(cmd.as_str(), "CMD:RECONCILE");
    }

    #[test]
    fn resync_has_no_key() {
        let cmd: ControllerCommand = serde_json::from_str(r#"{"type":"CMD:RESYNC"}"#).unwrap();
        assert_eq!(cmd, ControllerCommand::Resync);
        assert!(cmd.key().is_none());
        let json = serde_json::to_string(&ControllerCommand::reconcile(&ResourceKey::new("a", "b"))).unwrap();
        assert!(json.contains("CMD:RECONCILE"));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<ControllerCommand>(r#"{"type":"CMD:PROVISION"}"#).is_err());
    }
}
