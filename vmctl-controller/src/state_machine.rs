use vmctl_common::{LifecycleState, VmResource};

/// Reconciliation branch for a record, derived from its fields only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Record no longer exists.
    Deleted,
    /// Deletion marker set; cleanup pending.
    PendingDeletion,
    /// No external VM recorded yet.
    Uninitialized,
    /// External VM recorded in `status.vmID`.
    Provisioned,
}

impl Phase {
    pub fn of(record: Option<&VmResource>) -> Phase {
        match record {
            None => Phase::Deleted,
            Some(r) if r.metadata.is_being_deleted() => Phase::PendingDeletion,
            Some(r) if r.status.vm_id.is_empty() => Phase::Uninitialized,
            Some(_) => Phase::Provisioned,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Deleted => "deleted",
            Phase::PendingDeletion => "pending_deletion",
            Phase::Uninitialized => "uninitialized",
            Phase::Provisioned => "provisioned",
        }
    }
}

/// True when a previous create may have reached the provider without its
/// result being recorded.
pub fn creation_in_flight(record: &VmResource) -> bool {
    record.status.vm_id.is_empty() && record.status.state == LifecycleState::Provisioning
}
