use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod bus;

/// Finalizer token held by the controller while an external VM may exist.
pub const FINALIZER: &str = "upcloud.finalizer";

// --- Identity ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid resource key {0:?}: expected <namespace>/<name>")]
pub struct KeyParseError(pub String);

impl FromStr for ResourceKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((namespace, name)) = s.trim().split_once('/') else {
            return Err(KeyParseError(s.to_string()));
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(KeyParseError(s.to_string()));
        }
        Ok(Self::new(namespace, name))
    }
}

// --- Enums ---

/// Observed lifecycle of a VM record. `Ready` is rendered as "Running" to stay
/// compatible with records written by earlier controller versions.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Provisioning, // Create request sent, VM not recorded yet
    #[serde(rename = "Running")]
    Ready,
    Updating,
    Terminating,
    Deleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "Uninitialized",
            LifecycleState::Provisioning => "Provisioning",
            LifecycleState::Ready => "Running",
            LifecycleState::Updating => "Updating",
            LifecycleState::Terminating => "Terminating",
            LifecycleState::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Records ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: Uuid,
    #[serde(default)]
    pub resource_version: i64,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub creation_timestamp: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }

    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.iter().any(|f| f == token)
    }

    /// Returns false when the token was already present.
    pub fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) {
            return false;
        }
        self.finalizers.push(token.to_string());
        true
    }

    /// Removes every occurrence of `token`; returns false when none was present.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != token);
        before != self.finalizers.len()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct LoginUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_password: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
}

/// Desired state of a VM as written by the operator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub cpu: u32,
    pub memory: u32, // MiB
    #[serde(rename = "storagesize")]
    pub storage_size: u32, // GiB
    pub zone: String,
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(rename = "storagetemplate")]
    pub storage_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_user: Option<LoginUser>,
    // Size limit is enforced by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid VM spec: {}", .problems.join("; "))]
pub struct SpecError {
    pub problems: Vec<String>,
}

impl VmSpec {
    /// Shallow sanity checks only; the provider owns real validation.
    pub fn validate(&self) -> Result<(), SpecError> {
        let mut problems = Vec::new();
        if self.cpu == 0 {
            problems.push("cpu must be positive".to_string());
        }
        if self.memory == 0 {
            problems.push("memory must be positive".to_string());
        }
        if self.storage_size == 0 {
            problems.push("storagesize must be positive".to_string());
        }
        for (field, value) in [
            ("zone", &self.zone),
            ("plan", &self.plan),
            ("storagetemplate", &self.storage_template),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{} must not be empty", field));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SpecError { problems })
        }
    }
}

/// Observed state, written only by the controller.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct VmStatus {
    #[serde(rename = "vmID", default, skip_serializing_if = "String::is_empty")]
    pub vm_id: String,
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(rename = "ipAddress", default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VmResource {
    pub metadata: ObjectMeta,
    pub spec: VmSpec,
    #[serde(default)]
    pub status: VmStatus,
}

impl VmResource {
    /// A fresh record as an operator would submit it; the store assigns uid
    /// and versions on create.
    pub fn new(key: ResourceKey, spec: VmSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: key.namespace,
                name: key.name,
                uid: Uuid::nil(),
                resource_version: 0,
                generation: 0,
                finalizers: Vec::new(),
                deletion_timestamp: None,
                creation_timestamp: Utc::now(),
            },
            spec,
            status: VmStatus::default(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.metadata.key()
    }

    /// Lifecycle as an observer sees it: a deletion request overrides the
    /// last persisted state.
    pub fn lifecycle(&self) -> LifecycleState {
        if self.metadata.is_being_deleted() {
            LifecycleState::Terminating
        } else {
            self.status.state
        }
    }
}
