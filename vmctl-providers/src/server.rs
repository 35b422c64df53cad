use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Started,
    Stopped,
    Maintenance,
    Error,
    Unknown,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Started => "started",
            ServerState::Stopped => "stopped",
            ServerState::Maintenance => "maintenance",
            ServerState::Error => "error",
            ServerState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ServerState {
        match s.trim().to_ascii_lowercase().as_str() {
            "started" => ServerState::Started,
            "stopped" => ServerState::Stopped,
            "maintenance" => ServerState::Maintenance,
            "error" => ServerState::Error,
            _ => ServerState::Unknown,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    IPv4,
    IPv6,
}

impl IpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::IPv4 => "IPv4",
            IpFamily::IPv6 => "IPv6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Public,
    Utility,
    Private,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Public => "public",
            NetworkType::Utility => "utility",
            NetworkType::Private => "private",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub network_type: NetworkType,
    /// One automatically assigned address per entry.
    pub ip_families: Vec<IpFamily>,
}

/// Storage device cloned from a template at create time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneStorageDevice {
    pub template: String,
    pub title: String,
    pub size_gb: u32,
    pub tier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginUser {
    pub username: Option<String>,
    pub create_password: Option<bool>,
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVmRequest {
    pub title: String,
    pub hostname: String,
    pub zone: String,
    pub plan: String,
    pub core_number: u32,
    pub memory_amount: u32,
    pub timezone: Option<String>,
    pub storage_devices: Vec<CloneStorageDevice>,
    pub interfaces: Vec<NetworkInterface>,
    pub login_user: Option<LoginUser>,
    pub user_data: Option<String>,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyVmRequest {
    pub title: String,
    pub plan: String,
    pub zone: String,
    pub core_number: u32,
    pub memory_amount: u32,
    pub timezone: Option<String>,
    /// `None` leaves labels untouched, `Some` replaces the whole set.
    pub labels: Option<Vec<Label>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAddress {
    pub address: String,
    pub family: String,
    pub access: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDetails {
    pub uuid: String,
    pub title: String,
    pub hostname: String,
    pub zone: String,
    pub plan: String,
    pub state: ServerState,
    pub core_number: u32,
    pub memory_amount: u32,
    pub timezone: Option<String>,
    pub labels: Vec<Label>,
    pub ip_addresses: Vec<IpAddress>,
}

impl VmDetails {
    pub fn first_address(&self) -> Option<&str> {
        self.ip_addresses.first().map(|ip| ip.address.as_str())
    }

    pub fn has_label(&self, label: &Label) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}
