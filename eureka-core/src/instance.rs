//! Instance model: immutable InstanceInfo plus a copy-with builder.
//! A status change is a new InstanceInfo with the same id, never an in-place edit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::DiscoveryError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Starting,
    Up,
    Down,
    OutOfService,
    #[default]
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Starting => "STARTING",
            Status::Up => "UP",
            Status::Down => "DOWN",
            Status::OutOfService => "OUT_OF_SERVICE",
            Status::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Status {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Ok(Status::Starting),
            "UP" => Ok(Status::Up),
            "DOWN" => Ok(Status::Down),
            "OUT_OF_SERVICE" => Ok(Status::OutOfService),
            "UNKNOWN" => Ok(Status::Unknown),
            other => Err(DiscoveryError::InvalidArgument(format!("unknown status {:?}", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub ip: Option<String>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub public: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataCenterInfo {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
}

impl DataCenterInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: Vec::new(),
        }
    }

    pub fn with_address(mut self, address: NetworkAddress) -> Self {
        self.addresses.push(address);
        self
    }

    /// Local data-center info: hostname from HOSTNAME (or "localhost") and the loopback ip.
    pub fn from_system_data() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        DataCenterInfo::new("default").with_address(NetworkAddress {
            ip: Some("127.0.0.1".to_string()),
            hostname: Some(hostname),
            public: true,
        })
    }

    /// First public address (ip preferred over hostname), falling back to any address.
    pub fn default_host(&self) -> Option<&str> {
        fn pick(a: &NetworkAddress) -> Option<&str> {
            a.ip.as_deref().or(a.hostname.as_deref())
        }
        self.addresses
            .iter()
            .filter(|a| a.public)
            .find_map(pick)
            .or_else(|| self.addresses.iter().find_map(pick))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

impl ServicePort {
    pub fn new(port: u16) -> Self {
        Self {
            name: None,
            port,
            secure: false,
        }
    }

    pub fn named(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: Some(name.into()),
            port,
            secure: false,
        }
    }
}

/// Registered service process. Equality compares every field; registry identity is `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    id: String,
    app: String,
    app_group: Option<String>,
    vip_address: Option<String>,
    status: Status,
    data_center_info: Option<DataCenterInfo>,
    #[serde(default)]
    ports: Vec<ServicePort>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl InstanceInfo {
    pub fn builder() -> InstanceInfoBuilder {
        InstanceInfoBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn app_group(&self) -> Option<&str> {
        self.app_group.as_deref()
    }

    pub fn vip_address(&self) -> Option<&str> {
        self.vip_address.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn data_center_info(&self) -> Option<&DataCenterInfo> {
        self.data_center_info.as_ref()
    }

    pub fn ports(&self) -> &[ServicePort] {
        &self.ports
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

impl fmt::Display for InstanceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceInfo{{id={}, app={}, status={}}}", self.id, self.app, self.status)
    }
}

/// Builds validated InstanceInfo values. `From<&InstanceInfo>` starts from an existing value
/// so updates are "copy with changes".
#[derive(Clone, Debug, Default)]
pub struct InstanceInfoBuilder {
    id: Option<String>,
    app: Option<String>,
    app_group: Option<String>,
    vip_address: Option<String>,
    status: Status,
    data_center_info: Option<DataCenterInfo>,
    ports: Vec<ServicePort>,
    metadata: BTreeMap<String, String>,
}

impl From<&InstanceInfo> for InstanceInfoBuilder {
    fn from(info: &InstanceInfo) -> Self {
        Self {
            id: Some(info.id.clone()),
            app: Some(info.app.clone()),
            app_group: info.app_group.clone(),
            vip_address: info.vip_address.clone(),
            status: info.status,
            data_center_info: info.data_center_info.clone(),
            ports: info.ports.clone(),
            metadata: info.metadata.clone(),
        }
    }
}

impl InstanceInfoBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn app_group(mut self, group: impl Into<String>) -> Self {
        self.app_group = Some(group.into());
        self
    }

    pub fn vip_address(mut self, vip: impl Into<String>) -> Self {
        self.vip_address = Some(vip.into());
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn data_center_info(mut self, info: DataCenterInfo) -> Self {
        self.data_center_info = Some(info);
        self
    }

    pub fn port(mut self, port: ServicePort) -> Self {
        self.ports.push(port);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Fails when id or app is missing or blank.
    pub fn build(self) -> Result<InstanceInfo, DiscoveryError> {
        let id = self
            .id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| DiscoveryError::InvalidArgument("instance id is required".into()))?;
        let app = self
            .app
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| DiscoveryError::InvalidArgument(format!("app name is required for {}", id)))?;
        Ok(InstanceInfo {
            id,
            app,
            app_group: self.app_group,
            vip_address: self.vip_address,
            status: self.status,
            data_center_info: self.data_center_info,
            ports: self.ports,
            metadata: self.metadata,
        })
    }
}
