//! Eureka core: instance model, interests, change notifications, wire protocol and transports.
//! The client crate (eureka-rs) builds resolvers and channels on top of these.

pub mod endpoint;
pub mod instance;
pub mod interest;
pub mod loopback;
pub mod naming;
pub mod notification;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use endpoint::{Endpoint, Protocol};
pub use instance::{DataCenterInfo, InstanceInfo, InstanceInfoBuilder, NetworkAddress, ServicePort, Status};
pub use interest::{Interest, Interests};
pub use loopback::{LoopbackRegistry, LoopbackTransport, ObservedMessage};
pub use naming::{DnsNameResolver, NameResolver, StaticNameResolver};
pub use notification::{ChangeNotification, Kind};
pub use protocol::{decode_line, encode_line, ClientMessage, ServerMessage};
pub use tcp::TcpTransport;
pub use transport::{Session, Transport};

use std::time::Duration;
use thiserror::Error;

/// Failures seen by resolvers and channels. Cloneable so one terminal error can be
/// handed to a stream consumer and kept in channel state at the same time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Naming primitive or inner discovery query produced no endpoints.
    #[error("resolution failed: {0}")]
    Resolution(String),
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },
    /// Server sent a message that is not valid in the current session state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("deregistration not acknowledged within {0:?}")]
    DeregistrationTimeout(Duration),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("channel shut down")]
    Shutdown,
}

impl DiscoveryError {
    pub fn connection(endpoint: &Endpoint, reason: impl std::fmt::Display) -> Self {
        DiscoveryError::Connection {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Transient failures: retried internally with backoff, surfaced only once retries run out.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiscoveryError::Resolution(_) | DiscoveryError::Connection { .. })
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(e: serde_json::Error) -> Self {
        DiscoveryError::Codec(e.to_string())
    }
}
