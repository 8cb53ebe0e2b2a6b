//! Eureka client for Rust: server resolvers, registration and interest channels on eureka-core.

pub mod channel;
pub mod client;
pub mod config;
pub mod resolver;

pub use channel::{InstancePublisher, InterestChannel, NotificationStream, Registration, RegistrationChannel, RegistrationState};
pub use client::{EurekaClient, EurekaClientBuilder};
pub use config::{BackoffConfig, ClientConfig, ResolverConfig};
pub use resolver::{ServerResolver, ServerResolvers};
pub use eureka_core::{ChangeNotification, DiscoveryError, Endpoint, InstanceInfo, Interest, Interests, Status};
