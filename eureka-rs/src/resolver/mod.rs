//! Server resolvers: where channels find the discovery cluster.
//!
//! `ServerResolvers::from_dns_name(host).with_port(p)` resolves through the naming primitive,
//! `ServerResolvers::from_endpoints(..)` is a fixed list, and
//! `ServerResolvers::from_eureka(inner).for_interest(i)` derives endpoints from a live interest
//! subscription against the cluster `inner` finds.

mod dns;
mod eureka;
mod state;

pub use dns::{DnsResolver, DnsResolverBuilder, StaticResolver};
pub use eureka::{EurekaResolver, EurekaResolverBuilder};
pub use state::{diff_stream, EndpointView, ResolverState};

use async_trait::async_trait;
use eureka_core::{ChangeNotification, DiscoveryError, DnsNameResolver, Endpoint, NameResolver, Transport};
use futures_util::stream::BoxStream;
use std::sync::Arc;

use crate::config::{ClientConfig, ResolverConfig};

pub type EndpointStream = BoxStream<'static, Result<ChangeNotification<Endpoint>, DiscoveryError>>;

#[async_trait]
pub trait ServerResolver: Send + Sync {
    /// Lazy and restartable: every call is an independent traversal that starts with the current
    /// endpoints as Add, then BufferSentinel, then Add/Delete as membership changes.
    /// Dropping the stream has no effect on the cluster.
    fn resolve(&self) -> EndpointStream;

    /// Cached endpoint list; resolves only when nothing is cached or after `invalidate`.
    async fn endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError>;

    /// Mark the cache stale, e.g. after every endpoint refused a connection.
    fn invalidate(&self);

    /// Release resolver-held resources (inner channels, cached endpoints).
    /// A later call to `resolve` or `endpoints` starts from a fresh resolution.
    async fn close(&self);

    fn describe(&self) -> String;
}

/// Resolver constructors.
pub struct ServerResolvers;

impl ServerResolvers {
    pub fn from_dns_name(host: impl Into<String>) -> DnsResolverBuilder {
        DnsResolverBuilder::new(host)
    }

    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Arc<dyn ServerResolver> {
        Arc::new(StaticResolver::new(endpoints))
    }

    pub fn from_eureka(bootstrap: Arc<dyn ServerResolver>) -> EurekaResolverBuilder {
        EurekaResolverBuilder::new(bootstrap)
    }
}

/// Build a resolver graph from its declarative description. Construction does no I/O.
pub fn from_config(
    config: &ResolverConfig,
    naming: Option<Arc<dyn NameResolver>>,
    transport: Arc<dyn Transport>,
    client_config: &ClientConfig,
) -> Result<Arc<dyn ServerResolver>, DiscoveryError> {
    let naming = naming.unwrap_or_else(|| Arc::new(DnsNameResolver));
    build(config, &naming, &transport, client_config)
}

fn build(
    config: &ResolverConfig,
    naming: &Arc<dyn NameResolver>,
    transport: &Arc<dyn Transport>,
    client_config: &ClientConfig,
) -> Result<Arc<dyn ServerResolver>, DiscoveryError> {
    match config {
        ResolverConfig::Dns { host, port } => {
            if host.trim().is_empty() {
                return Err(DiscoveryError::InvalidArgument("dns resolver needs a host".into()));
            }
            Ok(ServerResolvers::from_dns_name(host.clone())
                .with_port(*port)
                .with_name_resolver(Arc::clone(naming))
                .build())
        }
        ResolverConfig::Endpoints { endpoints } => {
            if endpoints.is_empty() {
                return Err(DiscoveryError::InvalidArgument("endpoint list is empty".into()));
            }
            Ok(ServerResolvers::from_endpoints(endpoints.iter().cloned()))
        }
        ResolverConfig::Eureka {
            bootstrap,
            interest,
            port,
        } => {
            let inner = build(bootstrap, naming, transport, client_config)?;
            let mut builder = ServerResolvers::from_eureka(inner)
                .for_interest(interest.clone())
                .with_transport(Arc::clone(transport))
                .with_config(client_config.clone());
            if let Some(p) = port {
                builder = builder.with_port(*p);
            }
            builder.build()
        }
    }
}
