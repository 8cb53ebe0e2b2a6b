//! Name-based and fixed-list resolvers. Re-resolution is on demand only; there is no timer.

use async_trait::async_trait;
use eureka_core::{DiscoveryError, DnsNameResolver, Endpoint, NameResolver, Protocol};
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::state::{diff_stream, ResolverState};
use super::{EndpointStream, ServerResolver};
use crate::config::DEFAULT_INTEREST_PORT;

pub struct DnsResolverBuilder {
    host: String,
    port: u16,
    protocol: Protocol,
    naming: Option<Arc<dyn NameResolver>>,
}

impl DnsResolverBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_INTEREST_PORT,
            protocol: Protocol::Tcp,
            naming: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Naming primitive; defaults to the system resolver.
    pub fn with_name_resolver(mut self, naming: Arc<dyn NameResolver>) -> Self {
        self.naming = Some(naming);
        self
    }

    pub fn build_resolver(self) -> DnsResolver {
        DnsResolver {
            inner: Arc::new(DnsInner {
                host: self.host,
                port: self.port,
                protocol: self.protocol,
                naming: self.naming.unwrap_or_else(|| Arc::new(DnsNameResolver)),
                state: ResolverState::new(),
                stale: AtomicBool::new(true),
                lookups: AtomicUsize::new(0),
                lookup_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn build(self) -> Arc<dyn ServerResolver> {
        Arc::new(self.build_resolver())
    }
}

/// Resolves a fixed host and port through the naming primitive.
pub struct DnsResolver {
    inner: Arc<DnsInner>,
}

struct DnsInner {
    host: String,
    port: u16,
    protocol: Protocol,
    naming: Arc<dyn NameResolver>,
    state: ResolverState,
    stale: AtomicBool,
    lookups: AtomicUsize,
    // Concurrent callers share one lookup instead of each hitting the naming primitive.
    lookup_lock: tokio::sync::Mutex<()>,
}

impl DnsResolver {
    /// Naming-primitive calls made so far.
    pub fn lookups(&self) -> usize {
        self.inner.lookups.load(Ordering::SeqCst)
    }
}

impl DnsInner {
    async fn ensure_resolved(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let _guard = self.lookup_lock.lock().await;
        let view = self.state.current();
        if view.ready && !view.closed && !self.stale.load(Ordering::SeqCst) {
            return Ok(view.endpoints.into_iter().collect());
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let addrs = match self.naming.lookup(&self.host, self.port).await {
            Ok(addrs) if addrs.is_empty() => {
                warn!(host = %self.host, "name lookup returned no addresses");
                return Err(DiscoveryError::Resolution(format!("{} resolved to no addresses", self.host)));
            }
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(host = %self.host, error = %e, "name lookup failed");
                return Err(e);
            }
        };
        let endpoints: BTreeSet<Endpoint> = addrs
            .into_iter()
            .map(|a| Endpoint::from(a).with_protocol(self.protocol))
            .collect();
        debug!(host = %self.host, count = endpoints.len(), "resolved");
        self.state.publish(endpoints.clone());
        self.stale.store(false, Ordering::SeqCst);
        Ok(endpoints.into_iter().collect())
    }
}

#[async_trait]
impl ServerResolver for DnsResolver {
    fn resolve(&self) -> EndpointStream {
        let inner = Arc::clone(&self.inner);
        stream::once(async move { inner.ensure_resolved().await.map(|_| inner.state.subscribe()) })
            .flat_map(|resolved| match resolved {
                Ok(rx) => diff_stream(rx),
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            })
            .boxed()
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        self.inner.ensure_resolved().await
    }

    fn invalidate(&self) {
        debug!(host = %self.inner.host, "endpoint cache invalidated");
        self.inner.stale.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        let _guard = self.inner.lookup_lock.lock().await;
        self.inner.stale.store(true, Ordering::SeqCst);
        self.inner.state.close();
    }

    fn describe(&self) -> String {
        format!("dns({}:{})", self.inner.host, self.inner.port)
    }
}

/// Fixed endpoint list. Never touches the network.
pub struct StaticResolver {
    endpoints: BTreeSet<Endpoint>,
    state: Arc<ResolverState>,
}

impl StaticResolver {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let endpoints: BTreeSet<Endpoint> = endpoints.into_iter().collect();
        let state = Arc::new(ResolverState::new());
        state.publish(endpoints.clone());
        Self { endpoints, state }
    }

    fn ensure_open(&self) {
        if self.state.current().closed {
            self.state.reopen();
            self.state.publish(self.endpoints.clone());
        }
    }
}

#[async_trait]
impl ServerResolver for StaticResolver {
    fn resolve(&self) -> EndpointStream {
        self.ensure_open();
        diff_stream(self.state.subscribe())
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        self.ensure_open();
        if self.endpoints.is_empty() {
            return Err(DiscoveryError::Resolution("static endpoint list is empty".into()));
        }
        Ok(self.endpoints.iter().cloned().collect())
    }

    fn invalidate(&self) {}

    async fn close(&self) {
        self.state.close();
    }

    fn describe(&self) -> String {
        let list: Vec<String> = self.endpoints.iter().map(ToString::to_string).collect();
        format!("static[{}]", list.join(","))
    }
}
