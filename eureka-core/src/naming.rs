//! Naming primitive: hostname -> socket addresses. Any failure means "no endpoints this attempt".

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::DiscoveryError;

#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DiscoveryError>;
}

/// System resolver via `tokio::net::lookup_host`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsNameResolver;

#[async_trait]
impl NameResolver for DnsNameResolver {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| DiscoveryError::Resolution(format!("lookup {}: {}", host, e)))?;
        let mut out: Vec<SocketAddr> = addrs.collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}

/// Fixed host table. The port from `lookup` replaces the stored port.
/// Entries can be swapped at runtime to simulate membership changes.
#[derive(Clone, Default)]
pub struct StaticNameResolver {
    table: Arc<Mutex<HashMap<String, Vec<SocketAddr>>>>,
}

impl StaticNameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, addrs: Vec<SocketAddr>) -> Self {
        self.set(host, addrs);
        self
    }

    pub fn set(&self, host: &str, addrs: Vec<SocketAddr>) {
        if let Ok(mut t) = self.table.lock() {
            t.insert(host.to_string(), addrs);
        }
    }

    pub fn remove(&self, host: &str) {
        if let Ok(mut t) = self.table.lock() {
            t.remove(host);
        }
    }
}

#[async_trait]
impl NameResolver for StaticNameResolver {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let table = self
            .table
            .lock()
            .map_err(|_| DiscoveryError::Resolution("name table poisoned".into()))?;
        let addrs = table
            .get(host)
            .ok_or_else(|| DiscoveryError::Resolution(format!("unknown host {:?}", host)))?;
        Ok(addrs.iter().map(|a| SocketAddr::new(a.ip(), port)).collect())
    }
}
