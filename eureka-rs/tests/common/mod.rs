//! Shared fixtures: a loopback cluster, short timeouts and polling helpers.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use eureka_core::{
    DataCenterInfo, Endpoint, InstanceInfo, LoopbackRegistry, LoopbackTransport, NetworkAddress, ServicePort, Status,
};
use eureka_rs::{BackoffConfig, ClientConfig, ServerResolver, ServerResolvers};
use futures_util::{Stream, StreamExt};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn fast_config() -> ClientConfig {
    ClientConfig {
        deregistration_timeout: Duration::from_millis(200),
        ack_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(200),
        notification_buffer: 64,
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            max_attempts: 3,
        },
    }
}

pub fn instance(id: &str, app: &str, status: Status) -> InstanceInfo {
    InstanceInfo::builder().id(id).app(app).status(status).build().unwrap()
}

/// Server-like instance advertising `ip:port`, tagged with `vip`.
pub fn server_instance(id: &str, vip: &str, ip: &str, port: u16, status: Status) -> InstanceInfo {
    InstanceInfo::builder()
        .id(id)
        .app("ReadServer")
        .vip_address(vip)
        .status(status)
        .data_center_info(DataCenterInfo::new("default").with_address(NetworkAddress {
            ip: Some(ip.to_string()),
            hostname: None,
            public: true,
        }))
        .port(ServicePort::named("interest", port))
        .build()
        .unwrap()
}

/// One registry served at one endpoint, reachable through a fixed-list resolver.
pub struct Cluster {
    pub registry: LoopbackRegistry,
    pub transport: LoopbackTransport,
    pub endpoint: Endpoint,
    pub resolver: Arc<dyn ServerResolver>,
}

impl Cluster {
    pub fn new(host: &str, port: u16) -> Self {
        let registry = LoopbackRegistry::new();
        let transport = LoopbackTransport::new();
        let endpoint = Endpoint::new(host, port);
        transport.serve(&endpoint, registry.clone());
        let resolver = ServerResolvers::from_endpoints([endpoint.clone()]);
        Self {
            registry,
            transport,
            endpoint,
            resolver,
        }
    }

    pub fn transport(&self) -> Arc<LoopbackTransport> {
        Arc::new(self.transport.clone())
    }
}

/// Poll `check` until it holds or WAIT elapses.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

pub async fn next_item<S: Stream + Unpin>(stream: &mut S) -> S::Item {
    within(stream.next()).await.expect("stream ended early")
}

/// True when nothing arrives for a short while.
pub async fn quiet<S: Stream + Unpin>(stream: &mut S) -> bool {
    tokio::time::timeout(Duration::from_millis(150), stream.next()).await.is_err()
}
