//! Discovery-mediated resolver: endpoints are the Up instances matching an interest, read through
//! an InterestChannel against the cluster the bootstrap resolver finds.
//!
//! Ownership is explicit: the resolver owns its bootstrap resolver and its inner channel, and
//! `close` releases them in order (tracking task, channel, cache, bootstrap).

use async_trait::async_trait;
use eureka_core::{ChangeNotification, DiscoveryError, Endpoint, InstanceInfo, Interest, Status, TcpTransport, Transport};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{diff_stream, ResolverState};
use super::{EndpointStream, ServerResolver};
use crate::channel::{InterestChannel, NotificationStream};
use crate::config::ClientConfig;

pub struct EurekaResolverBuilder {
    bootstrap: Arc<dyn ServerResolver>,
    interest: Option<Interest>,
    port: Option<u16>,
    transport: Option<Arc<dyn Transport>>,
    config: ClientConfig,
}

impl EurekaResolverBuilder {
    pub fn new(bootstrap: Arc<dyn ServerResolver>) -> Self {
        Self {
            bootstrap,
            interest: None,
            port: None,
            transport: None,
            config: ClientConfig::default(),
        }
    }

    pub fn for_interest(mut self, interest: Interest) -> Self {
        self.interest = Some(interest);
        self
    }

    /// Fixed port for every derived endpoint; otherwise each instance's first service port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build_resolver(self) -> Result<EurekaResolver, DiscoveryError> {
        let interest = self
            .interest
            .ok_or_else(|| DiscoveryError::InvalidArgument("eureka resolver needs an interest".into()))?;
        interest.validate()?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new(self.config.connect_timeout)));
        Ok(EurekaResolver {
            inner: EurekaInner {
                bootstrap: self.bootstrap,
                interest,
                port: self.port,
                transport,
                config: self.config,
                state: Arc::new(ResolverState::new()),
                tracker: Mutex::new(None),
            },
        })
    }

    pub fn build(self) -> Result<Arc<dyn ServerResolver>, DiscoveryError> {
        Ok(Arc::new(self.build_resolver()?))
    }
}

pub struct EurekaResolver {
    inner: EurekaInner,
}

struct EurekaInner {
    bootstrap: Arc<dyn ServerResolver>,
    interest: Interest,
    port: Option<u16>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    state: Arc<ResolverState>,
    tracker: Mutex<Option<Tracker>>,
}

/// Live interest subscription feeding the endpoint cache.
struct Tracker {
    channel: InterestChannel,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EurekaInner {
    fn tracker(&self) -> MutexGuard<'_, Option<Tracker>> {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start the inner subscription unless a healthy one is running. No I/O happens before this.
    /// A failed subscription is replaced and the view stays not-ready until its first snapshot.
    fn ensure_started(&self) {
        let mut slot = self.tracker();
        if let Some(t) = slot.as_ref() {
            if !t.task.is_finished() && self.state.current().error.is_none() {
                return;
            }
            t.cancel.cancel();
        }
        self.state.restart();
        let channel = match InterestChannel::new(
            Arc::clone(&self.bootstrap),
            Arc::clone(&self.transport),
            self.interest.clone(),
            self.config.clone(),
        ) {
            Ok(c) => c,
            Err(e) => {
                self.state.fail(e);
                return;
            }
        };
        info!(interest = %self.interest, bootstrap = %self.bootstrap.describe(), "starting eureka resolver subscription");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(track_membership(
            channel.notifications(),
            Arc::clone(&self.state),
            self.port,
            cancel.clone(),
        ));
        *slot = Some(Tracker { channel, cancel, task });
    }
}

/// Endpoint an instance contributes, if it is Up and has an address and a port.
fn endpoint_for(info: &InstanceInfo, fixed_port: Option<u16>) -> Option<Endpoint> {
    if info.status() != Status::Up {
        return None;
    }
    let host = info.data_center_info()?.default_host()?;
    let port = fixed_port.or_else(|| info.ports().first().map(|p| p.port))?;
    Some(Endpoint::new(host, port))
}

async fn track_membership(
    mut notifications: NotificationStream,
    state: Arc<ResolverState>,
    port: Option<u16>,
    cancel: CancellationToken,
) {
    let mut members: HashMap<String, Endpoint> = HashMap::new();
    let mut ready = false;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            n = notifications.next() => n,
        };
        match next {
            Some(Ok(notification)) => {
                match notification {
                    ChangeNotification::Add(info) | ChangeNotification::Modify(info) => match endpoint_for(&info, port) {
                        Some(ep) => {
                            members.insert(info.id().to_string(), ep);
                        }
                        None => {
                            members.remove(info.id());
                        }
                    },
                    ChangeNotification::Delete(info) => {
                        members.remove(info.id());
                    }
                    ChangeNotification::BufferSentinel => ready = true,
                }
                if ready {
                    state.publish(members.values().cloned().collect());
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "eureka resolver subscription failed");
                state.fail(e);
                break;
            }
            None => break,
        }
    }
    debug!("eureka resolver subscription finished");
}

#[async_trait]
impl ServerResolver for EurekaResolver {
    fn resolve(&self) -> EndpointStream {
        self.inner.ensure_started();
        diff_stream(self.inner.state.subscribe())
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        self.inner.ensure_started();
        let mut rx = self.inner.state.subscribe();
        let view = rx
            .wait_for(|v| v.ready || v.error.is_some() || v.closed)
            .await
            .map(|v| (*v).clone())
            .map_err(|_| DiscoveryError::Shutdown)?;
        if view.ready {
            if view.endpoints.is_empty() {
                return Err(DiscoveryError::Resolution(format!("no live instances match {}", self.inner.interest)));
            }
            return Ok(view.endpoints.into_iter().collect());
        }
        match view.error {
            Some(e) => Err(e),
            None => Err(DiscoveryError::Shutdown),
        }
    }

    fn invalidate(&self) {
        // The cache follows the live subscription; there is nothing to re-resolve.
        debug!(interest = %self.inner.interest, "invalidate ignored by eureka resolver");
    }

    async fn close(&self) {
        let tracker = self.inner.tracker().take();
        if let Some(t) = tracker {
            t.cancel.cancel();
            let _ = t.task.await;
            t.channel.shutdown().await;
        }
        self.inner.state.close();
        self.inner.bootstrap.close().await;
    }

    fn describe(&self) -> String {
        format!("eureka({} via {})", self.inner.interest, self.inner.bootstrap.describe())
    }
}
