//! EurekaClient: one registration channel plus interest channels over shared resolvers.
//! Nothing connects at construction; `shutdown` releases channels and resolvers exactly once.

use eureka_core::{DiscoveryError, InstanceInfo, Interest, TcpTransport, Transport};
use futures_util::Stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::channel::{InterestChannel, NotificationStream, Registration, RegistrationChannel};
use crate::config::ClientConfig;
use crate::resolver::ServerResolver;

#[derive(Default)]
pub struct EurekaClientBuilder {
    registration_resolver: Option<Arc<dyn ServerResolver>>,
    interest_resolver: Option<Arc<dyn ServerResolver>>,
    transport: Option<Arc<dyn Transport>>,
    config: Option<ClientConfig>,
}

impl EurekaClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same resolver for both channels.
    pub fn with_server_resolver(mut self, resolver: Arc<dyn ServerResolver>) -> Self {
        self.registration_resolver = Some(Arc::clone(&resolver));
        self.interest_resolver = Some(resolver);
        self
    }

    pub fn with_registration_resolver(mut self, resolver: Arc<dyn ServerResolver>) -> Self {
        self.registration_resolver = Some(resolver);
        self
    }

    pub fn with_interest_resolver(mut self, resolver: Arc<dyn ServerResolver>) -> Self {
        self.interest_resolver = Some(resolver);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<EurekaClient, DiscoveryError> {
        let config = self.config.unwrap_or_default();
        let registration_resolver = self
            .registration_resolver
            .ok_or_else(|| DiscoveryError::InvalidArgument("client needs a registration resolver".into()))?;
        let interest_resolver = self
            .interest_resolver
            .ok_or_else(|| DiscoveryError::InvalidArgument("client needs an interest resolver".into()))?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new(config.connect_timeout)));
        let registration = RegistrationChannel::new(
            Arc::clone(&registration_resolver),
            Arc::clone(&transport),
            config.clone(),
        );
        Ok(EurekaClient {
            registration,
            registration_resolver,
            interest_resolver,
            transport,
            config,
            interest_channels: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }
}

pub struct EurekaClient {
    registration: RegistrationChannel,
    registration_resolver: Arc<dyn ServerResolver>,
    interest_resolver: Arc<dyn ServerResolver>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    interest_channels: Mutex<Vec<InterestChannel>>,
    shut_down: AtomicBool,
}

impl EurekaClient {
    pub fn builder() -> EurekaClientBuilder {
        EurekaClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// First value registers, later values update, cancel or end of stream deregisters.
    pub fn register<S>(&self, updates: S) -> Result<Registration, DiscoveryError>
    where
        S: Stream<Item = InstanceInfo> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(DiscoveryError::Shutdown);
        }
        self.registration.register(updates)
    }

    /// Live notifications for `interest`. Each call is an independent subscription;
    /// the session starts on the first poll.
    pub fn for_interest(&self, interest: Interest) -> Result<NotificationStream, DiscoveryError> {
        if self.is_shut_down() {
            return Err(DiscoveryError::Shutdown);
        }
        let channel = InterestChannel::new(
            Arc::clone(&self.interest_resolver),
            Arc::clone(&self.transport),
            interest,
            self.config.clone(),
        )?;
        let stream = channel.notifications();
        let mut channels = self.interest_channels.lock().unwrap_or_else(|p| p.into_inner());
        channels.retain(|c| c.has_subscribers() && !c.is_shut_down());
        channels.push(channel);
        Ok(stream)
    }

    /// Interest channels that still have a live notification stream.
    pub fn active_interest_channels(&self) -> usize {
        let mut channels = self.interest_channels.lock().unwrap_or_else(|p| p.into_inner());
        channels.retain(|c| c.has_subscribers() && !c.is_shut_down());
        channels.len()
    }

    /// Deregister, end every notification stream and close the resolvers.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("client already shut down");
            return;
        }
        self.registration.shutdown().await;
        let channels: Vec<InterestChannel> = {
            let mut c = self.interest_channels.lock().unwrap_or_else(|p| p.into_inner());
            c.drain(..).collect()
        };
        for channel in &channels {
            channel.shutdown().await;
        }
        self.registration_resolver.close().await;
        if !Arc::ptr_eq(&self.registration_resolver, &self.interest_resolver) {
            self.interest_resolver.close().await;
        }
        info!(interest_channels = channels.len(), "client shut down");
    }
}
