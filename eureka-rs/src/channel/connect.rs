//! Endpoint selection and bounded, capped-exponential reconnection.

use eureka_core::{DiscoveryError, Endpoint, Session, Transport};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::BackoffConfig;
use crate::resolver::ServerResolver;

/// Opens sessions for one channel task. Rotates through the resolved endpoints so a reconnect
/// tries the next endpoint before coming back to the one that just failed.
pub(crate) struct Connector {
    resolver: Arc<dyn ServerResolver>,
    transport: Arc<dyn Transport>,
    backoff: BackoffConfig,
    cursor: usize,
}

impl Connector {
    pub(crate) fn new(resolver: Arc<dyn ServerResolver>, transport: Arc<dyn Transport>, backoff: BackoffConfig) -> Self {
        Self {
            resolver,
            transport,
            backoff,
            cursor: 0,
        }
    }

    /// Up to `max_attempts` rounds of resolve-then-try-each-endpoint, sleeping between rounds.
    /// `after_failure` also delays the first round, so a flapping server is not hammered.
    /// Only the last failure of the last round is returned.
    pub(crate) async fn connect(&mut self, after_failure: bool) -> Result<(Box<dyn Session>, Endpoint), DiscoveryError> {
        let attempts = self.backoff.max_attempts.max(1);
        let mut last_error = DiscoveryError::Resolution(format!("{} was never resolved", self.resolver.describe()));
        for attempt in 0..attempts {
            if attempt > 0 || after_failure {
                let retry = if after_failure { attempt } else { attempt - 1 };
                let delay = self.backoff.delay(retry);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before reconnect");
                tokio::time::sleep(delay).await;
            }
            let endpoints = match self.resolver.endpoints().await {
                Ok(eps) if !eps.is_empty() => eps,
                Ok(_) => {
                    last_error = DiscoveryError::Resolution(format!("{} has no endpoints", self.resolver.describe()));
                    continue;
                }
                Err(e) => {
                    warn!(resolver = %self.resolver.describe(), error = %e, "resolution failed");
                    last_error = e;
                    continue;
                }
            };
            for offset in 0..endpoints.len() {
                let idx = (self.cursor + offset) % endpoints.len();
                let endpoint = &endpoints[idx];
                match self.transport.open(endpoint).await {
                    Ok(session) => {
                        self.cursor = idx + 1;
                        return Ok((session, endpoint.clone()));
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "connection attempt failed");
                        last_error = e;
                    }
                }
            }
            // Every endpoint refused: the list itself may be stale.
            self.resolver.invalidate();
        }
        Err(last_error)
    }

    /// An established session died; the next connect starts from a fresh resolution.
    pub(crate) fn session_failed(&self) {
        self.resolver.invalidate();
    }
}
