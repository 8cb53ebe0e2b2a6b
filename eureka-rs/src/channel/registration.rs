//! RegistrationChannel: pushes the local instance's record to the cluster.
//!
//! State machine per registration:
//! `Idle -> Connecting -> Registered <-> Updating -> Deregistering -> Closed`.
//! The first value from the caller's stream registers, every later value is a full-record update,
//! and only cancellation or the end of the stream deregisters.

use eureka_core::{ClientMessage, DiscoveryError, InstanceInfo, ServerMessage, Session, Transport};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connect::Connector;
use crate::config::ClientConfig;
use crate::resolver::ServerResolver;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Idle,
    Connecting,
    Registered,
    Updating,
    Deregistering,
    Closed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationState::Idle => "idle",
            RegistrationState::Connecting => "connecting",
            RegistrationState::Registered => "registered",
            RegistrationState::Updating => "updating",
            RegistrationState::Deregistering => "deregistering",
            RegistrationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Producer side of a registration: `push` registers or updates, `complete` deregisters.
/// Pushing nothing further keeps the registration alive.
pub struct InstancePublisher {
    tx: mpsc::UnboundedSender<InstanceInfo>,
}

impl InstancePublisher {
    pub fn new() -> (Self, UnboundedReceiverStream<InstanceInfo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }

    pub fn push(&self, info: InstanceInfo) -> Result<(), DiscoveryError> {
        self.tx.send(info).map_err(|_| DiscoveryError::Shutdown)
    }

    /// End of the update stream; the registration deregisters.
    pub fn complete(self) {}
}

pub struct RegistrationChannel {
    inner: Arc<RegistrationInner>,
}

struct RegistrationInner {
    resolver: Arc<dyn ServerResolver>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistrationChannel {
    /// No connection is made until the first value arrives on a registered stream.
    pub fn new(resolver: Arc<dyn ServerResolver>, transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(RegistrationInner {
                resolver,
                transport,
                config,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start a registration driven by `updates`. Fails with `Shutdown` after `shutdown`.
    pub fn register<S>(&self, updates: S) -> Result<Registration, DiscoveryError>
    where
        S: Stream<Item = InstanceInfo> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(DiscoveryError::Shutdown);
        }
        let cancel = self.inner.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(RegistrationState::Idle);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let driver = Driver {
            connector: Connector::new(
                Arc::clone(&self.inner.resolver),
                Arc::clone(&self.inner.transport),
                self.inner.config.backoff.clone(),
            ),
            config: self.inner.config.clone(),
            cancel: cancel.clone(),
            state: state_tx,
            latest: None,
        };
        let task = tokio::spawn(async move {
            let outcome = driver.run(updates.boxed()).await;
            let _ = outcome_tx.send(Some(outcome));
        });
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(Registration {
            state: state_rx,
            outcome: outcome_rx,
            cancel,
        })
    }

    /// Deregister everything this channel registered and wait for Closed. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut t = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
            t.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Handle to one live registration. Dropping it deregisters.
#[must_use = "dropping a Registration deregisters the instance"]
pub struct Registration {
    state: watch::Receiver<RegistrationState>,
    outcome: watch::Receiver<Option<Result<(), DiscoveryError>>>,
    cancel: CancellationToken,
}

impl Registration {
    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<RegistrationState> {
        self.state.clone()
    }

    /// Request deregistration without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for Closed. `Err(DeregistrationTimeout)` when the server never acknowledged removal;
    /// other errors mean the registration failed before it was cancelled.
    pub async fn closed(&self) -> Result<(), DiscoveryError> {
        let mut rx = self.outcome.clone();
        let outcome = rx.wait_for(|o| o.is_some()).await.map_err(|_| DiscoveryError::Shutdown)?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(DiscoveryError::Shutdown),
        }
    }

    pub async fn unregister(self) -> Result<(), DiscoveryError> {
        self.cancel();
        self.closed().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Reply {
    Acked,
    Cancelled,
    Lost(String),
    Violation(String),
}

/// Why the registered session loop stopped.
enum Exit {
    Deregister { outstanding_acks: usize },
    Reconnect,
    Failed(DiscoveryError),
}

struct Driver {
    connector: Connector,
    config: ClientConfig,
    cancel: CancellationToken,
    state: watch::Sender<RegistrationState>,
    latest: Option<InstanceInfo>,
}

impl Driver {
    fn transition(&self, next: RegistrationState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            let id = self.latest.as_ref().map(|i| i.id()).unwrap_or("-");
            debug!(id = %id, from = %prev, to = %next, "registration state");
        }
    }

    fn close(&self, outcome: Result<(), DiscoveryError>) -> Result<(), DiscoveryError> {
        self.transition(RegistrationState::Closed);
        outcome
    }

    async fn run(mut self, mut updates: BoxStream<'static, InstanceInfo>) -> Result<(), DiscoveryError> {
        let first = tokio::select! {
            _ = self.cancel.cancelled() => None,
            v = updates.next() => v,
        };
        let Some(first) = first else {
            // Nothing was ever registered.
            self.transition(RegistrationState::Deregistering);
            return self.close(Ok(()));
        };
        self.latest = Some(first);

        let mut after_failure = false;
        loop {
            self.transition(RegistrationState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => None,
                r = self.connector.connect(after_failure) => Some(r),
            };
            let (mut session, endpoint) = match connected {
                None => {
                    debug!("registration cancelled while connecting");
                    self.transition(RegistrationState::Deregistering);
                    return self.close(Ok(()));
                }
                Some(Err(e)) => {
                    error!(error = %e, "registration giving up");
                    return self.close(Err(e));
                }
                Some(Ok(c)) => c,
            };

            let exit = self.serve(session.as_mut(), &mut updates).await;
            match exit {
                Exit::Deregister { outstanding_acks } => {
                    let outcome = self.deregister(session.as_mut(), outstanding_acks).await;
                    session.close().await;
                    return self.close(outcome);
                }
                Exit::Reconnect => {
                    warn!(endpoint = %endpoint, "registration session lost, re-registering");
                    session.close().await;
                    self.connector.session_failed();
                    after_failure = true;
                }
                Exit::Failed(e) => {
                    error!(endpoint = %endpoint, error = %e, "registration failed");
                    session.close().await;
                    return self.close(Err(e));
                }
            }
        }
    }

    /// Register the latest value on a fresh session, then forward updates until something ends it.
    async fn serve(&mut self, session: &mut dyn Session, updates: &mut BoxStream<'static, InstanceInfo>) -> Exit {
        let Some(info) = self.latest.clone() else {
            return Exit::Deregister { outstanding_acks: 0 };
        };
        let id = info.id().to_string();
        match self.request(session, ClientMessage::Register(info)).await {
            Reply::Acked => {
                info!(id = %id, "registered");
                self.transition(RegistrationState::Registered);
            }
            Reply::Cancelled => return Exit::Deregister { outstanding_acks: 1 },
            Reply::Lost(reason) => {
                warn!(id = %id, reason = %reason, "register not acknowledged");
                return Exit::Reconnect;
            }
            Reply::Violation(reason) => return Exit::Failed(DiscoveryError::ProtocolViolation(reason)),
        }

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Deregister { outstanding_acks: 0 },
                v = updates.next() => v,
                m = session.recv() => match unexpected(m) {
                    Some(Reply::Lost(_)) => return Exit::Reconnect,
                    Some(Reply::Violation(reason)) => return Exit::Failed(DiscoveryError::ProtocolViolation(reason)),
                    _ => continue,
                },
            };
            let Some(update) = next else {
                debug!(id = %id, "update stream completed");
                return Exit::Deregister { outstanding_acks: 0 };
            };
            self.latest = Some(update.clone());
            self.transition(RegistrationState::Updating);
            match self.request(session, ClientMessage::Update(update)).await {
                Reply::Acked => self.transition(RegistrationState::Registered),
                Reply::Cancelled => return Exit::Deregister { outstanding_acks: 1 },
                Reply::Lost(reason) => {
                    warn!(id = %id, reason = %reason, "update not acknowledged");
                    return Exit::Reconnect;
                }
                Reply::Violation(reason) => return Exit::Failed(DiscoveryError::ProtocolViolation(reason)),
            }
        }
    }

    /// Send one message and wait for its Ack. The send and the wait share the `ack_timeout` bound.
    async fn request(&self, session: &mut dyn Session, msg: ClientMessage) -> Reply {
        let name = msg.name();
        let deadline = tokio::time::sleep(self.config.ack_timeout);
        tokio::pin!(deadline);
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Reply::Cancelled,
            _ = &mut deadline => return Reply::Lost(format!("{} not sent within {:?}", name, self.config.ack_timeout)),
            r = session.send(msg) => r,
        };
        if let Err(e) = sent {
            return Reply::Lost(e.to_string());
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Reply::Cancelled,
                _ = &mut deadline => return Reply::Lost(format!("no ack for {} within {:?}", name, self.config.ack_timeout)),
                m = session.recv() => match m {
                    Ok(Some(ServerMessage::Ack)) => return Reply::Acked,
                    other => {
                        if let Some(reply) = unexpected(other) {
                            return reply;
                        }
                    }
                },
            }
        }
    }

    /// Unregister and wait for the acknowledgement, skipping acks still owed to earlier requests.
    /// Closed follows either way; sending and waiting together never outlast the timeout.
    async fn deregister(&self, session: &mut dyn Session, outstanding_acks: usize) -> Result<(), DiscoveryError> {
        self.transition(RegistrationState::Deregistering);
        let id = self.latest.as_ref().map(|i| i.id().to_string()).unwrap_or_default();
        let timeout = self.config.deregistration_timeout;
        let exchange = async {
            if let Err(e) = session.send(ClientMessage::Unregister).await {
                return Err(e);
            }
            let mut skip = outstanding_acks;
            loop {
                match session.recv().await {
                    Ok(Some(ServerMessage::Ack)) if skip > 0 => skip -= 1,
                    Ok(Some(ServerMessage::Ack)) => return Ok(true),
                    Ok(Some(_)) => continue,
                    Ok(None) => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(true)) => {
                info!(id = %id, "unregistered");
                Ok(())
            }
            Ok(Ok(false)) => {
                warn!(id = %id, "session closed before unregister was acknowledged");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(id = %id, error = %e, "session lost while unregistering");
                Ok(())
            }
            Err(_) => {
                warn!(id = %id, timeout_ms = timeout.as_millis() as u64, "unregister not acknowledged, closing anyway");
                Err(DiscoveryError::DeregistrationTimeout(timeout))
            }
        }
    }
}

/// Classify a message that arrived while no acknowledgement was expected.
/// `None` means it can be ignored.
fn unexpected(msg: Result<Option<ServerMessage>, DiscoveryError>) -> Option<Reply> {
    match msg {
        Ok(Some(ServerMessage::Ack)) => {
            debug!("ignoring stray ack on registration session");
            None
        }
        Ok(Some(ServerMessage::Error { message })) => Some(Reply::Violation(format!("server error: {}", message))),
        Ok(Some(ServerMessage::Notification(n))) => {
            Some(Reply::Violation(format!("{:?} notification on registration session", n.kind())))
        }
        Ok(None) => Some(Reply::Lost("closed by server".into())),
        Err(e) if e.is_retryable() => Some(Reply::Lost(e.to_string())),
        Err(e) => Some(Reply::Violation(e.to_string())),
    }
}
