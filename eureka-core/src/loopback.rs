//! In-process transport and registry double. Used by tests and the demo example when there is no
//! discovery server to talk to. Sessions are routed by endpoint address to a `LoopbackRegistry`.
//!
//! Failure injection: `refuse` makes connects to an endpoint fail, `drop_sessions` kills every live
//! session of a registry, `set_ack_unregister(false)` withholds unregister acknowledgements.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::instance::InstanceInfo;
use crate::interest::Interest;
use crate::notification::ChangeNotification;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{Session, Transport};
use crate::DiscoveryError;

const EVENT_BUFFER: usize = 1024;

/// One client message as the registry saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedMessage {
    pub session: u64,
    pub message: ClientMessage,
}

struct RegistryState {
    instances: BTreeMap<String, InstanceInfo>,
    observed: Vec<ObservedMessage>,
    ack_unregister: bool,
    next_session: u64,
    live_sessions: usize,
}

/// Shared in-memory registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LoopbackRegistry {
    state: Arc<Mutex<RegistryState>>,
    events: broadcast::Sender<ChangeNotification<InstanceInfo>>,
    kill: Arc<watch::Sender<u64>>,
}

impl Default for LoopbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (kill, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                instances: BTreeMap::new(),
                observed: Vec::new(),
                ack_unregister: true,
                next_session: 0,
                live_sessions: 0,
            })),
            events,
            kill: Arc::new(kill),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panicking test thread must not wedge every other session.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert or replace by id and broadcast Add or Modify.
    pub fn upsert(&self, info: InstanceInfo) {
        let mut st = self.lock();
        let event = match st.instances.insert(info.id().to_string(), info.clone()) {
            None => ChangeNotification::Add(info),
            Some(_) => ChangeNotification::Modify(info),
        };
        let _ = self.events.send(event);
    }

    /// Remove by id and broadcast Delete. Unknown ids are ignored.
    pub fn remove(&self, id: &str) -> Option<InstanceInfo> {
        let mut st = self.lock();
        let removed = st.instances.remove(id);
        if let Some(info) = &removed {
            let _ = self.events.send(ChangeNotification::Delete(info.clone()));
        }
        removed
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.lock().instances.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<InstanceInfo> {
        self.lock().instances.get(id).cloned()
    }

    pub fn observed(&self) -> Vec<ObservedMessage> {
        self.lock().observed.clone()
    }

    /// Register/Update/Unregister messages in arrival order.
    pub fn registration_messages(&self) -> Vec<ClientMessage> {
        self.lock()
            .observed
            .iter()
            .filter(|o| !matches!(o.message, ClientMessage::Subscribe(_)))
            .map(|o| o.message.clone())
            .collect()
    }

    pub fn set_ack_unregister(&self, ack: bool) {
        self.lock().ack_unregister = ack;
    }

    pub fn live_sessions(&self) -> usize {
        self.lock().live_sessions
    }

    /// Close every live session from the server side.
    pub fn drop_sessions(&self) {
        self.kill.send_modify(|epoch| *epoch += 1);
    }

    fn open_session(&self) -> u64 {
        let mut st = self.lock();
        st.next_session += 1;
        st.live_sessions += 1;
        st.next_session
    }

    fn close_session(&self) {
        let mut st = self.lock();
        st.live_sessions = st.live_sessions.saturating_sub(1);
    }

    fn record(&self, session: u64, message: &ClientMessage) {
        self.lock().observed.push(ObservedMessage {
            session,
            message: message.clone(),
        });
    }

    /// Subscribe to live events and take the matching snapshot under one lock,
    /// so nothing falls between the two.
    fn subscribe(
        &self,
        interest: &Interest,
    ) -> (Vec<InstanceInfo>, broadcast::Receiver<ChangeNotification<InstanceInfo>>) {
        let st = self.lock();
        let rx = self.events.subscribe();
        let snapshot = st.instances.values().filter(|i| interest.matches(i)).cloned().collect();
        (snapshot, rx)
    }
}

/// Routes `open` to the registry serving the endpoint's address.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    servers: Arc<Mutex<HashMap<String, LoopbackRegistry>>>,
    refused: Arc<Mutex<HashSet<String>>>,
    opened: Arc<Mutex<HashMap<String, usize>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, endpoint: &Endpoint, registry: LoopbackRegistry) {
        if let Ok(mut s) = self.servers.lock() {
            s.insert(endpoint.address(), registry);
        }
    }

    pub fn unserve(&self, endpoint: &Endpoint) {
        if let Ok(mut s) = self.servers.lock() {
            s.remove(&endpoint.address());
        }
    }

    pub fn refuse(&self, endpoint: &Endpoint, refuse: bool) {
        if let Ok(mut r) = self.refused.lock() {
            if refuse {
                r.insert(endpoint.address());
            } else {
                r.remove(&endpoint.address());
            }
        }
    }

    /// Number of successful `open` calls against the endpoint.
    pub fn opened(&self, endpoint: &Endpoint) -> usize {
        self.opened
            .lock()
            .map(|o| o.get(&endpoint.address()).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_opened(&self) -> usize {
        self.opened.lock().map(|o| o.values().sum()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, DiscoveryError> {
        let address = endpoint.address();
        let refused = self.refused.lock().map(|r| r.contains(&address)).unwrap_or(false);
        if refused {
            return Err(DiscoveryError::connection(endpoint, "connection refused"));
        }
        let registry = self
            .servers
            .lock()
            .ok()
            .and_then(|s| s.get(&address).cloned())
            .ok_or_else(|| DiscoveryError::connection(endpoint, "no server at address"))?;
        if let Ok(mut o) = self.opened.lock() {
            *o.entry(address).or_insert(0) += 1;
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let session_id = registry.open_session();
        tokio::spawn(serve_session(registry, session_id, from_client, to_client));
        Ok(Box::new(LoopbackSession {
            tx: to_server,
            rx: from_server,
            endpoint: endpoint.clone(),
        }))
    }
}

struct LoopbackSession {
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    endpoint: Endpoint,
}

#[async_trait]
impl Session for LoopbackSession {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), DiscoveryError> {
        self.tx
            .send(msg)
            .map_err(|_| DiscoveryError::connection(&self.endpoint, "session closed by server"))
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, DiscoveryError> {
        Ok(self.rx.recv().await)
    }
}

/// Server side of one loopback session.
async fn serve_session(
    registry: LoopbackRegistry,
    session: u64,
    mut from_client: mpsc::UnboundedReceiver<ClientMessage>,
    to_client: mpsc::UnboundedSender<ServerMessage>,
) {
    let mut kill = registry.kill.subscribe();
    kill.borrow_and_update();
    let mut registered: Option<String> = None;
    let mut subscription: Option<(Interest, broadcast::Receiver<ChangeNotification<InstanceInfo>>)> = None;

    loop {
        tokio::select! {
            changed = kill.changed() => {
                if changed.is_ok() {
                    debug!(session, "loopback session killed");
                }
                break;
            }
            msg = from_client.recv() => {
                let Some(msg) = msg else { break };
                registry.record(session, &msg);
                match msg {
                    ClientMessage::Register(info) | ClientMessage::Update(info) => {
                        if let Some(prev) = registered.as_deref().filter(|prev| *prev != info.id()) {
                            registry.remove(prev);
                        }
                        registered = Some(info.id().to_string());
                        registry.upsert(info);
                        let _ = to_client.send(ServerMessage::Ack);
                    }
                    ClientMessage::Unregister => {
                        if let Some(id) = registered.take() {
                            registry.remove(&id);
                        }
                        let ack = registry.lock().ack_unregister;
                        if ack {
                            let _ = to_client.send(ServerMessage::Ack);
                        }
                    }
                    ClientMessage::Subscribe(interest) => {
                        if subscription.is_some() {
                            let _ = to_client.send(ServerMessage::Error {
                                message: "session already subscribed".into(),
                            });
                            break;
                        }
                        let (snapshot, rx) = registry.subscribe(&interest);
                        for info in snapshot {
                            let _ = to_client.send(ServerMessage::Notification(ChangeNotification::Add(info)));
                        }
                        let _ = to_client.send(ServerMessage::Notification(ChangeNotification::BufferSentinel));
                        subscription = Some((interest, rx));
                    }
                }
            }
            event = next_event(&mut subscription) => {
                match event {
                    Ok(n) => {
                        let _ = to_client.send(ServerMessage::Notification(n));
                    }
                    // Lagged or closed: drop the session, the client resubscribes.
                    Err(_) => break,
                }
            }
        }
    }
    registry.close_session();
}

/// Next event matching the subscription's interest; pending forever when not subscribed.
async fn next_event(
    subscription: &mut Option<(Interest, broadcast::Receiver<ChangeNotification<InstanceInfo>>)>,
) -> Result<ChangeNotification<InstanceInfo>, broadcast::error::RecvError> {
    let Some((interest, rx)) = subscription.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        let event = rx.recv().await?;
        if event.data().map(|i| interest.matches(i)).unwrap_or(true) {
            return Ok(event);
        }
    }
}
