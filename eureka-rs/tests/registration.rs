//! RegistrationChannel state machine against the loopback registry.

mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{eventually, fast_config, instance, within, Cluster};
use eureka_core::{
    ChangeNotification, ClientMessage, DiscoveryError, Endpoint, InstanceInfoBuilder, ServerMessage, Session, Status,
    Transport,
};
use eureka_rs::{InstancePublisher, RegistrationChannel, RegistrationState, ServerResolvers};

fn channel(cluster: &Cluster) -> RegistrationChannel {
    RegistrationChannel::new(cluster.resolver.clone(), cluster.transport(), fast_config())
}

#[tokio::test]
async fn register_update_unregister_in_push_order() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    let channel = channel(&cluster);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    assert_eq!(registration.state(), RegistrationState::Idle);

    let up = instance("id_serviceA", "ServiceA", Status::Up);
    publisher.push(up.clone()).unwrap();
    let mut states = registration.state_changes();
    within(states.wait_for(|s| *s == RegistrationState::Registered)).await.unwrap();
    assert_eq!(cluster.registry.get("id_serviceA"), Some(up.clone()));

    let down = InstanceInfoBuilder::from(&up).status(Status::Down).build().unwrap();
    publisher.push(down.clone()).unwrap();
    eventually("update applied", || {
        cluster.registry.get("id_serviceA").map(|i| i.status()) == Some(Status::Down)
    })
    .await;

    within(registration.unregister()).await.unwrap();
    assert!(cluster.registry.get("id_serviceA").is_none());
    assert_eq!(
        cluster.registry.registration_messages(),
        vec![ClientMessage::Register(up), ClientMessage::Update(down), ClientMessage::Unregister]
    );
}

#[tokio::test]
async fn queued_updates_are_sent_in_order_then_completion_deregisters() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    let channel = channel(&cluster);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();

    let base = instance("a", "A", Status::Starting);
    let values: Vec<_> = (0..10)
        .map(|n| InstanceInfoBuilder::from(&base).metadata("rev", n.to_string()).build().unwrap())
        .collect();
    for v in &values {
        publisher.push(v.clone()).unwrap();
    }
    publisher.complete();
    within(registration.closed()).await.unwrap();
    assert_eq!(registration.state(), RegistrationState::Closed);

    let mut expected = vec![ClientMessage::Register(values[0].clone())];
    expected.extend(values[1..].iter().cloned().map(ClientMessage::Update));
    expected.push(ClientMessage::Unregister);
    assert_eq!(cluster.registry.registration_messages(), expected);
}

#[tokio::test]
async fn silence_keeps_the_registration() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    let channel = channel(&cluster);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    publisher.push(instance("a", "A", Status::Up)).unwrap();
    within(registration.state_changes().wait_for(|s| *s == RegistrationState::Registered))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(registration.state(), RegistrationState::Registered);
    assert!(cluster.registry.get("a").is_some());
    within(registration.unregister()).await.unwrap();
}

#[tokio::test]
async fn missing_unregister_ack_times_out_into_closed() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    cluster.registry.set_ack_unregister(false);
    let channel = channel(&cluster);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    publisher.push(instance("a", "A", Status::Up)).unwrap();
    within(registration.state_changes().wait_for(|s| *s == RegistrationState::Registered))
        .await
        .unwrap();

    let started = Instant::now();
    registration.cancel();
    let outcome = within(registration.closed()).await;
    assert_eq!(outcome, Err(DiscoveryError::DeregistrationTimeout(fast_config().deregistration_timeout)));
    assert_eq!(registration.state(), RegistrationState::Closed);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn cancel_before_first_value_does_no_io() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    let channel = channel(&cluster);
    let (_publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    let states = registration.state_changes();
    within(registration.unregister()).await.unwrap();
    assert_eq!(*states.borrow(), RegistrationState::Closed);
    assert_eq!(cluster.transport.total_opened(), 0);
    assert!(cluster.registry.registration_messages().is_empty());
}

#[tokio::test]
async fn lost_session_re_registers_latest_value() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    let channel = channel(&cluster);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    let up = instance("a", "A", Status::Up);
    let down = InstanceInfoBuilder::from(&up).status(Status::Down).build().unwrap();
    publisher.push(up.clone()).unwrap();
    publisher.push(down.clone()).unwrap();
    eventually("update applied", || cluster.registry.get("a") == Some(down.clone())).await;

    cluster.registry.drop_sessions();
    eventually("re-registered", || cluster.transport.opened(&cluster.endpoint) == 2).await;
    eventually("register on second session", || {
        cluster.registry.registration_messages().len() == 3
    })
    .await;
    assert_eq!(
        cluster.registry.registration_messages(),
        vec![
            ClientMessage::Register(up),
            ClientMessage::Update(down.clone()),
            ClientMessage::Register(down.clone()),
        ]
    );
    within(registration.state_changes().wait_for(|s| *s == RegistrationState::Registered))
        .await
        .unwrap();

    within(registration.unregister()).await.unwrap();
    assert!(cluster.registry.get("a").is_none());
}

#[tokio::test]
async fn exhausted_connection_attempts_fail_the_registration() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    cluster.transport.refuse(&cluster.endpoint, true);
    let channel = channel(&cluster);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    publisher.push(instance("a", "A", Status::Up)).unwrap();
    match within(registration.closed()).await {
        Err(DiscoveryError::Connection { .. }) => {}
        other => panic!("expected Connection error, got {:?}", other),
    }
    assert_eq!(registration.state(), RegistrationState::Closed);
}

#[tokio::test]
async fn dropping_the_handle_deregisters() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    let channel = channel(&cluster);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    publisher.push(instance("a", "A", Status::Up)).unwrap();
    eventually("registered", || cluster.registry.get("a").is_some()).await;
    drop(registration);
    eventually("deregistered", || cluster.registry.get("a").is_none()).await;
    assert_eq!(cluster.registry.registration_messages().last(), Some(&ClientMessage::Unregister));
}

#[tokio::test]
async fn channel_shutdown_deregisters_and_refuses_new_registrations() {
    let cluster = Cluster::new("10.0.0.1", 12102);
    let channel = channel(&cluster);
    let (a_pub, a_updates) = InstancePublisher::new();
    let (b_pub, b_updates) = InstancePublisher::new();
    let a = channel.register(a_updates).unwrap();
    let b = channel.register(b_updates).unwrap();
    a_pub.push(instance("a", "A", Status::Up)).unwrap();
    b_pub.push(instance("b", "B", Status::Up)).unwrap();
    eventually("both registered", || cluster.registry.instances().len() == 2).await;

    within(channel.shutdown()).await;
    assert!(cluster.registry.instances().is_empty());
    assert_eq!(a.state(), RegistrationState::Closed);
    assert_eq!(b.state(), RegistrationState::Closed);
    let (_p, updates) = InstancePublisher::new();
    assert!(matches!(channel.register(updates), Err(DiscoveryError::Shutdown)));
    within(channel.shutdown()).await;
}

/// How one scripted server session answers registration traffic.
#[derive(Clone, Copy)]
enum Script {
    AckAll,
    RejectWithError,
    ReplyWithNotification,
    NeverAck,
    StallOnUnregister,
}

/// Hands out one script per opened session (AckAll once the queue is empty) and logs every
/// message the client sends.
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    opened: AtomicUsize,
}

impl ScriptedTransport {
    fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        })
    }

    fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

struct ScriptedSession {
    script: Script,
    replies: VecDeque<ServerMessage>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _endpoint: &Endpoint) -> Result<Box<dyn Session>, DiscoveryError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script::AckAll);
        Ok(Box::new(ScriptedSession {
            script,
            replies: VecDeque::new(),
            sent: Arc::clone(&self.sent),
        }))
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), DiscoveryError> {
        let unregister = msg == ClientMessage::Unregister;
        self.sent.lock().unwrap().push(msg);
        match self.script {
            Script::AckAll => self.replies.push_back(ServerMessage::Ack),
            Script::RejectWithError => self.replies.push_back(ServerMessage::Error {
                message: "registry is read-only".into(),
            }),
            Script::ReplyWithNotification => self
                .replies
                .push_back(ServerMessage::Notification(ChangeNotification::Add(instance("x", "X", Status::Up)))),
            Script::NeverAck => {}
            Script::StallOnUnregister if unregister => std::future::pending::<()>().await,
            Script::StallOnUnregister => self.replies.push_back(ServerMessage::Ack),
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, DiscoveryError> {
        match self.replies.pop_front() {
            Some(m) => Ok(Some(m)),
            None => std::future::pending().await,
        }
    }
}

fn scripted_channel(transport: &Arc<ScriptedTransport>) -> RegistrationChannel {
    let resolver = ServerResolvers::from_endpoints([Endpoint::new("scripted", 1)]);
    RegistrationChannel::new(resolver, Arc::clone(transport) as Arc<dyn Transport>, fast_config())
}

#[tokio::test]
async fn server_error_reply_fails_the_registration() {
    let transport = ScriptedTransport::new([Script::RejectWithError]);
    let channel = scripted_channel(&transport);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    publisher.push(instance("a", "A", Status::Up)).unwrap();

    assert!(matches!(within(registration.closed()).await, Err(DiscoveryError::ProtocolViolation(_))));
    assert_eq!(registration.state(), RegistrationState::Closed);
    assert_eq!(transport.opened(), 1);
    assert_eq!(transport.sent(), vec![ClientMessage::Register(instance("a", "A", Status::Up))]);
}

#[tokio::test]
async fn notification_on_registration_session_is_a_protocol_violation() {
    let transport = ScriptedTransport::new([Script::ReplyWithNotification]);
    let channel = scripted_channel(&transport);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    publisher.push(instance("a", "A", Status::Up)).unwrap();

    assert!(matches!(within(registration.closed()).await, Err(DiscoveryError::ProtocolViolation(_))));
    assert_eq!(registration.state(), RegistrationState::Closed);
    assert_eq!(transport.opened(), 1);
}

#[tokio::test]
async fn unacknowledged_register_reconnects_and_registers_again() {
    let transport = ScriptedTransport::new([Script::NeverAck]);
    let channel = scripted_channel(&transport);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    let a = instance("a", "A", Status::Up);
    publisher.push(a.clone()).unwrap();

    within(registration.state_changes().wait_for(|s| *s == RegistrationState::Registered))
        .await
        .unwrap();
    assert_eq!(transport.opened(), 2);
    assert_eq!(transport.sent(), vec![ClientMessage::Register(a.clone()), ClientMessage::Register(a)]);
    within(registration.unregister()).await.unwrap();
    assert_eq!(transport.sent().last(), Some(&ClientMessage::Unregister));
}

#[tokio::test]
async fn stalled_unregister_send_is_bounded_by_the_deregistration_timeout() {
    let transport = ScriptedTransport::new([Script::StallOnUnregister]);
    let channel = scripted_channel(&transport);
    let (publisher, updates) = InstancePublisher::new();
    let registration = channel.register(updates).unwrap();
    publisher.push(instance("a", "A", Status::Up)).unwrap();
    within(registration.state_changes().wait_for(|s| *s == RegistrationState::Registered))
        .await
        .unwrap();

    let started = Instant::now();
    registration.cancel();
    let outcome = within(registration.closed()).await;
    assert_eq!(outcome, Err(DiscoveryError::DeregistrationTimeout(fast_config().deregistration_timeout)));
    assert_eq!(registration.state(), RegistrationState::Closed);
    assert!(started.elapsed() < Duration::from_secs(2));
}
