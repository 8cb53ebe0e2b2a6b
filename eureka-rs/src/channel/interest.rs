//! InterestChannel: one fixed interest, any number of independent notification subscriptions.
//! Each subscription owns its own session task, started on first poll and torn down when the
//! stream is dropped or the channel shuts down.

use eureka_core::{ChangeNotification, ClientMessage, DiscoveryError, InstanceInfo, Interest, ServerMessage, Transport};
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::connect::Connector;
use super::reconcile::Reconciler;
use crate::config::ClientConfig;
use crate::resolver::ServerResolver;

pub type NotificationItem = Result<ChangeNotification<InstanceInfo>, DiscoveryError>;

pub struct InterestChannel {
    inner: Arc<InterestInner>,
}

struct InterestInner {
    resolver: Arc<dyn ServerResolver>,
    transport: Arc<dyn Transport>,
    interest: Interest,
    config: ClientConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscribers: AtomicUsize,
}

impl InterestChannel {
    /// Invalid interests are rejected here, never retried. Construction does no I/O.
    pub fn new(
        resolver: Arc<dyn ServerResolver>,
        transport: Arc<dyn Transport>,
        interest: Interest,
        config: ClientConfig,
    ) -> Result<Self, DiscoveryError> {
        interest.validate()?;
        Ok(Self {
            inner: Arc::new(InterestInner {
                resolver,
                transport,
                interest,
                config,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                subscribers: AtomicUsize::new(0),
            }),
        })
    }

    pub fn interest(&self) -> &Interest {
        &self.inner.interest
    }

    /// New subscription: snapshot as Add, one BufferSentinel, then live changes. Transient
    /// reconnects are invisible except for reconciliation; the stream ends with an error item
    /// only when the failure is unrecoverable.
    pub fn notifications(&self) -> NotificationStream {
        let token = self.inner.shutdown.child_token();
        self.inner.subscribers.fetch_add(1, Ordering::SeqCst);
        NotificationStream {
            inner: Arc::clone(&self.inner),
            pending: Some(token.clone()),
            rx: None,
            _guard: token.drop_guard(),
        }
    }

    /// True while at least one stream from `notifications` is still alive.
    pub fn has_subscribers(&self) -> bool {
        self.inner.subscribers.load(Ordering::SeqCst) > 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel every subscription and wait for their sessions to close. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = match self.inner.tasks.lock() {
            Ok(mut t) => t.drain(..).collect(),
            Err(p) => p.into_inner().drain(..).collect(),
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for InterestChannel {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Lazy notification stream. Nothing connects until the first poll.
pub struct NotificationStream {
    inner: Arc<InterestInner>,
    pending: Option<CancellationToken>,
    rx: Option<mpsc::Receiver<NotificationItem>>,
    _guard: DropGuard,
}

impl NotificationStream {
    fn start(inner: Arc<InterestInner>, token: CancellationToken) -> mpsc::Receiver<NotificationItem> {
        let (tx, rx) = mpsc::channel(inner.config.notification_buffer.max(1));
        let task = tokio::spawn(run_interest_session(Arc::clone(&inner), token, tx));
        let mut tasks = inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        rx
    }
}

impl Stream for NotificationStream {
    type Item = NotificationItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(token) = this.pending.take() {
            this.rx = Some(NotificationStream::start(Arc::clone(&this.inner), token));
        }
        match this.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.inner.subscribers.fetch_sub(1, Ordering::SeqCst);
    }
}

enum SessionEnd {
    Cancelled,
    Lost(String),
    Violation(String),
}

/// Send one item unless the subscription is gone. False means stop.
async fn deliver(tx: &mpsc::Sender<NotificationItem>, cancel: &CancellationToken, item: NotificationItem) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

async fn run_interest_session(inner: Arc<InterestInner>, cancel: CancellationToken, tx: mpsc::Sender<NotificationItem>) {
    let mut connector = Connector::new(
        Arc::clone(&inner.resolver),
        Arc::clone(&inner.transport),
        inner.config.backoff.clone(),
    );
    let mut reconciler = Reconciler::new(inner.interest.clone());
    let mut after_failure = false;

    'sessions: loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            r = connector.connect(after_failure) => r,
        };
        let (mut session, endpoint) = match connected {
            Ok(c) => c,
            Err(e) => {
                error!(interest = %inner.interest, error = %e, "interest channel giving up");
                let _ = deliver(&tx, &cancel, Err(e)).await;
                break;
            }
        };
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => Err(None),
            _ = tx.closed() => Err(None),
            r = session.send(ClientMessage::Subscribe(inner.interest.clone())) => r.map_err(Some),
        };
        if let Err(failure) = subscribed {
            let Some(e) = failure else {
                session.close().await;
                break;
            };
            warn!(endpoint = %endpoint, error = %e, "subscribe failed");
            connector.session_failed();
            after_failure = true;
            continue;
        }
        reconciler.begin_snapshot();
        info!(
            endpoint = %endpoint,
            interest = %inner.interest,
            held = reconciler.delivered().count(),
            "interest session established"
        );

        let end = loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                _ = tx.closed() => break SessionEnd::Cancelled,
                m = session.recv() => m,
            };
            match msg {
                Ok(Some(ServerMessage::Notification(n))) => {
                    for out in reconciler.apply(n) {
                        if !deliver(&tx, &cancel, Ok(out)).await {
                            break 'sessions;
                        }
                    }
                }
                Ok(Some(ServerMessage::Ack)) => break SessionEnd::Violation("unexpected ack on interest session".into()),
                Ok(Some(ServerMessage::Error { message })) => break SessionEnd::Violation(format!("server error: {}", message)),
                Ok(None) => break SessionEnd::Lost("closed by server".into()),
                Err(e) if e.is_retryable() => break SessionEnd::Lost(e.to_string()),
                Err(e) => break SessionEnd::Violation(e.to_string()),
            }
        };
        session.close().await;

        match end {
            SessionEnd::Cancelled => break,
            SessionEnd::Lost(reason) => {
                warn!(
                    endpoint = %endpoint,
                    reason = %reason,
                    mid_snapshot = reconciler.in_snapshot(),
                    "interest session lost, reconnecting"
                );
                connector.session_failed();
                after_failure = true;
            }
            SessionEnd::Violation(reason) => {
                error!(endpoint = %endpoint, reason = %reason, "interest session protocol violation");
                let _ = deliver(&tx, &cancel, Err(DiscoveryError::ProtocolViolation(reason))).await;
                break;
            }
        }
    }
    debug!(interest = %inner.interest, "interest subscription finished");
}
