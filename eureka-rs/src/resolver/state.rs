//! Per-resolver endpoint cache and the diffing stream every `resolve()` subscription reads from.

use eureka_core::{ChangeNotification, DiscoveryError, Endpoint};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeSet, VecDeque};
use tokio::sync::watch;

/// Last published resolution. `ready` means at least one complete endpoint list was published.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointView {
    pub endpoints: BTreeSet<Endpoint>,
    pub ready: bool,
    pub closed: bool,
    pub error: Option<DiscoveryError>,
}

/// Owned by exactly one resolver. Only the owning resolver publishes; everyone else reads.
pub struct ResolverState {
    tx: watch::Sender<EndpointView>,
}

impl Default for ResolverState {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(EndpointView::default());
        Self { tx }
    }

    pub fn current(&self) -> EndpointView {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EndpointView> {
        self.tx.subscribe()
    }

    /// Replace the endpoint set and mark it ready. No-op (no wakeups) when nothing changed.
    pub(crate) fn publish(&self, endpoints: BTreeSet<Endpoint>) {
        self.tx.send_if_modified(|view| {
            let next = EndpointView {
                endpoints,
                ready: true,
                closed: false,
                error: None,
            };
            if *view == next {
                return false;
            }
            *view = next;
            true
        });
    }

    /// Record a failed resolution; the endpoint set is kept.
    pub(crate) fn fail(&self, error: DiscoveryError) {
        self.tx.send_modify(|view| view.error = Some(error));
    }

    /// Drop cached endpoints and end every diff stream.
    pub(crate) fn close(&self) {
        self.tx.send_replace(EndpointView {
            closed: true,
            ..EndpointView::default()
        });
    }

    /// Fresh, not-ready state for a restart after `close`.
    pub(crate) fn reopen(&self) {
        self.tx.send_if_modified(|view| {
            if !view.closed {
                return false;
            }
            *view = EndpointView::default();
            true
        });
    }

    /// Not ready again until the next complete list, with the error cleared. The old endpoint
    /// set stays as the diff baseline so open streams only see what actually changed.
    pub(crate) fn restart(&self) {
        self.tx.send_if_modified(|view| {
            if view.closed {
                *view = EndpointView::default();
                return true;
            }
            let changed = view.ready || view.error.is_some();
            view.ready = false;
            view.error = None;
            changed
        });
    }
}

struct Diff {
    rx: watch::Receiver<EndpointView>,
    seen: BTreeSet<Endpoint>,
    last_error: Option<DiscoveryError>,
    sentinel_sent: bool,
    pending: VecDeque<Result<ChangeNotification<Endpoint>, DiscoveryError>>,
    done: bool,
}

impl Diff {
    fn absorb(&mut self, view: &EndpointView) {
        for gone in self.seen.difference(&view.endpoints) {
            self.pending.push_back(Ok(ChangeNotification::Delete(gone.clone())));
        }
        for added in view.endpoints.difference(&self.seen) {
            self.pending.push_back(Ok(ChangeNotification::Add(added.clone())));
        }
        self.seen = view.endpoints.clone();
        if view.ready && !self.sentinel_sent {
            self.sentinel_sent = true;
            self.pending.push_back(Ok(ChangeNotification::BufferSentinel));
        }
        if view.error.is_some() && view.error != self.last_error {
            if let Some(e) = view.error.clone() {
                self.pending.push_back(Err(e));
            }
        }
        self.last_error = view.error.clone();
        if view.closed {
            self.done = true;
        }
    }
}

/// Endpoint membership as change notifications: current set as Add, one BufferSentinel once the
/// first complete list is in, then Add/Delete per change. Each subscriber diffs against what it
/// has already emitted, so an endpoint is never added twice without a Delete in between.
pub fn diff_stream(rx: watch::Receiver<EndpointView>) -> BoxStream<'static, Result<ChangeNotification<Endpoint>, DiscoveryError>> {
    let diff = Diff {
        rx,
        seen: BTreeSet::new(),
        last_error: None,
        sentinel_sent: false,
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(diff, |mut diff| async move {
        loop {
            if let Some(item) = diff.pending.pop_front() {
                return Some((item, diff));
            }
            if diff.done {
                return None;
            }
            let view = diff.rx.borrow_and_update().clone();
            diff.absorb(&view);
            if diff.pending.is_empty() && !diff.done && diff.rx.changed().await.is_err() {
                diff.done = true;
            }
        }
    })
    .boxed()
}
