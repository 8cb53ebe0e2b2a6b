//! Consumer-facing view of one interest subscription.
//!
//! Every (re)connect buffers the server's snapshot burst until its BufferSentinel and then
//! reconciles it against what the consumer has already seen: ids missing from the new snapshot
//! are delivered as Delete first, then new ids as Add and changed ones as Modify. Values the
//! consumer already has are not repeated, so an id is never added twice without a Delete.

use eureka_core::{ChangeNotification, InstanceInfo, Interest};
use std::collections::HashMap;
use tracing::debug;

pub(crate) struct Reconciler {
    interest: Interest,
    delivered: HashMap<String, InstanceInfo>,
    /// Snapshot being buffered. `None` once live.
    burst: Option<Burst>,
}

/// Snapshot entries in server order, indexed by id. Removed entries leave a hole.
#[derive(Default)]
struct Burst {
    slots: Vec<Option<InstanceInfo>>,
    index: HashMap<String, usize>,
}

impl Burst {
    fn upsert(&mut self, info: InstanceInfo) {
        match self.index.get(info.id()) {
            Some(&slot) => self.slots[slot] = Some(info),
            None => {
                self.index.insert(info.id().to_string(), self.slots.len());
                self.slots.push(Some(info));
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if let Some(slot) = self.index.remove(id) {
            self.slots[slot] = None;
        }
    }

    fn into_ordered(self) -> impl Iterator<Item = InstanceInfo> {
        self.slots.into_iter().flatten()
    }
}

impl Reconciler {
    pub(crate) fn new(interest: Interest) -> Self {
        Self {
            interest,
            delivered: HashMap::new(),
            burst: None,
        }
    }

    /// Called on every new session, before the server's first notification.
    pub(crate) fn begin_snapshot(&mut self) {
        self.burst = Some(Burst::default());
    }

    pub(crate) fn in_snapshot(&self) -> bool {
        self.burst.is_some()
    }

    /// Instances the consumer currently holds.
    pub(crate) fn delivered(&self) -> impl Iterator<Item = &InstanceInfo> {
        self.delivered.values()
    }

    pub(crate) fn apply(&mut self, notification: ChangeNotification<InstanceInfo>) -> Vec<ChangeNotification<InstanceInfo>> {
        if let Some(burst) = self.burst.as_mut() {
            match notification {
                ChangeNotification::Add(info) | ChangeNotification::Modify(info) => {
                    if self.interest.matches(&info) {
                        burst.upsert(info);
                    } else {
                        burst.remove(info.id());
                    }
                    Vec::new()
                }
                ChangeNotification::Delete(info) => {
                    burst.remove(info.id());
                    Vec::new()
                }
                ChangeNotification::BufferSentinel => self.finish_snapshot(),
            }
        } else {
            self.apply_live(notification)
        }
    }

    fn finish_snapshot(&mut self) -> Vec<ChangeNotification<InstanceInfo>> {
        let burst = self.burst.take().unwrap_or_default();
        let mut out = Vec::with_capacity(burst.index.len() + 1);

        let mut phantoms: Vec<String> = self
            .delivered
            .keys()
            .filter(|id| !burst.index.contains_key(id.as_str()))
            .cloned()
            .collect();
        phantoms.sort();
        for id in phantoms {
            if let Some(old) = self.delivered.remove(&id) {
                debug!(id = %id, "instance missing from new snapshot, synthesizing delete");
                out.push(ChangeNotification::Delete(old));
            }
        }

        for info in burst.into_ordered() {
            match self.delivered.get(info.id()) {
                None => out.push(ChangeNotification::Add(info.clone())),
                // Different value for a known id without a Delete in between: a modification.
                Some(old) if *old != info => out.push(ChangeNotification::Modify(info.clone())),
                Some(_) => continue,
            }
            self.delivered.insert(info.id().to_string(), info);
        }
        out.push(ChangeNotification::BufferSentinel);
        out
    }

    fn apply_live(&mut self, notification: ChangeNotification<InstanceInfo>) -> Vec<ChangeNotification<InstanceInfo>> {
        match notification {
            ChangeNotification::Add(info) | ChangeNotification::Modify(info) => {
                if !self.interest.matches(&info) {
                    // Moved out of the interest: the consumer must forget it.
                    return match self.delivered.remove(info.id()) {
                        Some(_) => vec![ChangeNotification::Delete(info)],
                        None => Vec::new(),
                    };
                }
                match self.delivered.insert(info.id().to_string(), info.clone()) {
                    None => vec![ChangeNotification::Add(info)],
                    Some(old) if old == info => Vec::new(),
                    Some(_) => vec![ChangeNotification::Modify(info)],
                }
            }
            ChangeNotification::Delete(info) => match self.delivered.remove(info.id()) {
                Some(_) => vec![ChangeNotification::Delete(info)],
                None => Vec::new(),
            },
            ChangeNotification::BufferSentinel => {
                debug!("ignoring sentinel outside a snapshot burst");
                Vec::new()
            }
        }
    }
}
