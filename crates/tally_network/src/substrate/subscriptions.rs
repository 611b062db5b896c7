//! Wire subscription table.
//!
//! Logical listeners with the same `(method, params)` share one server-side
//! subscription. The table tracks which listener belongs to which wire
//! subscription, the server-assigned id once known, and notifications that
//! arrived before that id did.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::error::ConnectorError;
use crate::jsonrpc;

/// Per-id cap on notifications buffered before their subscribe response.
const MAX_EARLY: usize = 16;
/// Cap on distinct unknown ids buffered at once.
const MAX_EARLY_IDS: usize = 64;

/// Delivered to subscription listeners from the connection's task.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A notification payload (e.g. a `state_storage` change set).
    Update(Value),
    /// The socket dropped; the subscription is reissued after reconnecting.
    Disconnected,
    /// The node rejected the subscription, or the connection gave up.
    /// No further events follow.
    Error(ConnectorError),
}

/// Listener callback. Runs on the connection task, so it must not block.
pub type Listener = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

struct WireSub {
    method: String,
    params: Value,
    listeners: BTreeMap<u64, Listener>,
    server_id: Option<String>,
    request_id: Option<u64>,
    last: Option<Value>,
}

impl WireSub {
    fn emit(&self, event: &SubscriptionEvent) {
        for listener in self.listeners.values() {
            listener(event.clone());
        }
    }
}

/// A wire subscription whose last listener left.
#[derive(Debug, PartialEq)]
pub(crate) struct Removed {
    pub method: String,
    pub server_id: Option<String>,
}

/// Outcome of a subscribe response.
#[derive(Debug, PartialEq)]
pub(crate) enum Confirm {
    Live,
    /// Nobody wants this id any more; it should be unsubscribed.
    Orphan,
}

#[derive(Default)]
pub(crate) struct WireSubscriptions {
    subs: HashMap<String, WireSub>,
    by_server_id: HashMap<String, String>,
    by_listener: HashMap<u64, String>,
    early: HashMap<String, Vec<Value>>,
}

impl WireSubscriptions {
    /// Number of wire subscriptions, open or pending.
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Register a listener. Returns the signature key when a new wire
    /// subscription has to be opened; joiners get the last notification
    /// replayed instead.
    pub fn add(&mut self, listener_id: u64, method: &str, params: Value, listener: Listener) -> Option<String> {
        let key = jsonrpc::signature(method, &params);
        self.by_listener.insert(listener_id, key.clone());
        if let Some(sub) = self.subs.get_mut(&key) {
            if let Some(last) = &sub.last {
                listener(SubscriptionEvent::Update(last.clone()));
            }
            sub.listeners.insert(listener_id, listener);
            return None;
        }
        self.subs.insert(
            key.clone(),
            WireSub {
                method: method.to_string(),
                params,
                listeners: BTreeMap::from([(listener_id, listener)]),
                server_id: None,
                request_id: None,
                last: None,
            },
        );
        Some(key)
    }

    /// Drop a listener. Returns the wire subscription if it was the last one.
    pub fn remove(&mut self, listener_id: u64) -> Option<Removed> {
        let key = self.by_listener.remove(&listener_id)?;
        let sub = self.subs.get_mut(&key)?;
        sub.listeners.remove(&listener_id);
        if !sub.listeners.is_empty() {
            return None;
        }
        let sub = self.subs.remove(&key)?;
        if let Some(id) = &sub.server_id {
            self.by_server_id.remove(id);
        }
        Some(Removed {
            method: sub.method,
            server_id: sub.server_id,
        })
    }

    /// Method and params of a wire subscription, for (re)issuing it.
    pub fn request(&self, key: &str) -> Option<(String, Value)> {
        self.subs.get(key).map(|s| (s.method.clone(), s.params.clone()))
    }

    pub fn mark_sent(&mut self, key: &str, request_id: u64) {
        if let Some(sub) = self.subs.get_mut(key) {
            sub.request_id = Some(request_id);
        }
    }

    /// Forget an unanswered subscribe request so it can be reissued.
    /// Returns false when `request_id` is no longer the current attempt.
    pub fn clear_sent(&mut self, key: &str, request_id: u64) -> bool {
        match self.subs.get_mut(key) {
            Some(sub) if sub.request_id == Some(request_id) => {
                sub.request_id = None;
                true
            }
            _ => false,
        }
    }

    /// Bind the server id from a subscribe response and replay anything
    /// buffered for it.
    pub fn confirm(&mut self, key: &str, request_id: u64, server_id: String) -> Confirm {
        match self.subs.get_mut(key) {
            Some(sub) if sub.request_id == Some(request_id) => {
                sub.request_id = None;
                sub.server_id = Some(server_id.clone());
                self.by_server_id.insert(server_id.clone(), key.to_string());
                for value in self.early.remove(&server_id).unwrap_or_default() {
                    self.route(&server_id, value);
                }
                Confirm::Live
            }
            _ => {
                self.early.remove(&server_id);
                Confirm::Orphan
            }
        }
    }

    /// The node refused the subscription. Listeners are told and the entry
    /// is dropped.
    pub fn reject(&mut self, key: &str, request_id: u64, error: ConnectorError) -> bool {
        let current = self
            .subs
            .get(key)
            .is_some_and(|s| s.request_id == Some(request_id));
        if !current {
            return false;
        }
        let Some(sub) = self.subs.remove(key) else {
            return false;
        };
        for id in sub.listeners.keys() {
            self.by_listener.remove(id);
        }
        sub.emit(&SubscriptionEvent::Error(error));
        true
    }

    /// Deliver a notification, buffering it if its id is not bound yet.
    pub fn route(&mut self, server_id: &str, value: Value) {
        let sub = self
            .by_server_id
            .get(server_id)
            .and_then(|key| self.subs.get_mut(key));
        match sub {
            Some(sub) => {
                sub.emit(&SubscriptionEvent::Update(value.clone()));
                sub.last = Some(value);
            }
            None => {
                if self.early.len() >= MAX_EARLY_IDS && !self.early.contains_key(server_id) {
                    return;
                }
                let buffered = self.early.entry(server_id.to_string()).or_default();
                if buffered.len() < MAX_EARLY {
                    buffered.push(value);
                }
            }
        }
    }

    /// Take notifications buffered for an id bound outside this table.
    pub fn take_early(&mut self, server_id: &str) -> Vec<Value> {
        self.early.remove(server_id).unwrap_or_default()
    }

    /// Keys of wire subscriptions with no server id and no request in flight.
    pub fn unsent_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .subs
            .iter()
            .filter(|(_, s)| s.server_id.is_none() && s.request_id.is_none())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// The socket dropped: every server id is void.
    pub fn reset(&mut self) {
        self.by_server_id.clear();
        self.early.clear();
        for sub in self.subs.values_mut() {
            sub.server_id = None;
            sub.request_id = None;
            sub.emit(&SubscriptionEvent::Disconnected);
        }
    }

    /// The connection is going away for good.
    pub fn fail_all(&mut self, error: &ConnectorError) {
        for (_, sub) in self.subs.drain() {
            sub.emit(&SubscriptionEvent::Error(error.clone()));
        }
        self.by_server_id.clear();
        self.by_listener.clear();
        self.early.clear();
    }
}
