//! Per-`(docId, namespace)` ephemeral store: short-lived, gossiped state such
//! as presence or cursor position, layered on top of document sync but never
//! persisted.

use std::collections::HashMap;

use crate::model::PeerId;

/// Reserved namespace the supplemented presence-tracking feature writes into.
pub const PRESENCE_NAMESPACE: &str = "__presence";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralSource {
    Local,
    Remote,
    Initial,
}

/// `(key, value|none, source)` notification delivered to store subscribers.
pub trait EphemeralListener: Send + Sync {
    fn on_change(&self, key: &str, value: Option<&[u8]>, source: EphemeralSource);
}

/// A `(docId, namespace)`-scoped keyed store of short-lived values.
pub struct EphemeralStore {
    namespace: String,
    values: HashMap<String, Vec<u8>>,
    listeners: Vec<Box<dyn EphemeralListener>>,
}

impl EphemeralStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        EphemeralStore {
            namespace: namespace.into(),
            values: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn subscribe(&mut self, listener: Box<dyn EphemeralListener>) {
        self.listeners.push(listener);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.values.get(key).map(Vec::as_slice)
    }

    pub fn get_all(&self) -> &HashMap<String, Vec<u8>> {
        &self.values
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>, source: EphemeralSource) {
        let key = key.into();
        self.values.insert(key.clone(), value.clone());
        self.emit(&key, Some(&value), source);
    }

    pub fn delete(&mut self, key: &str, source: EphemeralSource) {
        if self.values.remove(key).is_some() {
            self.emit(key, None, source);
        }
    }

    fn emit(&self, key: &str, value: Option<&[u8]>, source: EphemeralSource) {
        for listener in &self.listeners {
            listener.on_change(key, value, source);
        }
    }
}

/// Presence states written to [`PRESENCE_NAMESPACE`] as hello/ping/bye
/// signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceSignal {
    Hello,
    Ping,
    Bye,
}

/// Liveness timeout after which a peer with no `ping` is considered offline.
pub const PRESENCE_OFFLINE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PresenceState {
    pub signal: PresenceSignal,
    pub last_seen: std::time::Instant,
}

/// Tracks per-peer liveness derived from presence ephemeral traffic.
/// Owned by the runtime, one per document.
#[derive(Default)]
pub struct PresenceTracker {
    peers: HashMap<PeerId, PresenceState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, peer: PeerId, signal: PresenceSignal) {
        self.peers.insert(
            peer,
            PresenceState {
                signal,
                last_seen: std::time::Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Peers not seen within [`PRESENCE_OFFLINE_TIMEOUT`] or that sent `bye`.
    pub fn offline_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, state)| {
                state.signal == PresenceSignal::Bye || state.last_seen.elapsed() > PRESENCE_OFFLINE_TIMEOUT
            })
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .map(|state| state.signal != PresenceSignal::Bye && state.last_seen.elapsed() <= PRESENCE_OFFLINE_TIMEOUT)
            .unwrap_or(false)
    }
}
