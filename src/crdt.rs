//! The CRDT interface boundary: the synchronizer and `Handle` reach a
//! document only through `export`, `import`, `version` and `subscribe`. This
//! module defines that trait boundary plus an in-memory reference
//! implementation used by tests and by `testutil`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::CrdtError;
use crate::model::{PeerId, VersionVector};

/// The small interface the synchronizer and `Handle` require of a CRDT
/// document. Concrete embedders back this with a real CRDT library.
pub trait CrdtDoc: Send + Sync {
    /// Full encoded state, sufficient to reconstruct the document from nothing.
    fn export_snapshot(&self) -> Vec<u8>;

    /// Encoded delta containing everything not yet reflected by `from`.
    fn export_update(&self, from: &VersionVector) -> Vec<u8>;

    /// Merge bytes produced by `export_snapshot` or `export_update` (either
    /// is valid input; CRDT merges are idempotent and commutative).
    fn import(&mut self, bytes: &[u8]) -> Result<(), CrdtError>;

    /// The document's current version vector.
    fn version(&self) -> VersionVector;

    /// Register a callback invoked after every successful local or remote
    /// mutation. Used by the runtime to feed `doc-change` back into the
    /// reducer.
    fn subscribe(&mut self, listener: Box<dyn Fn() + Send + Sync>);

    /// Hint that the document may drop log history it no longer needs to
    /// retain. Default is a no-op; embedders backed by a real CRDT library
    /// may compact internal history here.
    fn compact(&mut self) {}

    /// Untyped JSON projection of current state, used by `Handle`'s
    /// path-scoped and jsonpath subscriptions.
    fn to_json(&self) -> serde_json::Value;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LogOp {
    peer: PeerId,
    counter: u64,
    text: String,
}

/// A minimal, genuinely convergent text CRDT: an append log deduplicated by
/// `(peer, counter)` and replayed in a deterministic total order.
pub struct InMemoryCrdt {
    log: Vec<LogOp>,
    listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl InMemoryCrdt {
    pub fn new() -> Self {
        InMemoryCrdt {
            log: Vec::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Append a locally-authored operation and notify subscribers.
    pub fn append_local(&mut self, peer: PeerId, text: impl Into<String>) {
        let counter = self.log.iter().filter(|op| op.peer == peer).count() as u64 + 1;
        self.log.push(LogOp {
            peer,
            counter,
            text: text.into(),
        });
        self.notify();
    }

    /// Materialized text: ops replayed in `(counter, peer)` order, which is
    /// independent of arrival order and therefore commutative.
    pub fn text(&self) -> String {
        let mut ordered = self.log.clone();
        ordered.sort_by(|a, b| (a.counter, &a.peer).cmp(&(b.counter, &b.peer)));
        ordered.into_iter().map(|op| op.text).collect()
    }

    fn notify(&self) {
        for listener in self.listeners.lock().expect("lock poisoned").iter() {
            listener();
        }
    }

    fn merge_ops(&mut self, incoming: Vec<LogOp>) {
        let mut changed = false;
        for op in incoming {
            if !self.log.iter().any(|existing| existing.peer == op.peer && existing.counter == op.counter) {
                self.log.push(op);
                changed = true;
            }
        }
        if changed {
            self.notify();
        }
    }
}

impl Default for InMemoryCrdt {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtDoc for InMemoryCrdt {
    fn export_snapshot(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.log, &mut buf).expect("in-memory encode cannot fail");
        buf
    }

    fn export_update(&self, from: &VersionVector) -> Vec<u8> {
        let delta: Vec<LogOp> = self
            .log
            .iter()
            .filter(|op| op.counter > from.get(&op.peer))
            .cloned()
            .collect();
        let mut buf = Vec::new();
        ciborium::into_writer(&delta, &mut buf).expect("in-memory encode cannot fail");
        buf
    }

    fn import(&mut self, bytes: &[u8]) -> Result<(), CrdtError> {
        let ops: Vec<LogOp> = ciborium::from_reader(bytes)
            .map_err(|e| CrdtError::Import(e.to_string()))?;
        self.merge_ops(ops);
        Ok(())
    }

    fn version(&self) -> VersionVector {
        let mut counters: BTreeMap<PeerId, u64> = BTreeMap::new();
        for op in &self.log {
            let entry = counters.entry(op.peer.clone()).or_insert(0);
            if op.counter > *entry {
                *entry = op.counter;
            }
        }
        VersionVector(counters)
    }

    fn subscribe(&mut self, listener: Box<dyn Fn() + Send + Sync>) {
        self.listeners.lock().expect("lock poisoned").push(listener);
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "text": self.text() })
    }
}
