//! The core data model: peer identity, document state, channel variants,
//! awareness, version vectors and ready state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, externally-assigned document identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_owned())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        DocumentId(s)
    }
}

/// Stable, externally-assigned peer identifier. Survives reconnection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Opaque per-channel identifier. Allocated by the runtime, never by an adapter.
pub type ChannelId = u64;

/// Opaque adapter identifier, assigned by the embedder at registration time.
pub type AdapterId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    User,
    Bot,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    pub name: Option<String>,
    pub kind: PeerKind,
}

/// A version vector: per-peer monotone counters, comparable by dominance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(pub BTreeMap<PeerId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> u64 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    pub fn set(&mut self, peer: PeerId, counter: u64) {
        let entry = self.0.entry(peer).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// `true` if every counter in `self` is `>=` the corresponding counter in `other`.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(peer, counter)| self.get(peer) >= *counter)
    }

    /// Per-key maximum of two version vectors.
    pub fn join(&self, other: &VersionVector) -> VersionVector {
        let mut joined = self.clone();
        for (peer, counter) in &other.0 {
            joined.set(peer.clone(), *counter);
        }
        joined
    }
}

/// Cached belief about whether a peer has a document, and at what version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum Awareness {
    Unknown,
    Absent,
    Pending,
    Synced { version: VersionVector },
}

impl Default for Awareness {
    fn default() -> Self {
        Awareness::Unknown
    }
}

/// Per-peer state, keyed by `PeerId`, surviving channel removal.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub identity: PeerIdentity,
    pub document_awareness: std::collections::HashMap<DocumentId, Awareness>,
    pub subscriptions: std::collections::HashSet<DocumentId>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub channels: std::collections::HashSet<ChannelId>,
}

impl PeerState {
    pub fn new(identity: PeerIdentity, now: chrono::DateTime<chrono::Utc>) -> Self {
        PeerState {
            identity,
            document_awareness: Default::default(),
            subscriptions: Default::default(),
            last_seen: now,
            channels: Default::default(),
        }
    }

    pub fn awareness(&self, doc_id: &DocumentId) -> Awareness {
        self.document_awareness.get(doc_id).cloned().unwrap_or(Awareness::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Network,
    Storage,
    Other,
}

/// Discriminated channel lifecycle state: `generated -> connected -> established`,
/// monotone, never transitions backward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Generated,
    Connected,
    Established { peer_id: PeerId },
}

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub channel_id: ChannelId,
    pub adapter_id: AdapterId,
    pub kind: ChannelKind,
    pub state: ChannelState,
}

/// A pending network `sync-request`, queued while storage is consulted first.
#[derive(Debug, Clone)]
pub struct PendingNetworkRequest {
    pub channel_id: ChannelId,
    pub requester_version: VersionVector,
    pub bidirectional: bool,
}

/// Per-document entry: the CRDT instance plus storage-first admission bookkeeping.
///
/// `pending_network_requests` is non-empty only while
/// `pending_storage_channels` is non-empty.
pub struct DocumentState {
    pub doc: Box<dyn crate::crdt::CrdtDoc>,
    pub pending_storage_channels: Option<std::collections::HashSet<ChannelId>>,
    pub pending_network_requests: Vec<PendingNetworkRequest>,
}

impl DocumentState {
    pub fn new(doc: Box<dyn crate::crdt::CrdtDoc>) -> Self {
        DocumentState {
            doc,
            pending_storage_channels: None,
            pending_network_requests: Vec::new(),
        }
    }

    pub fn is_storage_pending(&self) -> bool {
        self.pending_storage_channels
            .as_ref()
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyStatus {
    Aware,
    Synced,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReadyInfo {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub established: bool,
}

/// Ready-state snapshot emitted to observers, one entry per known peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyState {
    pub doc_id: DocumentId,
    pub peer_id: PeerId,
    pub channels: Vec<ChannelReadyInfo>,
    pub status: ReadyStatus,
}
