//! The synchronizer state machine: a pure reducer `(message, model) ->
//! (model', commands)`, implemented as a plain mutable struct mutated in
//! place. The CRDT document and ephemeral stores are logically owned by the
//! synchronizer and mutated directly inside the reducer rather than through
//! a side channel.
//!
//! An explicit `Message`/`Command` pair with a single `handle` entry point
//! keeps dispatch as tagged enums rather than trait-object dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::crdt::CrdtDoc;
use crate::ephemeral::{EphemeralSource, EphemeralStore};
use crate::error::SyncError;
use crate::model::{
    AdapterId, Awareness, ChannelId, ChannelKind, ChannelReadyInfo, ChannelRecord, ChannelState,
    DocumentId, DocumentState, PeerId, PeerIdentity, PeerState, PendingNetworkRequest, ReadyState,
    ReadyStatus, VersionVector,
};
use crate::rules::{DocContext, PeerContext, Rules};
use crate::wire::{
    DeleteStatus, EphemeralEnvelope, ProtocolMessage, SyncRequestEntry, SyncTransmission, WireMessage,
};

/// Constructs a fresh CRDT document for a given id. Owned by whoever builds
/// the `Synchronizer` (normally `runtime`, which wraps the embedder's raw
/// factory with subscription wiring, see `runtime::Runtime::new`).
pub type DocFactory = Arc<dyn Fn(&DocumentId) -> Box<dyn crate::crdt::CrdtDoc> + Send + Sync>;

/// Lifecycle and protocol input to the reducer.
#[derive(Debug, Clone)]
pub enum Message {
    ChannelAdded {
        channel_id: ChannelId,
        adapter_id: AdapterId,
        kind: ChannelKind,
    },
    EstablishChannel {
        channel_id: ChannelId,
    },
    ChannelRemoved {
        channel_id: ChannelId,
    },
    DocEnsure {
        doc_id: DocumentId,
    },
    DocChange {
        doc_id: DocumentId,
    },
    DocDelete {
        doc_id: DocumentId,
    },
    EphemeralLocalChange {
        doc_id: DocumentId,
        namespace: String,
        key: String,
        value: Option<Vec<u8>>,
    },
    Heartbeat,
    ChannelReceive {
        channel_id: ChannelId,
        message: WireMessage,
    },
}

/// Side-effect commands the runtime executes.
#[derive(Debug, Clone)]
pub enum Command {
    SendEstablishmentMessage {
        channel_id: ChannelId,
        message: ProtocolMessage,
    },
    SendMessage {
        channel_id: ChannelId,
        message: ProtocolMessage,
    },
    SendSyncRequest {
        channel_id: ChannelId,
        message: ProtocolMessage,
    },
    SendSyncResponse {
        channel_id: ChannelId,
        message: ProtocolMessage,
    },
    StopChannel {
        channel_id: ChannelId,
    },
    SubscribeDoc {
        doc_id: DocumentId,
    },
    ApplyEphemeral {
        doc_id: DocumentId,
        namespace: String,
        peer_id: PeerId,
    },
    BroadcastEphemeral {
        doc_id: DocumentId,
        channel_id: ChannelId,
        message: ProtocolMessage,
    },
    RemoveEphemeralPeer {
        doc_id: DocumentId,
        namespace: String,
        peer_id: PeerId,
    },
    EmitReadyStateChanged {
        doc_id: DocumentId,
    },
    EmitEphemeralChange {
        doc_id: DocumentId,
        namespace: String,
        key: String,
        value: Option<Vec<u8>>,
        source: EphemeralSource,
    },
    Dispatch(Message),
    Batch(Vec<Command>),
}

/// The reducer itself, plus the model it owns.
pub struct Synchronizer {
    local_identity: PeerIdentity,
    rules: Arc<dyn Rules>,
    doc_factory: DocFactory,
    documents: HashMap<DocumentId, DocumentState>,
    peers: HashMap<PeerId, PeerState>,
    channels: HashMap<ChannelId, ChannelRecord>,
    ephemeral_stores: HashMap<(DocumentId, String), EphemeralStore>,
}

impl Synchronizer {
    pub fn new(local_identity: PeerIdentity, rules: Arc<dyn Rules>, doc_factory: DocFactory) -> Self {
        Synchronizer {
            local_identity,
            rules,
            doc_factory,
            documents: HashMap::new(),
            peers: HashMap::new(),
            channels: HashMap::new(),
            ephemeral_stores: HashMap::new(),
        }
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local_identity
    }

    pub fn document_version(&self, doc_id: &DocumentId) -> Option<VersionVector> {
        self.documents.get(doc_id).map(|d| d.doc.version())
    }

    pub fn has_document(&self, doc_id: &DocumentId) -> bool {
        self.documents.contains_key(doc_id)
    }

    pub fn with_document<R>(&self, doc_id: &DocumentId, f: impl FnOnce(&dyn crate::crdt::CrdtDoc) -> R) -> Option<R> {
        self.documents.get(doc_id).map(|d| f(d.doc.as_ref()))
    }

    pub fn with_document_mut<R>(
        &mut self,
        doc_id: &DocumentId,
        f: impl FnOnce(&mut dyn crate::crdt::CrdtDoc) -> R,
    ) -> Option<R> {
        self.documents.get_mut(doc_id).map(|d| f(d.doc.as_mut()))
    }

    pub fn channel_state(&self, channel_id: ChannelId) -> Option<ChannelState> {
        self.channels.get(&channel_id).map(|r| r.state.clone())
    }

    /// Read a single key from a `(docId, namespace)` ephemeral store, used by
    /// `Handle::get_ephemeral`/`get_typed_ephemeral`. Read-only: does not
    /// create the namespace if absent.
    pub fn ephemeral_get(&self, doc_id: &DocumentId, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.ephemeral_stores
            .get(&(doc_id.clone(), namespace.to_owned()))
            .and_then(|store| store.get(key))
            .map(<[u8]>::to_vec)
    }

    /// Snapshot every key in a `(docId, namespace)` ephemeral store.
    pub fn ephemeral_get_all(&self, doc_id: &DocumentId, namespace: &str) -> HashMap<String, Vec<u8>> {
        self.ephemeral_stores
            .get(&(doc_id.clone(), namespace.to_owned()))
            .map(|store| store.get_all().clone())
            .unwrap_or_default()
    }

    /// Ready-state snapshot for every peer known to have an opinion about `doc_id`.
    pub fn ready_states(&self, doc_id: &DocumentId) -> Vec<ReadyState> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.subscriptions.contains(doc_id) || peer.document_awareness.contains_key(doc_id))
            .map(|(peer_id, peer)| {
                let channels = peer
                    .channels
                    .iter()
                    .filter_map(|cid| self.channels.get(cid))
                    .map(|rec| ChannelReadyInfo {
                        channel_id: rec.channel_id,
                        kind: rec.kind,
                        established: matches!(rec.state, ChannelState::Established { .. }),
                    })
                    .collect();
                let status = match peer.awareness(doc_id) {
                    Awareness::Synced { .. } => ReadyStatus::Synced,
                    Awareness::Absent => ReadyStatus::Absent,
                    _ => ReadyStatus::Aware,
                };
                ReadyState {
                    doc_id: doc_id.clone(),
                    peer_id: peer_id.clone(),
                    channels,
                    status,
                }
            })
            .collect()
    }

    /// The single reducer entry point. Returns an error rather than silently
    /// dropping the message when a non-establishment message arrives on a
    /// channel that hasn't completed the establishment handshake yet.
    pub fn handle(&mut self, message: Message) -> Result<Vec<Command>, SyncError> {
        Ok(match message {
            Message::ChannelAdded { channel_id, adapter_id, kind } => {
                self.handle_channel_added(channel_id, adapter_id, kind)
            }
            Message::EstablishChannel { channel_id } => self.handle_establish_channel(channel_id),
            Message::ChannelRemoved { channel_id } => self.handle_channel_removed(channel_id),
            Message::DocEnsure { doc_id } => self.handle_doc_ensure(doc_id),
            Message::DocChange { doc_id } => self.handle_doc_change(doc_id),
            Message::DocDelete { doc_id } => self.handle_doc_delete(doc_id),
            Message::EphemeralLocalChange { doc_id, namespace, key, value } => {
                self.handle_ephemeral_local_change(doc_id, namespace, key, value)
            }
            Message::Heartbeat => self.handle_heartbeat(),
            Message::ChannelReceive { channel_id, message } => self.handle_channel_receive(channel_id, message)?,
        })
    }

    // ---- channel lifecycle -------------------------------------------------

    fn handle_channel_added(&mut self, channel_id: ChannelId, adapter_id: AdapterId, kind: ChannelKind) -> Vec<Command> {
        // "generated" is the adapter-local pre-registration state; by the
        // time channel-added reaches the reducer the channel is already
        // known to the runtime, i.e. "connected".
        self.channels.insert(
            channel_id,
            ChannelRecord {
                channel_id,
                adapter_id,
                kind,
                state: ChannelState::Connected,
            },
        );
        Vec::new()
    }

    fn handle_establish_channel(&mut self, channel_id: ChannelId) -> Vec<Command> {
        if !self.channels.contains_key(&channel_id) {
            return Vec::new();
        }
        vec![Command::SendEstablishmentMessage {
            channel_id,
            message: ProtocolMessage::EstablishRequest {
                identity: self.local_identity.clone(),
            },
        }]
    }

    fn handle_channel_removed(&mut self, channel_id: ChannelId) -> Vec<Command> {
        if let Some(record) = self.channels.remove(&channel_id) {
            if let ChannelState::Established { peer_id } = &record.state {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.channels.remove(&channel_id);
                }
            }
        }

        let mut commands = Vec::new();
        let doc_ids: Vec<DocumentId> = self.documents.keys().cloned().collect();
        for doc_id in doc_ids {
            // Removing a channel cancels any network request it made that is
            // still queued behind storage-first admission.
            if let Some(doc) = self.documents.get_mut(&doc_id) {
                doc.pending_network_requests.retain(|req| req.channel_id != channel_id);
            }

            let mut became_empty = false;
            if let Some(doc) = self.documents.get_mut(&doc_id) {
                if let Some(set) = doc.pending_storage_channels.as_mut() {
                    if set.remove(&channel_id) && set.is_empty() {
                        became_empty = true;
                    }
                }
            }
            if became_empty {
                commands.extend(self.flush_pending_network_requests(&doc_id));
            }
        }
        commands
    }

    // ---- establishment handshake -------------------------------------------

    fn handle_establish_request(&mut self, channel_id: ChannelId, identity: PeerIdentity) -> Vec<Command> {
        let peer_id = identity.peer_id.clone();
        self.upsert_peer(&peer_id, identity.clone(), channel_id);
        self.set_channel_established(channel_id, peer_id);

        let channel_kind = self.channels.get(&channel_id).map(|c| c.kind).unwrap_or(ChannelKind::Other);
        let entries: Vec<SyncRequestEntry> = self
            .documents
            .iter()
            .filter(|(doc_id, _)| {
                let ctx_doc = DocContext { doc_id };
                let ctx_peer = PeerContext { identity: &identity, channel_kind };
                self.rules.visibility(&ctx_doc, &ctx_peer)
            })
            .map(|(doc_id, state)| SyncRequestEntry {
                doc_id: doc_id.clone(),
                requester_doc_version: state.doc.version(),
                ephemeral: self.local_ephemeral_envelopes(doc_id),
            })
            .collect();

        let mut commands = vec![Command::SendEstablishmentMessage {
            channel_id,
            message: ProtocolMessage::EstablishResponse {
                identity: self.local_identity.clone(),
            },
        }];
        if !entries.is_empty() {
            // Bidirectional: a responder with fresher content reciprocates
            // (see respond_to_sync_request) instead of waiting to be asked.
            commands.push(Command::SendSyncRequest {
                channel_id,
                message: ProtocolMessage::SyncRequest { docs: entries, bidirectional: true },
            });
        }
        commands
    }

    fn handle_establish_response(&mut self, channel_id: ChannelId, identity: PeerIdentity) -> Vec<Command> {
        let peer_id = identity.peer_id.clone();
        let peer_already_known = self.peers.contains_key(&peer_id);
        self.upsert_peer(&peer_id, identity.clone(), channel_id);
        self.set_channel_established(channel_id, peer_id.clone());

        let channel_kind = self.channels.get(&channel_id).map(|c| c.kind).unwrap_or(ChannelKind::Other);
        let candidates: Vec<DocumentId> = self
            .documents
            .iter()
            .filter(|(doc_id, _)| {
                let ctx_doc = DocContext { doc_id };
                let ctx_peer = PeerContext { identity: &identity, channel_kind };
                self.rules.visibility(&ctx_doc, &ctx_peer)
            })
            .map(|(doc_id, _)| doc_id.clone())
            .collect();

        let selected: Vec<DocumentId> = if peer_already_known {
            // Delta reconnection: only docs created since last contact, or
            // whose local version strictly dominates the cached synced{v}.
            candidates
                .into_iter()
                .filter(|doc_id| {
                    let awareness = self.peers[&peer_id].awareness(doc_id);
                    match awareness {
                        Awareness::Unknown => true,
                        Awareness::Synced { version } => {
                            let local = self.documents[doc_id].doc.version();
                            local.dominates(&version) && local != version
                        }
                        _ => false,
                    }
                })
                .collect()
        } else {
            candidates
        };

        if selected.is_empty() {
            return Vec::new();
        }
        let entries = selected
            .iter()
            .map(|doc_id| SyncRequestEntry {
                doc_id: doc_id.clone(),
                requester_doc_version: self.documents[doc_id].doc.version(),
                ephemeral: self.local_ephemeral_envelopes(doc_id),
            })
            .collect();
        vec![Command::SendSyncRequest {
            channel_id,
            message: ProtocolMessage::SyncRequest { docs: entries, bidirectional: true },
        }]
    }

    // ---- discovery ----------------------------------------------------------

    fn handle_directory_request(&mut self, channel_id: ChannelId, requested: Option<Vec<DocumentId>>) -> Vec<Command> {
        let Some(peer_id) = self.established_peer(channel_id) else {
            return Vec::new();
        };
        let Some(identity) = self.peers.get(&peer_id).map(|p| p.identity.clone()) else {
            return Vec::new();
        };
        let channel_kind = self.channels.get(&channel_id).map(|c| c.kind).unwrap_or(ChannelKind::Other);
        let subscriptions = self.peers.get(&peer_id).map(|p| p.subscriptions.clone()).unwrap_or_default();

        let candidates: Vec<DocumentId> = match requested {
            Some(ids) => ids.into_iter().filter(|id| self.documents.contains_key(id)).collect(),
            None => self.documents.keys().cloned().collect(),
        };
        let visible: Vec<DocumentId> = candidates
            .into_iter()
            .filter(|doc_id| {
                // Subscription bypass: already-subscribed docs are revealed
                // regardless of `visibility` (prior reveal already happened).
                if subscriptions.contains(doc_id) {
                    return true;
                }
                let ctx_doc = DocContext { doc_id };
                let ctx_peer = PeerContext { identity: &identity, channel_kind };
                self.rules.visibility(&ctx_doc, &ctx_peer)
            })
            .collect();

        vec![Command::SendMessage {
            channel_id,
            message: ProtocolMessage::DirectoryResponse { doc_ids: visible },
        }]
    }

    fn handle_directory_response(&mut self, channel_id: ChannelId, doc_ids: Vec<DocumentId>) -> Vec<Command> {
        tracing::debug!(channel_id, count = doc_ids.len(), "directory-response received");
        self.pull_unheld_docs(channel_id, doc_ids)
    }

    fn handle_new_doc(&mut self, channel_id: ChannelId, doc_ids: Vec<DocumentId>) -> Vec<Command> {
        tracing::debug!(channel_id, count = doc_ids.len(), "new-doc announcement received");
        self.pull_unheld_docs(channel_id, doc_ids)
    }

    /// Issues a `sync-request` over `channel_id` for every advertised doc id
    /// not already held locally, so a document announced after the channel
    /// was established still gets pulled rather than sitting unrequested.
    fn pull_unheld_docs(&self, channel_id: ChannelId, doc_ids: Vec<DocumentId>) -> Vec<Command> {
        let entries: Vec<SyncRequestEntry> = doc_ids
            .into_iter()
            .filter(|doc_id| !self.documents.contains_key(doc_id))
            .map(|doc_id| SyncRequestEntry {
                doc_id,
                requester_doc_version: VersionVector::new(),
                ephemeral: None,
            })
            .collect();
        if entries.is_empty() {
            return Vec::new();
        }
        vec![Command::SendSyncRequest {
            channel_id,
            message: ProtocolMessage::SyncRequest { docs: entries, bidirectional: false },
        }]
    }

    /// Announce a newly admitted document to every other established channel
    /// passing `visibility`.
    fn announce_new_doc(&self, doc_id: &DocumentId, exclude_channel: Option<ChannelId>) -> Vec<Command> {
        let mut commands = Vec::new();
        for (channel_id, record) in &self.channels {
            if Some(*channel_id) == exclude_channel {
                continue;
            }
            if let ChannelState::Established { peer_id } = &record.state {
                if let Some(peer) = self.peers.get(peer_id) {
                    let ctx_doc = DocContext { doc_id };
                    let ctx_peer = PeerContext { identity: &peer.identity, channel_kind: record.kind };
                    if self.rules.visibility(&ctx_doc, &ctx_peer) {
                        commands.push(Command::SendMessage {
                            channel_id: *channel_id,
                            message: ProtocolMessage::NewDoc { doc_ids: vec![doc_id.clone()] },
                        });
                    }
                }
            }
        }
        commands
    }

    // ---- sync -----------------------------------------------------------

    fn handle_sync_request(&mut self, channel_id: ChannelId, docs: Vec<SyncRequestEntry>, bidirectional: bool) -> Vec<Command> {
        let mut commands = Vec::new();
        for entry in docs {
            commands.extend(self.handle_sync_request_entry(channel_id, entry, bidirectional));
        }
        commands
    }

    fn handle_sync_request_entry(&mut self, channel_id: ChannelId, entry: SyncRequestEntry, bidirectional: bool) -> Vec<Command> {
        let SyncRequestEntry { doc_id, requester_doc_version, ephemeral } = entry;
        let Some(peer_id) = self.established_peer(channel_id) else {
            tracing::warn!(channel_id, "sync-request on non-established channel ignored");
            return Vec::new();
        };

        // Step 1: mark awareness pending, subscribe unconditionally.
        self.set_awareness(&peer_id, &doc_id, Awareness::Pending);
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.subscriptions.insert(doc_id.clone());
        }

        let channel_kind = self.channels.get(&channel_id).map(|c| c.kind).unwrap_or(ChannelKind::Other);
        let mut pre_commands = Vec::new();

        if !self.documents.contains_key(&doc_id) {
            // Step 2: document not held locally.
            let storage_channels: HashSet<ChannelId> = self
                .channels
                .iter()
                .filter(|(_, rec)| rec.kind == ChannelKind::Storage)
                .map(|(id, _)| *id)
                .collect();

            if !storage_channels.is_empty() && channel_kind == ChannelKind::Network {
                let doc = (self.doc_factory)(&doc_id);
                let mut doc_state = DocumentState::new(doc);
                doc_state.pending_storage_channels = Some(storage_channels.clone());
                doc_state.pending_network_requests.push(PendingNetworkRequest {
                    channel_id,
                    requester_version: requester_doc_version,
                    bidirectional,
                });
                self.documents.insert(doc_id.clone(), doc_state);

                return storage_channels
                    .into_iter()
                    .map(|storage_channel| Command::SendSyncRequest {
                        channel_id: storage_channel,
                        message: ProtocolMessage::SyncRequest {
                            docs: vec![SyncRequestEntry {
                                doc_id: doc_id.clone(),
                                requester_doc_version: VersionVector::new(),
                                ephemeral: None,
                            }],
                            bidirectional: false,
                        },
                    })
                    .collect();
            }

            let Some(identity) = self.peers.get(&peer_id).map(|p| p.identity.clone()) else {
                return Vec::new();
            };
            let ctx_peer = PeerContext { identity: &identity, channel_kind };
            if self.rules.creation(&doc_id, &ctx_peer) {
                let doc = (self.doc_factory)(&doc_id);
                self.documents.insert(doc_id.clone(), DocumentState::new(doc));
                pre_commands.extend(self.announce_new_doc(&doc_id, Some(channel_id)));
            } else {
                tracing::warn!(%doc_id, %peer_id, "dropping sync-request: creation denied");
                return Vec::new();
            }
        } else if self.documents.get(&doc_id).map(|d| d.is_storage_pending()).unwrap_or(false)
            && channel_kind == ChannelKind::Network
        {
            // Step 3: already suspended waiting on storage; enqueue and return.
            if let Some(doc_state) = self.documents.get_mut(&doc_id) {
                doc_state.pending_network_requests.push(PendingNetworkRequest {
                    channel_id,
                    requester_version: requester_doc_version,
                    bidirectional,
                });
            }
            return pre_commands;
        }

        // Steps 4-5.
        pre_commands.extend(self.respond_to_sync_request(&doc_id, channel_id, &requester_doc_version, bidirectional, ephemeral));
        pre_commands
    }

    fn respond_to_sync_request(
        &mut self,
        doc_id: &DocumentId,
        channel_id: ChannelId,
        requester_version: &VersionVector,
        bidirectional: bool,
        ephemeral: Option<Vec<EphemeralEnvelope>>,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        if let Some(envelopes) = ephemeral {
            commands.extend(self.apply_ephemeral_envelopes(doc_id, envelopes));
        }

        let Some(doc_state) = self.documents.get(doc_id) else {
            return commands;
        };
        let my_version = doc_state.doc.version();
        let transmission = if requester_version.dominates(&my_version) {
            SyncTransmission::UpToDate { version: my_version.clone() }
        } else if requester_version.is_empty() {
            SyncTransmission::Snapshot { bytes: doc_state.doc.export_snapshot(), version: my_version.clone() }
        } else {
            SyncTransmission::Update { bytes: doc_state.doc.export_update(requester_version), version: my_version.clone() }
        };

        commands.push(Command::SendSyncResponse {
            channel_id,
            message: ProtocolMessage::SyncResponse {
                doc_id: doc_id.clone(),
                transmission,
                ephemeral: self.local_ephemeral_envelopes(doc_id),
            },
        });

        if bidirectional {
            commands.push(Command::SendSyncRequest {
                channel_id,
                message: ProtocolMessage::SyncRequest {
                    docs: vec![SyncRequestEntry {
                        doc_id: doc_id.clone(),
                        requester_doc_version: my_version,
                        ephemeral: None,
                    }],
                    bidirectional: false,
                },
            });
        }
        commands
    }

    fn handle_sync_response(
        &mut self,
        channel_id: ChannelId,
        doc_id: DocumentId,
        transmission: SyncTransmission,
        ephemeral: Option<Vec<EphemeralEnvelope>>,
    ) -> Vec<Command> {
        let mut commands = self.apply_transmission(channel_id, &doc_id, transmission);
        if let Some(envelopes) = ephemeral {
            commands.extend(self.apply_ephemeral_envelopes(&doc_id, envelopes));
        }

        let from_storage = self.channels.get(&channel_id).map(|c| c.kind) == Some(ChannelKind::Storage);
        if from_storage {
            let mut became_empty = false;
            if let Some(doc_state) = self.documents.get_mut(&doc_id) {
                if let Some(set) = doc_state.pending_storage_channels.as_mut() {
                    if set.remove(&channel_id) && set.is_empty() {
                        became_empty = true;
                    }
                }
            }
            if became_empty {
                commands.extend(self.flush_pending_network_requests(&doc_id));
            }
        }
        commands
    }

    fn handle_update(&mut self, channel_id: ChannelId, doc_id: DocumentId, transmission: SyncTransmission) -> Vec<Command> {
        self.apply_transmission(channel_id, &doc_id, transmission)
    }

    /// Shared tail of `sync-response` and `update` handling: permission
    /// check, CRDT apply, awareness update, ready-state emission.
    fn apply_transmission(&mut self, channel_id: ChannelId, doc_id: &DocumentId, transmission: SyncTransmission) -> Vec<Command> {
        let Some(peer_id) = self.established_peer(channel_id) else {
            return Vec::new();
        };
        let channel_kind = self.channels.get(&channel_id).map(|c| c.kind).unwrap_or(ChannelKind::Other);

        match transmission {
            SyncTransmission::Unavailable => {
                self.set_awareness(&peer_id, doc_id, Awareness::Absent);
                vec![Command::EmitReadyStateChanged { doc_id: doc_id.clone() }]
            }
            SyncTransmission::UpToDate { version } => {
                self.set_awareness(&peer_id, doc_id, Awareness::Synced { version });
                vec![Command::EmitReadyStateChanged { doc_id: doc_id.clone() }]
            }
            SyncTransmission::Snapshot { bytes, version } | SyncTransmission::Update { bytes, version } => {
                let Some(identity) = self.peers.get(&peer_id).map(|p| p.identity.clone()) else {
                    return Vec::new();
                };
                let ctx_doc = DocContext { doc_id };
                let ctx_peer = PeerContext { identity: &identity, channel_kind };
                if !self.rules.mutability(&ctx_doc, &ctx_peer) {
                    tracing::warn!(%doc_id, %peer_id, "dropping transmission: mutability denied");
                    return Vec::new();
                }
                let Some(doc_state) = self.documents.get_mut(doc_id) else {
                    return Vec::new();
                };
                if let Err(err) = doc_state.doc.import(&bytes) {
                    tracing::error!(%doc_id, %peer_id, %err, "failed to import transmission bytes");
                    return Vec::new();
                }
                self.set_awareness(&peer_id, doc_id, Awareness::Synced { version });
                vec![Command::EmitReadyStateChanged { doc_id: doc_id.clone() }]
            }
        }
    }

    fn flush_pending_network_requests(&mut self, doc_id: &DocumentId) -> Vec<Command> {
        let requests = self
            .documents
            .get_mut(doc_id)
            .map(|d| std::mem::take(&mut d.pending_network_requests))
            .unwrap_or_default();
        let mut commands = Vec::new();
        for req in requests {
            if !self.channels.contains_key(&req.channel_id) {
                continue;
            }
            commands.extend(self.respond_to_sync_request(doc_id, req.channel_id, &req.requester_version, req.bidirectional, None));
        }
        commands
    }

    // ---- local change propagation ------------------------------------------

    fn handle_doc_ensure(&mut self, doc_id: DocumentId) -> Vec<Command> {
        if self.documents.contains_key(&doc_id) {
            return Vec::new();
        }
        let doc = (self.doc_factory)(&doc_id);
        self.documents.insert(doc_id.clone(), DocumentState::new(doc));
        self.announce_new_doc(&doc_id, None)
    }

    fn handle_doc_change(&mut self, doc_id: DocumentId) -> Vec<Command> {
        let Some(doc_state) = self.documents.get(&doc_id) else {
            return Vec::new();
        };
        let my_version = doc_state.doc.version();

        let established: Vec<(ChannelId, PeerId, ChannelKind)> = self
            .channels
            .iter()
            .filter_map(|(cid, rec)| match &rec.state {
                ChannelState::Established { peer_id } => Some((*cid, peer_id.clone(), rec.kind)),
                _ => None,
            })
            .collect();

        let mut commands = Vec::new();
        for (channel_id, peer_id, channel_kind) in established {
            let Some(peer) = self.peers.get(&peer_id) else { continue };
            let identity = peer.identity.clone();
            let subscribed = peer.subscriptions.contains(&doc_id);
            let ctx_doc = DocContext { doc_id: &doc_id };
            let ctx_peer = PeerContext { identity: &identity, channel_kind };
            let visible = self.rules.visibility(&ctx_doc, &ctx_peer);
            if !subscribed && !visible {
                continue;
            }

            let awareness = peer.awareness(&doc_id);
            if subscribed {
                let cached_version = match awareness {
                    Awareness::Synced { version } => Some(version),
                    _ => None,
                };
                let transmission = match cached_version {
                    Some(version) => SyncTransmission::Update { bytes: doc_state.doc.export_update(&version), version: my_version.clone() },
                    None => SyncTransmission::Snapshot { bytes: doc_state.doc.export_snapshot(), version: my_version.clone() },
                };
                commands.push(Command::SendMessage {
                    channel_id,
                    message: ProtocolMessage::Update { doc_id: doc_id.clone(), transmission },
                });
            } else if matches!(awareness, Awareness::Unknown) {
                commands.push(Command::SendMessage {
                    channel_id,
                    message: ProtocolMessage::NewDoc { doc_ids: vec![doc_id.clone()] },
                });
            }
            // Awareness::Absent (known-absent peer) -> send nothing.
        }
        commands
    }

    fn handle_doc_delete(&mut self, doc_id: DocumentId) -> Vec<Command> {
        if self.documents.remove(&doc_id).is_none() {
            return Vec::new();
        }
        self.ephemeral_stores.retain(|(d, _), _| d != &doc_id);

        self.subscribed_established_channels(&doc_id, None)
            .into_iter()
            .map(|channel_id| Command::SendMessage {
                channel_id,
                message: ProtocolMessage::DeleteRequest { doc_id: doc_id.clone() },
            })
            .collect()
    }

    fn handle_delete_request(&mut self, channel_id: ChannelId, doc_id: DocumentId) -> Vec<Command> {
        let Some(peer_id) = self.established_peer(channel_id) else {
            return Vec::new();
        };
        let Some(identity) = self.peers.get(&peer_id).map(|p| p.identity.clone()) else {
            return Vec::new();
        };
        let channel_kind = self.channels.get(&channel_id).map(|c| c.kind).unwrap_or(ChannelKind::Other);
        let ctx_doc = DocContext { doc_id: &doc_id };
        let ctx_peer = PeerContext { identity: &identity, channel_kind };

        let status = if self.rules.deletion(&ctx_doc, &ctx_peer) {
            self.documents.remove(&doc_id);
            self.ephemeral_stores.retain(|(d, _), _| d != &doc_id);
            DeleteStatus::Deleted
        } else {
            DeleteStatus::Ignored
        };
        vec![Command::SendMessage {
            channel_id,
            message: ProtocolMessage::DeleteResponse { doc_id, status },
        }]
    }

    fn handle_delete_response(&self, channel_id: ChannelId, doc_id: DocumentId, status: DeleteStatus) -> Vec<Command> {
        tracing::debug!(channel_id, %doc_id, ?status, "delete-response received");
        Vec::new()
    }

    // ---- ephemeral ----------------------------------------------------------

    fn handle_ephemeral_local_change(&mut self, doc_id: DocumentId, namespace: String, key: String, value: Option<Vec<u8>>) -> Vec<Command> {
        {
            let store = self
                .ephemeral_stores
                .entry((doc_id.clone(), namespace.clone()))
                .or_insert_with(|| EphemeralStore::new(namespace.clone()));
            match &value {
                Some(v) => store.set(key.clone(), v.clone(), EphemeralSource::Local),
                None => store.delete(&key, EphemeralSource::Local),
            }
        }

        let mut commands = vec![Command::EmitEphemeralChange {
            doc_id: doc_id.clone(),
            namespace: namespace.clone(),
            key,
            value,
            source: EphemeralSource::Local,
        }];

        if let Some(envelopes) = self.local_ephemeral_envelopes(&doc_id) {
            for channel_id in self.subscribed_established_channels(&doc_id, None) {
                commands.push(Command::BroadcastEphemeral {
                    doc_id: doc_id.clone(),
                    channel_id,
                    message: ProtocolMessage::Ephemeral {
                        doc_id: doc_id.clone(),
                        hops_remaining: 1,
                        stores: envelopes.clone(),
                    },
                });
            }
        }
        commands
    }

    fn handle_ephemeral_message(&mut self, channel_id: ChannelId, doc_id: DocumentId, hops_remaining: u8, stores: Vec<EphemeralEnvelope>) -> Vec<Command> {
        let mut commands = self.apply_ephemeral_envelopes(&doc_id, stores.clone());
        if hops_remaining > 0 {
            let relay_hops = hops_remaining - 1;
            for target in self.subscribed_established_channels(&doc_id, Some(channel_id)) {
                commands.push(Command::BroadcastEphemeral {
                    doc_id: doc_id.clone(),
                    channel_id: target,
                    message: ProtocolMessage::Ephemeral {
                        doc_id: doc_id.clone(),
                        hops_remaining: relay_hops,
                        stores: stores.clone(),
                    },
                });
            }
        }
        commands
    }

    fn apply_ephemeral_envelopes(&mut self, doc_id: &DocumentId, envelopes: Vec<EphemeralEnvelope>) -> Vec<Command> {
        let mut commands = Vec::new();
        for envelope in envelopes {
            let decoded: HashMap<String, Vec<u8>> = match ciborium::from_reader(envelope.data.as_slice()) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!(%doc_id, peer_id = %envelope.peer_id, %err, "dropping malformed ephemeral envelope");
                    continue;
                }
            };
            let store = self
                .ephemeral_stores
                .entry((doc_id.clone(), envelope.namespace.clone()))
                .or_insert_with(|| EphemeralStore::new(envelope.namespace.clone()));
            for (key, value) in decoded {
                let previous = store.get(&key).map(<[u8]>::to_vec);
                if previous.as_deref() != Some(value.as_slice()) {
                    store.set(key.clone(), value.clone(), EphemeralSource::Remote);
                    commands.push(Command::EmitEphemeralChange {
                        doc_id: doc_id.clone(),
                        namespace: envelope.namespace.clone(),
                        key,
                        value: Some(value),
                        source: EphemeralSource::Remote,
                    });
                }
            }
            commands.push(Command::ApplyEphemeral {
                doc_id: doc_id.clone(),
                namespace: envelope.namespace.clone(),
                peer_id: envelope.peer_id.clone(),
            });
        }
        commands
    }

    fn local_ephemeral_envelopes(&self, doc_id: &DocumentId) -> Option<Vec<EphemeralEnvelope>> {
        let local_peer = self.local_identity.peer_id.clone();
        let mut envelopes = Vec::new();
        for ((d, namespace), store) in &self.ephemeral_stores {
            if d != doc_id {
                continue;
            }
            let map = store.get_all();
            if map.is_empty() {
                continue;
            }
            let mut buf = Vec::new();
            if ciborium::into_writer(map, &mut buf).is_ok() {
                envelopes.push(EphemeralEnvelope {
                    peer_id: local_peer.clone(),
                    data: buf,
                    namespace: namespace.clone(),
                });
            }
        }
        if envelopes.is_empty() {
            None
        } else {
            Some(envelopes)
        }
    }

    fn subscribed_established_channels(&self, doc_id: &DocumentId, exclude: Option<ChannelId>) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter_map(|(cid, rec)| {
                if Some(*cid) == exclude {
                    return None;
                }
                match &rec.state {
                    ChannelState::Established { peer_id } => {
                        let subscribed = self.peers.get(peer_id).map(|p| p.subscriptions.contains(doc_id)).unwrap_or(false);
                        subscribed.then_some(*cid)
                    }
                    _ => None,
                }
            })
            .collect()
    }

    // ---- heartbeat ------------------------------------------------------

    fn handle_heartbeat(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        let doc_ids: Vec<DocumentId> = self.documents.keys().cloned().collect();
        for doc_id in doc_ids {
            if let Some(envelopes) = self.local_ephemeral_envelopes(&doc_id) {
                for channel_id in self.subscribed_established_channels(&doc_id, None) {
                    commands.push(Command::BroadcastEphemeral {
                        doc_id: doc_id.clone(),
                        channel_id,
                        message: ProtocolMessage::Ephemeral {
                            doc_id: doc_id.clone(),
                            hops_remaining: 0,
                            stores: envelopes.clone(),
                        },
                    });
                }
            }
        }
        commands
    }

    // ---- channel-receive dispatch -------------------------------------------

    fn handle_channel_receive(&mut self, channel_id: ChannelId, message: WireMessage) -> Result<Vec<Command>, SyncError> {
        match message {
            WireMessage::Single(msg) => self.dispatch_protocol_message(channel_id, msg),
            WireMessage::Batch(batch) => {
                let mut commands = Vec::new();
                for msg in batch.messages {
                    commands.extend(self.dispatch_protocol_message(channel_id, msg)?);
                }
                Ok(commands)
            }
        }
    }

    fn dispatch_protocol_message(&mut self, channel_id: ChannelId, message: ProtocolMessage) -> Result<Vec<Command>, SyncError> {
        let is_establishment = matches!(message, ProtocolMessage::EstablishRequest { .. } | ProtocolMessage::EstablishResponse { .. });
        let established = matches!(self.channels.get(&channel_id).map(|c| &c.state), Some(ChannelState::Established { .. }));
        if !is_establishment && !established {
            return Err(SyncError::NotEstablished(channel_id));
        }

        Ok(match message {
            ProtocolMessage::EstablishRequest { identity } => self.handle_establish_request(channel_id, identity),
            ProtocolMessage::EstablishResponse { identity } => self.handle_establish_response(channel_id, identity),
            ProtocolMessage::SyncRequest { docs, bidirectional } => self.handle_sync_request(channel_id, docs, bidirectional),
            ProtocolMessage::SyncResponse { doc_id, transmission, ephemeral } => {
                self.handle_sync_response(channel_id, doc_id, transmission, ephemeral)
            }
            ProtocolMessage::Update { doc_id, transmission } => self.handle_update(channel_id, doc_id, transmission),
            ProtocolMessage::DirectoryRequest { doc_ids } => self.handle_directory_request(channel_id, doc_ids),
            ProtocolMessage::DirectoryResponse { doc_ids } => self.handle_directory_response(channel_id, doc_ids),
            ProtocolMessage::NewDoc { doc_ids } => self.handle_new_doc(channel_id, doc_ids),
            ProtocolMessage::DeleteRequest { doc_id } => self.handle_delete_request(channel_id, doc_id),
            ProtocolMessage::DeleteResponse { doc_id, status } => self.handle_delete_response(channel_id, doc_id, status),
            ProtocolMessage::Ephemeral { doc_id, hops_remaining, stores } => {
                self.handle_ephemeral_message(channel_id, doc_id, hops_remaining, stores)
            }
        })
    }

    // ---- internal helpers -------------------------------------------------

    fn established_peer(&self, channel_id: ChannelId) -> Option<PeerId> {
        match self.channels.get(&channel_id).map(|c| &c.state) {
            Some(ChannelState::Established { peer_id }) => Some(peer_id.clone()),
            _ => None,
        }
    }

    fn set_awareness(&mut self, peer_id: &PeerId, doc_id: &DocumentId, awareness: Awareness) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.document_awareness.insert(doc_id.clone(), awareness);
        }
    }

    fn upsert_peer(&mut self, peer_id: &PeerId, identity: PeerIdentity, channel_id: ChannelId) {
        let now = chrono::Utc::now();
        let peer = self.peers.entry(peer_id.clone()).or_insert_with(|| PeerState::new(identity.clone(), now));
        peer.identity = identity;
        peer.last_seen = now;
        peer.channels.insert(channel_id);
    }

    fn set_channel_established(&mut self, channel_id: ChannelId, peer_id: PeerId) {
        if let Some(record) = self.channels.get_mut(&channel_id) {
            record.state = ChannelState::Established { peer_id };
        }
    }
}
