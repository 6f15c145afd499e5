//! Shared scaffolding for the black-box scenario suite. Not a test target
//! itself; each `tests/*.rs` file pulls this in with `mod support;`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use weft_sync::channel::{Adapter, AdapterHooks, Channel};
use weft_sync::crdt::InMemoryCrdt;
use weft_sync::model::{ChannelId, ChannelKind, DocumentId, PeerId, PeerIdentity, PeerKind};
use weft_sync::rules::Rules;
use weft_sync::testutil::{connect, InMemoryAdapter};
use weft_sync::wire::{ProtocolMessage, SyncTransmission, WireMessage};
use weft_sync::{Runtime, SynchronizerConfig};

pub fn identity(peer_id: &str) -> PeerIdentity {
    PeerIdentity { peer_id: PeerId::from(peer_id), name: None, kind: PeerKind::User }
}

pub fn new_runtime(peer_id: &str, rules: Arc<dyn Rules>) -> Arc<Runtime> {
    Runtime::new(identity(peer_id), rules, Arc::new(|| Box::new(InMemoryCrdt::new())), SynchronizerConfig::default())
}

/// Wires a fresh network channel between two runtimes' own adapters.
pub async fn network_pair(a: &Arc<Runtime>, b: &Arc<Runtime>) -> (ChannelId, ChannelId) {
    let adapter_a = InMemoryAdapter::new(format!("net-{:p}-a", Arc::as_ptr(a)));
    let adapter_b = InMemoryAdapter::new(format!("net-{:p}-b", Arc::as_ptr(b)));
    a.register_adapter(adapter_a.clone()).await.expect("register adapter a");
    b.register_adapter(adapter_b.clone()).await.expect("register adapter b");
    connect(&adapter_a, ChannelKind::Network, &adapter_b, ChannelKind::Network)
        .await
        .expect("connect network pair")
}

/// Polls `condition` until it's true, or panics after a generous timeout.
/// The dispatch queue (`Runtime::dispatch`) is fire-and-forget, so tests
/// observe its effects this way rather than via a direct return value.
pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not satisfied within the timeout");
}

/// An adapter side that isn't backed by a `Runtime` at all: auto-replies to
/// `establish-request` and forwards everything it receives onto an mpsc
/// channel for the test to inspect. Used to play the part of a bare wire
/// peer (a storage backend, or an observing client) without standing up a
/// second full `Synchronizer`.
pub fn observing_peer_hooks(
    peer_id: &str,
) -> (AdapterHooks, tokio::sync::mpsc::UnboundedReceiver<(ChannelId, WireMessage)>) {
    let channels: Arc<StdMutex<HashMap<ChannelId, Arc<dyn Channel>>>> = Arc::new(StdMutex::new(HashMap::new()));
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let own_identity = identity(peer_id);

    let channels_ready = Arc::clone(&channels);
    let channels_recv = Arc::clone(&channels);
    let hooks = AdapterHooks {
        on_channel_ready: Arc::new(move |channel: Arc<dyn Channel>| {
            channels_ready.lock().expect("lock poisoned").insert(channel.channel_id(), channel);
        }),
        on_channel_removed: Arc::new(|_channel_id| {}),
        on_receive: Arc::new(move |channel_id, message| {
            let channels = Arc::clone(&channels_recv);
            let own_identity = own_identity.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if matches!(&message, WireMessage::Single(ProtocolMessage::EstablishRequest { .. })) {
                    if let Some(channel) = channels.lock().expect("lock poisoned").get(&channel_id).cloned() {
                        let response = WireMessage::Single(ProtocolMessage::EstablishResponse { identity: own_identity });
                        let _ = channel.send(response).await;
                    }
                }
                let _ = tx.send((channel_id, message));
            });
        }),
    };
    (hooks, rx)
}

/// A scripted storage backend: auto-establishes, and answers any
/// `sync-request` naming `doc_id` with a canned snapshot. Used to exercise
/// storage-first admission without a real storage adapter.
pub fn storage_stub_hooks(
    doc_id: DocumentId,
    snapshot: Vec<u8>,
    version: weft_sync::VersionVector,
    responses_sent: Arc<std::sync::atomic::AtomicUsize>,
) -> AdapterHooks {
    let channels: Arc<StdMutex<HashMap<ChannelId, Arc<dyn Channel>>>> = Arc::new(StdMutex::new(HashMap::new()));
    let own_identity = identity("storage-backend");

    let channels_ready = Arc::clone(&channels);
    let channels_recv = Arc::clone(&channels);
    AdapterHooks {
        on_channel_ready: Arc::new(move |channel: Arc<dyn Channel>| {
            channels_ready.lock().expect("lock poisoned").insert(channel.channel_id(), channel);
        }),
        on_channel_removed: Arc::new(|_channel_id| {}),
        on_receive: Arc::new(move |channel_id, message| {
            let channels = Arc::clone(&channels_recv);
            let own_identity = own_identity.clone();
            let doc_id = doc_id.clone();
            let snapshot = snapshot.clone();
            let version = version.clone();
            let responses_sent = Arc::clone(&responses_sent);
            tokio::spawn(async move {
                let Some(channel) = channels.lock().expect("lock poisoned").get(&channel_id).cloned() else {
                    return;
                };
                match message {
                    WireMessage::Single(ProtocolMessage::EstablishRequest { .. }) => {
                        let _ = channel
                            .send(WireMessage::Single(ProtocolMessage::EstablishResponse { identity: own_identity }))
                            .await;
                    }
                    WireMessage::Single(ProtocolMessage::SyncRequest { docs, .. }) => {
                        if docs.iter().any(|entry| entry.doc_id == doc_id) {
                            responses_sent.fetch_add(1, Ordering::SeqCst);
                            let response = WireMessage::Single(ProtocolMessage::SyncResponse {
                                doc_id: doc_id.clone(),
                                transmission: SyncTransmission::Snapshot { bytes: snapshot.clone(), version: version.clone() },
                                ephemeral: None,
                            });
                            let _ = channel.send(response).await;
                        }
                    }
                    _ => {}
                }
            });
        }),
    }
}

/// Starts a bare [`InMemoryAdapter`] with the given hooks, bypassing
/// `Runtime::register_adapter` (which always wires hooks back into a
/// `Synchronizer`).
pub async fn start_scripted_adapter(adapter_id: &str, hooks: AdapterHooks) -> Arc<InMemoryAdapter> {
    let adapter = InMemoryAdapter::new(adapter_id);
    adapter.initialize(hooks).await.expect("initialize scripted adapter");
    adapter.start().await.expect("start scripted adapter");
    adapter
}
