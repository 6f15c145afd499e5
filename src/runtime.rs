//! Executes the `Command`s the synchronizer reducer (`sync.rs`) returns:
//! sends wire messages over registered channels, runs the send-interceptor
//! chain, drives the heartbeat timer, and republishes ready-state snapshots
//! to observers. This is the only piece of the crate that touches async I/O.
//!
//! `Arc<Self>` ownership with `RwLock`-guarded mutable registries and
//! weak-referenced hook closures avoid an adapter-runtime reference cycle.
//! A self-dispatch loop (`tokio::spawn` + `AbortHandle`, torn down on `Drop`)
//! keeps the `Synchronizer` itself single-threaded: it is never touched
//! except from inside `process`, serialized by `dispatch_tx`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::AbortHandle;

use crate::channel::{
    run_interceptors, Adapter, AdapterHooks, Channel, InterceptorOutcome, OutgoingEnvelope, SendInterceptor,
};
use crate::crdt::CrdtDoc;
use crate::ephemeral::{PresenceSignal, PresenceTracker, PRESENCE_NAMESPACE};
use crate::error::ChannelError;
use crate::model::{AdapterId, ChannelId, ChannelKind, DocumentId, PeerId, PeerIdentity, ReadyState, VersionVector};
use crate::rules::Rules;
use crate::sync::{Command, DocFactory, Message, Synchronizer};
use crate::wire::ProtocolMessage;

/// Runtime tunables.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    pub heartbeat_interval: Duration,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        SynchronizerConfig { heartbeat_interval: Duration::from_secs(20) }
    }
}

type ReadyStateMap = HashMap<DocumentId, Vec<ReadyState>>;

pub struct Runtime {
    synchronizer: Mutex<Synchronizer>,
    channels: RwLock<HashMap<ChannelId, Arc<dyn Channel>>>,
    adapters: RwLock<HashMap<AdapterId, Arc<dyn Adapter>>>,
    interceptors: RwLock<Vec<SendInterceptor>>,
    dispatch_tx: mpsc::UnboundedSender<Message>,
    ready_tx: watch::Sender<ReadyStateMap>,
    presence: Mutex<HashMap<DocumentId, PresenceTracker>>,
    config: SynchronizerConfig,
    abort_handles: StdMutex<Vec<AbortHandle>>,
}

impl Runtime {
    /// `base_factory` builds a fresh, doc-id-agnostic CRDT instance; this
    /// wraps it so every created document auto-subscribes its mutation feed
    /// back into the reducer as `doc-change`.
    pub fn new(
        local_identity: PeerIdentity,
        rules: Arc<dyn Rules>,
        base_factory: Arc<dyn Fn() -> Box<dyn CrdtDoc> + Send + Sync>,
        config: SynchronizerConfig,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (ready_tx, _ready_rx) = watch::channel(HashMap::new());

        let factory_tx = dispatch_tx.clone();
        let doc_factory: DocFactory = Arc::new(move |doc_id: &DocumentId| {
            let mut doc = base_factory();
            let doc_id = doc_id.clone();
            let tx = factory_tx.clone();
            doc.subscribe(Box::new(move || {
                let _ = tx.send(Message::DocChange { doc_id: doc_id.clone() });
            }));
            doc
        });

        let synchronizer = Synchronizer::new(local_identity, rules, doc_factory);
        let runtime = Arc::new(Runtime {
            synchronizer: Mutex::new(synchronizer),
            channels: RwLock::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
            interceptors: RwLock::new(Vec::new()),
            dispatch_tx,
            ready_tx,
            presence: Mutex::new(HashMap::new()),
            config,
            abort_handles: StdMutex::new(Vec::new()),
        });

        runtime.spawn_dispatch_loop(dispatch_rx);
        runtime.spawn_heartbeat();
        runtime
    }

    fn spawn_dispatch_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Message>) {
        let runtime = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                runtime.process(message).await;
            }
        });
        self.abort_handles.lock().expect("lock poisoned").push(handle.abort_handle());
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let interval = self.config.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it.
            loop {
                ticker.tick().await;
                runtime.dispatch(Message::Heartbeat);
            }
        });
        self.abort_handles.lock().expect("lock poisoned").push(handle.abort_handle());
    }

    /// Queue a message for the single-threaded reducer loop. Non-blocking.
    pub fn dispatch(&self, message: Message) {
        if self.dispatch_tx.send(message).is_err() {
            tracing::error!("dispatch queue closed; runtime is shutting down");
        }
    }

    async fn process(self: &Arc<Self>, message: Message) {
        let commands = {
            let mut sync = self.synchronizer.lock().await;
            match sync.handle(message) {
                Ok(commands) => commands,
                Err(err) => {
                    tracing::error!(%err, "fatal synchronizer error, message dropped");
                    return;
                }
            }
        };
        self.execute_all(commands).await;
    }

    async fn execute_all(self: &Arc<Self>, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            match command {
                Command::Batch(inner) => {
                    for c in inner.into_iter().rev() {
                        queue.push_front(c);
                    }
                }
                Command::Dispatch(message) => self.dispatch(message),
                other => self.execute_one(other).await,
            }
        }
    }

    async fn execute_one(self: &Arc<Self>, command: Command) {
        match command {
            Command::SendEstablishmentMessage { channel_id, message }
            | Command::SendMessage { channel_id, message }
            | Command::SendSyncRequest { channel_id, message }
            | Command::SendSyncResponse { channel_id, message } => {
                self.send(channel_id, message).await;
            }
            Command::BroadcastEphemeral { channel_id, message, .. } => {
                self.send(channel_id, message).await;
            }
            Command::StopChannel { channel_id } => {
                if let Some(channel) = self.channels.read().await.get(&channel_id).cloned() {
                    channel.stop();
                }
            }
            Command::SubscribeDoc { doc_id } => {
                tracing::debug!(%doc_id, "document subscribed");
            }
            Command::ApplyEphemeral { doc_id, namespace, peer_id } => {
                tracing::trace!(%doc_id, %namespace, %peer_id, "ephemeral envelope applied");
            }
            Command::RemoveEphemeralPeer { doc_id, namespace, peer_id } => {
                if namespace == PRESENCE_NAMESPACE {
                    self.presence.lock().await.entry(doc_id).or_default().remove(&peer_id);
                }
            }
            Command::EmitReadyStateChanged { doc_id } => {
                self.publish_ready_state(&doc_id).await;
            }
            Command::EmitEphemeralChange { doc_id, namespace, key, value, source } => {
                self.observe_ephemeral_change(&doc_id, &namespace, &key, value, source).await;
            }
            Command::Dispatch(_) | Command::Batch(_) => unreachable!("flattened in execute_all"),
        }
    }

    async fn send(self: &Arc<Self>, channel_id: ChannelId, message: ProtocolMessage) {
        let envelope = OutgoingEnvelope { channel_id, message: message.into() };
        let interceptors = self.interceptors.read().await.clone();
        match run_interceptors(&interceptors, envelope) {
            InterceptorOutcome::Send(envelope) => self.deliver(envelope).await,
            InterceptorOutcome::SendAfter(envelope, delay) => {
                let runtime = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    runtime.deliver(envelope).await;
                });
            }
            InterceptorOutcome::Dropped => {}
        }
    }

    async fn deliver(&self, envelope: OutgoingEnvelope) {
        let channel = self.channels.read().await.get(&envelope.channel_id).cloned();
        match channel {
            Some(channel) => {
                if let Err(err) = channel.send(envelope.message).await {
                    tracing::warn!(channel_id = envelope.channel_id, %err, "channel send failed");
                }
            }
            None => tracing::warn!(channel_id = envelope.channel_id, "dropping send: channel unknown"),
        }
    }

    async fn publish_ready_state(&self, doc_id: &DocumentId) {
        let states = self.synchronizer.lock().await.ready_states(doc_id);
        self.ready_tx.send_modify(|map| {
            map.insert(doc_id.clone(), states);
        });
    }

    /// Feeds the reserved `__presence` namespace into the per-document
    /// liveness tracker. Ordinary namespaces pass through untouched;
    /// presence plumbing never reaches the reducer itself.
    async fn observe_ephemeral_change(
        &self,
        doc_id: &DocumentId,
        namespace: &str,
        key: &str,
        value: Option<Vec<u8>>,
        _source: crate::ephemeral::EphemeralSource,
    ) {
        if namespace != PRESENCE_NAMESPACE {
            return;
        }
        let peer_id = PeerId::from(key);
        let mut presence = self.presence.lock().await;
        let tracker = presence.entry(doc_id.clone()).or_default();
        match value.as_deref().and_then(|bytes| ciborium::from_reader::<PresenceSignal, _>(bytes).ok()) {
            Some(signal) => tracker.record(peer_id, signal),
            None => tracker.remove(&peer_id),
        }
    }

    pub async fn is_peer_online(&self, doc_id: &DocumentId, peer_id: &PeerId) -> bool {
        self.presence
            .lock()
            .await
            .get(doc_id)
            .map(|tracker| tracker.is_online(peer_id))
            .unwrap_or(false)
    }

    // ---- adapter registration -------------------------------------------

    pub async fn register_adapter(self: &Arc<Self>, adapter: Arc<dyn Adapter>) -> Result<(), ChannelError> {
        let weak: Weak<Runtime> = Arc::downgrade(self);
        let hooks = AdapterHooks {
            on_channel_ready: {
                let weak = weak.clone();
                Arc::new(move |channel: Arc<dyn Channel>| {
                    if let Some(runtime) = weak.upgrade() {
                        tokio::spawn(async move { runtime.on_channel_ready(channel).await });
                    }
                })
            },
            on_channel_removed: {
                let weak = weak.clone();
                Arc::new(move |channel_id: ChannelId| {
                    if let Some(runtime) = weak.upgrade() {
                        tokio::spawn(async move { runtime.on_channel_removed(channel_id).await });
                    }
                })
            },
            on_receive: {
                let weak = weak.clone();
                Arc::new(move |channel_id: ChannelId, message: crate::wire::WireMessage| {
                    if let Some(runtime) = weak.upgrade() {
                        tokio::spawn(async move { runtime.dispatch(Message::ChannelReceive { channel_id, message }) });
                    }
                })
            },
        };

        adapter.initialize(hooks).await?;
        adapter.start().await?;
        self.adapters.write().await.insert(adapter.adapter_id().clone(), adapter);
        Ok(())
    }

    async fn on_channel_ready(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let channel_id = channel.channel_id();
        let adapter_id = channel.adapter_id().clone();
        let kind = channel.kind();
        self.channels.write().await.insert(channel_id, channel);
        self.dispatch(Message::ChannelAdded { channel_id, adapter_id, kind });
        self.dispatch(Message::EstablishChannel { channel_id });
    }

    async fn on_channel_removed(self: &Arc<Self>, channel_id: ChannelId) {
        self.channels.write().await.remove(&channel_id);
        self.dispatch(Message::ChannelRemoved { channel_id });
    }

    pub async fn add_interceptor(&self, interceptor: SendInterceptor) {
        self.interceptors.write().await.push(interceptor);
    }

    // ---- document + ready-state accessors, used by `handle::DocHandle` ----

    pub async fn local_identity(&self) -> PeerIdentity {
        self.synchronizer.lock().await.local_identity().clone()
    }

    pub async fn has_document(&self, doc_id: &DocumentId) -> bool {
        self.synchronizer.lock().await.has_document(doc_id)
    }

    pub async fn document_version(&self, doc_id: &DocumentId) -> Option<VersionVector> {
        self.synchronizer.lock().await.document_version(doc_id)
    }

    pub async fn with_document<R>(&self, doc_id: &DocumentId, f: impl FnOnce(&dyn CrdtDoc) -> R) -> Option<R> {
        self.synchronizer.lock().await.with_document(doc_id, f)
    }

    /// Mutates the document directly. The mutation's own `subscribe`
    /// callback (wired in at creation time) feeds `doc-change` back into the
    /// reducer asynchronously; this method does not dispatch it itself.
    pub async fn with_document_mut<R>(&self, doc_id: &DocumentId, f: impl FnOnce(&mut dyn CrdtDoc) -> R) -> Option<R> {
        self.synchronizer.lock().await.with_document_mut(doc_id, f)
    }

    pub async fn ready_states(&self, doc_id: &DocumentId) -> Vec<ReadyState> {
        self.synchronizer.lock().await.ready_states(doc_id)
    }

    pub fn ready_state_receiver(&self) -> watch::Receiver<ReadyStateMap> {
        self.ready_tx.subscribe()
    }

    pub async fn ephemeral_get(&self, doc_id: &DocumentId, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.synchronizer.lock().await.ephemeral_get(doc_id, namespace, key)
    }

    pub async fn ephemeral_get_all(&self, doc_id: &DocumentId, namespace: &str) -> HashMap<String, Vec<u8>> {
        self.synchronizer.lock().await.ephemeral_get_all(doc_id, namespace)
    }

    /// Dispatches a local ephemeral write. Fire-and-forget, same as any
    /// other `dispatch`.
    pub fn set_ephemeral(&self, doc_id: DocumentId, namespace: String, key: String, value: Option<Vec<u8>>) {
        self.dispatch(Message::EphemeralLocalChange { doc_id, namespace, key, value });
    }

    /// Registers a listener on the document's own CRDT subscription feed,
    /// invoked after every successful local or remote mutation. Distinct from
    /// the reducer's own `doc-change` wiring set up in `doc_factory` above;
    /// `CrdtDoc::subscribe` accepts any number of listeners.
    pub async fn subscribe_doc(&self, doc_id: &DocumentId, listener: Box<dyn Fn() + Send + Sync>) {
        self.synchronizer.lock().await.with_document_mut(doc_id, move |doc| doc.subscribe(listener));
    }

    /// Whether any registered channel is of `kind`, used by
    /// `Handle::wait_for_sync` to reject with `HandleError::NoAdapters`
    /// before waiting on a kind that could never resolve.
    pub async fn has_channel_kind(&self, kind: ChannelKind) -> bool {
        self.channels.read().await.values().any(|channel| channel.kind() == kind)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for handle in self.abort_handles.lock().expect("lock poisoned").drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeerKind;
    use crate::rules::AllowAll;
    use crate::crdt::InMemoryCrdt;

    fn runtime() -> Arc<Runtime> {
        Runtime::new(
            PeerIdentity { peer_id: PeerId::from("local"), name: None, kind: PeerKind::User },
            Arc::new(AllowAll),
            Arc::new(|| Box::new(InMemoryCrdt::new())),
            SynchronizerConfig { heartbeat_interval: Duration::from_secs(3600) },
        )
    }

    #[tokio::test]
    async fn dispatching_doc_ensure_creates_the_document() {
        let runtime = runtime();
        let doc_id = DocumentId::from("doc-1");
        runtime.dispatch(Message::DocEnsure { doc_id: doc_id.clone() });
        // Give the dispatch loop a tick to drain the unbounded channel.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(runtime.has_document(&doc_id).await);
    }

    #[tokio::test]
    async fn local_mutation_feeds_doc_change_back_through_the_reducer() {
        let runtime = runtime();
        let doc_id = DocumentId::from("doc-1");
        runtime.dispatch(Message::DocEnsure { doc_id: doc_id.clone() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        runtime
            .with_document_mut(&doc_id, |doc| {
                doc.import(&{
                    let mut crdt = InMemoryCrdt::new();
                    crdt.append_local(PeerId::from("local"), "hi");
                    crdt.export_snapshot()
                })
            })
            .await;

        // The subscribe callback should have dispatched DocChange without panicking.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(runtime.has_document(&doc_id).await);
    }
}
