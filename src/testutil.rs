//! In-memory `Adapter`/`Channel` test doubles, used by the integration suite
//! under `tests/`. An `mpsc::unbounded_channel` wrapped so messages sent on
//! one side are observed on the other, with no real transport in between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::channel::{require_started, Adapter, AdapterHooks, AdapterLifecycle, Channel};
use crate::error::ChannelError;
use crate::model::{AdapterId, ChannelId, ChannelKind};
use crate::wire::WireMessage;

/// An adapter with no real transport: channels are wired directly to another
/// `InMemoryAdapter` via [`connect`].
pub struct InMemoryAdapter {
    adapter_id: AdapterId,
    lifecycle: StdMutex<AdapterLifecycle>,
    hooks: RwLock<Option<AdapterHooks>>,
    next_channel_id: AtomicU64,
    channels: RwLock<HashMap<ChannelId, Arc<InMemoryChannel>>>,
}

impl InMemoryAdapter {
    pub fn new(adapter_id: impl Into<AdapterId>) -> Arc<Self> {
        Arc::new(InMemoryAdapter {
            adapter_id: adapter_id.into(),
            lifecycle: StdMutex::new(AdapterLifecycle::Created),
            hooks: RwLock::new(None),
            next_channel_id: AtomicU64::new(1),
            channels: RwLock::new(HashMap::new()),
        })
    }

    async fn push_channel(&self, kind: ChannelKind, peer_tx: mpsc::UnboundedSender<WireMessage>) -> Result<ChannelId, ChannelError> {
        require_started(self.lifecycle())?;
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(InMemoryChannel {
            channel_id,
            adapter_id: self.adapter_id.clone(),
            kind,
            peer_tx,
            stopped: AtomicBool::new(false),
        });
        self.channels.write().await.insert(channel_id, Arc::clone(&channel));
        if let Some(hooks) = self.hooks.read().await.clone() {
            (hooks.on_channel_ready)(channel);
        }
        Ok(channel_id)
    }
}

#[async_trait]
impl Adapter for InMemoryAdapter {
    fn adapter_id(&self) -> &AdapterId {
        &self.adapter_id
    }

    fn lifecycle(&self) -> AdapterLifecycle {
        *self.lifecycle.lock().expect("lock poisoned")
    }

    async fn initialize(&self, hooks: AdapterHooks) -> Result<(), ChannelError> {
        let _ = self.stop().await;
        *self.hooks.write().await = Some(hooks);
        *self.lifecycle.lock().expect("lock poisoned") = AdapterLifecycle::Initialized;
        Ok(())
    }

    async fn start(&self) -> Result<(), ChannelError> {
        *self.lifecycle.lock().expect("lock poisoned") = AdapterLifecycle::Started;
        Ok(())
    }

    /// Registers an unconnected channel stub. Honors the state-mismatch
    /// contract, but has no peer to wire to without going through
    /// [`connect`], which tests use directly.
    async fn add_channel(&self, kind: ChannelKind) -> Result<ChannelId, ChannelError> {
        let (tx, _unused_rx) = mpsc::unbounded_channel();
        self.push_channel(kind, tx).await
    }

    async fn remove_channel(&self, channel_id: ChannelId) -> Result<(), ChannelError> {
        require_started(self.lifecycle())?;
        if let Some(channel) = self.channels.write().await.remove(&channel_id) {
            channel.stop();
            if let Some(hooks) = self.hooks.read().await.clone() {
                (hooks.on_channel_removed)(channel_id);
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        let mut channels = self.channels.write().await;
        for channel in channels.values() {
            channel.stop();
        }
        channels.clear();
        *self.lifecycle.lock().expect("lock poisoned") = AdapterLifecycle::Stopped;
        Ok(())
    }
}

struct InMemoryChannel {
    channel_id: ChannelId,
    adapter_id: AdapterId,
    kind: ChannelKind,
    peer_tx: mpsc::UnboundedSender<WireMessage>,
    stopped: AtomicBool,
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn adapter_id(&self) -> &AdapterId {
        &self.adapter_id
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, message: WireMessage) -> Result<(), ChannelError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ChannelError::Closed(self.channel_id));
        }
        self.peer_tx.send(message).map_err(|e| ChannelError::Send(e.to_string()))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Wires a channel on each of two already-started, already-initialized
/// adapters directly to one another, spawning the forwarding tasks that
/// deliver each side's sends to the other's `on_receive` hook.
pub async fn connect(
    adapter_a: &Arc<InMemoryAdapter>,
    kind_a: ChannelKind,
    adapter_b: &Arc<InMemoryAdapter>,
    kind_b: ChannelKind,
) -> Result<(ChannelId, ChannelId), ChannelError> {
    let (a_to_b_tx, mut a_to_b_rx) = mpsc::unbounded_channel::<WireMessage>();
    let (b_to_a_tx, mut b_to_a_rx) = mpsc::unbounded_channel::<WireMessage>();

    let channel_a = adapter_a.push_channel(kind_a, a_to_b_tx).await?;
    let channel_b = adapter_b.push_channel(kind_b, b_to_a_tx).await?;

    let hooks_b = adapter_b.hooks.read().await.clone().expect("adapter b not initialized");
    tokio::spawn(async move {
        while let Some(message) = a_to_b_rx.recv().await {
            (hooks_b.on_receive)(channel_b, message);
        }
    });

    let hooks_a = adapter_a.hooks.read().await.clone().expect("adapter a not initialized");
    tokio::spawn(async move {
        while let Some(message) = b_to_a_rx.recv().await {
            (hooks_a.on_receive)(channel_a, message);
        }
    });

    Ok((channel_a, channel_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ProtocolMessage;

    fn capturing_hooks() -> (AdapterHooks, mpsc::UnboundedReceiver<(ChannelId, WireMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hooks = AdapterHooks {
            on_channel_ready: Arc::new(|_channel| {}),
            on_channel_removed: Arc::new(|_id| {}),
            on_receive: Arc::new(move |channel_id, message| {
                let _ = tx.send((channel_id, message));
            }),
        };
        (hooks, rx)
    }

    #[tokio::test]
    async fn connect_delivers_messages_in_both_directions() {
        let adapter_a = InMemoryAdapter::new("a");
        let adapter_b = InMemoryAdapter::new("b");

        let (hooks_a, _rx_a) = capturing_hooks();
        let (hooks_b, mut rx_b) = capturing_hooks();
        adapter_a.initialize(hooks_a).await.unwrap();
        adapter_b.initialize(hooks_b).await.unwrap();
        adapter_a.start().await.unwrap();
        adapter_b.start().await.unwrap();

        let (channel_a, channel_b) = connect(&adapter_a, ChannelKind::Network, &adapter_b, ChannelKind::Network)
            .await
            .unwrap();

        let request = WireMessage::Single(ProtocolMessage::DirectoryRequest { doc_ids: None });
        {
            let channels = adapter_a.channels.read().await;
            channels.get(&channel_a).unwrap().send(request).await.unwrap();
        }

        let (received_on, received_message) = rx_b.recv().await.unwrap();
        assert_eq!(received_on, channel_b);
        assert!(matches!(received_message, WireMessage::Single(ProtocolMessage::DirectoryRequest { .. })));
    }

    #[tokio::test]
    async fn add_channel_fails_before_start() {
        let adapter = InMemoryAdapter::new("solo");
        assert!(adapter.add_channel(ChannelKind::Network).await.is_err());
    }
}
