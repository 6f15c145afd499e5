//! End-to-end scenarios: two peers converge to the same document state
//! purely by dispatching messages through real `Runtime`/`Synchronizer`
//! pairs wired together with `testutil::InMemoryAdapter`.

mod support;

use std::sync::Arc;
use std::time::Duration;

use weft_sync::crdt::InMemoryCrdt;
use weft_sync::model::{ChannelKind, DocumentId, PeerId};
use weft_sync::rules::AllowAll;
use weft_sync::{DocHandle, Message, WaitForSyncOptions};

use support::{network_pair, new_runtime, wait_for};

fn sync_options() -> WaitForSyncOptions {
    WaitForSyncOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() }
}

#[tokio::test]
#[test_log::test]
async fn two_peer_convergence_from_a_cold_connect() {
    let doc_id = DocumentId::from("d1");
    let runtime_a = new_runtime("a", Arc::new(AllowAll));
    let runtime_b = new_runtime("b", Arc::new(AllowAll));
    let handle_a = DocHandle::new(doc_id.clone(), runtime_a.clone());
    let handle_b = DocHandle::new(doc_id.clone(), runtime_b.clone());

    runtime_a.dispatch(Message::DocEnsure { doc_id: doc_id.clone() });
    wait_for(|| async { runtime_a.has_document(&doc_id).await }).await;

    let mut seed = InMemoryCrdt::new();
    seed.append_local(PeerId::from("a"), "hello");
    let bytes = seed.export_snapshot();
    handle_a.change(|doc| doc.import(&bytes).unwrap()).await;

    network_pair(&runtime_a, &runtime_b).await;

    handle_b.wait_for_sync(sync_options()).await.expect("b syncs with a");
    wait_for(|| async { handle_b.view().await.map(|v| v["text"] == "hello").unwrap_or(false) }).await;

    let view_a = handle_a.view().await.expect("a holds the document");
    let view_b = handle_b.view().await.expect("b holds the document");
    assert_eq!(view_a, view_b);
}

#[tokio::test]
#[test_log::test]
async fn bidirectional_edits_converge_to_the_same_text() {
    let doc_id = DocumentId::from("d1");
    let runtime_a = new_runtime("a", Arc::new(AllowAll));
    let runtime_b = new_runtime("b", Arc::new(AllowAll));
    let handle_a = DocHandle::new(doc_id.clone(), runtime_a.clone());
    let handle_b = DocHandle::new(doc_id.clone(), runtime_b.clone());

    runtime_a.dispatch(Message::DocEnsure { doc_id: doc_id.clone() });
    runtime_b.dispatch(Message::DocEnsure { doc_id: doc_id.clone() });
    wait_for(|| async { runtime_a.has_document(&doc_id).await }).await;
    wait_for(|| async { runtime_b.has_document(&doc_id).await }).await;

    network_pair(&runtime_a, &runtime_b).await;
    handle_a.wait_for_sync(sync_options()).await.expect("a reaches an initial ready state");
    handle_b.wait_for_sync(sync_options()).await.expect("b reaches an initial ready state");

    let mut from_a = InMemoryCrdt::new();
    from_a.append_local(PeerId::from("a"), "A");
    let bytes_a = from_a.export_snapshot();
    handle_a.change(|doc| doc.import(&bytes_a).unwrap()).await;

    let mut from_b = InMemoryCrdt::new();
    from_b.append_local(PeerId::from("b"), "B");
    let bytes_b = from_b.export_snapshot();
    handle_b.change(|doc| doc.import(&bytes_b).unwrap()).await;

    wait_for(|| async {
        let view_a = handle_a.view().await;
        let view_b = handle_b.view().await;
        match (view_a, view_b) {
            (Some(a), Some(b)) => a == b && a["text"].as_str().is_some_and(|t| t.contains('A') && t.contains('B')),
            _ => false,
        }
    })
    .await;

    assert_eq!(handle_a.view().await, handle_b.view().await);
}

#[tokio::test]
#[test_log::test]
async fn reconnecting_peer_pulls_the_delta_it_missed_while_offline() {
    let doc_id = DocumentId::from("d1");
    let runtime_a = new_runtime("a", Arc::new(AllowAll));
    let runtime_b = new_runtime("b", Arc::new(AllowAll));
    let handle_a = DocHandle::new(doc_id.clone(), runtime_a.clone());
    let handle_b = DocHandle::new(doc_id.clone(), runtime_b.clone());

    runtime_a.dispatch(Message::DocEnsure { doc_id: doc_id.clone() });
    wait_for(|| async { runtime_a.has_document(&doc_id).await }).await;

    let mut seed = InMemoryCrdt::new();
    seed.append_local(PeerId::from("a"), "v1");
    let v1_bytes = seed.export_snapshot();
    handle_a.change(|doc| doc.import(&v1_bytes).unwrap()).await;

    let (adapter_a, adapter_b) = (
        weft_sync::testutil::InMemoryAdapter::new("a-net-1"),
        weft_sync::testutil::InMemoryAdapter::new("b-net-1"),
    );
    runtime_a.register_adapter(adapter_a.clone()).await.unwrap();
    runtime_b.register_adapter(adapter_b.clone()).await.unwrap();
    let (channel_a1, channel_b1) =
        weft_sync::testutil::connect(&adapter_a, ChannelKind::Network, &adapter_b, ChannelKind::Network)
            .await
            .unwrap();

    handle_b.wait_for_sync(sync_options()).await.expect("b's first connect settles");
    wait_for(|| async { handle_b.view().await.map(|v| v["text"] == "v1").unwrap_or(false) }).await;

    // Disconnect both sides by removing the channel through the adapter
    // (the real lifecycle path, distinct from directly dispatching
    // `ChannelRemoved`) so the runtime's own channel registry clears too.
    adapter_a.remove_channel(channel_a1).await.unwrap();
    adapter_b.remove_channel(channel_b1).await.unwrap();
    wait_for(|| async { !runtime_a.has_channel_kind(ChannelKind::Network).await }).await;
    wait_for(|| async { !runtime_b.has_channel_kind(ChannelKind::Network).await }).await;

    // a keeps writing while b is offline.
    seed.append_local(PeerId::from("a"), "-v2");
    let full_bytes = seed.export_snapshot();
    handle_a.change(|doc| doc.import(&full_bytes).unwrap()).await;
    wait_for(|| async { handle_a.view().await.map(|v| v["text"] == "v1-v2").unwrap_or(false) }).await;

    // Reconnect on brand new channels; peer state (and b's stale cached
    // awareness of a) survives the disconnect.
    let (adapter_a2, adapter_b2) = (
        weft_sync::testutil::InMemoryAdapter::new("a-net-2"),
        weft_sync::testutil::InMemoryAdapter::new("b-net-2"),
    );
    runtime_a.register_adapter(adapter_a2.clone()).await.unwrap();
    runtime_b.register_adapter(adapter_b2.clone()).await.unwrap();
    weft_sync::testutil::connect(&adapter_a2, ChannelKind::Network, &adapter_b2, ChannelKind::Network)
        .await
        .unwrap();

    wait_for(|| async { handle_b.view().await.map(|v| v["text"] == "v1-v2").unwrap_or(false) }).await;
}
