//! Rules-gated scenarios: a denied `mutability` silently drops an incoming
//! write, and a denied `visibility` keeps a document from ever being
//! advertised to a connecting peer.

mod support;

use std::sync::Arc;
use std::time::Duration;

use weft_sync::crdt::InMemoryCrdt;
use weft_sync::model::DocumentId;
use weft_sync::rules::{AllowAll, DocContext, PeerContext, Rules};
use weft_sync::{DocHandle, Message};

use support::{network_pair, new_runtime, wait_for};

struct DenyMutability;

impl Rules for DenyMutability {
    fn visibility(&self, _doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        true
    }

    fn mutability(&self, _doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        false
    }

    fn creation(&self, _doc_id: &DocumentId, _peer: &PeerContext<'_>) -> bool {
        true
    }

    fn deletion(&self, _doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        false
    }
}

#[tokio::test]
#[test_log::test]
async fn mutability_denial_drops_the_write_without_erroring_the_sender() {
    let doc_id = DocumentId::from("d1");
    let runtime_a = new_runtime("a", Arc::new(DenyMutability));
    let runtime_b = new_runtime("b", Arc::new(AllowAll));
    let handle_a = DocHandle::new(doc_id.clone(), runtime_a.clone());
    let handle_b = DocHandle::new(doc_id.clone(), runtime_b.clone());

    runtime_b.dispatch(Message::DocEnsure { doc_id: doc_id.clone() });
    wait_for(|| async { runtime_b.has_document(&doc_id).await }).await;
    let mut seed = InMemoryCrdt::new();
    seed.append_local(weft_sync::model::PeerId::from("b"), "hi");
    let bytes = seed.export_snapshot();
    handle_b.change(|doc| doc.import(&bytes).unwrap()).await;

    network_pair(&runtime_a, &runtime_b).await;

    // a's creation rule still admits the placeholder document; only the
    // mutability rule (evaluated separately, per invariant 5) rejects b's
    // content once it arrives.
    wait_for(|| async { runtime_a.has_document(&doc_id).await }).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let view_a = handle_a.view().await.expect("a admitted the placeholder document");
    assert_eq!(view_a["text"], "");
    let view_b = handle_b.view().await.expect("b still holds its own write");
    assert_eq!(view_b["text"], "hi");
}

struct PrefixVisibility;

impl Rules for PrefixVisibility {
    fn visibility(&self, doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        doc.doc_id.0.starts_with("allowed-")
    }

    fn mutability(&self, _doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        true
    }

    fn creation(&self, _doc_id: &DocumentId, _peer: &PeerContext<'_>) -> bool {
        true
    }

    fn deletion(&self, _doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        false
    }
}

#[tokio::test]
#[test_log::test]
async fn visibility_rule_hides_a_denied_document_from_a_connecting_peer() {
    let runtime_a = new_runtime("a", Arc::new(PrefixVisibility));
    let runtime_b = new_runtime("b", Arc::new(AllowAll));

    for doc_id in ["allowed-1", "denied-1", "allowed-2"] {
        runtime_a.dispatch(Message::DocEnsure { doc_id: DocumentId::from(doc_id) });
    }
    for doc_id in ["allowed-1", "denied-1", "allowed-2"] {
        wait_for(|| async { runtime_a.has_document(&DocumentId::from(doc_id)).await }).await;
    }

    network_pair(&runtime_a, &runtime_b).await;

    wait_for(|| async { runtime_b.has_document(&DocumentId::from("allowed-1")).await }).await;
    wait_for(|| async { runtime_b.has_document(&DocumentId::from("allowed-2")).await }).await;
    // Give the (non-)announcement of the denied document time to have
    // arrived, were it ever going to.
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!runtime_b.has_document(&DocumentId::from("denied-1")).await);
}
