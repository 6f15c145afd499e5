//! The four permission predicates: pure functions of `(DocContext,
//! PeerContext)`, evaluated once inside the reducer and never re-evaluated
//! against mutated inputs. The embedder supplies an `Arc<dyn Rules>` at
//! construction time.

use crate::model::{ChannelKind, DocumentId, PeerIdentity};

/// Everything the reducer knows about a document at the point a rule fires.
#[derive(Debug, Clone)]
pub struct DocContext<'a> {
    pub doc_id: &'a DocumentId,
}

/// Everything the reducer knows about the remote peer at the point a rule fires.
#[derive(Debug, Clone)]
pub struct PeerContext<'a> {
    pub identity: &'a PeerIdentity,
    pub channel_kind: ChannelKind,
}

/// The four synchronous permission predicates.
pub trait Rules: Send + Sync {
    /// May `peer` learn this document exists and receive its content at all?
    fn visibility(&self, doc: &DocContext<'_>, peer: &PeerContext<'_>) -> bool;

    /// May a `snapshot`/`update` from `peer` be applied to the local CRDT?
    fn mutability(&self, doc: &DocContext<'_>, peer: &PeerContext<'_>) -> bool;

    /// May `peer` cause a not-yet-held document to be created locally?
    fn creation(&self, doc_id: &DocumentId, peer: &PeerContext<'_>) -> bool;

    /// May `peer`'s `delete-request` actually purge this document? Default deny.
    fn deletion(&self, doc: &DocContext<'_>, peer: &PeerContext<'_>) -> bool;
}

/// Permits everything. Useful for tests and single-tenant embedders.
pub struct AllowAll;

impl Rules for AllowAll {
    fn visibility(&self, _doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        true
    }

    fn mutability(&self, _doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        true
    }

    fn creation(&self, _doc_id: &DocumentId, _peer: &PeerContext<'_>) -> bool {
        true
    }

    fn deletion(&self, _doc: &DocContext<'_>, _peer: &PeerContext<'_>) -> bool {
        // Deletion defaults to deny even under otherwise permissive rules;
        // embedders that want deletion must opt in explicitly with their own
        // `Rules` impl.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PeerId, PeerKind};

    #[test]
    fn allow_all_denies_deletion_by_default() {
        let rules = AllowAll;
        let doc_id = DocumentId::from("doc-1");
        let identity = PeerIdentity {
            peer_id: PeerId::from("peer-a"),
            name: None,
            kind: PeerKind::User,
        };
        let peer = PeerContext {
            identity: &identity,
            channel_kind: ChannelKind::Network,
        };
        let doc = DocContext { doc_id: &doc_id };
        assert!(rules.visibility(&doc, &peer));
        assert!(!rules.deletion(&doc, &peer));
    }
}
