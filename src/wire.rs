//! Wire protocol envelopes and their binary/JSON framing.
//!
//! `ciborium` is the primary binary codec; binary payloads that travel over a
//! text transport are framed as base64 strings instead.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::model::{DocumentId, PeerIdentity, VersionVector};

/// One peer's ephemeral payload for a document: `{peerId, data, namespace}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralEnvelope {
    pub peer_id: crate::model::PeerId,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub namespace: String,
}

/// The four-variant tagged union carried by `sync-response` and `update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SyncTransmission {
    UpToDate {
        version: VersionVector,
    },
    Snapshot {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
        version: VersionVector,
    },
    Update {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
        version: VersionVector,
    },
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestEntry {
    pub doc_id: DocumentId,
    pub requester_doc_version: VersionVector,
    pub ephemeral: Option<Vec<EphemeralEnvelope>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteStatus {
    Deleted,
    Ignored,
}

/// Every non-batch protocol envelope. `type` is `channel/<kebab-case-variant>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProtocolMessage {
    #[serde(rename = "channel/establish-request")]
    EstablishRequest { identity: PeerIdentity },
    #[serde(rename = "channel/establish-response")]
    EstablishResponse { identity: PeerIdentity },
    #[serde(rename = "channel/sync-request")]
    SyncRequest {
        docs: Vec<SyncRequestEntry>,
        bidirectional: bool,
    },
    #[serde(rename = "channel/sync-response")]
    SyncResponse {
        doc_id: DocumentId,
        transmission: SyncTransmission,
        ephemeral: Option<Vec<EphemeralEnvelope>>,
    },
    #[serde(rename = "channel/update")]
    Update {
        doc_id: DocumentId,
        transmission: SyncTransmission,
    },
    #[serde(rename = "channel/directory-request")]
    DirectoryRequest { doc_ids: Option<Vec<DocumentId>> },
    #[serde(rename = "channel/directory-response")]
    DirectoryResponse { doc_ids: Vec<DocumentId> },
    #[serde(rename = "channel/new-doc")]
    NewDoc { doc_ids: Vec<DocumentId> },
    #[serde(rename = "channel/delete-request")]
    DeleteRequest { doc_id: DocumentId },
    #[serde(rename = "channel/delete-response")]
    DeleteResponse {
        doc_id: DocumentId,
        status: DeleteStatus,
    },
    #[serde(rename = "channel/ephemeral")]
    Ephemeral {
        doc_id: DocumentId,
        hops_remaining: u8,
        stores: Vec<EphemeralEnvelope>,
    },
}

/// The type-level enforcement that a batch carries only non-batch messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Single(ProtocolMessage),
    Batch(BatchMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMessage {
    #[serde(rename = "type", default = "batch_tag")]
    pub tag: String,
    pub messages: Vec<ProtocolMessage>,
}

fn batch_tag() -> String {
    "channel/batch".to_owned()
}

impl WireMessage {
    pub fn batch(messages: Vec<ProtocolMessage>) -> Self {
        WireMessage::Batch(BatchMessage {
            tag: batch_tag(),
            messages,
        })
    }
}

impl From<ProtocolMessage> for WireMessage {
    fn from(msg: ProtocolMessage) -> Self {
        WireMessage::Single(msg)
    }
}

/// Encode a message for a binary transport using `ciborium`.
pub fn encode_cbor(message: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| CodecError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Decode a message produced by [`encode_cbor`].
pub fn decode_cbor(bytes: &[u8]) -> Result<WireMessage, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::CborDecode(e.to_string()))
}

/// Encode a message as JSON text (binary payloads carried as base64 strings).
pub fn encode_json(message: &WireMessage) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::JsonEncode(e.to_string()))
}

/// Decode a message produced by [`encode_json`].
pub fn decode_json(text: &str) -> Result<WireMessage, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::JsonDecode(e.to_string()))
}

/// `serde(with = ...)` helper: (de)serializes `Vec<u8>` as a base64 string.
///
/// This is the uniform representation for both JSON and CBOR framing. A
/// binary transport may bypass base64 and carry raw length-prefixed bytes
/// instead, by working with [`SyncTransmission`]'s bytes directly rather than
/// through this codec module.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PeerId, PeerKind};

    fn sample_identity() -> PeerIdentity {
        PeerIdentity {
            peer_id: PeerId::from("peer-a"),
            name: Some("Ada".to_owned()),
            kind: PeerKind::User,
        }
    }

    #[test]
    fn round_trips_through_cbor() {
        let msg = WireMessage::Single(ProtocolMessage::EstablishRequest {
            identity: sample_identity(),
        });
        let bytes = encode_cbor(&msg).unwrap();
        let decoded = decode_cbor(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_through_json_with_base64_payload() {
        let mut version = VersionVector::new();
        version.set(PeerId::from("peer-a"), 3);
        let msg = WireMessage::Single(ProtocolMessage::SyncResponse {
            doc_id: DocumentId::from("doc-1"),
            transmission: SyncTransmission::Snapshot {
                bytes: vec![1, 2, 3, 255, 0],
                version,
            },
            ephemeral: None,
        });
        let text = encode_json(&msg).unwrap();
        assert!(text.contains("snapshot"));
        let decoded = decode_json(&text).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn batch_carries_only_non_batch_messages() {
        let inner = ProtocolMessage::DirectoryRequest { doc_ids: None };
        let batch = WireMessage::batch(vec![inner.clone()]);
        let bytes = encode_cbor(&batch).unwrap();
        let decoded = decode_cbor(&bytes).unwrap();
        match decoded {
            WireMessage::Batch(b) => assert_eq!(b.messages, vec![inner]),
            _ => panic!("expected a batch"),
        }
    }

    #[test]
    fn version_vector_dominance() {
        let mut a = VersionVector::new();
        a.set(PeerId::from("x"), 2);
        a.set(PeerId::from("y"), 5);
        let mut b = VersionVector::new();
        b.set(PeerId::from("x"), 2);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
    }
}
