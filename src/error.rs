//! Error taxonomy for the crate.
//!
//! Every typed error is a small `thiserror` enum scoped to one layer, with
//! `#[from]` conversions at the boundary rather than a single catch-all
//! error type.

use crate::model::{ChannelId, DocumentId};
use thiserror::Error;

/// State errors and transport-facing failures from the adapter/channel layer.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("adapter state mismatch: expected {expected}, got {actual}")]
    StateMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("channel {0} is not registered")]
    UnknownChannel(ChannelId),

    #[error("channel {0} is closed")]
    Closed(ChannelId),

    #[error("transport send failed: {0}")]
    Send(String),
}

/// Errors from the binary/JSON wire codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor encode failed: {0}")]
    CborEncode(String),

    #[error("cbor decode failed: {0}")]
    CborDecode(String),

    #[error("json encode failed: {0}")]
    JsonEncode(String),

    #[error("json decode failed: {0}")]
    JsonDecode(String),

    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("batch message contains a nested batch, which is not permitted")]
    NestedBatch,
}

/// Errors surfaced by a `CrdtDoc` implementation.
#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("failed to import bytes: {0}")]
    Import(String),
}

/// Errors from ephemeral store operations.
#[derive(Debug, Error)]
pub enum EphemeralError {
    #[error("no ephemeral store registered under name {0:?}")]
    NotFound(String),

    #[error("ephemeral payload for document {0} failed to decode: {1}")]
    Decode(DocumentId, String),
}

/// Errors raised by the synchronizer reducer itself, as opposed to errors
/// that are merely logged and dropped (most rule denials are silent).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("channel {0} received an establishment-only message before being established")]
    NotEstablished(ChannelId),
}

/// Errors surfaced by the `Handle` façade.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("no adapters of the requested kind are configured")]
    NoAdapters,

    #[error("wait-for-sync timed out")]
    Timeout,

    #[error("wait-for-sync was cancelled")]
    Cancelled,

    #[error("document {0} is not known to this runtime")]
    UnknownDocument(DocumentId),
}
