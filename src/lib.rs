//! A peer-to-peer CRDT document synchronization engine: a transport-agnostic
//! core that keeps documents convergent across heterogeneous storage and
//! network adapters.
//!
//! The crate is organized around a pure-reducer [`sync::Synchronizer`]
//! driven by [`runtime::Runtime`], which owns the adapter registry, the
//! dispatch queue, and the I/O side effects the reducer's [`sync::Command`]s
//! describe. Application code talks to a single document through
//! [`handle::DocHandle`].

pub mod channel;
pub mod crdt;
pub mod ephemeral;
pub mod error;
pub mod handle;
pub mod model;
pub mod rules;
pub mod runtime;
pub mod sync;
pub mod wire;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use channel::{Adapter, AdapterHooks, AdapterLifecycle, Channel};
pub use crdt::CrdtDoc;
pub use error::{ChannelError, CodecError, CrdtError, EphemeralError, HandleError, SyncError};
pub use handle::{DocHandle, EphemeralHandle, TypedEphemeralHandle, WaitForSyncOptions};
pub use model::{
    AdapterId, ChannelId, ChannelKind, DocumentId, PeerId, PeerIdentity, PeerKind, ReadyState, ReadyStatus,
    VersionVector,
};
pub use rules::{AllowAll, Rules};
pub use runtime::{Runtime, SynchronizerConfig};
pub use sync::{Command, Message, Synchronizer};
