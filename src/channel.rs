//! The Adapter/Channel abstraction: the uniform interface through which
//! storage and network transports deliver and accept messages, with strict
//! lifecycle guarantees.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::model::{AdapterId, ChannelId, ChannelKind};
use crate::wire::WireMessage;

/// Adapter lifecycle: `created -> initialized -> started -> stopped`.
/// Re-initializing from any state auto-stops first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterLifecycle {
    Created,
    Initialized,
    Started,
    Stopped,
}

impl AdapterLifecycle {
    fn label(self) -> &'static str {
        match self {
            AdapterLifecycle::Created => "created",
            AdapterLifecycle::Initialized => "initialized",
            AdapterLifecycle::Started => "started",
            AdapterLifecycle::Stopped => "stopped",
        }
    }
}

/// Hooks an adapter invokes into the runtime. Captured by reference at
/// `initialize` time; re-initializing must not retroactively swap the hooks
/// already captured by channels created under a previous set.
#[derive(Clone)]
pub struct AdapterHooks {
    pub on_channel_ready: Arc<dyn Fn(Arc<dyn Channel>) + Send + Sync>,
    pub on_channel_removed: Arc<dyn Fn(ChannelId) + Send + Sync>,
    pub on_receive: Arc<dyn Fn(ChannelId, WireMessage) + Send + Sync>,
}

/// A bidirectional, lifecycle-typed message pipe between the core and a
/// transport.
#[async_trait]
pub trait Channel: Send + Sync {
    fn channel_id(&self) -> ChannelId;
    fn adapter_id(&self) -> &AdapterId;
    fn kind(&self) -> ChannelKind;

    /// Transport-side outbound send. Must be non-blocking or integrate with
    /// the runtime's I/O loop.
    async fn send(&self, message: WireMessage) -> Result<(), ChannelError>;

    /// Idempotent local close. Does not itself emit a removal event; the
    /// adapter decides when a channel is actually gone.
    fn stop(&self);
}

/// Owns zero or more [`Channel`]s and progresses through [`AdapterLifecycle`].
#[async_trait]
pub trait Adapter: Send + Sync {
    fn adapter_id(&self) -> &AdapterId;
    fn lifecycle(&self) -> AdapterLifecycle;

    /// Re-initializing from any state auto-stops first (HMR resilience).
    async fn initialize(&self, hooks: AdapterHooks) -> Result<(), ChannelError>;
    async fn start(&self) -> Result<(), ChannelError>;

    /// Fails with a state-mismatch error unless `started`.
    async fn add_channel(&self, kind: ChannelKind) -> Result<ChannelId, ChannelError>;

    /// Fails with a state-mismatch error unless `started`. Removing an
    /// unknown channel id is not an error; it returns `Ok(())`.
    async fn remove_channel(&self, channel_id: ChannelId) -> Result<(), ChannelError>;

    async fn stop(&self) -> Result<(), ChannelError>;
}

/// Checks the lifecycle precondition shared by `add_channel`/`remove_channel`,
/// returning a state-mismatch error when the adapter isn't started.
pub fn require_started(current: AdapterLifecycle) -> Result<(), ChannelError> {
    if current == AdapterLifecycle::Started {
        Ok(())
    } else {
        Err(ChannelError::StateMismatch {
            expected: AdapterLifecycle::Started.label(),
            actual: current.label(),
        })
    }
}

/// An envelope queued for a specific channel, as seen by the interceptor chain.
#[derive(Debug, Clone)]
pub struct OutgoingEnvelope {
    pub channel_id: ChannelId,
    pub message: WireMessage,
}

/// A send-interceptor's verdict: may drop, delay, rewrite, or pass an
/// envelope through unchanged. Delay is expressed as data rather than as an
/// async callback so the interceptor itself stays a plain synchronous
/// function; the runtime's executor is what actually waits out the delay
/// before continuing the chain.
pub enum InterceptorDecision {
    Pass(OutgoingEnvelope),
    Drop,
    Delay(OutgoingEnvelope, std::time::Duration),
}

pub type SendInterceptor = Arc<dyn Fn(OutgoingEnvelope) -> InterceptorDecision + Send + Sync>;

/// Runs an envelope through an ordered chain of interceptors. An empty chain
/// is the fast path: the envelope passes straight through.
pub fn run_interceptors(
    chain: &[SendInterceptor],
    mut envelope: OutgoingEnvelope,
) -> InterceptorOutcome {
    if chain.is_empty() {
        return InterceptorOutcome::Send(envelope);
    }
    let mut delay = std::time::Duration::ZERO;
    for interceptor in chain {
        match interceptor(envelope) {
            InterceptorDecision::Pass(next) => envelope = next,
            InterceptorDecision::Drop => return InterceptorOutcome::Dropped,
            InterceptorDecision::Delay(next, d) => {
                envelope = next;
                delay += d;
            }
        }
    }
    if delay.is_zero() {
        InterceptorOutcome::Send(envelope)
    } else {
        InterceptorOutcome::SendAfter(envelope, delay)
    }
}

pub enum InterceptorOutcome {
    Send(OutgoingEnvelope),
    SendAfter(OutgoingEnvelope, std::time::Duration),
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ProtocolMessage;

    fn sample_envelope() -> OutgoingEnvelope {
        OutgoingEnvelope {
            channel_id: 1,
            message: WireMessage::Single(ProtocolMessage::DirectoryRequest { doc_ids: None }),
        }
    }

    #[test]
    fn empty_chain_is_fast_path() {
        let outcome = run_interceptors(&[], sample_envelope());
        assert!(matches!(outcome, InterceptorOutcome::Send(_)));
    }

    #[test]
    fn dropping_interceptor_short_circuits() {
        let drop_all: SendInterceptor = Arc::new(|_| InterceptorDecision::Drop);
        let outcome = run_interceptors(&[drop_all], sample_envelope());
        assert!(matches!(outcome, InterceptorOutcome::Dropped));
    }

    #[test]
    fn require_started_rejects_other_states() {
        assert!(require_started(AdapterLifecycle::Started).is_ok());
        assert!(require_started(AdapterLifecycle::Created).is_err());
    }
}
