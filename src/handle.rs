//! Per-document façade external code uses to request documents, observe
//! ready-state, wait for sync, and publish changes.
//!
//! A thin handle carrying a reference back to the owning runtime plus an id;
//! its public methods forward into shared state rather than holding a
//! private copy of it.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::crdt::CrdtDoc;
use crate::error::{CodecError, HandleError};
use crate::model::{ChannelKind, DocumentId, ReadyState, ReadyStatus};
use crate::runtime::Runtime;

/// Options for [`DocHandle::wait_for_sync`].
#[derive(Default)]
pub struct WaitForSyncOptions {
    /// Restrict to channels of this kind; `None` accepts any kind.
    pub kind: Option<ChannelKind>,
    /// `None` disables the timeout.
    pub timeout: Option<Duration>,
    /// Resolves the wait early with [`HandleError::Cancelled`].
    pub cancel: Option<oneshot::Receiver<()>>,
}

/// Per-document façade.
#[derive(Clone)]
pub struct DocHandle {
    doc_id: DocumentId,
    runtime: Arc<Runtime>,
}

impl DocHandle {
    pub fn new(doc_id: DocumentId, runtime: Arc<Runtime>) -> Self {
        DocHandle { doc_id, runtime }
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Untyped JSON projection of the current state (no schema/type-builder
    /// layer).
    pub async fn view(&self) -> Option<serde_json::Value> {
        self.runtime.with_document(&self.doc_id, |doc| doc.to_json()).await
    }

    /// Mutate the shared CRDT instance backing this document. The
    /// subscription callback wired in at document creation
    /// (`runtime::Runtime::new`) feeds `doc-change` back into the reducer;
    /// this method does not dispatch it itself.
    pub async fn change<R>(&self, mutator: impl FnOnce(&mut dyn CrdtDoc) -> R) -> Option<R> {
        self.runtime.with_document_mut(&self.doc_id, mutator).await
    }

    /// All changes, unfiltered. `listener` receives the document's JSON
    /// projection after every successful local or remote mutation.
    pub async fn subscribe(&self, listener: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        let runtime = Arc::clone(&self.runtime);
        let doc_id = self.doc_id.clone();
        let listener = Arc::new(listener);
        self.runtime
            .subscribe_doc(
                &self.doc_id,
                Box::new(move || {
                    let runtime = Arc::clone(&runtime);
                    let doc_id = doc_id.clone();
                    let listener = Arc::clone(&listener);
                    tokio::spawn(async move {
                        if let Some(value) = runtime.with_document(&doc_id, |doc| doc.to_json()).await {
                            listener(value);
                        }
                    });
                }),
            )
            .await;
    }

    /// Path-scoped subscription with two-stage filtering: every document
    /// change is a candidate (stage one; the underlying CRDT library's own
    /// path-subscription would narrow this further, but `CrdtDoc` only
    /// exposes a whole-document `to_json`/`subscribe` surface); a
    /// deep-equality compare against the previously observed value at each
    /// concrete path then suppresses false positives for selectors
    /// containing wildcards (stage two).
    ///
    /// `selector` is a `/`-separated path where a bare `*` segment matches
    /// every key of an object or every index of an array, e.g. `todos/*/done`.
    pub async fn subscribe_selector(
        &self,
        selector: impl Into<String>,
        listener: impl Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    ) {
        let segments = parse_selector(&selector.into());
        let runtime = Arc::clone(&self.runtime);
        let doc_id = self.doc_id.clone();
        let previous: Arc<StdMutex<HashMap<String, serde_json::Value>>> = Arc::new(StdMutex::new(HashMap::new()));
        let listener = Arc::new(listener);
        self.runtime
            .subscribe_doc(
                &self.doc_id,
                Box::new(move || {
                    let runtime = Arc::clone(&runtime);
                    let doc_id = doc_id.clone();
                    let segments = segments.clone();
                    let previous = Arc::clone(&previous);
                    let listener = Arc::clone(&listener);
                    tokio::spawn(async move {
                        let Some(value) = runtime.with_document(&doc_id, |doc| doc.to_json()).await else {
                            return;
                        };
                        let mut matches = Vec::new();
                        collect_matches(&value, &segments, Vec::new(), &mut matches);
                        let mut prev = previous.lock().expect("lock poisoned");
                        for (path_segments, matched) in matches {
                            let path = path_segments.join("/");
                            if prev.get(&path) != Some(&matched) {
                                prev.insert(path.clone(), matched.clone());
                                listener(&path, &matched);
                            }
                        }
                    });
                }),
            )
            .await;
    }

    /// Escape hatch returning untyped arrays: every change re-emits the full,
    /// unfiltered set of values matching `path`, with no stage-two
    /// suppression.
    pub async fn subscribe_jsonpath(
        &self,
        path: impl Into<String>,
        listener: impl Fn(Vec<serde_json::Value>) + Send + Sync + 'static,
    ) {
        let segments = parse_selector(&path.into());
        let runtime = Arc::clone(&self.runtime);
        let doc_id = self.doc_id.clone();
        let listener = Arc::new(listener);
        self.runtime
            .subscribe_doc(
                &self.doc_id,
                Box::new(move || {
                    let runtime = Arc::clone(&runtime);
                    let doc_id = doc_id.clone();
                    let segments = segments.clone();
                    let listener = Arc::clone(&listener);
                    tokio::spawn(async move {
                        let Some(value) = runtime.with_document(&doc_id, |doc| doc.to_json()).await else {
                            return;
                        };
                        let mut matches = Vec::new();
                        collect_matches(&value, &segments, Vec::new(), &mut matches);
                        listener(matches.into_iter().map(|(_, v)| v).collect());
                    });
                }),
            )
            .await;
    }

    pub async fn ready_states(&self) -> Vec<ReadyState> {
        self.runtime.ready_states(&self.doc_id).await
    }

    /// Invokes `callback` with this document's ready-state list every time it
    /// changes.
    pub fn on_ready_state_change(&self, mut callback: impl FnMut(Vec<ReadyState>) + Send + 'static) {
        let mut rx = self.runtime.ready_state_receiver();
        let doc_id = self.doc_id.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let states = rx.borrow().get(&doc_id).cloned().unwrap_or_default();
                callback(states);
            }
        });
    }

    /// Resolves when some channel of `options.kind` reports `synced` or
    /// `absent` for a remote peer. Rejects with [`HandleError::NoAdapters`]
    /// if no channel of that kind is configured at all,
    /// [`HandleError::Timeout`] after `options.timeout` elapses, and
    /// [`HandleError::Cancelled`] if `options.cancel` fires first.
    pub async fn wait_for_sync(&self, options: WaitForSyncOptions) -> Result<(), HandleError> {
        if let Some(kind) = options.kind {
            if !self.runtime.has_channel_kind(kind).await {
                return Err(HandleError::NoAdapters);
            }
        }
        let kind = options.kind;
        let predicate = move |states: &[ReadyState]| {
            states.iter().any(|state| {
                let matches_kind = kind.map(|k| state.channels.iter().any(|c| c.kind == k)).unwrap_or(true);
                matches_kind && matches!(state.status, ReadyStatus::Synced | ReadyStatus::Absent)
            })
        };
        self.wait_until_ready_inner(predicate, options.timeout, options.cancel).await
    }

    /// General form of [`Self::wait_for_sync`]: waits until `predicate` holds
    /// for this document's ready-state list, with no timeout or
    /// cancellation.
    pub async fn wait_until_ready(&self, predicate: impl Fn(&[ReadyState]) -> bool) -> Result<(), HandleError> {
        self.wait_until_ready_inner(predicate, None, None).await
    }

    async fn wait_until_ready_inner(
        &self,
        predicate: impl Fn(&[ReadyState]) -> bool,
        timeout: Option<Duration>,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<(), HandleError> {
        let mut rx = self.runtime.ready_state_receiver();
        let doc_id = self.doc_id.clone();
        if predicate(rx.borrow().get(&doc_id).map(Vec::as_slice).unwrap_or(&[])) {
            return Ok(());
        }

        let poll_loop = async move {
            loop {
                if rx.changed().await.is_err() {
                    return Err(HandleError::Cancelled);
                }
                if predicate(rx.borrow().get(&doc_id).map(Vec::as_slice).unwrap_or(&[])) {
                    return Ok(());
                }
            }
        };
        let timeout_fut = async move {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancel_fut = async move {
            match cancel {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = poll_loop => result,
            _ = timeout_fut => Err(HandleError::Timeout),
            _ = cancel_fut => Err(HandleError::Cancelled),
        }
    }

    /// Untyped handle onto a `(docId, namespace)` ephemeral store.
    pub fn get_ephemeral(&self, namespace: impl Into<String>) -> EphemeralHandle {
        EphemeralHandle {
            doc_id: self.doc_id.clone(),
            namespace: namespace.into(),
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// Registers (or re-attaches to) a namespaced ephemeral store.
    /// Registration is implicit in this crate's model: the reducer lazily
    /// creates the namespace on first write
    /// (`Synchronizer::handle_ephemeral_local_change`), so this is equivalent
    /// to [`Self::get_ephemeral`].
    pub fn add_ephemeral(&self, namespace: impl Into<String>) -> EphemeralHandle {
        self.get_ephemeral(namespace)
    }

    /// Typed handle onto a `(docId, namespace)` ephemeral store, (de)serializing
    /// values with `ciborium` the same way the reducer itself encodes
    /// ephemeral envelopes.
    pub fn get_typed_ephemeral<T>(&self, namespace: impl Into<String>) -> TypedEphemeralHandle<T> {
        TypedEphemeralHandle {
            inner: self.get_ephemeral(namespace),
            _marker: PhantomData,
        }
    }
}

/// Untyped per-`(docId, namespace)` ephemeral store handle.
#[derive(Clone)]
pub struct EphemeralHandle {
    doc_id: DocumentId,
    namespace: String,
    runtime: Arc<Runtime>,
}

impl EphemeralHandle {
    pub fn set(&self, key: impl Into<String>, value: Vec<u8>) {
        self.runtime.set_ephemeral(self.doc_id.clone(), self.namespace.clone(), key.into(), Some(value));
    }

    pub fn delete(&self, key: impl Into<String>) {
        self.runtime.set_ephemeral(self.doc_id.clone(), self.namespace.clone(), key.into(), None);
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.runtime.ephemeral_get(&self.doc_id, &self.namespace, key).await
    }

    pub async fn get_all(&self) -> HashMap<String, Vec<u8>> {
        self.runtime.ephemeral_get_all(&self.doc_id, &self.namespace).await
    }
}

/// Typed wrapper over [`EphemeralHandle`].
pub struct TypedEphemeralHandle<T> {
    inner: EphemeralHandle,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> TypedEphemeralHandle<T> {
    pub fn set(&self, key: impl Into<String>, value: &T) -> Result<(), CodecError> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::CborEncode(e.to_string()))?;
        self.inner.set(key, buf);
        Ok(())
    }

    pub fn delete(&self, key: impl Into<String>) {
        self.inner.delete(key);
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, CodecError> {
        match self.inner.get(key).await {
            Some(bytes) => ciborium::from_reader(bytes.as_slice())
                .map(Some)
                .map_err(|e| CodecError::CborDecode(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn get_all(&self) -> Result<HashMap<String, T>, CodecError> {
        self.inner
            .get_all()
            .await
            .into_iter()
            .map(|(key, bytes)| {
                ciborium::from_reader(bytes.as_slice())
                    .map(|value| (key, value))
                    .map_err(|e| CodecError::CborDecode(e.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Wildcard,
}

fn parse_selector(selector: &str) -> Vec<PathSegment> {
    selector
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| if segment == "*" { PathSegment::Wildcard } else { PathSegment::Key(segment.to_owned()) })
        .collect()
}

fn collect_matches(
    value: &serde_json::Value,
    segments: &[PathSegment],
    prefix: Vec<String>,
    out: &mut Vec<(Vec<String>, serde_json::Value)>,
) {
    match segments.split_first() {
        None => out.push((prefix, value.clone())),
        Some((PathSegment::Key(key), rest)) => {
            if let Some(child) = value.get(key.as_str()) {
                let mut next = prefix;
                next.push(key.clone());
                collect_matches(child, rest, next, out);
            }
        }
        Some((PathSegment::Wildcard, rest)) => match value {
            serde_json::Value::Object(map) => {
                for (key, child) in map {
                    let mut next = prefix.clone();
                    next.push(key.clone());
                    collect_matches(child, rest, next, out);
                }
            }
            serde_json::Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    let mut next = prefix.clone();
                    next.push(index.to_string());
                    collect_matches(child, rest, next, out);
                }
            }
            _ => {}
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_selector_collects_every_matching_path() {
        let value = serde_json::json!({
            "todos": {
                "a": { "done": true },
                "b": { "done": false },
            }
        });
        let segments = parse_selector("todos/*/done");
        let mut matches = Vec::new();
        collect_matches(&value, &segments, Vec::new(), &mut matches);
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            matches,
            vec![
                (vec!["todos".to_owned(), "a".to_owned(), "done".to_owned()], serde_json::json!(true)),
                (vec!["todos".to_owned(), "b".to_owned(), "done".to_owned()], serde_json::json!(false)),
            ]
        );
    }

    #[test]
    fn concrete_selector_matches_a_single_path() {
        let value = serde_json::json!({ "title": "hello" });
        let segments = parse_selector("title");
        let mut matches = Vec::new();
        collect_matches(&value, &segments, Vec::new(), &mut matches);
        assert_eq!(matches, vec![(vec!["title".to_owned()], serde_json::json!("hello"))]);
    }
}
