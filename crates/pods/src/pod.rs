//! A running pod: shared state, invoke, namespace loading, teardown.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use pods_format::{encode_payload, Format, Handlers, Value};
use tracing::debug;

use crate::dispatch::{self, lock, InvokeHandlers, Pending, ReplyPayload, Slot};
use crate::error::{Error, Result};
use crate::process::{self, SHUTDOWN_GRACE};
use crate::protocol::{self, RawNamespace};
use crate::PodId;

/// Options for a single invoke.
#[derive(Debug, Default)]
pub struct InvokeOpts {
    /// Streaming callbacks. When present the call returns right after the
    /// envelope is written and replies go to the callbacks.
    pub handlers: Option<InvokeHandlers>,
    /// Local deadline. Expiry abandons the request id; late replies are
    /// dropped.
    pub deadline: Option<Duration>,
    /// Register as streaming even without handlers (set for vars the pod
    /// marked async). Stream values buffer and return as a vector.
    pub stream: bool,
}

/// Exposure state of one described namespace.
#[derive(Debug, Clone)]
pub(crate) struct NamespaceState {
    pub deferred: bool,
    pub loaded: bool,
}

pub(crate) struct PodShared {
    pub id: PodId,
    pub format: Format,
    pub ops: BTreeSet<String>,
    pub handlers: RwLock<Handlers>,
    pub pending: Mutex<HashMap<u64, Pending>>,
    pub writer: Mutex<Option<Box<dyn Write + Send>>>,
    pub next_id: AtomicU64,
    pub stopping: AtomicBool,
    pub child: Mutex<Child>,
    pub port_file: Option<PathBuf>,
    /// Per-var overrides, applied whenever a namespace is exposed.
    pub patches: BTreeMap<String, crate::namespaces::PatchFn>,
    /// name -> state, for every namespace the pod described.
    pub namespaces: Mutex<BTreeMap<String, NamespaceState>>,
    pub reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PodShared {
    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn send_envelope(&self, envelope: &pods_wire::Envelope) -> Result<()> {
        let mut guard = lock(&self.writer);
        match guard.as_mut() {
            Some(writer) => pods_wire::write_message(writer, envelope).map_err(|err| match err {
                pods_wire::EnvelopeError::Io(_) => Error::PodTerminated,
                other => Error::Envelope(other),
            }),
            None => Err(Error::PodCancelled),
        }
    }

    /// Invoke a var. Blocks on the completion slot unless handlers are
    /// given. Envelopes reach the pod in writer-lock order; replies
    /// correlate by id only.
    pub(crate) fn invoke(
        self: &Arc<Self>,
        var: &str,
        args: Vec<Value>,
        opts: InvokeOpts,
    ) -> Result<Value> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::PodCancelled);
        }

        let payload = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            encode_payload(self.format, &Value::Vector(args), &handlers)?
        };

        let id = self.next_request_id();
        let streaming = opts.stream || opts.handlers.is_some();
        let pending = match opts.handlers {
            Some(handlers) => Pending::Handlers(Arc::new(handlers)),
            None => Pending::Slot {
                slot: Arc::new(Slot::new()),
                streaming,
            },
        };
        lock(&self.pending).insert(id, pending.clone());

        let envelope = protocol::invoke_message(id, var, &payload);
        if let Err(err) = self.send_envelope(&envelope) {
            lock(&self.pending).remove(&id);
            return Err(err);
        }

        match pending {
            Pending::Handlers(_) => Ok(Value::Nil),
            Pending::Slot { slot, .. } => match slot.wait(opts.deadline) {
                Ok(ReplyPayload::Value(value)) => Ok(value),
                Ok(ReplyPayload::Unit) => Ok(Value::Nil),
                Ok(ReplyPayload::Namespace(_)) => Err(Error::Envelope(
                    pods_wire::EnvelopeError::Malformed(
                        "namespace reply to an invoke".to_string(),
                    ),
                )),
                Err(Error::PodTimeout) => {
                    // Abandon the id; the reader logs and drops late replies.
                    lock(&self.pending).remove(&id);
                    debug!(pod = %self.id, id, "invoke deadline expired");
                    Err(Error::PodTimeout)
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Send `load-ns` and wait for the namespace description.
    pub(crate) fn load_ns(self: &Arc<Self>, namespace: &str) -> Result<RawNamespace> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::PodCancelled);
        }
        let id = self.next_request_id();
        let slot = Arc::new(Slot::new());
        lock(&self.pending).insert(
            id,
            Pending::Slot {
                slot: Arc::clone(&slot),
                streaming: false,
            },
        );
        let envelope = protocol::load_ns_message(id, namespace);
        if let Err(err) = self.send_envelope(&envelope) {
            lock(&self.pending).remove(&id);
            return Err(err);
        }
        match slot.wait(None)? {
            ReplyPayload::Namespace(ns) => Ok(ns),
            _ => Err(Error::UnknownNamespace(namespace.to_string())),
        }
    }

    /// Graceful stop: shutdown op if the pod supports it, close the write
    /// side, reap within the grace period, fail whatever is still pending.
    pub(crate) fn unload(self: &Arc<Self>) -> Result<()> {
        let already = self.stopping.swap(true, Ordering::SeqCst);
        if !already {
            if self.ops.contains("shutdown") {
                let id = self.next_request_id();
                let _ = self.send_envelope(&protocol::shutdown_message(id));
            }
            // Closing the write side gives the pod EOF on its input.
            lock(&self.writer).take();
        }

        process::reap_with_grace(&self.child, SHUTDOWN_GRACE)?;

        dispatch::fail_all(&self.pending, || Error::PodCancelled);

        if let Some(handle) = lock(&self.reader_thread).take() {
            let _ = handle.join();
        }
        if let Some(port_file) = &self.port_file {
            let _ = std::fs::remove_file(port_file);
        }
        debug!(pod = %self.id, "pod unloaded");
        Ok(())
    }
}
