//! Reply routing for a running pod.
//!
//! One reader thread per pod owns the read side of the transport and
//! routes each decoded envelope to the pending request carrying its id.
//! Callers block on completion slots; streaming requests hold handler
//! triples instead. A fatal read error fails every live request and moves
//! the pod to stopping.

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pods_format::{decode_payload, Value};
use tracing::{debug, warn};

use crate::error::Error;
use crate::pod::PodShared;
use crate::protocol::{self, RawNamespace};

/// What a terminal reply delivered to a completion slot.
pub(crate) enum ReplyPayload {
    Value(Value),
    Namespace(RawNamespace),
    /// `done` with neither value nor stream: a synchronous void return.
    Unit,
}

/// Streaming callbacks for an async invoke.
#[derive(Default)]
pub struct InvokeHandlers {
    pub success: Option<Box<dyn Fn(Value) + Send + Sync>>,
    pub error: Option<Box<dyn Fn(Error) + Send + Sync>>,
    pub done: Option<Box<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for InvokeHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeHandlers")
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .field("done", &self.done.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub(crate) enum Pending {
    Slot { slot: Arc<Slot>, streaming: bool },
    Handlers(Arc<InvokeHandlers>),
}

/// A fulfil-once completion slot with a stream buffer for async vars
/// called without handlers.
pub(crate) struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

struct SlotState {
    result: Option<Result<ReplyPayload, Error>>,
    stream: Vec<Value>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Slot {
    pub(crate) fn new() -> Self {
        Slot {
            state: Mutex::new(SlotState {
                result: None,
                stream: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// First fulfilment wins; later ones are dropped.
    pub(crate) fn fulfill(&self, result: Result<ReplyPayload, Error>) {
        let mut state = lock(&self.state);
        if state.result.is_none() {
            state.result = Some(result);
            self.cond.notify_all();
        }
    }

    pub(crate) fn push_stream(&self, value: Value) {
        lock(&self.state).stream.push(value);
    }

    /// Close a streaming request: deliver the buffered values.
    pub(crate) fn close_stream(&self) {
        let mut state = lock(&self.state);
        if state.result.is_none() {
            let buffered = std::mem::take(&mut state.stream);
            state.result = Some(Ok(ReplyPayload::Value(Value::Vector(buffered))));
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait(&self, deadline: Option<Duration>) -> Result<ReplyPayload, Error> {
        let expires = deadline.map(|d| Instant::now() + d);
        let mut state = lock(&self.state);
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            state = match expires {
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(expires) => {
                    let now = Instant::now();
                    if now >= expires {
                        return Err(Error::PodTimeout);
                    }
                    self.cond
                        .wait_timeout(state, expires - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }
}

/// Fail every live request of this pod.
pub(crate) fn fail_all(
    pending: &Mutex<HashMap<u64, Pending>>,
    mut make_error: impl FnMut() -> Error,
) {
    let drained: Vec<Pending> = lock(pending).drain().map(|(_, p)| p).collect();
    for entry in drained {
        match entry {
            Pending::Slot { slot, .. } => slot.fulfill(Err(make_error())),
            Pending::Handlers(handlers) => {
                if let Some(error) = &handlers.error {
                    error(make_error());
                }
                if let Some(done) = &handlers.done {
                    done();
                }
            }
        }
    }
}

/// Reader-thread body. Owns the read side until EOF or a fatal error.
pub(crate) fn reader_loop(pod: Arc<PodShared>, reader: Box<dyn Read + Send>) {
    let mut reader = BufReader::new(reader);
    loop {
        match pods_wire::read_message(&mut reader) {
            Ok(Some(envelope)) => handle_reply(&pod, envelope),
            Ok(None) => break,
            Err(err) => {
                warn!(pod = %pod.id, %err, "pod reader failed; failing live requests");
                pod.stopping.store(true, Ordering::SeqCst);
                fail_all(&pod.pending, || Error::Envelope(pods_wire::EnvelopeError::Malformed(err.to_string())));
                return;
            }
        }
    }
    let stopping = pod.stopping.swap(true, Ordering::SeqCst);
    if stopping {
        fail_all(&pod.pending, || Error::PodCancelled);
    } else {
        debug!(pod = %pod.id, "pod closed its output");
        fail_all(&pod.pending, || Error::PodTerminated);
    }
}

fn handle_reply(pod: &Arc<PodShared>, envelope: pods_wire::Envelope) {
    let Some(id) = protocol::get_str(&envelope, "id").and_then(|s| s.parse::<u64>().ok()) else {
        debug!(pod = %pod.id, "dropping reply without a usable id");
        return;
    };

    // Pod-side prints travel as out/err byte strings.
    if let Some(out) = protocol::get_str(&envelope, "out") {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(out.as_bytes());
        let _ = stdout.flush();
    }
    if let Some(err_text) = protocol::get_str(&envelope, "err") {
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(err_text.as_bytes());
        let _ = stderr.flush();
    }

    let status = protocol::parse_status(&envelope);

    let mut failure: Option<Error> = None;
    let mut value: Option<Value> = None;
    if let Some(entry) = envelope.get("value") {
        match entry.as_str() {
            Ok(text) => {
                let handlers = pod.handlers.read().unwrap_or_else(|p| p.into_inner());
                match decode_payload(pod.format, text, &handlers) {
                    Ok(decoded) => value = Some(decoded),
                    Err(err) => failure = Some(Error::Format(err)),
                }
            }
            Err(err) => failure = Some(Error::Envelope(err)),
        }
    }

    if failure.is_none() && status.contains("error") {
        let message = protocol::get_str(&envelope, "ex-message").unwrap_or_default();
        let data = protocol::get_str(&envelope, "ex-data")
            .and_then(|text| {
                let handlers = pod.handlers.read().unwrap_or_else(|p| p.into_inner());
                decode_payload(pod.format, &text, &handlers).ok()
            })
            .unwrap_or(Value::Nil);
        failure = Some(Error::PodError { message, data });
    }

    let namespace = if envelope.get("vars").is_some() {
        protocol::parse_namespace(&envelope).ok()
    } else {
        None
    };

    let error = failure.is_some();
    let done = error || status.contains("done");

    let entry = {
        let mut pending = lock(&pod.pending);
        if done {
            pending.remove(&id)
        } else {
            pending.get(&id).cloned()
        }
    };
    let Some(entry) = entry else {
        debug!(pod = %pod.id, id, "dropping reply for unknown or abandoned request");
        return;
    };

    match entry {
        Pending::Slot { slot, streaming } => {
            if let Some(err) = failure {
                slot.fulfill(Err(err));
                return;
            }
            if let Some(ns) = namespace {
                slot.fulfill(Ok(ReplyPayload::Namespace(ns)));
                return;
            }
            if let Some(value) = value {
                if streaming {
                    slot.push_stream(value);
                } else {
                    slot.fulfill(Ok(ReplyPayload::Value(value)));
                }
            }
            if done {
                if streaming {
                    slot.close_stream();
                } else {
                    slot.fulfill(Ok(ReplyPayload::Unit));
                }
            }
        }
        Pending::Handlers(handlers) => {
            if let Some(err) = failure {
                if let Some(error_cb) = &handlers.error {
                    error_cb(err);
                }
            } else if let Some(value) = value {
                if let Some(success) = &handlers.success {
                    success(value);
                }
            }
            if done {
                if let Some(done_cb) = &handlers.done {
                    done_cb();
                }
            }
        }
    }
}
