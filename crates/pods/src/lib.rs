//! Host runtime for babashka-style pods.
//!
//! A pod is a child process exposing named operations over a bencode-framed
//! protocol. [`load_pod`] spawns (or resolves from the registry, downloads
//! and caches) a pod binary, performs the describe handshake, and exposes
//! the pod's namespaces as host-side callables; [`invoke`] calls an
//! operation; [`unload_pod`] tears the pod down and reaps the process.
//!
//! ```no_run
//! use pods::{load_pod, invoke, unload_pod, InvokeOpts, LoadPodOpts, Value};
//!
//! # fn main() -> pods::Result<()> {
//! let pod = load_pod(vec!["./my-pod"], LoadPodOpts::default())?;
//! let answer = invoke(&pod, "pod.my-pod/add-one", vec![Value::Int(41)], InvokeOpts::default())?;
//! assert_eq!(answer, Value::Int(42));
//! unload_pod(&pod)?;
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, RwLock};

use tracing::{debug, warn};

mod config;
mod dispatch;
mod error;
mod namespaces;
mod pod;
mod process;
mod protocol;
mod transport;

pub use config::{load_pods_from_config, EntryOpts, PodEntry, DEFAULT_CONFIG_FILE};
pub use dispatch::InvokeHandlers;
pub use error::{Error, Result};
pub use namespaces::{
    list_namespaces, lookup_var, namespace_vars, set_host_code_evaluator, ExposedVar,
    HostCodeEvaluator, PatchFn,
};
pub use pod::InvokeOpts;
pub use pods_format::{
    Format, FormatError, Handlers, ReadHandler, Value, WriteHandler,
};
pub use pods_registry::{PodRegistry, ResolveError};
pub use pods_wire as wire;
pub use process::StderrMode;
pub use transport::TransportKind;

use dispatch::lock;
use pod::{NamespaceState, PodShared};

/// Stable identifier of a loaded pod: the registry coordinate, the first
/// described namespace, or a synthetic `pod-<n>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodId(String);

impl PodId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PodId {
    fn from(s: &str) -> Self {
        PodId(s.to_string())
    }
}

/// What to load: a command vector, a local binary, or a registry
/// coordinate (`qualifier/name`, version in [`LoadPodOpts`]).
#[derive(Debug, Clone)]
pub enum PodSpec {
    Command(Vec<String>),
    Path(PathBuf),
    Registry(String),
}

impl From<Vec<String>> for PodSpec {
    fn from(argv: Vec<String>) -> Self {
        PodSpec::Command(argv)
    }
}

impl From<Vec<&str>> for PodSpec {
    fn from(argv: Vec<&str>) -> Self {
        PodSpec::Command(argv.into_iter().map(str::to_string).collect())
    }
}

impl From<PathBuf> for PodSpec {
    fn from(path: PathBuf) -> Self {
        PodSpec::Path(path)
    }
}

impl From<&std::path::Path> for PodSpec {
    fn from(path: &std::path::Path) -> Self {
        PodSpec::Path(path.to_path_buf())
    }
}

impl From<&str> for PodSpec {
    fn from(coordinate: &str) -> Self {
        PodSpec::Registry(coordinate.to_string())
    }
}

#[derive(Default)]
pub struct LoadPodOpts {
    /// Registry version; required for [`PodSpec::Registry`].
    pub version: Option<String>,
    /// Re-download a cached registry pod / reload a live coordinate.
    pub force: bool,
    pub transport: TransportKind,
    pub stderr: StderrMode,
    /// Per-var overrides keyed `namespace/var`, applied before exposure.
    pub patches: BTreeMap<String, PatchFn>,
    /// Registry override (base url, cache root); tests point this at a
    /// local registry.
    pub registry: Option<PodRegistry>,
    /// With [`load_pod_metadata`]: populate the cache, do not spawn.
    pub download_only: bool,
}

/// Describe-time summary of a pod, from [`load_pod_metadata`].
#[derive(Debug, Clone)]
pub struct PodMetadata {
    pub format: Format,
    pub ops: Vec<String>,
    pub namespaces: Vec<String>,
    pub deferred: Vec<String>,
}

static PODS: Mutex<BTreeMap<String, Arc<PodShared>>> = Mutex::new(BTreeMap::new());
static POD_COUNTER: AtomicU64 = AtomicU64::new(1);
static EXIT_HOOK: Once = Once::new();

thread_local! {
    static ACTIVE_PODS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

extern "C" fn unload_pods_at_exit() {
    unload_all_pods();
}

fn register_exit_hook() {
    EXIT_HOOK.call_once(|| unsafe {
        libc::atexit(unload_pods_at_exit);
    });
}

struct ActiveFrame;

impl ActiveFrame {
    fn push(id: &PodId) -> ActiveFrame {
        ACTIVE_PODS.with(|stack| stack.borrow_mut().push(id.0.clone()));
        ActiveFrame
    }
}

impl Drop for ActiveFrame {
    fn drop(&mut self) {
        ACTIVE_PODS.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `f` with `pod` as the current pod for handler registration.
pub fn with_active_pod<R>(pod: &PodId, f: impl FnOnce() -> R) -> R {
    let _frame = ActiveFrame::push(pod);
    f()
}

fn current_pod() -> Result<PodId> {
    ACTIVE_PODS
        .with(|stack| stack.borrow().last().cloned())
        .map(PodId)
        .ok_or(Error::NoActivePod)
}

fn lookup_pod(id: &PodId) -> Result<Arc<PodShared>> {
    lock(&PODS)
        .get(&id.0)
        .cloned()
        .ok_or_else(|| Error::UnknownPod(id.0.clone()))
}

/// Load a pod and expose its namespaces. Loading a registry coordinate
/// that is already live returns the existing handle unless `force`.
pub fn load_pod(spec: impl Into<PodSpec>, mut opts: LoadPodOpts) -> Result<PodId> {
    let spec = spec.into();

    let (argv, coordinate) = match &spec {
        PodSpec::Registry(coordinate) => {
            if lock(&PODS).contains_key(coordinate) {
                if opts.force {
                    let _ = unload_pod(&PodId(coordinate.clone()));
                } else {
                    debug!(%coordinate, "registry pod already loaded");
                    return Ok(PodId(coordinate.clone()));
                }
            }
            let version = opts.version.clone().ok_or_else(|| {
                Error::Config(format!("registry coordinate {coordinate:?} needs a version"))
            })?;
            let registry = opts.registry.take().unwrap_or_default();
            let resolved = registry.resolve(coordinate, &version, opts.force)?;
            apply_manifest_options(&mut opts, resolved.options.as_ref());
            (
                vec![resolved.executable.to_string_lossy().into_owned()],
                Some(coordinate.clone()),
            )
        }
        PodSpec::Path(path) => (vec![path.to_string_lossy().into_owned()], None),
        PodSpec::Command(argv) => (argv.clone(), None),
    };

    let mut spawned = process::spawn_pod(&argv, opts.transport, &opts.stderr)?;

    let describe = match describe_handshake(&mut spawned) {
        Ok(describe) => describe,
        Err(err) => {
            let _ = spawned.child.kill();
            let _ = spawned.child.wait();
            if let Some(port_file) = &spawned.port_file {
                let _ = std::fs::remove_file(port_file);
            }
            return Err(err);
        }
    };

    let pod_id = pod_identity(coordinate, &describe);

    let mut handlers = Handlers::new();
    if describe.format == Format::Edn && !describe.readers.is_empty() {
        if let Some(evaluator) = namespaces::evaluator() {
            for (tag, source) in &describe.readers {
                if let Some(handler) = evaluator.resolve_reader(tag, source) {
                    handlers.edn_read.insert(tag.clone(), handler);
                }
            }
        }
    }

    let namespace_states: BTreeMap<String, NamespaceState> = describe
        .namespaces
        .iter()
        .map(|ns| {
            (
                ns.name.clone(),
                NamespaceState {
                    deferred: ns.defer,
                    loaded: !ns.defer,
                },
            )
        })
        .collect();

    let shared = Arc::new(PodShared {
        id: pod_id.clone(),
        format: describe.format,
        ops: describe.ops,
        handlers: RwLock::new(handlers),
        pending: Mutex::new(HashMap::new()),
        writer: Mutex::new(Some(spawned.writer)),
        next_id: AtomicU64::new(2),
        stopping: AtomicBool::new(false),
        child: Mutex::new(spawned.child),
        port_file: spawned.port_file,
        patches: opts.patches,
        namespaces: Mutex::new(namespace_states),
        reader_thread: Mutex::new(None),
    });

    let reader_handle = std::thread::Builder::new()
        .name(format!("pod-reader-{pod_id}"))
        .spawn({
            let shared = Arc::clone(&shared);
            let reader = spawned.reader;
            move || dispatch::reader_loop(shared, reader)
        })
        .map_err(Error::Io)?;
    *lock(&shared.reader_thread) = Some(reader_handle);

    {
        let _frame = ActiveFrame::push(&pod_id);
        for ns in &describe.namespaces {
            if ns.defer {
                debug!(namespace = %ns.name, "deferring namespace until loaded");
                continue;
            }
            namespaces::expose_namespace(&shared, ns, &shared.patches);
        }
    }

    lock(&PODS).insert(pod_id.0.clone(), shared);
    register_exit_hook();
    debug!(pod = %pod_id, "pod ready");
    Ok(pod_id)
}

fn describe_handshake(spawned: &mut process::SpawnedPod) -> Result<protocol::DescribeData> {
    pods_wire::write_message(&mut spawned.writer, &protocol::describe_message(1))
        .map_err(|err| Error::PodHandshake(format!("write describe: {err}")))?;
    let reply = pods_wire::read_message(&mut spawned.reader)
        .map_err(|err| Error::PodHandshake(format!("read describe reply: {err}")))?
        .ok_or_else(|| Error::PodHandshake("pod closed before describing itself".to_string()))?;
    protocol::parse_describe(&reply)
}

fn pod_identity(coordinate: Option<String>, describe: &protocol::DescribeData) -> PodId {
    if let Some(coordinate) = coordinate {
        return PodId(coordinate);
    }
    let base = describe
        .namespaces
        .first()
        .map(|ns| ns.name.clone())
        .unwrap_or_else(|| format!("pod-{}", POD_COUNTER.fetch_add(1, Ordering::Relaxed)));
    let pods = lock(&PODS);
    if !pods.contains_key(&base) {
        return PodId(base);
    }
    // Same local pod loaded twice: keep both live under distinct ids.
    PodId(format!(
        "{base}-{}",
        POD_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

fn apply_manifest_options(opts: &mut LoadPodOpts, options: Option<&Value>) {
    let Some(options) = options else { return };
    if let Some(transport) = options.get("transport") {
        let name = match transport {
            Value::String(s) | Value::Keyword(s) => s.as_str(),
            _ => return,
        };
        match TransportKind::from_name(name) {
            Some(kind) => opts.transport = kind,
            None => warn!(?transport, "manifest declares unknown transport"),
        }
    }
}

/// Gracefully stop a pod and drop its namespace registrations. No child
/// process remains once this returns.
pub fn unload_pod(id: &PodId) -> Result<()> {
    let shared = lock(&PODS)
        .remove(&id.0)
        .ok_or_else(|| Error::UnknownPod(id.0.clone()))?;
    namespaces::remove_pod_namespaces(id);
    shared.unload()
}

/// Best-effort teardown of every live pod. Also wired to process exit.
pub fn unload_all_pods() {
    let drained: Vec<Arc<PodShared>> = lock(&PODS)
        .split_off(&String::new())
        .into_values()
        .collect();
    for shared in drained {
        namespaces::remove_pod_namespaces(&shared.id);
        if let Err(err) = shared.unload() {
            warn!(pod = %shared.id, %err, "pod teardown failed");
        }
    }
}

/// Invoke a var by fully qualified symbol. Synchronous unless handlers
/// are supplied; a var the pod marked async streams into a buffer and
/// returns the collected values.
pub fn invoke(pod: &PodId, var: &str, args: Vec<Value>, mut opts: InvokeOpts) -> Result<Value> {
    let shared = lookup_pod(pod)?;
    if !opts.stream && opts.handlers.is_none() {
        if let Some((ns, name)) = var.rsplit_once('/') {
            if let Some(exposed) = namespaces::lookup_var(ns, name) {
                opts.stream = exposed.is_async;
            }
        }
    }
    shared.invoke(var, args, opts)
}

/// Currently exposed namespaces with their owning pod ids.
pub fn list_pod_modules() -> Vec<(String, PodId)> {
    namespaces::list_namespaces()
}

/// Deferred namespaces as `(pod, namespace, loaded)`.
pub fn list_deferred_namespaces(pod: Option<&PodId>) -> Vec<(PodId, String, bool)> {
    let pods = lock(&PODS);
    let mut out = Vec::new();
    for (id, shared) in pods.iter() {
        if let Some(filter) = pod {
            if filter.0 != *id {
                continue;
            }
        }
        for (name, state) in lock(&shared.namespaces).iter() {
            if state.deferred {
                out.push((PodId(id.clone()), name.clone(), state.loaded));
            }
        }
    }
    out
}

/// Force-load a deferred namespace and expose it.
pub fn load_and_expose_namespace(pod: &PodId, namespace: &str) -> Result<()> {
    let shared = lookup_pod(pod)?;
    let state = lock(&shared.namespaces).get(namespace).cloned();
    match state {
        None => Err(Error::UnknownNamespace(namespace.to_string())),
        Some(state) if state.loaded => Ok(()),
        Some(_) => {
            let raw = shared.load_ns(namespace)?;
            with_active_pod(pod, || {
                namespaces::expose_namespace(&shared, &raw, &shared.patches)
            });
            if let Some(state) = lock(&shared.namespaces).get_mut(namespace) {
                state.loaded = true;
            }
            Ok(())
        }
    }
}

/// The payload format a live pod negotiated.
pub fn pod_format(pod: &PodId) -> Option<Format> {
    lock(&PODS).get(&pod.0).map(|shared| shared.format)
}

/// Pre-download a registry pod into the cache without spawning it.
pub fn cache_pod(coordinate: &str, mut opts: LoadPodOpts) -> Result<()> {
    let version = opts
        .version
        .clone()
        .ok_or_else(|| Error::Config(format!("coordinate {coordinate:?} needs a version")))?;
    let registry = opts.registry.take().unwrap_or_default();
    registry.resolve(coordinate, &version, opts.force)?;
    Ok(())
}

/// Run a pod only for its describe reply, then shut it down. With
/// `opts.download_only` the pod is resolved into the cache and not run.
pub fn load_pod_metadata(
    spec: impl Into<PodSpec>,
    mut opts: LoadPodOpts,
) -> Result<Option<PodMetadata>> {
    let spec = spec.into();
    if opts.download_only {
        match &spec {
            PodSpec::Registry(coordinate) => {
                cache_pod(coordinate, opts)?;
                return Ok(None);
            }
            _ => {
                warn!("download_only is meaningful only for registry pods");
                return Ok(None);
            }
        }
    }

    let argv = match &spec {
        PodSpec::Registry(coordinate) => {
            let version = opts.version.clone().ok_or_else(|| {
                Error::Config(format!("registry coordinate {coordinate:?} needs a version"))
            })?;
            let registry = opts.registry.take().unwrap_or_default();
            let resolved = registry.resolve(coordinate, &version, opts.force)?;
            vec![resolved.executable.to_string_lossy().into_owned()]
        }
        PodSpec::Path(path) => vec![path.to_string_lossy().into_owned()],
        PodSpec::Command(argv) => argv.clone(),
    };

    let mut spawned = process::spawn_pod(&argv, opts.transport, &opts.stderr)?;
    let describe = match describe_handshake(&mut spawned) {
        Ok(describe) => describe,
        Err(err) => {
            let _ = spawned.child.kill();
            let _ = spawned.child.wait();
            return Err(err);
        }
    };

    if describe.ops.contains("shutdown") {
        let _ = pods_wire::write_message(&mut spawned.writer, &protocol::shutdown_message(2));
    }
    drop(spawned.writer);
    let child = Mutex::new(spawned.child);
    process::reap_with_grace(&child, process::SHUTDOWN_GRACE)?;
    if let Some(port_file) = &spawned.port_file {
        let _ = std::fs::remove_file(port_file);
    }

    let (mut namespaces, mut deferred) = (Vec::new(), Vec::new());
    for ns in &describe.namespaces {
        if ns.defer {
            deferred.push(ns.name.clone());
        } else {
            namespaces.push(ns.name.clone());
        }
    }
    Ok(Some(PodMetadata {
        format: describe.format,
        ops: describe.ops.into_iter().collect(),
        namespaces,
        deferred,
    }))
}

fn check_format(shared: &Arc<PodShared>, requested: &'static str) -> Result<()> {
    let wanted = match requested {
        "edn" => Format::Edn,
        _ => Format::TransitJson,
    };
    if shared.format != wanted {
        return Err(Error::WrongFormat {
            pod: shared.id.to_string(),
            requested,
            actual: shared.format.as_str(),
        });
    }
    Ok(())
}

macro_rules! handler_fns {
    ($add:ident, $add_for:ident, $table:ident, $format:literal, $kind:ty) => {
        /// Register against the current pod (the active-pod stack top).
        pub fn $add(tag: &str, handler: $kind) -> Result<()> {
            let pod = current_pod()?;
            $add_for(&pod, tag, handler)
        }

        pub fn $add_for(pod: &PodId, tag: &str, handler: $kind) -> Result<()> {
            let shared = lookup_pod(pod)?;
            check_format(&shared, $format)?;
            shared
                .handlers
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .$table
                .insert(tag.to_string(), handler);
            Ok(())
        }
    };
}

handler_fns!(
    add_edn_read_handler,
    add_edn_read_handler_for_pod,
    edn_read,
    "edn",
    ReadHandler
);
handler_fns!(
    add_edn_write_handler,
    add_edn_write_handler_for_pod,
    edn_write,
    "edn",
    WriteHandler
);
handler_fns!(
    add_transit_read_handler,
    add_transit_read_handler_for_pod,
    transit_read,
    "transit+json",
    ReadHandler
);
handler_fns!(
    add_transit_write_handler,
    add_transit_write_handler_for_pod,
    transit_write,
    "transit+json",
    WriteHandler
);

/// Fallback write handler for tagged values with no specific handler.
pub fn set_default_transit_write_handler(handler: WriteHandler) -> Result<()> {
    let pod = current_pod()?;
    set_default_transit_write_handler_for_pod(&pod, handler)
}

pub fn set_default_transit_write_handler_for_pod(
    pod: &PodId,
    handler: WriteHandler,
) -> Result<()> {
    let shared = lookup_pod(pod)?;
    check_format(&shared, "transit+json")?;
    shared
        .handlers
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .transit_default_write = Some(handler);
    Ok(())
}

/// Ops the pod advertised in its describe reply.
pub fn pod_ops(pod: &PodId) -> Result<BTreeSet<String>> {
    Ok(lookup_pod(pod)?.ops.clone())
}
