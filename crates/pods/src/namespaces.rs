//! The namespace registry: described namespaces exposed as host-side
//! callables.
//!
//! Every exposed var is reachable under its verbatim name and, when they
//! differ, a `-`→`_` alias. Vars carrying inline code are stored for the
//! embedder's host-code evaluator; vars without code become remote
//! callables that invoke through the owning pod. Patches replace a remote
//! callable with a user function and re-expose the remote one under
//! `original-<name>`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use pods_format::{edn, Handlers, Value};
use tracing::warn;

use crate::dispatch::lock;
use crate::error::{Error, Result};
use crate::pod::{InvokeOpts, PodShared};
use crate::protocol::RawNamespace;
use crate::PodId;

/// A user override for a remote var. Receives the call's arguments and
/// the original remote callable.
pub type PatchFn =
    Arc<dyn Fn(Vec<Value>, &dyn Fn(Vec<Value>) -> Result<Value>) -> Result<Value> + Send + Sync>;

/// Host-code capability the embedder may install. The core never
/// evaluates pod-supplied source itself.
pub trait HostCodeEvaluator: Send + Sync {
    /// Evaluate the source of a code-bearing var. The namespace's remote
    /// vars are already exposed when this runs.
    fn eval_var(&self, namespace: &str, var: &str, source: &str) -> Result<()>;

    /// Turn a reader-function source from `describe.readers` into a read
    /// handler. Returning `None` leaves the tag decoding as a tagged
    /// literal.
    fn resolve_reader(&self, tag: &str, source: &str) -> Option<pods_format::ReadHandler> {
        let _ = (tag, source);
        None
    }
}

static EVALUATOR: RwLock<Option<Arc<dyn HostCodeEvaluator>>> = RwLock::new(None);

pub fn set_host_code_evaluator(evaluator: Arc<dyn HostCodeEvaluator>) {
    *EVALUATOR.write().unwrap_or_else(|p| p.into_inner()) = Some(evaluator);
}

pub(crate) fn evaluator() -> Option<Arc<dyn HostCodeEvaluator>> {
    EVALUATOR
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .clone()
}

enum VarKind {
    Remote {
        pod: Weak<PodShared>,
        symbol: String,
    },
    Code {
        source: String,
    },
    Patched {
        patch: PatchFn,
        pod: Weak<PodShared>,
        symbol: String,
    },
}

/// A first-class host-side callable for one pod var.
pub struct ExposedVar {
    pub namespace: String,
    pub name: String,
    pub doc: Option<String>,
    pub is_async: bool,
    /// The var asked for argument metadata to travel with invocations.
    pub arg_meta: bool,
    pub meta: Option<Value>,
    kind: VarKind,
}

impl ExposedVar {
    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.call_with(args, InvokeOpts::default())
    }

    pub fn call_with(&self, args: Vec<Value>, mut opts: InvokeOpts) -> Result<Value> {
        opts.stream = opts.stream || self.is_async;
        match &self.kind {
            VarKind::Remote { pod, symbol } => {
                let pod = pod
                    .upgrade()
                    .ok_or_else(|| Error::UnknownPod(self.namespace.clone()))?;
                pod.invoke(symbol, args, opts)
            }
            VarKind::Code { .. } => Err(Error::HostEvaluated(format!(
                "{}/{}",
                self.namespace, self.name
            ))),
            VarKind::Patched { patch, pod, symbol } => {
                let pod = pod
                    .upgrade()
                    .ok_or_else(|| Error::UnknownPod(self.namespace.clone()))?;
                let symbol = symbol.clone();
                let original = move |args: Vec<Value>| -> Result<Value> {
                    pod.invoke(&symbol, args, InvokeOpts::default())
                };
                patch(args, &original)
            }
        }
    }

    /// Source of a host-evaluated var, if this is one.
    pub fn source(&self) -> Option<&str> {
        match &self.kind {
            VarKind::Code { source } => Some(source),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ExposedVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposedVar")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("is_async", &self.is_async)
            .finish()
    }
}

struct NamespaceEntry {
    pod_id: PodId,
    vars: BTreeMap<String, Arc<ExposedVar>>,
}

static REGISTRY: Mutex<BTreeMap<String, NamespaceEntry>> = Mutex::new(BTreeMap::new());

fn host_alias(name: &str) -> Option<String> {
    if name.contains('-') {
        Some(name.replace('-', "_"))
    } else {
        None
    }
}

/// Expose a described namespace. Patches are keyed `namespace/var` and
/// are applied before exposure.
pub(crate) fn expose_namespace(
    pod: &Arc<PodShared>,
    raw: &RawNamespace,
    patches: &BTreeMap<String, PatchFn>,
) {
    let mut vars: BTreeMap<String, Arc<ExposedVar>> = BTreeMap::new();
    let mut code_vars: Vec<(String, String)> = Vec::new();

    for raw_var in &raw.vars {
        let symbol = format!("{}/{}", raw.name, raw_var.name);
        let meta = raw_var
            .meta
            .as_deref()
            .and_then(|text| edn::from_edn(text, &Handlers::new()).ok());

        let kind = if let Some(source) = &raw_var.code {
            code_vars.push((raw_var.name.clone(), source.clone()));
            VarKind::Code {
                source: source.clone(),
            }
        } else if let Some(patch) = patches.get(&symbol) {
            // Keep the remote callable reachable for the patch body.
            let original_name = format!("original-{}", raw_var.name);
            let original = Arc::new(ExposedVar {
                namespace: raw.name.clone(),
                name: original_name.clone(),
                doc: raw_var.doc.clone(),
                is_async: raw_var.is_async,
                arg_meta: raw_var.arg_meta,
                meta: None,
                kind: VarKind::Remote {
                    pod: Arc::downgrade(pod),
                    symbol: symbol.clone(),
                },
            });
            insert_with_alias(&mut vars, &original_name, original);
            VarKind::Patched {
                patch: Arc::clone(patch),
                pod: Arc::downgrade(pod),
                symbol,
            }
        } else {
            VarKind::Remote {
                pod: Arc::downgrade(pod),
                symbol,
            }
        };

        let var = Arc::new(ExposedVar {
            namespace: raw.name.clone(),
            name: raw_var.name.clone(),
            doc: raw_var.doc.clone(),
            is_async: raw_var.is_async,
            arg_meta: raw_var.arg_meta,
            meta,
            kind,
        });
        insert_with_alias(&mut vars, &raw_var.name, var);
    }

    lock(&REGISTRY).insert(
        raw.name.clone(),
        NamespaceEntry {
            pod_id: pod.id.clone(),
            vars,
        },
    );

    // Code vars go to the embedder once their siblings are reachable.
    if !code_vars.is_empty() {
        match evaluator() {
            Some(evaluator) => {
                for (name, source) in &code_vars {
                    if let Err(err) = evaluator.eval_var(&raw.name, name, source) {
                        warn!(namespace = %raw.name, var = %name, %err, "host code evaluation failed");
                    }
                }
            }
            None => warn!(
                namespace = %raw.name,
                count = code_vars.len(),
                "namespace carries host-evaluated vars but no evaluator is installed"
            ),
        }
    }
}

fn insert_with_alias(
    vars: &mut BTreeMap<String, Arc<ExposedVar>>,
    name: &str,
    var: Arc<ExposedVar>,
) {
    if let Some(alias) = host_alias(name) {
        vars.insert(alias, Arc::clone(&var));
    }
    vars.insert(name.to_string(), var);
}

/// Look up an exposed var by namespace and name (verbatim or alias).
pub fn lookup_var(namespace: &str, name: &str) -> Option<Arc<ExposedVar>> {
    lock(&REGISTRY)
        .get(namespace)
        .and_then(|entry| entry.vars.get(name))
        .cloned()
}

/// Exposed namespaces and their owning pods.
pub fn list_namespaces() -> Vec<(String, PodId)> {
    lock(&REGISTRY)
        .iter()
        .map(|(name, entry)| (name.clone(), entry.pod_id.clone()))
        .collect()
}

/// Var names exposed in a namespace (aliases included).
pub fn namespace_vars(namespace: &str) -> Vec<String> {
    lock(&REGISTRY)
        .get(namespace)
        .map(|entry| entry.vars.keys().cloned().collect())
        .unwrap_or_default()
}

pub(crate) fn remove_pod_namespaces(pod_id: &PodId) {
    lock(&REGISTRY).retain(|_, entry| entry.pod_id != *pod_id);
}
