//! Declarative pod configuration.
//!
//! A `pods.toml` (or any TOML file handed in) declares pods to load:
//!
//! ```toml
//! [[tool.pods.pod]]
//! name = "org.babashka/instaparse"
//! version = "0.0.6"
//!
//! [[tool.pods.pod]]
//! name = "local-helper"
//! path = "./target/debug/my-pod"
//! [tool.pods.pod.opts]
//! transport = "socket"
//! ```
//!
//! Exactly one of `version`/`path` per entry. `cache = true` pre-downloads
//! a registry pod without spawning it.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::transport::TransportKind;
use crate::{LoadPodOpts, PodId, PodSpec};

pub const DEFAULT_CONFIG_FILE: &str = "pods.toml";

#[derive(Debug, Deserialize)]
struct ConfigRoot {
    tool: Option<ToolTable>,
}

#[derive(Debug, Deserialize)]
struct ToolTable {
    pods: Option<PodsTable>,
}

#[derive(Debug, Deserialize)]
struct PodsTable {
    #[serde(default)]
    pod: Vec<PodEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PodEntry {
    pub name: String,
    pub version: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub cache: bool,
    pub opts: Option<EntryOpts>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntryOpts {
    pub transport: Option<String>,
    pub format: Option<String>,
    #[serde(default)]
    pub force: bool,
}

pub(crate) fn parse_entries(text: &str) -> Result<Vec<PodEntry>> {
    let root: ConfigRoot =
        toml::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
    let entries = root
        .tool
        .and_then(|tool| tool.pods)
        .map(|pods| pods.pod)
        .unwrap_or_default();
    for entry in &entries {
        match (&entry.version, &entry.path) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(format!(
                    "pod {:?} sets both version and path",
                    entry.name
                )))
            }
            (None, None) => {
                return Err(Error::Config(format!(
                    "pod {:?} sets neither version nor path",
                    entry.name
                )))
            }
            _ => {}
        }
    }
    Ok(entries)
}

/// Load every declared pod (or the selected ones). Returns the ids of the
/// pods actually spawned; `cache = true` entries only populate the cache.
pub fn load_pods_from_config(path: Option<&Path>, selectors: &[&str]) -> Result<Vec<PodId>> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let text = std::fs::read_to_string(path)
        .map_err(|err| Error::Config(format!("read {}: {err}", path.display())))?;
    let entries = parse_entries(&text)?;

    let mut loaded = Vec::new();
    for entry in entries {
        if !selectors.is_empty() && !selectors.contains(&entry.name.as_str()) {
            continue;
        }
        let entry_opts = entry.opts.unwrap_or_default();
        let mut opts = LoadPodOpts {
            version: entry.version.clone(),
            force: entry_opts.force,
            ..LoadPodOpts::default()
        };
        if let Some(transport) = &entry_opts.transport {
            opts.transport = TransportKind::from_name(transport).ok_or_else(|| {
                Error::Config(format!("pod {:?}: unknown transport {transport:?}", entry.name))
            })?;
        }

        let spec = match &entry.path {
            Some(path) => PodSpec::Path(path.into()),
            None => PodSpec::Registry(entry.name.clone()),
        };

        if entry.cache {
            if entry.path.is_some() {
                warn!(pod = %entry.name, "cache=true is meaningless for path pods; skipping");
                continue;
            }
            crate::cache_pod(&entry.name, opts)?;
            continue;
        }

        let id = crate::load_pod(spec, opts)?;
        if let Some(expected) = &entry_opts.format {
            if let Some(actual) = crate::pod_format(&id) {
                if actual.as_str() != expected {
                    warn!(
                        pod = %entry.name,
                        expected, actual = actual.as_str(),
                        "pod negotiated a different format than the config expects"
                    );
                }
            }
        }
        loaded.push(id);
    }
    Ok(loaded)
}
