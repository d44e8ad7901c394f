//! Message construction and describe-reply parsing for the pod protocol.
//!
//! Requests are bencode dictionaries keyed by `op`; replies correlate by
//! `id`. The describe reply enumerates namespaces and vars and fixes the
//! payload format for the pod's lifetime.

use std::collections::{BTreeMap, BTreeSet};

use pods_format::Format;
use pods_wire::Envelope;

use crate::error::{Error, Result};

pub(crate) fn dict(entries: Vec<(&str, Envelope)>) -> Envelope {
    Envelope::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub(crate) fn describe_message(id: u64) -> Envelope {
    dict(vec![
        ("op", Envelope::str("describe")),
        ("id", Envelope::bytes(id.to_string())),
    ])
}

pub(crate) fn invoke_message(id: u64, var: &str, payload: &str) -> Envelope {
    dict(vec![
        ("op", Envelope::str("invoke")),
        ("id", Envelope::bytes(id.to_string())),
        ("var", Envelope::str(var)),
        ("args", Envelope::str(payload)),
    ])
}

pub(crate) fn load_ns_message(id: u64, ns: &str) -> Envelope {
    dict(vec![
        ("op", Envelope::str("load-ns")),
        ("id", Envelope::bytes(id.to_string())),
        ("ns", Envelope::str(ns)),
    ])
}

pub(crate) fn shutdown_message(id: u64) -> Envelope {
    dict(vec![
        ("op", Envelope::str("shutdown")),
        ("id", Envelope::bytes(id.to_string())),
    ])
}

/// A namespace as described by the pod, before exposure.
#[derive(Debug, Clone)]
pub(crate) struct RawNamespace {
    pub name: String,
    pub defer: bool,
    pub vars: Vec<RawVar>,
}

#[derive(Debug, Clone)]
pub(crate) struct RawVar {
    pub name: String,
    pub doc: Option<String>,
    pub is_async: bool,
    pub arg_meta: bool,
    pub code: Option<String>,
    pub meta: Option<String>,
}

#[derive(Debug)]
pub(crate) struct DescribeData {
    pub format: Format,
    pub ops: BTreeSet<String>,
    /// Reader-function sources keyed by tag (EDN pods).
    pub readers: Vec<(String, String)>,
    pub namespaces: Vec<RawNamespace>,
}

pub(crate) fn get_str(env: &Envelope, key: &str) -> Option<String> {
    env.get(key)
        .and_then(|v| v.as_str().ok())
        .map(str::to_string)
}

fn get_flag(env: &Envelope, key: &str) -> bool {
    match env.get(key) {
        Some(Envelope::Bytes(b)) => b == b"true",
        Some(Envelope::Int(n)) => *n != 0,
        _ => false,
    }
}

/// The reply's `status` list as a set of strings.
pub(crate) fn parse_status(env: &Envelope) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if let Some(Envelope::List(items)) = env.get("status") {
        for item in items {
            if let Ok(s) = item.as_str() {
                out.insert(s.to_string());
            }
        }
    }
    out
}

pub(crate) fn parse_describe(env: &Envelope) -> Result<DescribeData> {
    env.as_dict()
        .map_err(|_| Error::PodHandshake("describe reply is not a dictionary".to_string()))?;

    let format_name = get_str(env, "format").unwrap_or_else(|| "edn".to_string());
    let format = Format::from_wire(&format_name)
        .ok_or_else(|| Error::PodHandshake(format!("unknown payload format {format_name:?}")))?;

    let mut ops = BTreeSet::new();
    if let Some(Envelope::Dict(entries)) = env.get("ops") {
        for key in entries.keys() {
            if let Ok(op) = std::str::from_utf8(key) {
                ops.insert(op.to_string());
            }
        }
    }

    let mut namespaces = Vec::new();
    if let Some(Envelope::List(items)) = env.get("namespaces") {
        for item in items {
            namespaces.push(parse_namespace(item)?);
        }
    }

    // Namespaces may be deferred per-namespace or via a top-level list.
    if let Some(Envelope::List(items)) = env.get("defer") {
        let deferred: BTreeSet<String> = items
            .iter()
            .filter_map(|item| item.as_str().ok().map(str::to_string))
            .collect();
        for ns in &mut namespaces {
            if deferred.contains(&ns.name) {
                ns.defer = true;
            }
        }
    }

    Ok(DescribeData {
        format,
        ops,
        readers: parse_readers(env),
        namespaces,
    })
}

/// Parse a namespace dictionary: from a describe reply's `namespaces` list
/// or from a `load-ns` reply (same shape, inlined at the top level).
pub(crate) fn parse_namespace(env: &Envelope) -> Result<RawNamespace> {
    let name = get_str(env, "name")
        .ok_or_else(|| Error::PodHandshake("namespace without a name".to_string()))?;
    let mut vars = Vec::new();
    if let Some(Envelope::List(items)) = env.get("vars") {
        for item in items {
            let var_name = get_str(item, "name")
                .ok_or_else(|| Error::PodHandshake(format!("var without a name in {name}")))?;
            vars.push(RawVar {
                name: var_name,
                doc: get_str(item, "doc"),
                is_async: get_flag(item, "async"),
                arg_meta: get_flag(item, "arg-meta"),
                code: get_str(item, "code"),
                meta: get_str(item, "meta"),
            });
        }
    }
    Ok(RawNamespace {
        name,
        defer: get_flag(env, "defer"),
        vars,
    })
}

/// The `readers` mapping. The flat `tag -> source` shape is what pods send
/// in practice; a dialect-keyed nesting is flattened by taking string
/// values from any inner mapping.
fn parse_readers(env: &Envelope) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let Some(Envelope::Dict(entries)) = env.get("readers") else {
        return out;
    };
    for (key, value) in entries {
        let Ok(tag) = std::str::from_utf8(key) else {
            continue;
        };
        match value {
            Envelope::Bytes(_) => {
                if let Ok(source) = value.as_str() {
                    out.push((tag.to_string(), source.to_string()));
                }
            }
            Envelope::Dict(inner) => {
                for (inner_key, inner_value) in inner {
                    if let (Ok(inner_tag), Ok(source)) =
                        (std::str::from_utf8(inner_key), inner_value.as_str())
                    {
                        out.push((inner_tag.to_string(), source.to_string()));
                    }
                }
                let _ = tag;
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns_env(name: &str, defer: bool) -> Envelope {
        let mut entries = vec![
            ("name", Envelope::str(name)),
            (
                "vars",
                Envelope::List(vec![
                    dict(vec![("name", Envelope::str("add-one"))]),
                    dict(vec![
                        ("name", Envelope::str("watch")),
                        ("async", Envelope::str("true")),
                        ("doc", Envelope::str("streams changes")),
                    ]),
                ]),
            ),
        ];
        if defer {
            entries.push(("defer", Envelope::str("true")));
        }
        dict(entries)
    }

    #[test]
    fn describe_reply_parses() {
        let reply = dict(vec![
            ("format", Envelope::str("json")),
            ("ops", dict(vec![("shutdown", dict(vec![]))])),
            (
                "namespaces",
                Envelope::List(vec![ns_env("pod.test-pod", false), ns_env("pod.extra", true)]),
            ),
        ]);
        let data = parse_describe(&reply).expect("parse");
        assert_eq!(data.format, Format::Json);
        assert!(data.ops.contains("shutdown"));
        assert_eq!(data.namespaces.len(), 2);
        assert!(!data.namespaces[0].defer);
        assert!(data.namespaces[1].defer);
        let watch = &data.namespaces[0].vars[1];
        assert!(watch.is_async);
        assert_eq!(watch.doc.as_deref(), Some("streams changes"));
    }

    #[test]
    fn top_level_defer_list_marks_namespaces() {
        let reply = dict(vec![
            (
                "namespaces",
                Envelope::List(vec![ns_env("pod.a", false), ns_env("pod.b", false)]),
            ),
            ("defer", Envelope::List(vec![Envelope::str("pod.b")])),
        ]);
        let data = parse_describe(&reply).expect("parse");
        assert_eq!(data.format, Format::Edn, "format defaults to edn");
        assert!(!data.namespaces[0].defer);
        assert!(data.namespaces[1].defer);
    }

    #[test]
    fn readers_flat_and_nested() {
        let flat = dict(vec![(
            "readers",
            dict(vec![("person", Envelope::str("(fn [x] x)"))]),
        )]);
        assert_eq!(
            parse_readers(&flat),
            vec![("person".to_string(), "(fn [x] x)".to_string())]
        );

        let nested = dict(vec![(
            "readers",
            dict(vec![(
                "rust",
                dict(vec![("person", Envelope::str("src"))]),
            )]),
        )]);
        assert_eq!(
            parse_readers(&nested),
            vec![("person".to_string(), "src".to_string())]
        );
    }
}
