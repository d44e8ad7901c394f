//! Protocol-complete pod used by the host integration tests.
//!
//! Speaks bencode over stdio or, when `BABASHKA_POD_TRANSPORT=socket`, over
//! a localhost socket published through the port rendezvous file. The
//! payload format is chosen with `--format edn|json|transit+json`.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pods_format::{decode_payload, encode_payload, Format, Handlers, Value};
use pods_wire::{read_message, write_message, Envelope};

fn main() {
    match try_main() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("pods-test-pod: {err:#}");
            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<()> {
    if std::env::var("BABASHKA_POD").as_deref() != Ok("true") {
        bail!("not started as a pod (BABASHKA_POD is unset)");
    }

    let mut format = Format::Edn;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--format" => {
                let name = args.next().context("--format needs a value")?;
                format = Format::from_wire(&name)
                    .with_context(|| format!("unknown format {name:?}"))?;
            }
            other => bail!("unknown argument {other:?}"),
        }
    }

    if std::env::var("BABASHKA_POD_TRANSPORT").as_deref() == Ok("socket") {
        serve_socket(format)
    } else {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        serve(format, &mut stdin.lock(), &mut stdout.lock())
    }
}

fn serve_socket(format: Format) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).context("bind pod socket")?;
    let port = listener.local_addr().context("local_addr")?.port();
    let port_file = format!(".babashka-pod-{}.port", std::process::id());
    std::fs::write(&port_file, format!("{port}\n")).context("write port file")?;

    let result = (|| {
        let (stream, _) = listener.accept().context("accept host connection")?;
        stream.set_nodelay(true).ok();
        let mut reader = stream.try_clone().context("clone socket")?;
        let mut writer = stream;
        serve(format, &mut reader, &mut writer)
    })();

    let _ = std::fs::remove_file(&port_file);
    result
}

fn serve(format: Format, reader: &mut impl Read, writer: &mut impl Write) -> Result<()> {
    loop {
        let Some(message) = read_message(reader).context("read request")? else {
            return Ok(());
        };
        let op = get_str(&message, "op").unwrap_or_default();
        match op.as_str() {
            "describe" => {
                write_message(writer, &describe_reply(format)).context("write describe")?;
            }
            "invoke" => {
                let id = get_str(&message, "id").context("invoke without id")?;
                let var = get_str(&message, "var").unwrap_or_default();
                let args = get_str(&message, "args").unwrap_or_default();
                handle_invoke(format, writer, &id, &var, &args)?;
            }
            "load-ns" => {
                let id = get_str(&message, "id").context("load-ns without id")?;
                let ns = get_str(&message, "ns").unwrap_or_default();
                if ns == "pod.test-pod.deferred" {
                    write_message(writer, &deferred_ns_reply(&id)).context("write load-ns")?;
                } else {
                    write_message(
                        writer,
                        &error_reply(format, &id, &format!("unknown namespace {ns}"), Value::Nil)?,
                    )?;
                }
            }
            "shutdown" => return Ok(()),
            other => {
                eprintln!("pods-test-pod: ignoring op {other:?}");
            }
        }
    }
}

fn handle_invoke(
    format: Format,
    writer: &mut impl Write,
    id: &str,
    var: &str,
    args_payload: &str,
) -> Result<()> {
    let handlers = Handlers::new();
    let args = match decode_payload(format, args_payload, &handlers) {
        Ok(Value::Vector(items)) | Ok(Value::List(items)) => items,
        Ok(other) => vec![other],
        Err(err) => {
            let reply = error_reply(format, id, &format!("cannot read args: {err}"), Value::Nil)?;
            return write_message(writer, &reply).context("write error");
        }
    };

    match var {
        "pod.test-pod/add-one" => match args.first() {
            Some(Value::Int(n)) => {
                let reply = value_reply(format, id, &Value::Int(n + 1), true)?;
                write_message(writer, &reply).context("write value")
            }
            other => {
                let data = Value::Map(vec![(
                    Value::keyword("args"),
                    Value::Vector(args.clone()),
                )]);
                let message = format!("Cannot add one to {other:?}");
                write_message(writer, &error_reply(format, id, &message, data)?)
                    .context("write error")
            }
        },
        "pod.test-pod/deep-merge" => {
            let merged = match (args.first(), args.get(1)) {
                (Some(a), Some(b)) => deep_merge(a.clone(), b.clone()),
                (Some(a), None) => a.clone(),
                _ => Value::Nil,
            };
            write_message(writer, &value_reply(format, id, &merged, true)?).context("write value")
        }
        "pod.test-pod/echo" | "pod.test-pod/echo-meta" => {
            let value = args.into_iter().next().unwrap_or(Value::Nil);
            write_message(writer, &value_reply(format, id, &value, true)?).context("write value")
        }
        "pod.test-pod/async-countdown" => {
            for n in ["3", "2", "1"] {
                let reply = value_reply(format, id, &Value::string(n), false)?;
                write_message(writer, &reply).context("write stream value")?;
                std::thread::sleep(Duration::from_millis(100));
            }
            write_message(writer, &done_reply(id)).context("write done")
        }
        "pod.test-pod/print-op" => {
            let mut reply = done_reply(id);
            if let Envelope::Dict(entries) = &mut reply {
                entries.insert(b"out".to_vec(), Envelope::str("hello from pod\n"));
            }
            write_message(writer, &reply).context("write print")
        }
        "pod.test-pod/error-op" => write_message(
            writer,
            &error_reply(
                format,
                id,
                "error-op always fails",
                Value::Map(vec![(Value::keyword("kind"), Value::string("deliberate"))]),
            )?,
        )
        .context("write error"),
        "pod.test-pod.deferred/hidden-op" => {
            write_message(writer, &value_reply(format, id, &Value::string("hidden"), true)?)
                .context("write value")
        }
        other => {
            let reply = error_reply(format, id, &format!("unknown var {other}"), Value::Nil)?;
            write_message(writer, &reply).context("write error")
        }
    }
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Map(left), Value::Map(right)) => {
            let mut merged = left;
            for (key, value) in right {
                match merged.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, existing)) => {
                        let prior = std::mem::replace(existing, Value::Nil);
                        *existing = deep_merge(prior, value);
                    }
                    None => merged.push((key, value)),
                }
            }
            Value::Map(merged)
        }
        (_, b) => b,
    }
}

fn dict(entries: Vec<(&str, Envelope)>) -> Envelope {
    Envelope::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn get_str(env: &Envelope, key: &str) -> Option<String> {
    env.get(key)
        .and_then(|v| v.as_str().ok())
        .map(str::to_string)
}

fn var_entry(name: &str) -> Envelope {
    dict(vec![("name", Envelope::str(name))])
}

fn describe_reply(format: Format) -> Envelope {
    let main_ns = dict(vec![
        ("name", Envelope::str("pod.test-pod")),
        (
            "vars",
            Envelope::List(vec![
                var_entry("add-one"),
                var_entry("deep-merge"),
                var_entry("echo"),
                var_entry("echo-meta"),
                dict(vec![
                    ("name", Envelope::str("async-countdown")),
                    ("async", Envelope::str("true")),
                    ("doc", Envelope::str("Streams a countdown, then done.")),
                ]),
                var_entry("error-op"),
                var_entry("print-op"),
                dict(vec![
                    ("name", Envelope::str("banner")),
                    ("code", Envelope::str("(println \"loaded pod.test-pod\")")),
                ]),
            ]),
        ),
    ]);
    let deferred_ns = dict(vec![
        ("name", Envelope::str("pod.test-pod.deferred")),
        ("defer", Envelope::str("true")),
    ]);
    dict(vec![
        ("format", Envelope::str(format.as_str())),
        ("namespaces", Envelope::List(vec![main_ns, deferred_ns])),
        ("ops", dict(vec![("shutdown", dict(vec![]))])),
    ])
}

fn deferred_ns_reply(id: &str) -> Envelope {
    dict(vec![
        ("id", Envelope::str(id)),
        ("name", Envelope::str("pod.test-pod.deferred")),
        ("vars", Envelope::List(vec![var_entry("hidden-op")])),
        ("status", Envelope::List(vec![Envelope::str("done")])),
    ])
}

fn value_reply(format: Format, id: &str, value: &Value, done: bool) -> Result<Envelope> {
    let payload = encode_payload(format, value, &Handlers::new())
        .with_context(|| format!("encode reply for {id}"))?;
    let mut entries = vec![
        ("id", Envelope::str(id)),
        ("value", Envelope::str(&payload)),
    ];
    if done {
        entries.push(("status", Envelope::List(vec![Envelope::str("done")])));
    }
    Ok(dict(entries))
}

fn done_reply(id: &str) -> Envelope {
    dict(vec![
        ("id", Envelope::str(id)),
        ("status", Envelope::List(vec![Envelope::str("done")])),
    ])
}

fn error_reply(format: Format, id: &str, message: &str, data: Value) -> Result<Envelope> {
    let payload = encode_payload(format, &data, &Handlers::new())
        .with_context(|| format!("encode ex-data for {id}"))?;
    Ok(dict(vec![
        ("id", Envelope::str(id)),
        ("ex-message", Envelope::str(message)),
        ("ex-data", Envelope::str(&payload)),
        (
            "status",
            Envelope::List(vec![Envelope::str("done"), Envelope::str("error")]),
        ),
    ]))
}
