//! End-to-end tests against the `pods-test-pod` helper binary.
//!
//! The host globals (pod table, namespace registry) are process-wide, so
//! every test serializes on one lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pods::{
    add_edn_read_handler, add_edn_read_handler_for_pod, add_transit_read_handler_for_pod,
    invoke, list_deferred_namespaces, list_pod_modules, load_and_expose_namespace, load_pod,
    load_pod_metadata, lookup_var, unload_pod, with_active_pod, Error, Format, InvokeHandlers,
    InvokeOpts, LoadPodOpts, PatchFn, PodId, TransportKind, Value,
};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn pod_cmd(format: &str) -> Vec<String> {
    vec![
        env!("CARGO_BIN_EXE_pods-test-pod").to_string(),
        "--format".to_string(),
        format.to_string(),
    ]
}

fn load(format: &str) -> PodId {
    load_pod(pod_cmd(format), LoadPodOpts::default()).expect("load pod")
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn describe_then_invoke_edn() {
    let _serial = serial();
    let pod = load("edn");
    let answer = invoke(
        &pod,
        "pod.test-pod/add-one",
        vec![Value::Int(41)],
        InvokeOpts::default(),
    )
    .expect("add-one");
    assert_eq!(answer, Value::Int(42));

    let started = Instant::now();
    unload_pod(&pod).expect("unload");
    assert!(started.elapsed() < Duration::from_secs(5), "pod exited within grace");

    assert!(matches!(unload_pod(&pod), Err(Error::UnknownPod(_))));
    assert!(matches!(
        invoke(&pod, "pod.test-pod/add-one", vec![], InvokeOpts::default()),
        Err(Error::UnknownPod(_))
    ));
}

#[test]
fn deep_merge_over_json() {
    let _serial = serial();
    let pod = load("json");
    let left = Value::Map(vec![
        (
            Value::string("a"),
            Value::Map(vec![(Value::string("b"), Value::Int(1))]),
        ),
        (Value::string("x"), Value::Int(2)),
    ]);
    let right = Value::Map(vec![(
        Value::string("a"),
        Value::Map(vec![(Value::string("c"), Value::Int(3))]),
    )]);
    let merged = invoke(
        &pod,
        "pod.test-pod/deep-merge",
        vec![left, right],
        InvokeOpts::default(),
    )
    .expect("deep-merge");

    let expected = Value::Map(vec![
        (
            Value::string("a"),
            Value::Map(vec![
                (Value::string("b"), Value::Int(1)),
                (Value::string("c"), Value::Int(3)),
            ]),
        ),
        (Value::string("x"), Value::Int(2)),
    ]);
    assert_eq!(merged, expected);
    unload_pod(&pod).expect("unload");
}

#[test]
fn async_countdown_streams_to_handlers() {
    let _serial = serial();
    let pod = load("edn");

    let values: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let errored = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let handlers = InvokeHandlers {
        success: Some(Box::new({
            let values = Arc::clone(&values);
            move |value| values.lock().expect("values lock").push(value)
        })),
        error: Some(Box::new({
            let errored = Arc::clone(&errored);
            move |_| errored.store(true, Ordering::SeqCst)
        })),
        done: Some(Box::new({
            let done = Arc::clone(&done);
            move || done.store(true, Ordering::SeqCst)
        })),
    };

    let ack = invoke(
        &pod,
        "pod.test-pod/async-countdown",
        vec![],
        InvokeOpts {
            handlers: Some(handlers),
            ..InvokeOpts::default()
        },
    )
    .expect("async invoke");
    assert_eq!(ack, Value::Nil, "handler invokes return immediately");

    wait_until("countdown done", || done.load(Ordering::SeqCst));
    let seen = values.lock().expect("values lock").clone();
    assert_eq!(
        seen,
        vec![Value::string("3"), Value::string("2"), Value::string("1")]
    );
    assert!(!errored.load(Ordering::SeqCst), "no error callback expected");
    unload_pod(&pod).expect("unload");
}

#[test]
fn async_var_without_handlers_buffers_stream() {
    let _serial = serial();
    let pod = load("edn");
    // async-countdown is marked async at describe time, so the call
    // streams into a buffer and returns the collected values.
    let collected = invoke(
        &pod,
        "pod.test-pod/async-countdown",
        vec![],
        InvokeOpts::default(),
    )
    .expect("buffered stream");
    assert_eq!(
        collected,
        Value::Vector(vec![
            Value::string("3"),
            Value::string("2"),
            Value::string("1")
        ])
    );
    unload_pod(&pod).expect("unload");
}

#[test]
fn metadata_roundtrip_over_transit() {
    let _serial = serial();
    let pod = load("transit+json");
    let sent = Value::with_meta(
        Value::Vector(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        Value::Map(vec![
            (Value::string("source"), Value::string("x")),
            (Value::string("v"), Value::Int(1)),
        ]),
    );
    let result = invoke(
        &pod,
        "pod.test-pod/echo-meta",
        vec![sent.clone()],
        InvokeOpts::default(),
    )
    .expect("echo-meta");
    assert_eq!(result, sent);
    let Value::WithMeta(value, meta) = result else {
        panic!("expected WithMeta, got {result:?}");
    };
    assert_eq!(
        *value,
        Value::Vector(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
    );
    assert_eq!(meta.get("source"), Some(&Value::string("x")));
    unload_pod(&pod).expect("unload");
}

#[test]
fn custom_edn_read_handler_transforms_tagged_values() {
    let _serial = serial();
    let pod = load("edn");
    add_edn_read_handler_for_pod(
        &pod,
        "person",
        Arc::new(|rep| {
            let name = rep
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            let age = rep.get("age").and_then(Value::as_int).unwrap_or(0);
            Ok(Value::Map(vec![
                (Value::string("type"), Value::string("Person")),
                (Value::string("name"), Value::string(name.clone())),
                (Value::string("age"), Value::Int(age)),
                (
                    Value::string("description"),
                    Value::string(format!("{name} is {age} years old")),
                ),
            ]))
        }),
    )
    .expect("register read handler");

    let person = Value::tagged(
        "person",
        Value::Map(vec![
            (Value::keyword("name"), Value::string("A")),
            (Value::keyword("age"), Value::Int(30)),
        ]),
    );
    let echoed = invoke(
        &pod,
        "pod.test-pod/echo",
        vec![person],
        InvokeOpts::default(),
    )
    .expect("echo");
    assert_eq!(echoed.get("type"), Some(&Value::string("Person")));
    assert_eq!(
        echoed.get("description"),
        Some(&Value::string("A is 30 years old"))
    );
    unload_pod(&pod).expect("unload");
}

#[test]
fn pod_errors_carry_message_and_data() {
    let _serial = serial();
    let pod = load("edn");
    let err = invoke(
        &pod,
        "pod.test-pod/add-one",
        vec![Value::string("not-a-number")],
        InvokeOpts::default(),
    )
    .expect_err("non-integer must fail");
    match err {
        Error::PodError { message, data } => {
            assert!(!message.is_empty(), "ex-message must be non-empty");
            let args = data.get("args").expect("ex-data has args");
            assert_eq!(
                args,
                &Value::Vector(vec![Value::string("not-a-number")])
            );
        }
        other => panic!("expected PodError, got {other}"),
    }
    unload_pod(&pod).expect("unload");
}

#[test]
fn concurrent_invokes_correlate_by_id() {
    let _serial = serial();
    let pod = load("json");
    let failures = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for n in 0..8i64 {
            let pod = pod.clone();
            let failures = &failures;
            scope.spawn(move || {
                for round in 0..5 {
                    let arg = n * 100 + round;
                    let got = invoke(
                        &pod,
                        "pod.test-pod/add-one",
                        vec![Value::Int(arg)],
                        InvokeOpts::default(),
                    );
                    if got.ok() != Some(Value::Int(arg + 1)) {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });
    assert_eq!(failures.load(Ordering::SeqCst), 0, "every caller got its own reply");
    unload_pod(&pod).expect("unload");
}

#[test]
fn socket_transport_rendezvous() {
    let _serial = serial();
    let pod = load_pod(
        pod_cmd("json"),
        LoadPodOpts {
            transport: TransportKind::Socket,
            ..LoadPodOpts::default()
        },
    )
    .expect("load over socket");
    let answer = invoke(
        &pod,
        "pod.test-pod/add-one",
        vec![Value::Int(6)],
        InvokeOpts::default(),
    )
    .expect("add-one over socket");
    assert_eq!(answer, Value::Int(7));
    unload_pod(&pod).expect("unload");

    // Neither side may leave a rendezvous file behind.
    let lingering: Vec<String> = std::fs::read_dir(".")
        .expect("read cwd")
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".babashka-pod-") && name.ends_with(".port"))
        .collect();
    assert!(lingering.is_empty(), "lingering port files: {lingering:?}");
}

#[test]
fn deferred_namespace_loads_on_demand() {
    let _serial = serial();
    let pod = load("edn");

    let deferred = list_deferred_namespaces(Some(&pod));
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].1, "pod.test-pod.deferred");
    assert!(!deferred[0].2, "not loaded yet");
    assert!(
        lookup_var("pod.test-pod.deferred", "hidden-op").is_none(),
        "deferred vars are not exposed before load"
    );

    load_and_expose_namespace(&pod, "pod.test-pod.deferred").expect("load-ns");
    let deferred = list_deferred_namespaces(Some(&pod));
    assert!(deferred[0].2, "loaded now");

    let hidden = lookup_var("pod.test-pod.deferred", "hidden_op").expect("alias exposed");
    assert_eq!(hidden.call(vec![]).expect("hidden-op"), Value::string("hidden"));

    // Loading again is a no-op; unknown namespaces are errors.
    load_and_expose_namespace(&pod, "pod.test-pod.deferred").expect("idempotent");
    assert!(matches!(
        load_and_expose_namespace(&pod, "pod.nope"),
        Err(Error::UnknownNamespace(_))
    ));
    unload_pod(&pod).expect("unload");
}

#[test]
fn exposure_aliases_docs_and_code_vars() {
    let _serial = serial();
    let pod = load("edn");

    let modules = list_pod_modules();
    assert!(
        modules.iter().any(|(ns, id)| ns == "pod.test-pod" && *id == pod),
        "namespace registered for this pod: {modules:?}"
    );

    let verbatim = lookup_var("pod.test-pod", "add-one").expect("verbatim name");
    let alias = lookup_var("pod.test-pod", "add_one").expect("underscore alias");
    assert_eq!(
        verbatim.call(vec![Value::Int(1)]).expect("call"),
        alias.call(vec![Value::Int(1)]).expect("call alias")
    );

    let countdown = lookup_var("pod.test-pod", "async-countdown").expect("async var");
    assert!(countdown.is_async);
    assert!(countdown.doc.as_deref().unwrap_or("").contains("countdown"));

    let banner = lookup_var("pod.test-pod", "banner").expect("code var");
    assert!(banner.source().expect("source").contains("println"));
    assert!(matches!(banner.call(vec![]), Err(Error::HostEvaluated(_))));

    unload_pod(&pod).expect("unload");
    assert!(lookup_var("pod.test-pod", "add-one").is_none(), "exposure removed");
}

#[test]
fn patches_wrap_the_remote_callable() {
    let _serial = serial();
    let patch: PatchFn = Arc::new(|args, original| {
        let base = original(args)?;
        match base {
            Value::Int(n) => Ok(Value::Int(n + 100)),
            other => Ok(other),
        }
    });
    let mut patches = BTreeMap::new();
    patches.insert("pod.test-pod/add-one".to_string(), patch);

    let pod = load_pod(
        pod_cmd("edn"),
        LoadPodOpts {
            patches,
            ..LoadPodOpts::default()
        },
    )
    .expect("load with patches");

    let patched = lookup_var("pod.test-pod", "add-one").expect("patched var");
    assert_eq!(patched.call(vec![Value::Int(1)]).expect("patched"), Value::Int(102));

    let original = lookup_var("pod.test-pod", "original-add-one").expect("original kept");
    assert_eq!(original.call(vec![Value::Int(1)]).expect("original"), Value::Int(2));

    unload_pod(&pod).expect("unload");
}

#[test]
fn deadline_expiry_abandons_the_request() {
    let _serial = serial();
    let pod = load("edn");
    let err = invoke(
        &pod,
        "pod.test-pod/async-countdown",
        vec![],
        InvokeOpts {
            deadline: Some(Duration::from_millis(50)),
            ..InvokeOpts::default()
        },
    )
    .expect_err("countdown cannot finish in 50ms");
    assert!(matches!(err, Error::PodTimeout), "{err}");

    // Late countdown replies are dropped; the pod keeps serving.
    let answer = invoke(
        &pod,
        "pod.test-pod/add-one",
        vec![Value::Int(9)],
        InvokeOpts::default(),
    )
    .expect("pod still healthy");
    assert_eq!(answer, Value::Int(10));
    unload_pod(&pod).expect("unload");
}

#[test]
fn handler_registration_needs_matching_pod_and_format() {
    let _serial = serial();
    assert!(matches!(
        add_edn_read_handler("tag", Arc::new(Ok)),
        Err(Error::NoActivePod)
    ));

    let pod = load("edn");
    assert!(matches!(
        add_transit_read_handler_for_pod(&pod, "tag", Arc::new(Ok)),
        Err(Error::WrongFormat { .. })
    ));
    with_active_pod(&pod, || add_edn_read_handler("tag", Arc::new(Ok)))
        .expect("active pod frame routes registration");
    unload_pod(&pod).expect("unload");
}

#[test]
fn print_op_forwards_pod_output() {
    let _serial = serial();
    let pod = load("edn");
    let result = invoke(&pod, "pod.test-pod/print-op", vec![], InvokeOpts::default())
        .expect("print-op");
    assert_eq!(result, Value::Nil, "void return for a pure done reply");
    unload_pod(&pod).expect("unload");
}

#[test]
fn metadata_probe_describes_without_registering() {
    let _serial = serial();
    let metadata = load_pod_metadata(pod_cmd("json"), LoadPodOpts::default())
        .expect("metadata")
        .expect("pod was run");
    assert_eq!(metadata.format, Format::Json);
    assert_eq!(metadata.namespaces, vec!["pod.test-pod".to_string()]);
    assert_eq!(metadata.deferred, vec!["pod.test-pod.deferred".to_string()]);
    assert!(metadata.ops.contains(&"shutdown".to_string()));
    assert!(
        lookup_var("pod.test-pod", "add-one").is_none(),
        "metadata probe must not expose namespaces"
    );
}
