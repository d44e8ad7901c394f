//! Declarative loading from a pods.toml table.

use std::path::PathBuf;

use pods::{invoke, load_pods_from_config, unload_pod, InvokeOpts, Value};

fn make_temp_dir(prefix: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    for n in 0..10_000u32 {
        let p = base.join(format!("pods-config-{prefix}-{pid}-{n}"));
        if std::fs::create_dir(&p).is_ok() {
            return p;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

#[test]
fn loads_declared_pods_and_honors_selectors() {
    let dir = make_temp_dir("decl");
    let config_path = dir.join("pods.toml");
    let bin = env!("CARGO_BIN_EXE_pods-test-pod");
    std::fs::write(
        &config_path,
        format!(
            "[[tool.pods.pod]]\n\
             name = \"local-test\"\n\
             path = \"{bin}\"\n\
             [tool.pods.pod.opts]\n\
             format = \"edn\"\n"
        ),
    )
    .expect("write config");

    // A selector that matches nothing loads nothing.
    let none = load_pods_from_config(Some(&config_path), &["other-pod"]).expect("filtered");
    assert!(none.is_empty());

    let loaded = load_pods_from_config(Some(&config_path), &[]).expect("load all");
    assert_eq!(loaded.len(), 1);
    let answer = invoke(
        &loaded[0],
        "pod.test-pod/add-one",
        vec![Value::Int(1)],
        InvokeOpts::default(),
    )
    .expect("declared pod works");
    assert_eq!(answer, Value::Int(2));

    for pod in &loaded {
        unload_pod(pod).expect("unload");
    }
    let _ = std::fs::remove_dir_all(&dir);
}
