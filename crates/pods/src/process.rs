//! Pod process supervision: spawn with the pod environment, drain stderr,
//! and tear down with a shutdown grace period before killing.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::dispatch::lock;
use crate::error::{Error, Result};
use crate::transport::{self, TransportKind};

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where the pod's stderr goes. Stdout belongs to the protocol (stdio
/// transport), stderr is the pod's to print on.
#[derive(Clone, Default)]
pub enum StderrMode {
    /// Swallow stderr entirely.
    #[default]
    Discard,
    /// Let the pod share the host's stderr.
    Inherit,
    /// Drain stderr into a buffer, for tests and diagnostics.
    Collect(Arc<Mutex<Vec<u8>>>),
}

impl std::fmt::Debug for StderrMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StderrMode::Discard => f.write_str("Discard"),
            StderrMode::Inherit => f.write_str("Inherit"),
            StderrMode::Collect(_) => f.write_str("Collect"),
        }
    }
}

pub(crate) struct SpawnedPod {
    pub child: Child,
    pub pid: u32,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn std::io::Write + Send>,
    pub port_file: Option<PathBuf>,
}

pub(crate) fn spawn_pod(
    argv: &[String],
    transport: TransportKind,
    stderr: &StderrMode,
) -> Result<SpawnedPod> {
    let program = argv
        .first()
        .ok_or_else(|| Error::Config("empty pod command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    cmd.env("BABASHKA_POD", "true");

    match transport {
        TransportKind::Stdio => {
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
        }
        TransportKind::Socket => {
            cmd.env("BABASHKA_POD_TRANSPORT", "socket");
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::null());
        }
    }
    match stderr {
        StderrMode::Discard => {
            cmd.stderr(Stdio::null());
        }
        StderrMode::Inherit => {
            cmd.stderr(Stdio::inherit());
        }
        StderrMode::Collect(_) => {
            cmd.stderr(Stdio::piped());
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| Error::PodSpawn(format!("{program}: {err}")))?;
    let pid = child.id();
    debug!(pid, ?transport, "spawned pod process");

    if let StderrMode::Collect(sink) = stderr {
        if let Some(child_stderr) = child.stderr.take() {
            drain_stderr(child_stderr, Arc::clone(sink));
        }
    }

    match transport {
        TransportKind::Stdio => {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::PodSpawn("pod stdout not captured".to_string()))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::PodSpawn("pod stdin not captured".to_string()))?;
            Ok(SpawnedPod {
                child,
                pid,
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                port_file: None,
            })
        }
        TransportKind::Socket => {
            let stream = match transport::await_socket(pid) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = std::fs::remove_file(transport::port_file_path(pid));
                    return Err(err);
                }
            };
            let read_half = stream.try_clone().map_err(Error::Io)?;
            Ok(SpawnedPod {
                child,
                pid,
                reader: Box::new(read_half),
                writer: Box::new(transport::SocketWriter(stream)),
                port_file: Some(transport::port_file_path(pid)),
            })
        }
    }
}

fn drain_stderr(mut stderr: std::process::ChildStderr, sink: Arc<Mutex<Vec<u8>>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => lock(&sink).extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

/// Wait for exit within the grace period, then kill and reap.
pub(crate) fn reap_with_grace(child: &Mutex<Child>, grace: Duration) -> Result<()> {
    let deadline = Instant::now() + grace;
    loop {
        let mut guard = lock(child);
        match guard.try_wait() {
            Ok(Some(status)) => {
                debug!(?status, "pod process exited");
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => return Err(Error::Io(err)),
        }
        if Instant::now() >= deadline {
            warn!("pod did not exit within {grace:?}; killing");
            let _ = guard.kill();
            guard.wait().map_err(Error::Io)?;
            return Ok(());
        }
        drop(guard);
        std::thread::sleep(Duration::from_millis(10));
    }
}
