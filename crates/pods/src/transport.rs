//! Transport variants: stdio pipes or a localhost socket reached through
//! a port-file rendezvous.

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

pub const SOCKET_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Stdio,
    Socket,
}

impl TransportKind {
    pub fn from_name(name: &str) -> Option<TransportKind> {
        match name {
            "stdio" => Some(TransportKind::Stdio),
            "socket" => Some(TransportKind::Socket),
            _ => None,
        }
    }
}

/// `.babashka-pod-<pid>.port` in the working directory.
pub(crate) fn port_file_path(pid: u32) -> PathBuf {
    PathBuf::from(format!(".babashka-pod-{pid}.port"))
}

/// Poll the rendezvous file until the pod publishes its port, then dial
/// it. Connection refused is retried within the same deadline, since the
/// pod may write the file just before it starts listening.
pub(crate) fn await_socket(pid: u32) -> Result<TcpStream> {
    let path = port_file_path(pid);
    let deadline = Instant::now() + SOCKET_RENDEZVOUS_TIMEOUT;

    let port = loop {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            // The pod writes the port followed by a newline; tolerate a
            // partially written file by waiting for a parseable line.
            if let Ok(port) = contents.trim().parse::<u16>() {
                if contents.ends_with('\n') || !contents.trim().is_empty() {
                    break port;
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::PodHandshake(format!(
                "no port published in {} within {:?}",
                path.display(),
                SOCKET_RENDEZVOUS_TIMEOUT
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    debug!(pid, port, "pod published socket port");

    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                if Instant::now() >= deadline {
                    return Err(Error::PodHandshake(format!(
                        "pod socket on port {port} refused connections for {:?}",
                        SOCKET_RENDEZVOUS_TIMEOUT
                    )));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => return Err(Error::PodHandshake(format!("dial port {port}: {err}"))),
        }
    }
}

/// Write half of a socket transport. Dropping it half-closes the socket so
/// the pod sees EOF on its input, mirroring a closed stdin pipe.
pub(crate) struct SocketWriter(pub TcpStream);

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl Drop for SocketWriter {
    fn drop(&mut self) {
        let _ = self.0.shutdown(Shutdown::Write);
    }
}
