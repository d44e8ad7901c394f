use pods_format::{FormatError, Value};
use pods_registry::ResolveError;
use pods_wire::EnvelopeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pod spawn failed: {0}")]
    PodSpawn(String),
    #[error("pod handshake failed: {0}")]
    PodHandshake(String),
    #[error("pod terminated unexpectedly")]
    PodTerminated,
    #[error("pod invoke deadline expired")]
    PodTimeout,
    #[error("pod unloaded while call was pending")]
    PodCancelled,
    /// The pod replied with an error status. `data` holds the decoded
    /// `ex-data` payload (or nil).
    #[error("pod error: {message}")]
    PodError { message: String, data: Value },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("no active pod; handler registration requires a loaded pod")]
    NoActivePod,
    #[error("pod {pod} negotiated format {actual}, not {requested}")]
    WrongFormat {
        pod: String,
        requested: &'static str,
        actual: &'static str,
    },
    #[error("unknown pod: {0}")]
    UnknownPod(String),
    #[error("unknown or non-deferred namespace: {0}")]
    UnknownNamespace(String),
    #[error("var {0} is host-evaluated; install a host code evaluator to use it")]
    HostEvaluated(String),
    #[error("config: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
