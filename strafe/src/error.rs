use std::time::Duration;

use crate::job::JobState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong inside the engine.
///
/// Binding-level failures (I/O, network, codecs) are carried back to the
/// awaiting script as a string; only compile errors and reporter failures
/// surface to whoever drives the job.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("script: {0}")]
    Script(#[from] mlua::Error),

    #[error("expected global function run()")]
    MissingEntry,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("grpc: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("grpc transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("protobuf: {0}")]
    Proto(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("async task failed: {0}")]
    Task(String),

    #[error("async task timed out after {0:?}")]
    Timeout(Duration),

    #[error("async pool is not running")]
    PoolStopped,

    #[error("async task was dropped before completion")]
    TaskDropped,

    #[error("resource \"{0}\" is closed")]
    Closed(String),

    #[error("unique value \"{0}\" was created with a different type")]
    UniqueType(String),

    #[error("job is {actual:?}, expected {expected:?}")]
    State { expected: JobState, actual: JobState },

    #[error("reporter: {0}")]
    Reporter(String),
}

impl From<prost_reflect::DescriptorError> for Error {
    fn from(value: prost_reflect::DescriptorError) -> Self {
        Error::Proto(value.to_string())
    }
}

impl From<protox::Error> for Error {
    fn from(value: protox::Error) -> Self {
        Error::Proto(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Error::Proto(value.to_string())
    }
}

impl From<Error> for mlua::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Script(e) => e,
            other => mlua::Error::external(other),
        }
    }
}
