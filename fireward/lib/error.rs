use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a fireward-related operation.
pub type FirewardResult<T> = Result<T, FirewardError>;

/// An error that occurred while provisioning, supervising or stopping a microVM.
#[derive(pretty_error_debug::Debug, Error)]
pub enum FirewardError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be parsed.
    #[error("config file error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// A system call made through `nix` failed.
    #[error("system call error: {0}")]
    Nix(#[from] nix::Error),

    /// A spawned task panicked or was cancelled.
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The machine configuration is invalid.
    #[error("invalid machine configuration: {0}")]
    Config(String),

    /// A drive specification carries neither a `:rw` nor a `:ro` suffix.
    #[error("invalid drive specification {0:?}: must have :rw or :ro suffix")]
    MissingDriveSuffix(String),

    /// A drive specification has an empty path.
    #[error("invalid drive specification {0:?}: must have path")]
    MissingDrivePath(String),

    /// A referenced host file does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(PathBuf),

    /// A vsock specification is not of the form `path:CID`.
    #[error("unable to parse vsock device {0:?}: expected path:CID")]
    VsockFormat(String),

    /// The CID of a vsock specification is not an unsigned 32-bit integer.
    #[error("unable to parse vsock CID as a number: {0:?}")]
    VsockCid(String),

    /// A combined log file and a raw log pipe were both requested.
    #[error("log fifo and log file cannot be used together")]
    LogOptionsConflict,

    /// A required sandbox or request field is unset.
    #[error("validation error: {0}")]
    Validation(String),

    /// A handler placement refers to a step that is not part of the base pipeline.
    #[error("handler anchor not found: {0}")]
    AnchorNotFound(String),

    /// The sandboxed hypervisor failed to start or become reachable.
    #[error("launch failed: {0}")]
    Launch(Box<FirewardError>),

    /// The shutdown action could not be delivered to the hypervisor.
    #[error("stop protocol error: {0}")]
    StopProtocol(String),

    /// The stop request names an architecture without a stop sequence.
    #[error("arch not recognized: {0}, please use x86_64 or aarch64")]
    UnsupportedArch(String),

    /// The hypervisor process could not be resolved.
    #[error("cannot find process: {0}")]
    ProcessNotFound(String),

    /// The shutdown document could not be delivered over the metadata channel.
    #[error("cannot send metadata to vm: {0}")]
    MetadataDelivery(String),

    /// An HTTP transport error on the control socket.
    #[error("control socket http error: {0}")]
    Http(String),

    /// The control socket exists but nothing accepts connections on it.
    #[error("control socket refused connection: {0}")]
    ControlSocketUnavailable(PathBuf),

    /// The hypervisor API rejected a request.
    #[error("control api returned {status}: {message}")]
    ControlApi {
        /// The HTTP status code.
        status: u16,

        /// The fault message returned by the hypervisor.
        message: String,
    },

    /// A network plugin failed.
    #[error("cni error: {0}")]
    Cni(String),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirewardError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> FirewardError {
        FirewardError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps an error raised while launching an instance.
    pub fn launch(error: FirewardError) -> FirewardError {
        match error {
            FirewardError::Launch(_) => error,
            other => FirewardError::Launch(Box::new(other)),
        }
    }

    /// Returns `true` when the error was caused by user-fixable input and should map to a 4xx
    /// status rather than a 5xx.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FirewardError::Config(_)
                | FirewardError::MissingDriveSuffix(_)
                | FirewardError::MissingDrivePath(_)
                | FirewardError::ResourceNotFound(_)
                | FirewardError::VsockFormat(_)
                | FirewardError::VsockCid(_)
                | FirewardError::LogOptionsConflict
                | FirewardError::Validation(_)
                | FirewardError::UnsupportedArch(_)
        )
    }

    /// Returns `true` if the error means the control socket refused the connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, FirewardError::ControlSocketUnavailable(_))
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `FirewardResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> FirewardResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_wraps_once() {
        let err = FirewardError::launch(FirewardError::launch(FirewardError::Cni("boom".into())));
        match err {
            FirewardError::Launch(inner) => assert!(matches!(*inner, FirewardError::Cni(_))),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_client_error_classification() {
        assert!(FirewardError::LogOptionsConflict.is_client_error());
        assert!(FirewardError::Validation("uid".into()).is_client_error());
        assert!(!FirewardError::StopProtocol("refused".into()).is_client_error());
        assert!(!FirewardError::launch(FirewardError::Config("x".into())).is_client_error());
    }
}
