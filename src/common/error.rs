use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("destination unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("session closed")]
    SessionClosed,
}

impl EngineError {
    /// Whether this error is transient and a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether this error is a permanent failure (no point retrying).
    pub fn is_permanent(&self) -> bool {
        self.kind().is_permanent()
    }

    /// Get the kind/category of this error.
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            EngineError::Io(_) => EngineErrorKind::Io,
            EngineError::MalformedPacket(_) => EngineErrorKind::MalformedPacket,
            EngineError::BackendUnavailable(_) => EngineErrorKind::BackendUnavailable,
            EngineError::Unreachable(_) => EngineErrorKind::Unreachable,
            EngineError::AuthRejected(_) => EngineErrorKind::AuthRejected,
            EngineError::ConnectTimeout(_) => EngineErrorKind::ConnectTimeout,
            EngineError::InvalidConfig(_) => EngineErrorKind::InvalidConfig,
            EngineError::Startup(_) => EngineErrorKind::Startup,
            EngineError::SessionClosed => EngineErrorKind::SessionClosed,
        }
    }

    /// Classify an io::Error from a connect attempt into the engine taxonomy.
    pub fn from_connect_io(err: std::io::Error, target: impl std::fmt::Display) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::HostUnreachable
            | std::io::ErrorKind::NetworkUnreachable => {
                EngineError::Unreachable(format!("{}: {}", target, err))
            }
            std::io::ErrorKind::TimedOut => {
                EngineError::ConnectTimeout(format!("{}: {}", target, err))
            }
            std::io::ErrorKind::PermissionDenied => {
                EngineError::AuthRejected(format!("{}: {}", target, err))
            }
            _ => EngineError::Io(err),
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    Io,
    MalformedPacket,
    BackendUnavailable,
    Unreachable,
    AuthRejected,
    ConnectTimeout,
    InvalidConfig,
    Startup,
    SessionClosed,
}

impl EngineErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            EngineErrorKind::Unreachable
                | EngineErrorKind::ConnectTimeout
                | EngineErrorKind::BackendUnavailable
                | EngineErrorKind::Io
        )
    }

    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            EngineErrorKind::AuthRejected
                | EngineErrorKind::InvalidConfig
                | EngineErrorKind::Startup
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineErrorKind::Io => "IO",
            EngineErrorKind::MalformedPacket => "MALFORMED_PACKET",
            EngineErrorKind::BackendUnavailable => "BACKEND_UNAVAILABLE",
            EngineErrorKind::Unreachable => "UNREACHABLE",
            EngineErrorKind::AuthRejected => "AUTH_REJECTED",
            EngineErrorKind::ConnectTimeout => "CONNECT_TIMEOUT",
            EngineErrorKind::InvalidConfig => "INVALID_CONFIG",
            EngineErrorKind::Startup => "STARTUP",
            EngineErrorKind::SessionClosed => "SESSION_CLOSED",
        }
    }
}

impl From<EngineError> for std::io::Error {
    fn from(e: EngineError) -> Self {
        std::io::Error::other(e.to_string())
    }
}
