//! Error taxonomy shared by the provider, the client stub and the reduction engine.
//!
//! `MonError` is what Rust callers see. `ErrorCode` is the integer carried in
//! every RPC reply so a client can rebuild the typed error on its side.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    #[error("metric not found: {0}")]
    InvalidMetric(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("unknown backend: {0}")]
    InvalidBackend(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("metric already exists: {0}")]
    MetricExists(String),

    #[error("sample buffer full: capacity {capacity}")]
    BufferFull { capacity: usize },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("operation forbidden: {0}")]
    Forbidden(String),

    #[error("aggregation sink error: {0}")]
    Sink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tagmon operations
pub type Result<T> = std::result::Result<T, MonError>;

impl MonError {
    pub fn invalid_metric(id: impl std::fmt::Display) -> Self {
        Self::InvalidMetric(id.to_string())
    }

    pub fn invalid_value<S: Into<String>>(msg: S) -> Self {
        Self::InvalidValue(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn sink<S: Into<String>>(msg: S) -> Self {
        Self::Sink(msg.into())
    }

    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}

/// Integer status carried in the `ret` field of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    InvalidName = 1,
    Allocation = 2,
    InvalidArgs = 3,
    InvalidProvider = 4,
    InvalidMetric = 5,
    InvalidValue = 6,
    InvalidBackend = 7,
    InvalidConfig = 8,
    InvalidToken = 9,
    Transport = 10,
    MetricExists = 11,
    BufferFull = 12,
    Unsupported = 13,
    Forbidden = 14,
    Other = 15,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<ErrorCode> {
        let code = match code {
            0 => ErrorCode::Success,
            1 => ErrorCode::InvalidName,
            2 => ErrorCode::Allocation,
            3 => ErrorCode::InvalidArgs,
            4 => ErrorCode::InvalidProvider,
            5 => ErrorCode::InvalidMetric,
            6 => ErrorCode::InvalidValue,
            7 => ErrorCode::InvalidBackend,
            8 => ErrorCode::InvalidConfig,
            9 => ErrorCode::InvalidToken,
            10 => ErrorCode::Transport,
            11 => ErrorCode::MetricExists,
            12 => ErrorCode::BufferFull,
            13 => ErrorCode::Unsupported,
            14 => ErrorCode::Forbidden,
            15 => ErrorCode::Other,
            _ => return None,
        };
        Some(code)
    }

    /// Turn a reply code back into a typed result. `context` names the
    /// request so the rebuilt error carries something readable.
    pub fn into_result(self, context: &str) -> Result<()> {
        let ctx = context.to_string();
        match self {
            ErrorCode::Success => Ok(()),
            ErrorCode::InvalidName => Err(MonError::InvalidName(ctx)),
            ErrorCode::Allocation => Err(MonError::Allocation(ctx)),
            ErrorCode::InvalidArgs => Err(MonError::InvalidArgs(ctx)),
            ErrorCode::InvalidProvider => Err(MonError::InvalidProvider(ctx)),
            ErrorCode::InvalidMetric => Err(MonError::InvalidMetric(ctx)),
            ErrorCode::InvalidValue => Err(MonError::InvalidValue(ctx)),
            ErrorCode::InvalidBackend => Err(MonError::InvalidBackend(ctx)),
            ErrorCode::InvalidConfig => Err(MonError::InvalidConfig(ctx)),
            ErrorCode::InvalidToken => Err(MonError::InvalidToken),
            ErrorCode::Transport => Err(MonError::Transport(ctx)),
            ErrorCode::MetricExists => Err(MonError::MetricExists(ctx)),
            ErrorCode::BufferFull => Err(MonError::BufferFull { capacity: 0 }),
            ErrorCode::Unsupported => Err(MonError::Unsupported(ctx)),
            ErrorCode::Forbidden => Err(MonError::Forbidden(ctx)),
            ErrorCode::Other => Err(MonError::Other(ctx)),
        }
    }
}

impl From<&MonError> for ErrorCode {
    fn from(e: &MonError) -> Self {
        match e {
            MonError::InvalidName(_) => ErrorCode::InvalidName,
            MonError::Allocation(_) => ErrorCode::Allocation,
            MonError::InvalidArgs(_) => ErrorCode::InvalidArgs,
            MonError::InvalidProvider(_) => ErrorCode::InvalidProvider,
            MonError::InvalidMetric(_) => ErrorCode::InvalidMetric,
            MonError::InvalidValue(_) => ErrorCode::InvalidValue,
            MonError::InvalidBackend(_) => ErrorCode::InvalidBackend,
            MonError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            MonError::InvalidToken => ErrorCode::InvalidToken,
            MonError::Transport(_) | MonError::Io(_) => ErrorCode::Transport,
            MonError::MetricExists(_) => ErrorCode::MetricExists,
            MonError::BufferFull { .. } => ErrorCode::BufferFull,
            MonError::Unsupported(_) => ErrorCode::Unsupported,
            MonError::Forbidden(_) => ErrorCode::Forbidden,
            MonError::Sink(_) | MonError::Other(_) => ErrorCode::Other,
        }
    }
}
