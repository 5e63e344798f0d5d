//! Hook result taxonomy and top-level error types.

use actix_web::http::StatusCode;
use thiserror::Error;

/// Business result codes carried in every hook response body.
///
/// The numeric values are part of the wire contract with the media server
/// and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    Success = 0,
    AuthDenied = 1,
    InvalidFormat = 2,
    UnsupportedAction = 3,
    InternalError = 4,
    Timeout = 5,
    ResourceNotReady = 6,
}

impl HookResult {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// HTTP status paired with each business code.
    pub fn http_status(self) -> StatusCode {
        match self {
            HookResult::Success => StatusCode::OK,
            HookResult::AuthDenied => StatusCode::OK,
            HookResult::InvalidFormat => StatusCode::BAD_REQUEST,
            HookResult::UnsupportedAction => StatusCode::NOT_FOUND,
            HookResult::InternalError => StatusCode::OK,
            HookResult::Timeout => StatusCode::GATEWAY_TIMEOUT,
            HookResult::ResourceNotReady => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Fatal startup faults. Anything surfacing here terminates the process
/// with a non-zero exit code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("redis unavailable: {0}")]
    RedisInit(String),

    #[error("database unavailable: {0}")]
    DatabaseInit(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
