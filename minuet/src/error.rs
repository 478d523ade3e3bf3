use minuet_pg::PgError;
use std::io;

/// Central error type for server startup and control-plane failures.
///
/// Per-request failures never surface here; they flow through the parser's
/// outcome codes and end as HTTP error responses.
#[derive(Debug)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Invalid configuration (CLI flags or config file).
    Config(String),
    /// Database pool initialization or query failure.
    Db(PgError),
    /// Any other fatal startup condition.
    Startup(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Config(msg) => write!(f, "Config error: {}", msg),
            ServerError::Db(e) => write!(f, "Database error: {}", e),
            ServerError::Startup(msg) => write!(f, "Startup error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            ServerError::Db(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<PgError> for ServerError {
    fn from(e: PgError) -> Self {
        ServerError::Db(e)
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
