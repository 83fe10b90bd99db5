//! Error taxonomy shared by every component boundary.

use thiserror::Error;

/// Main error type for qpg operations.
///
/// Each variant maps to one of the process exit codes:
/// `0` success, `1` user error, `2` privilege-check failure,
/// `3` connection/guard violation, `4` internal.
#[derive(Error, Debug)]
pub enum Error {
    #[error("read-only guard violation: {0}")]
    GuardViolation(String),

    #[error("privilege check failed: {0}")]
    PrivilegeFailure(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("index build failed: {0}")]
    IndexBuild(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rerank hook failed: {0}")]
    Hook(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("source '{0}' already exists")]
    SourceExists(String),

    #[error("source '{0}' not found")]
    SourceNotFound(String),

    #[error("invalid context target: {0}")]
    InvalidContextTarget(String),

    #[error("vector model is not initialized. Run `qpg init` to download it into the local cache.")]
    ModelNotInitialized,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("catalog error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl Error {
    /// Process exit code for this error, per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound(_)
            | Error::Config(_)
            | Error::SourceExists(_)
            | Error::SourceNotFound(_)
            | Error::InvalidContextTarget(_)
            | Error::Cancelled => 1,
            Error::PrivilegeFailure(_) => 2,
            Error::Connection(_) | Error::GuardViolation(_) => 3,
            Error::SchemaConflict(_)
            | Error::IndexBuild(_)
            | Error::Hook(_)
            | Error::ModelNotInitialized
            | Error::Embedding(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Http(_)
            | Error::Other(_) => 4,
        }
    }

    /// Stable machine-readable code used in tool-surface envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::GuardViolation(_) => "guard_violation",
            Error::PrivilegeFailure(_) => "privilege_failure",
            Error::Connection(_) => "connection_error",
            Error::SchemaConflict(_) => "schema_conflict",
            Error::IndexBuild(_) => "index_build_error",
            Error::NotFound(_) | Error::SourceNotFound(_) => "not_found",
            Error::Hook(_) => "hook_error",
            Error::Config(_) | Error::InvalidContextTarget(_) => "config_error",
            Error::Cancelled => "cancelled",
            Error::SourceExists(_) => "source_exists",
            Error::ModelNotInitialized => "model_not_initialized",
            Error::Embedding(_) => "embedding_error",
            _ => "internal",
        }
    }
}

/// Result type alias for qpg.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(Error::NotFound("x".into()).exit_code(), 1);
        assert_eq!(Error::PrivilegeFailure("INSERT".into()).exit_code(), 2);
        assert_eq!(Error::Connection("refused".into()).exit_code(), 3);
        assert_eq!(Error::GuardViolation("off".into()).exit_code(), 3);
        assert_eq!(Error::IndexBuild("boom".into()).exit_code(), 4);
        assert_eq!(Error::SchemaConflict("dup".into()).exit_code(), 4);
        assert_eq!(Error::ModelNotInitialized.exit_code(), 4);
    }

    #[test]
    fn envelope_codes_are_stable() {
        assert_eq!(Error::GuardViolation(String::new()).code(), "guard_violation");
        assert_eq!(Error::NotFound(String::new()).code(), "not_found");
        assert_eq!(Error::Hook(String::new()).code(), "hook_error");
    }
}
