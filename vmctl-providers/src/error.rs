use std::fmt;
use std::time::Duration;

use crate::server::ServerState;

/// Provider-neutral classification of a failure. The reconciler branches on
/// this, never on provider payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    AlreadyExists,
    NotFound,
    PermanentRejection,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermanentRejection => "permanent_rejection",
        }
    }

    /// Maps an HTTP status plus provider error code onto a kind.
    pub fn classify(status: u16, code: &str) -> ErrorKind {
        let code = code.to_ascii_uppercase();
        if code.ends_with("ALREADY_EXISTS") {
            return ErrorKind::AlreadyExists;
        }
        if status == 404 || code.ends_with("NOT_FOUND") {
            return ErrorKind::NotFound;
        }
        // 409 is mostly "server busy / illegal state right now"
        if status == 409 || status == 429 || status >= 500 {
            return ErrorKind::Transient;
        }
        ErrorKind::PermanentRejection
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned {status} {code} ({kind}): {message}")]
    Api {
        kind: ErrorKind,
        status: u16,
        code: String,
        message: String,
    },
    #[error("timed out after {waited:?} waiting for server {uuid} to reach {desired} (last seen {last})")]
    Timeout {
        uuid: String,
        desired: ServerState,
        last: ServerState,
        waited: Duration,
    },
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn api(
        kind: ErrorKind,
        status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ProviderError::Api {
            kind,
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(uuid: &str) -> Self {
        ProviderError::api(
            ErrorKind::NotFound,
            404,
            "SERVER_NOT_FOUND",
            format!("server {} does not exist", uuid),
        )
    }

    /// Timeouts and transport failures count as transient: the same request
    /// may succeed on a later attempt.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Api { kind, .. } => *kind,
            ProviderError::Timeout { .. } | ProviderError::Transport(_) => ErrorKind::Transient,
            ProviderError::Malformed(_) => ErrorKind::PermanentRejection,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }
}
