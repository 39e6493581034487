//! Error types for the ForensicVM console

use thiserror::Error;

/// Result type alias using the ForensicVM Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of the tunnel sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStage {
    /// Share address or image path could not be parsed
    Parse,
    /// Local SMB endpoint did not accept connections
    ShareUnreachable,
    /// Reverse forward negotiation with the remote host
    Negotiate,
    /// Long-lived session carrying the forward and the remote command
    Session,
    /// Key generation or key-based authentication probe
    Key,
}

impl std::fmt::Display for TunnelStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStage::Parse => write!(f, "parse"),
            TunnelStage::ShareUnreachable => write!(f, "share"),
            TunnelStage::Negotiate => write!(f, "negotiate"),
            TunnelStage::Session => write!(f, "session"),
            TunnelStage::Key => write!(f, "key"),
        }
    }
}

/// ForensicVM error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Access denied: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    Application(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Tunnel error ({stage}): {cause}")]
    Tunnel { stage: TunnelStage, cause: String },

    #[error("IO error: {0}")]
    LocalIo(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Action {action} not permitted while {phase}")]
    NotPermitted { action: String, phase: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a tunnel failure at a given stage
    pub fn tunnel(stage: TunnelStage, cause: impl Into<String>) -> Self {
        Error::Tunnel {
            stage,
            cause: cause.into(),
        }
    }

    /// Errors the next poll tick may clear on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unreachable(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_is_retryable() {
        assert!(Error::Unreachable("refused".into()).is_retryable());
        assert!(!Error::Unauthorized("bad key".into()).is_retryable());
        assert!(!Error::Application("VM not stopped".into()).is_retryable());
        assert!(!Error::tunnel(TunnelStage::Negotiate, "timeout").is_retryable());
    }

    #[test]
    fn test_application_error_is_verbatim() {
        let err = Error::Application("VM not stopped".into());
        assert_eq!(err.to_string(), "VM not stopped");
    }

    #[test]
    fn test_tunnel_error_names_stage() {
        let err = Error::tunnel(TunnelStage::Parse, "malformed share");
        assert_eq!(err.to_string(), "Tunnel error (parse): malformed share");
    }
}
