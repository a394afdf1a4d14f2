//! Typed error kinds exposed on the WebSocket surface.
//!
//! Services raise a [`ServiceError`] inside `anyhow::Error`; the hub
//! downcasts at the boundary and writes the kind string into the error
//! frame. Anything that is not a `ServiceError` is reported as `internal`
//! and logged server-side.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Operation deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Resource (session, path, tunnel, commit) missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Policy rejection — origin, command allowlist, destructive git op.
    #[error("refused: {0}")]
    Refused(String),

    /// Capacity exhaustion — connections, sessions, watchers.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Failure reported by a spawned child (agent, git, tunnel binary).
    #[error("upstream: {0}")]
    Upstream(String),

    /// The agent requires authentication; carries the declared methods.
    #[error("auth required")]
    AuthRequired { methods: serde_json::Value },

    /// Envelope or payload validation failed.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Daemon is shutting down.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// The wire kind — the first token of every error frame's `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Timeout(_) => "Timeout",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::Refused(_) => "Refused",
            ServiceError::Conflict(_) => "Conflict",
            ServiceError::Upstream(_) => "Upstream",
            ServiceError::AuthRequired { .. } => "AuthRequired",
            ServiceError::Malformed(_) => "Malformed",
            ServiceError::Unavailable(_) => "Unavailable",
        }
    }

    /// Wire representation: `Kind: detail`.
    pub fn wire_message(&self) -> String {
        match self {
            ServiceError::AuthRequired { methods } => {
                format!("AuthRequired: {}", methods)
            }
            other => format!("{}: {}", other.kind(), strip_kind_prefix(&other.to_string())),
        }
    }
}

fn strip_kind_prefix(msg: &str) -> &str {
    match msg.split_once(": ") {
        Some((_, rest)) => rest,
        None => msg,
    }
}

/// Classify an error produced by a service handler into a wire message.
///
/// `ServiceError` instances pass through with their kind; everything else
/// is an internal error — logged with full detail, reported without it.
pub fn classify(err: &anyhow::Error) -> String {
    if let Some(svc) = err.downcast_ref::<ServiceError>() {
        return svc.wire_message();
    }
    tracing::error!(err = %err, "internal error");
    "Internal: internal error".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ServiceError::Timeout("x".into()).kind(), "Timeout");
        assert_eq!(ServiceError::NotFound("x".into()).kind(), "NotFound");
        assert_eq!(ServiceError::Refused("x".into()).kind(), "Refused");
        assert_eq!(ServiceError::Conflict("x".into()).kind(), "Conflict");
    }

    #[test]
    fn wire_message_carries_detail() {
        let e = ServiceError::NotFound("session abc".into());
        assert_eq!(e.wire_message(), "NotFound: session abc");
    }

    #[test]
    fn classify_maps_service_error() {
        let err = anyhow::Error::new(ServiceError::Refused("rm -rf /".into()));
        assert!(classify(&err).starts_with("Refused:"));
    }

    #[test]
    fn classify_hides_internal_detail() {
        let err = anyhow::anyhow!("sqlite file is corrupt at /home/user/secret");
        assert_eq!(classify(&err), "Internal: internal error");
    }
}
