//! Error taxonomy for the sync engine.
//!
//! Hardware errors stay below the feature-store boundary: they turn into
//! availability changes or [`ErrorEvent`]s, never into failures of
//! `set_virtual`. Refresh surfaces its own typed errors so callers can tell a
//! slow bus from a missing one.

use serde::Serialize;
use std::fmt;

/// Failures reported by a hardware collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HardwareError {
    #[error("display enumeration failed on {backend}: {reason}")]
    Enumerate { backend: String, reason: String },

    #[error("reading VCP 0x{code:02X} failed: {reason}")]
    Read { code: u8, reason: String },

    #[error("writing VCP 0x{code:02X} failed: {reason}")]
    Write { code: u8, reason: String },

    /// The feature answered but is not a continuous range.
    #[error("VCP 0x{code:02X} is not a continuous feature")]
    NonContinuous { code: u8 },

    #[error("handle {token} is no longer known to backend {backend}")]
    UnknownHandle { backend: String, token: u64 },

    #[error("OS correlation query failed: {0}")]
    Correlation(String),
}

/// Which part of a refresh ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStage {
    Enumeration,
    FeatureTest,
}

impl fmt::Display for RefreshStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefreshStage::Enumeration => "enumeration",
            RefreshStage::FeatureTest => "feature test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// The hardware did not answer before the refresh deadline.
    #[error("refresh timed out during {stage} after {timeout_ms}ms")]
    RefreshTimeout { stage: RefreshStage, timeout_ms: u64 },

    /// Per-display locks were still held when the deadline passed.
    #[error("display locks still held after {waited_ms}ms: {held:?}")]
    LockContentionTimeout { waited_ms: u64, held: Vec<String> },

    #[error("no backend could enumerate displays: {0}")]
    Enumeration(String),

    #[error("monitor directory has been shut down")]
    ShutDown,
}

impl DirectoryError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DirectoryError::RefreshTimeout { .. } | DirectoryError::LockContentionTimeout { .. }
        )
    }
}

/// Classification used on the error notification stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IdentityResolutionFailure,
    FeatureReadFailure,
    FeatureWriteFailure,
    RefreshTimeout,
    LockContentionTimeout,
    Enumeration,
}

/// Observability event published on the directory's error stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    pub stable_id: Option<String>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), stable_id: None }
    }

    pub fn for_display(kind: ErrorKind, stable_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stable_id: Some(stable_id.to_string()),
        }
    }
}

impl From<&DirectoryError> for ErrorEvent {
    fn from(err: &DirectoryError) -> Self {
        let kind = match err {
            DirectoryError::RefreshTimeout { .. } => ErrorKind::RefreshTimeout,
            DirectoryError::LockContentionTimeout { .. } => ErrorKind::LockContentionTimeout,
            DirectoryError::Enumeration(_) | DirectoryError::ShutDown => ErrorKind::Enumeration,
        };
        ErrorEvent::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_kinds_are_distinguishable() {
        let timeout = DirectoryError::RefreshTimeout { stage: RefreshStage::Enumeration, timeout_ms: 500 };
        let absent = DirectoryError::Enumeration("no displays".into());
        assert!(timeout.is_timeout());
        assert!(!absent.is_timeout());
        assert_eq!(ErrorEvent::from(&timeout).kind, ErrorKind::RefreshTimeout);
        assert_eq!(
            timeout.to_string(),
            "refresh timed out during enumeration after 500ms"
        );
    }

    #[test]
    fn lock_waits_are_reported_as_contention() {
        let contention = DirectoryError::LockContentionTimeout { waited_ms: 200, held: vec!["sn:DEL4109:A".into()] };
        assert!(contention.is_timeout());
        assert_eq!(ErrorEvent::from(&contention).kind, ErrorKind::LockContentionTimeout);

        let test_stage = DirectoryError::RefreshTimeout { stage: RefreshStage::FeatureTest, timeout_ms: 50 };
        assert_eq!(test_stage.to_string(), "refresh timed out during feature test after 50ms");
    }
}
