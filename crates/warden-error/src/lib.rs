// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared error taxonomy for the warden workspace.
//!
//! Every crate that crosses a process boundary (agent ↔ master, agent ↔
//! module) or a library boundary within a binary maps its local error type
//! onto [`ErrorCode`] via [`AsErrorCode`], so logs, RPC error responses, and
//! test assertions speak one stable vocabulary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse grouping of [`ErrorCode`]s, used for metrics and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The requested resource does not exist.
    NotFound,
    /// A cryptographic signature or digest did not verify.
    Security,
    /// A caller-supplied credential (pairing token, session key) was rejected.
    Auth,
    /// An operation did not complete within its deadline.
    Timeout,
    /// A failure expected to clear on retry (dial failure, stream hiccup).
    Transient,
    /// A data invariant was violated (digest mismatch, duplicate version).
    Invariant,
    /// Configuration was invalid at load or validation time.
    Config,
    /// Unrecoverable; the process should exit non-zero.
    Fatal,
}

/// Stable, machine-readable error code shared across every crate boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A module, version, pairing, satellite, or session was not found.
    NotFound,
    /// A signature over a catalog, assignment, or module manifest did not verify.
    InvalidSignature,
    /// A pairing token was unknown, already used, or expired.
    InvalidToken,
    /// An operation exceeded its deadline.
    Timeout,
    /// A retryable failure (dial, stream read, socket-wait).
    Transient,
    /// A durable invariant was violated (digest mismatch after download, duplicate version).
    InvariantViolation,
    /// Configuration failed validation.
    InvalidConfig,
    /// An unrecoverable startup or runtime failure.
    Fatal,
}

impl ErrorCode {
    /// The [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::NotFound => ErrorCategory::NotFound,
            ErrorCode::InvalidSignature => ErrorCategory::Security,
            ErrorCode::InvalidToken => ErrorCategory::Auth,
            ErrorCode::Timeout => ErrorCategory::Timeout,
            ErrorCode::Transient => ErrorCategory::Transient,
            ErrorCode::InvariantViolation => ErrorCategory::Invariant,
            ErrorCode::InvalidConfig => ErrorCategory::Config,
            ErrorCode::Fatal => ErrorCategory::Fatal,
        }
    }

    /// Stable string form, matching the serde rename (`SCREAMING_SNAKE_CASE`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Transient => "TRANSIENT",
            ErrorCode::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::Fatal => "FATAL",
        }
    }

    /// Whether an operation that failed with this code is worth retrying.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::Transient | ErrorCode::Timeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait every crate-local error enum implements to report its [`ErrorCode`].
pub trait AsErrorCode {
    /// The stable code this error maps onto.
    fn code(&self) -> ErrorCode;
}

/// The shared error type carried across crate and process boundaries.
#[derive(Clone)]
pub struct WardenError {
    code: ErrorCode,
    message: String,
    context: BTreeMap<String, serde_json::Value>,
    source: Option<std::sync::Arc<dyn std::error::Error + Send + Sync>>,
}

impl WardenError {
    /// Build a new error with a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach a structured context field.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying source error.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(std::sync::Arc::new(source));
        self
    }

    /// The stable error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Structured context attached to this error.
    #[must_use]
    pub fn context(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.context
    }
}

impl fmt::Debug for WardenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WardenError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("context", &self.context)
            .finish()
    }
}

impl fmt::Display for WardenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for WardenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable projection of a [`WardenError`] for RPC error responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenErrorDto {
    /// The stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context, if any.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&WardenError> for WardenErrorDto {
    fn from(err: &WardenError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
        }
    }
}

impl From<WardenErrorDto> for WardenError {
    fn from(dto: WardenErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            context: dto.context,
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::NotFound,
        ErrorCode::InvalidSignature,
        ErrorCode::InvalidToken,
        ErrorCode::Timeout,
        ErrorCode::Transient,
        ErrorCode::InvariantViolation,
        ErrorCode::InvalidConfig,
        ErrorCode::Fatal,
    ];

    #[test]
    fn every_code_has_a_stable_str_form() {
        for &code in ALL_CODES {
            assert!(!code.as_str().is_empty());
            assert_eq!(code.as_str(), code.to_string());
        }
    }

    #[test]
    fn only_timeout_and_transient_are_retryable() {
        for &code in ALL_CODES {
            let expected = matches!(code, ErrorCode::Transient | ErrorCode::Timeout);
            assert_eq!(code.is_retryable(), expected, "{code:?}");
        }
    }

    #[test]
    fn security_errors_are_never_retryable() {
        assert!(!ErrorCode::InvalidSignature.is_retryable());
        assert!(!ErrorCode::InvariantViolation.is_retryable());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = WardenError::new(ErrorCode::NotFound, "module foo@1.0 not found");
        let s = err.to_string();
        assert!(s.contains("NOT_FOUND"));
        assert!(s.contains("not found"));
    }

    #[test]
    fn context_round_trips_through_dto() {
        let err = WardenError::new(ErrorCode::InvalidSignature, "bad sig")
            .with_context("module_id", "ssh-honeypot")
            .with_context("version", "1.0.1");
        let dto = WardenErrorDto::from(&err);
        assert_eq!(dto.code, ErrorCode::InvalidSignature);
        assert_eq!(dto.context["module_id"], "ssh-honeypot");
        let back: WardenError = dto.into();
        assert_eq!(back.code(), ErrorCode::InvalidSignature);
    }

    #[test]
    fn dto_serializes_without_empty_context() {
        let err = WardenError::new(ErrorCode::Fatal, "ca init failed");
        let dto = WardenErrorDto::from(&err);
        let json = serde_json::to_string(&dto).unwrap();
        assert!(!json.contains("\"context\""));
    }
}
