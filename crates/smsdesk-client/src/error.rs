use smsdesk::client::ApiError;
use std::fmt;
use thiserror::Error;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network trouble or a server-side hiccup; retrying may help.
    Transient,
    /// The request itself was wrong (empty body, bad number).
    Validation,
    NotFound,
    /// Duplicate contact and similar uniqueness violations.
    Conflict,
    Unauthorized,
    /// Nothing the session can recover from without user action.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "temporary failure",
            ErrorKind::Validation => "invalid request",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "already exists",
            ErrorKind::Unauthorized => "not authorized",
            ErrorKind::Fatal => "fatal error",
        };
        f.write_str(s)
    }
}

/// An error worth showing to the person using the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct UserError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UserError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<&ApiError> for UserError {
    fn from(err: &ApiError) -> Self {
        let message = match err {
            ApiError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        };
        UserError::new(classify(err), message)
    }
}

impl From<ApiError> for UserError {
    fn from(err: ApiError) -> Self {
        UserError::from(&err)
    }
}

/// Map an API failure onto the taxonomy, preferring the server's `code`.
pub fn classify(err: &ApiError) -> ErrorKind {
    match err {
        ApiError::Transport(_) => ErrorKind::Transient,
        ApiError::Decode(_) => ErrorKind::Fatal,
        ApiError::Status { status, code, .. } => match code.as_str() {
            "invalid" => ErrorKind::Validation,
            "unauthorized" | "forbidden" => ErrorKind::Unauthorized,
            "not_found" => ErrorKind::NotFound,
            "conflict" => ErrorKind::Conflict,
            "carrier" | "internal" => ErrorKind::Transient,
            _ => match status {
                400 | 422 => ErrorKind::Validation,
                401 | 403 => ErrorKind::Unauthorized,
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                408 | 429 | 500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
        },
    }
}
