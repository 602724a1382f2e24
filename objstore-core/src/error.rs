use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error response from the remote API.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// A `404 NotFound` response for the named object
    pub fn not_found(resource: &str, name: &str) -> Self {
        Self {
            status: "Failure".into(),
            message: format!("{resource} \"{name}\" not found"),
            reason: "NotFound".into(),
            code: 404,
        }
    }

    /// A `403 Forbidden` response
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: "Failure".into(),
            message: message.into(),
            reason: "Forbidden".into(),
            code: 403,
        }
    }

    /// A `410 Gone` response, sent when a watch falls out of the history window
    pub fn gone(message: impl Into<String>) -> Self {
        Self {
            status: "Failure".into(),
            message: message.into(),
            reason: "Expired".into(),
            code: 410,
        }
    }

    /// Whether the response reports a missing object
    pub fn is_not_found(&self) -> bool {
        self.code == 404 || self.reason == "NotFound"
    }

    /// Whether the response reports an authorization failure
    pub fn is_forbidden(&self) -> bool {
        self.code == 403 || self.reason == "Forbidden"
    }

    /// Whether the response reports an expired resource version
    pub fn is_gone(&self) -> bool {
        self.code == 410
    }
}
