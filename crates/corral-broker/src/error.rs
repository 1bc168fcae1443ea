// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker error taxonomy.
//!
//! Every error a verb or action handler can surface maps to an HTTP status,
//! an optional OSB error code, and a description. The external transport
//! renders these as `{"error": ..., "description": ...}` bodies.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the lifecycle controller and action handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The request did not opt into asynchronous completion.
    #[error("The query parameter accepts_incomplete=true MUST be included the request.")]
    AsyncRequired,

    /// The instance id was missing from the request.
    #[error("The instance ID was not provided.")]
    InstanceRequired,

    /// The instance id is already in use or has been used before.
    #[error("The instance ID was either already in-use or invalid. ({0})")]
    InstanceInvalid(String),

    /// A mutating request raced an in-flight operation.
    #[error("Clients MUST wait until pending requests have completed for the specified resources.")]
    ConcurrencyError,

    /// The requested plan change is not possible.
    #[error("{0}")]
    UpgradeError(String),

    /// The instance is not yet in a state where bindings can be read.
    #[error("The service requested is not yet available.")]
    ServiceNotYetAvailable,

    /// Generic unprocessable request.
    #[error("Unprocessable Entity")]
    Unprocessable,

    /// Unknown instance, plan, backup, or role.
    #[error("Not Found")]
    NotFound,

    /// The request conflicts with existing state.
    #[error("{0}")]
    Conflict(String),

    /// Anything unexpected. Details are logged, never surfaced.
    #[error("Internal Server Error")]
    Internal,
}

impl BrokerError {
    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::AsyncRequired
            | Self::InstanceRequired
            | Self::InstanceInvalid(_)
            | Self::ConcurrencyError
            | Self::UpgradeError(_)
            | Self::ServiceNotYetAvailable
            | Self::Unprocessable => 422,
            Self::NotFound => 404,
            Self::Conflict(_) => 409,
            Self::Internal => 500,
        }
    }

    /// OSB error code, where one is defined.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::AsyncRequired => Some("AsyncRequired"),
            Self::InstanceRequired => Some("InstanceRequired"),
            Self::InstanceInvalid(_) => Some("InstanceInvalid"),
            Self::ConcurrencyError => Some("ConcurrencyError"),
            Self::UpgradeError(_) => Some("UpgradeError"),
            Self::ServiceNotYetAvailable => Some("ServiceNotYetAvailable"),
            _ => None,
        }
    }

    /// Error body for the external transport.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.error_code().map(str::to_string),
            description: Some(self.to_string()),
        }
    }
}

/// Wire shape of an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result type using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_and_codes() {
        assert_eq!(BrokerError::AsyncRequired.status(), 422);
        assert_eq!(BrokerError::AsyncRequired.error_code(), Some("AsyncRequired"));
        assert_eq!(
            BrokerError::AsyncRequired.to_string(),
            "The query parameter accepts_incomplete=true MUST be included the request."
        );
        assert_eq!(BrokerError::NotFound.status(), 404);
        assert_eq!(BrokerError::Conflict("InstanceID in use".into()).status(), 409);
        assert_eq!(BrokerError::Internal.status(), 500);
        assert_eq!(BrokerError::Internal.error_code(), None);
    }

    #[test]
    fn upgrade_error_carries_message() {
        let err = BrokerError::UpgradeError("Cannot upgrade to the same plan.".into());
        assert_eq!(err.status(), 422);
        assert_eq!(err.error_code(), Some("UpgradeError"));
        assert_eq!(err.to_string(), "Cannot upgrade to the same plan.");
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["error"], "UpgradeError");
        assert_eq!(body["description"], "Cannot upgrade to the same plan.");
    }
}
