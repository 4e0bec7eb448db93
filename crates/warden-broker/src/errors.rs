//! Broker error taxonomy and the uniform error envelope.

use serde_json::Value;

use crate::types::ErrorBody;

/// Message type has no handler.
pub const UNSUPPORTED_MESSAGE_TYPE: &str = "UNSUPPORTED_MESSAGE_TYPE";
/// Unknown or already-removed subscription, request, or channel.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Second settlement attempt on a pending request.
pub const ALREADY_SETTLED: &str = "ALREADY_SETTLED";
/// Approver explicitly refused the request.
pub const USER_REJECTED: &str = "USER_REJECTED";
/// Request was dismissed without an explicit refusal.
pub const CANCELLED: &str = "CANCELLED";
/// Lock or unlock transition failed.
pub const LOCK_POLICY_ERROR: &str = "LOCK_POLICY_ERROR";
/// Missing or malformed payload fields.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Operation not possible in the current state.
pub const NOT_AVAILABLE: &str = "NOT_AVAILABLE";
/// Unexpected broker failure.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// An external collaborator (keyring, chain, transaction service) failed.
pub const COLLABORATOR_ERROR: &str = "COLLABORATOR_ERROR";

/// Error returned by handlers and broker operations.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// Dispatch received a type string outside the closed set.
    #[error("unsupported message type '{message_type}'")]
    UnsupportedMessageType {
        /// The offending type string.
        message_type: String,
    },

    /// Referenced id is unknown or already removed.
    #[error("{what} '{id}' not found")]
    NotFound {
        /// What kind of thing was looked up (`pending request`, `channel`, ...).
        what: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// Pending request was already resolved or rejected.
    #[error("request '{id}' is already settled")]
    AlreadySettled {
        /// Request id.
        id: String,
    },

    /// Approver refused the request.
    #[error("{message}")]
    UserRejected {
        /// Reason shown to the original caller.
        message: String,
    },

    /// Request was dismissed silently.
    #[error("{}", message.as_deref().unwrap_or("request cancelled"))]
    Cancelled {
        /// Optional reason.
        message: Option<String>,
    },

    /// Lock or unlock failed (e.g. wrong password).
    #[error("{message}")]
    LockPolicy {
        /// Description.
        message: String,
    },

    /// Payload failed validation.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Operation not possible right now.
    #[error("{message}")]
    NotAvailable {
        /// Description.
        message: String,
    },

    /// Unexpected broker failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// A collaborator call failed.
    #[error("{message}")]
    Collaborator {
        /// Description from the collaborator.
        message: String,
        /// Optional structured details.
        details: Option<Value>,
    },
}

impl BrokerError {
    /// Shorthand for [`BrokerError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Shorthand for [`BrokerError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`BrokerError::NotFound`].
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    /// Machine-readable code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedMessageType { .. } => UNSUPPORTED_MESSAGE_TYPE,
            Self::NotFound { .. } => NOT_FOUND,
            Self::AlreadySettled { .. } => ALREADY_SETTLED,
            Self::UserRejected { .. } => USER_REJECTED,
            Self::Cancelled { .. } => CANCELLED,
            Self::LockPolicy { .. } => LOCK_POLICY_ERROR,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::NotAvailable { .. } => NOT_AVAILABLE,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Collaborator { .. } => COLLABORATOR_ERROR,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        let details = match self {
            Self::UnsupportedMessageType { message_type } => {
                Some(serde_json::json!({ "messageType": message_type }))
            }
            Self::NotFound { id, .. } | Self::AlreadySettled { id } => {
                Some(serde_json::json!({ "id": id }))
            }
            Self::Collaborator { details, .. } => details.clone(),
            _ => None,
        };
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<warden_settings::SettingsError> for BrokerError {
    fn from(err: warden_settings::SettingsError) -> Self {
        match err {
            warden_settings::SettingsError::InvalidValue(message) => Self::InvalidParams { message },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_names_the_type() {
        let err = BrokerError::UnsupportedMessageType {
            message_type: "pri(nope)".into(),
        };
        assert_eq!(err.code(), UNSUPPORTED_MESSAGE_TYPE);
        assert!(err.to_string().contains("pri(nope)"));
        let body = err.to_error_body();
        assert_eq!(body.details.unwrap()["messageType"], "pri(nope)");
    }

    #[test]
    fn not_found_message() {
        let err = BrokerError::not_found("pending request", "req-1");
        assert_eq!(err.code(), NOT_FOUND);
        assert_eq!(err.to_string(), "pending request 'req-1' not found");
    }

    #[test]
    fn cancelled_default_message() {
        let err = BrokerError::Cancelled { message: None };
        assert_eq!(err.to_string(), "request cancelled");
        let err = BrokerError::Cancelled {
            message: Some("closed by user".into()),
        };
        assert_eq!(err.to_string(), "closed by user");
        assert_eq!(err.code(), CANCELLED);
    }

    #[test]
    fn collaborator_details_pass_through() {
        let err = BrokerError::Collaborator {
            message: "rpc down".into(),
            details: Some(serde_json::json!({"chain": "polkadot"})),
        };
        let body = err.to_error_body();
        assert_eq!(body.code, COLLABORATOR_ERROR);
        assert_eq!(body.message, "rpc down");
        assert_eq!(body.details.unwrap()["chain"], "polkadot");
    }

    #[test]
    fn plain_errors_have_no_details() {
        let body = BrokerError::invalid_params("missing 'id'").to_error_body();
        assert_eq!(body.code, INVALID_PARAMS);
        assert!(body.details.is_none());
    }

    #[test]
    fn settings_range_error_is_invalid_params() {
        let err: BrokerError =
            warden_settings::SettingsError::InvalidValue("too long".into()).into();
        assert_eq!(err.code(), INVALID_PARAMS);
    }
}
