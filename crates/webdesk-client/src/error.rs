use thiserror::Error;
use webdesk_core::ValidationError;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Logged; retried or ignored on background paths.
    Transport,
    /// Surfaced; the desktop returns to the signed-out state.
    Auth,
    /// Surfaced inline to the action that caused it.
    Validation,
    /// The record is already gone; local state still transitions.
    Reconciliation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("not authenticated: {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Auth(_) => ErrorClass::Auth,
            GatewayError::Validation(_)
            | GatewayError::Forbidden(_)
            | GatewayError::Conflict(_) => ErrorClass::Validation,
            GatewayError::NotFound(_) => ErrorClass::Reconciliation,
            GatewayError::Transport(_) | GatewayError::Status { .. } | GatewayError::Decode(_) => {
                ErrorClass::Transport
            }
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, GatewayError::Auth(_))
    }

    /// Maps a non-success HTTP status and its `detail` message.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => GatewayError::Auth(message),
            400 | 422 => GatewayError::Validation(message),
            403 => GatewayError::Forbidden(message),
            404 => GatewayError::NotFound(message),
            409 => GatewayError::Conflict(message),
            _ => GatewayError::Status { status, message },
        }
    }
}

impl From<ValidationError> for GatewayError {
    fn from(err: ValidationError) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(
            GatewayError::from_status(401, "Invalid token"),
            GatewayError::Auth("Invalid token".to_string())
        );
        assert_eq!(GatewayError::from_status(422, "x").class(), ErrorClass::Validation);
        assert_eq!(
            GatewayError::from_status(409, "Username already exists").class(),
            ErrorClass::Validation
        );
        assert_eq!(GatewayError::from_status(404, "gone").class(), ErrorClass::Reconciliation);
        assert_eq!(
            GatewayError::from_status(502, "bad gateway"),
            GatewayError::Status {
                status: 502,
                message: "bad gateway".to_string()
            }
        );
        assert_eq!(GatewayError::from_status(500, "boom").class(), ErrorClass::Transport);
    }

    #[test]
    fn auth_is_distinct_from_transport() {
        assert!(GatewayError::Auth("missing token".to_string()).is_auth());
        assert!(!GatewayError::Transport("connection refused".to_string()).is_auth());
    }

    #[test]
    fn validation_errors_convert() {
        let err: GatewayError = ValidationError::PathTraversal.into();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.to_string().contains(".."));
    }
}
