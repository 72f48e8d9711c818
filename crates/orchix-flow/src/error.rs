use thiserror::Error;

use crate::wire::{ConflictCheckResult, ErrorOrigin, OperationFailure};

/// Coarse class of a failure, used to decide how it is surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Local input problem; never reaches the network.
    Validation,
    /// Backend-confirmed name/port clash; fixed by editing input.
    Conflict,
    /// Backend reported a failure for the requested action.
    Operation,
    /// Network, decoding or session failure.
    Transport,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("{0}")]
    Validation(String),

    #[error("{}", describe_conflict(.0))]
    Conflict(ConflictCheckResult),

    #[error("{0}")]
    Operation(String),

    #[error("{0}")]
    Transport(String),

    #[error("session expired; sign in again")]
    Unauthorized,

    #[error("an install is already in progress for {0}")]
    SessionActive(String),

    #[error("another operation is running on {0}")]
    Busy(String),

    #[error("cannot move install flow from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl FlowError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FlowError::Validation(_)
            | FlowError::SessionActive(_)
            | FlowError::Busy(_)
            | FlowError::InvalidTransition { .. } => ErrorClass::Validation,
            FlowError::Conflict(_) => ErrorClass::Conflict,
            FlowError::Operation(_) => ErrorClass::Operation,
            FlowError::Transport(_)
            | FlowError::Unauthorized
            | FlowError::Decode(_)
            | FlowError::Http(_) => ErrorClass::Transport,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        FlowError::Validation(message.into())
    }
}

/// Terminal stream failures keep their origin when raised as errors.
impl From<OperationFailure> for FlowError {
    fn from(failure: OperationFailure) -> Self {
        match failure.origin {
            ErrorOrigin::Operation => FlowError::Operation(failure.message),
            ErrorOrigin::Transport => FlowError::Transport(failure.message),
        }
    }
}

fn describe_conflict(result: &ConflictCheckResult) -> String {
    match (result.name_conflict, result.port_conflict) {
        (true, true) => "instance name and port are already in use".into(),
        (true, false) => "instance name is already in use".into(),
        (false, true) => "port is already in use".into(),
        (false, false) => "no conflict".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            FlowError::validation("Select at least one container").class(),
            ErrorClass::Validation
        );
        assert_eq!(
            FlowError::Conflict(ConflictCheckResult {
                name_conflict: true,
                port_conflict: false
            })
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            FlowError::from(OperationFailure::operation("boom")).class(),
            ErrorClass::Operation
        );
        assert_eq!(FlowError::Unauthorized.class(), ErrorClass::Transport);
    }

    #[test]
    fn stream_failures_keep_origin_and_message() {
        let err = FlowError::from(OperationFailure::operation("Container not found"));
        assert!(matches!(&err, FlowError::Operation(message) if message == "Container not found"));
        assert_eq!(err.to_string(), "Container not found");

        let err = FlowError::from(OperationFailure::transport("Update failed: connection reset"));
        assert_eq!(err.class(), ErrorClass::Transport);
        assert_eq!(err.to_string(), "Update failed: connection reset");
    }

    #[test]
    fn conflict_message_names_both_fields() {
        let err = FlowError::Conflict(ConflictCheckResult {
            name_conflict: true,
            port_conflict: true,
        });
        assert_eq!(err.to_string(), "instance name and port are already in use");
    }
}
