//! Validation error type shared across the frame orchestrator core.
//!
//! spec.md §7 groups errors into six categories, but only validation is a
//! single cross-cutting type in this workspace: malformed frames and
//! processor descriptors are rejected at the boundary before the value
//! reaches the registry, queue, or router, so every crate that validates
//! input shares one [`ValidationError`] rather than redefining it. The
//! other five categories are behaviorally distinct per component instead
//! of sharing a code type, matching how the rest of the workspace models
//! errors (one enum per crate, the way the teacher's `ckb-error` composes
//! with per-crate error types rather than forcing everything through a
//! single umbrella): capacity and processor failures surface as
//! [`frame_router::RouteOutcome`] variants the router never turns into an
//! `Err`; transient substrate failures and protocol violations are
//! [`frame_store::StoreError::Transient`] / `::Protocol`, retried or
//! surfaced exactly where the Store client already classifies them; fatal
//! startup failures are logged and turn into the binary's non-zero exit
//! code rather than a propagated error value.

use thiserror::Error;

/// Malformed frame or processor descriptor. Raised at the boundary (frame
/// deserialization, processor registration) before the value can reach the
/// registry, queue, or router.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("processor id cannot be empty")]
    EmptyProcessorId,
    #[error("processor must advertise at least one capability")]
    EmptyCapabilities,
    #[error("processor capacity must be positive, got {0}")]
    NonPositiveCapacity(i64),
    #[error("frame dimensions must be positive, got {width}x{height}")]
    NegativeDimensions { width: i64, height: i64 },
    #[error("frame metadata is missing 'detection_type'")]
    MissingDetectionType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_processor_id_message() {
        let err = ValidationError::EmptyProcessorId;
        assert_eq!(err.to_string(), "processor id cannot be empty");
    }

    #[test]
    fn invalid_field_message_names_field_and_reason() {
        let err = ValidationError::InvalidField {
            field: "width",
            reason: "not a non-negative integer".to_string(),
        };
        assert_eq!(err.to_string(), "field 'width' is invalid: not a non-negative integer");
    }
}
