use oadr_transport::{OadrTransportError, Service};

use crate::replay::ReplayError;
use crate::types::ResponseCode;

/// A payload failed a structural rule of the data model.
///
/// These are fatal at construction time. Nothing invalid is ever queued or sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("'{value}' is not a valid {kind}")]
    UnknownEnumValue { kind: &'static str, value: String },

    #[error("an event needs either targets or targets_by_type")]
    MissingTargets,

    #[error("targets ({targets}) and targets_by_type ({by_type}) describe different target sets")]
    InconsistentTargets { targets: String, by_type: String },

    #[error("an event needs at least one signal")]
    NoSignals,

    #[error("signal {signal_id} has no intervals")]
    NoIntervals { signal_id: String },

    #[error("no active period given and the first interval of signal {signal_id} has no start time")]
    MissingStart { signal_id: String },

    #[error("sampling rate minimum {min_secs}s exceeds maximum {max_secs}s")]
    InvalidSamplingRate { min_secs: u64, max_secs: u64 },

    #[error("r_id {r_id} already exists in report {report_specifier_id}")]
    DuplicateRId { report_specifier_id: String, r_id: String },

    #[error("a report with specifier {report_specifier_id} already exists under a different name")]
    ReportNameConflict { report_specifier_id: String },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

/// Protocol-level errors for OpenADR engines.
///
/// Wraps transport errors and adds the protocol taxonomy: response codes,
/// validation, security and serialization.
#[derive(Debug, thiserror::Error)]
pub enum OadrError {
    #[error("transport error: {0}")]
    Transport(#[from] OadrTransportError),

    #[error("{code}: {description}")]
    Protocol {
        code: ResponseCode,
        description: String,
    },

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("replay rejected: {0}")]
    Replay(#[from] ReplayError),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("message is not signed")]
    Unsigned,

    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("invalid key material: {0}")]
    Key(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no usable reply from the VTN on {0}")]
    NoReply(Service),

    #[error("not registered with a VTN")]
    NotRegistered,

    #[error("engine has shut down")]
    Shutdown,
}

impl OadrError {
    pub fn protocol(code: ResponseCode, description: impl Into<String>) -> Self {
        OadrError::Protocol {
            code,
            description: description.into(),
        }
    }

    /// The response code a server reports back for this error.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            OadrError::Protocol { code, .. } => *code,
            OadrError::Validation(_) | OadrError::Deserialization(_) => ResponseCode::InvalidData,
            OadrError::NotRegistered => ResponseCode::NotRegisteredOrAuthorized,
            _ => ResponseCode::DeploymentError,
        }
    }

    /// Signature, fingerprint and replay failures. Messages failing these are
    /// discarded without a reply.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            OadrError::InvalidSignature
                | OadrError::Unsigned
                | OadrError::FingerprintMismatch { .. }
                | OadrError::Replay(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for OadrError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        OadrError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for OadrError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        OadrError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_displays_code_and_description() {
        let err = OadrError::protocol(ResponseCode::InvalidId, "unknown event e1");
        assert_eq!(err.to_string(), "452 Invalid ID: unknown event e1");
        assert_eq!(err.response_code(), ResponseCode::InvalidId);
    }

    #[test]
    fn validation_maps_to_invalid_data() {
        let err: OadrError = ValidationError::NoSignals.into();
        assert_eq!(err.to_string(), "validation error: an event needs at least one signal");
        assert_eq!(err.response_code(), ResponseCode::InvalidData);
        assert!(!err.is_security());
    }

    #[test]
    fn security_errors_are_flagged() {
        assert!(OadrError::InvalidSignature.is_security());
        assert!(OadrError::Replay(ReplayError::AlreadyUsed).is_security());
        assert!(OadrError::FingerprintMismatch {
            expected: "AA".into(),
            actual: "BB".into()
        }
        .is_security());
        assert!(!OadrError::Shutdown.is_security());
    }

    #[test]
    fn from_transport_error() {
        let err: OadrError = OadrTransportError::Shutdown.into();
        assert!(matches!(err, OadrError::Transport(_)));
    }
}
