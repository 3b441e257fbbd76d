use derive_more::{Display, Error};

/// Everything that can go wrong while moving one message through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum PipelineError {
    #[display(fmt = "bus connection lost: {}", reason)]
    ConnectionLost { reason: String },
    #[display(fmt = "malformed payload: {}", reason)]
    MalformedPayload { reason: String },
    #[display(fmt = "unknown event type: {}", kind)]
    UnknownEventType { kind: String },
    #[display(fmt = "store unavailable: {}", reason)]
    StoreUnavailable { reason: String },
    #[display(fmt = "constraint violation: {}", reason)]
    ConstraintViolation { reason: String },
    #[display(fmt = "acknowledgment failed: {}", reason)]
    AckFailure { reason: String },
}

impl PipelineError {
    pub fn connection_lost(reason: impl ToString) -> Self {
        Self::ConnectionLost {
            reason: reason.to_string(),
        }
    }

    pub fn malformed(reason: impl ToString) -> Self {
        Self::MalformedPayload {
            reason: reason.to_string(),
        }
    }

    pub fn store_unavailable(reason: impl ToString) -> Self {
        Self::StoreUnavailable {
            reason: reason.to_string(),
        }
    }

    pub fn ack_failure(reason: impl ToString) -> Self {
        Self::AckFailure {
            reason: reason.to_string(),
        }
    }

    /// Retrying the same message may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. } | Self::StoreUnavailable { .. } | Self::AckFailure { .. }
        )
    }

    /// Decode failures: the payload itself is the problem.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            Self::MalformedPayload { .. } | Self::UnknownEventType { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
