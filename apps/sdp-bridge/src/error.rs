use std::time::Duration;

use rtc_engine::EngineError;
use thiserror::Error;

/// Failures of a single offer/answer exchange. Each one rejects only the
/// request that hit it; nothing is retried.
#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("malformed signaling payload: {0}")]
    Decode(String),
    #[error("failed to create peer connection: {0}")]
    EngineInit(#[source] EngineError),
    #[error("invalid remote description: {0}")]
    InvalidRemoteDescription(#[source] EngineError),
    #[error("failed to generate answer: {0}")]
    AnswerGeneration(#[source] EngineError),
    #[error("failed to set local description: {0}")]
    LocalDescription(#[source] EngineError),
    #[error("candidate gathering did not complete within {0:?}")]
    GatheringTimeout(Duration),
    #[error("local description missing after candidate gathering")]
    MissingLocalDescription,
    #[error("signaling handler is shutting down")]
    ShuttingDown,
}

impl NegotiateError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiateError::Decode(_) => "decode",
            NegotiateError::EngineInit(_) => "engine_init",
            NegotiateError::InvalidRemoteDescription(_) => "invalid_remote_description",
            NegotiateError::AnswerGeneration(_) => "answer_generation",
            NegotiateError::LocalDescription(_) => "local_description",
            NegotiateError::GatheringTimeout(_) => "gathering_timeout",
            NegotiateError::MissingLocalDescription => "missing_local_description",
            NegotiateError::ShuttingDown => "shutting_down",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, NegotiateError::Decode(_))
    }
}
