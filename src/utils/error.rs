//! Error types and handling
//!
//! Common error types used across the crate. Module errors convert into
//! [`AppError`], and [`ErrorResponse`] is the serializable form handed to
//! callers of the command layer.

use crate::capture::CaptureError;
use crate::compositor::CompositeError;
use crate::encoder::EncoderError;
use crate::merger::MergeError;
use crate::recorder::RecorderError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Watermark error: {0}")]
    Compositor(#[from] CompositeError),

    #[error("Recording error: {0}")]
    Recorder(RecorderError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<RecorderError> for AppError {
    fn from(error: RecorderError) -> Self {
        match error {
            RecorderError::Capture(e) => AppError::Capture(e),
            RecorderError::Encoder(e) => AppError::Encoder(e),
            RecorderError::Merge(e) => AppError::Merge(e),
            RecorderError::Composite(e) => AppError::Compositor(e),
            RecorderError::Io(e) => AppError::Io(e),
            RecorderError::Config(message) => AppError::Configuration(message),
            other => AppError::Recorder(other),
        }
    }
}

/// Error response for callers of the command layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Capture(_) => "CAPTURE_ERROR",
            AppError::Encoder(_) => "ENCODER_ERROR",
            AppError::Merge(_) => "MERGE_ERROR",
            AppError::Compositor(_) => "WATERMARK_ERROR",
            AppError::Recorder(_) => "RECORDING_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<RecorderError> for ErrorResponse {
    fn from(error: RecorderError) -> Self {
        AppError::from(error).into()
    }
}

impl From<CompositeError> for ErrorResponse {
    fn from(error: CompositeError) -> Self {
        AppError::from(error).into()
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_recorder_errors_keep_their_source_code() {
        let response = ErrorResponse::from(RecorderError::Capture(CaptureError::NotReady(
            Duration::from_secs(3),
        )));
        assert_eq!(response.code, "CAPTURE_ERROR");
        assert!(response.message.contains("not ready"));

        let response = ErrorResponse::from(RecorderError::AlreadyRecording);
        assert_eq!(response.code, "RECORDING_ERROR");
        assert_eq!(response.message, "Recording error: Already recording");
    }

    #[test]
    fn test_error_response_serializes() {
        let response = ErrorResponse::from(AppError::Configuration("fps must be > 0".to_string()));
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            r#"{"code":"CONFIGURATION_ERROR","message":"Configuration error: fps must be > 0"}"#
        );
    }
}
