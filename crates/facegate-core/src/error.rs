use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::extractor::ExtractorError;
use crate::store::StoreError;
use crate::types::LengthMismatch;

/// Failure of an enrollment or verification request.
#[derive(Error, Debug)]
pub enum FaceIdError {
    #[error("{0}")]
    Validation(String),
    #[error("upload exceeds the {limit_bytes} byte limit")]
    UploadTooLarge { limit_bytes: usize },
    #[error("no face detected in the submitted image")]
    NoFaceDetected,
    #[error("no identities are enrolled")]
    NoEnrolledIdentities,
    #[error("no enrolled identity within the match threshold (closest distance {min_distance:.4})")]
    NoMatchFound { min_distance: f32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    LengthMismatch(#[from] LengthMismatch),
    #[error("descriptor extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Machine-readable error kind reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    UploadTooLarge,
    NoFaceDetected,
    NoEnrolledIdentities,
    NoMatchFound,
    StoreCorrupt,
    StoreUnavailable,
    DescriptorLengthMismatch,
    ExtractionTimeout,
    ExtractorFailed,
    Internal,
}

/// How a caller should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input; the user can fix it and resubmit.
    UserInput,
    /// The operation ran correctly and the answer is "no".
    Rejected,
    /// Safe to retry as is.
    Transient,
    /// Data-integrity or system fault; needs operator attention.
    Fault,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::UploadTooLarge => "upload_too_large",
            ErrorKind::NoFaceDetected => "no_face_detected",
            ErrorKind::NoEnrolledIdentities => "no_enrolled_identities",
            ErrorKind::NoMatchFound => "no_match_found",
            ErrorKind::StoreCorrupt => "store_corrupt",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::DescriptorLengthMismatch => "descriptor_length_mismatch",
            ErrorKind::ExtractionTimeout => "extraction_timeout",
            ErrorKind::ExtractorFailed => "extractor_failed",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::ValidationError | ErrorKind::UploadTooLarge | ErrorKind::NoFaceDetected => {
                ErrorClass::UserInput
            }
            ErrorKind::NoEnrolledIdentities | ErrorKind::NoMatchFound => ErrorClass::Rejected,
            ErrorKind::ExtractionTimeout => ErrorClass::Transient,
            ErrorKind::StoreCorrupt
            | ErrorKind::StoreUnavailable
            | ErrorKind::DescriptorLengthMismatch
            | ErrorKind::ExtractorFailed
            | ErrorKind::Internal => ErrorClass::Fault,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Fixed wording for fault-class errors, safe to show to clients.
    pub fn public_message(self) -> &'static str {
        match self {
            ErrorKind::StoreCorrupt => "identity store is corrupt",
            ErrorKind::StoreUnavailable => "identity store is unavailable",
            ErrorKind::DescriptorLengthMismatch => "stored descriptors are inconsistent",
            ErrorKind::ExtractorFailed => "face descriptor extraction failed",
            ErrorKind::ExtractionTimeout => "face descriptor extraction timed out",
            ErrorKind::Internal => "internal error",
            ErrorKind::ValidationError => "invalid request",
            ErrorKind::UploadTooLarge => "upload is too large",
            ErrorKind::NoFaceDetected => "no face detected in the submitted image",
            ErrorKind::NoEnrolledIdentities => "no identities are enrolled",
            ErrorKind::NoMatchFound => "no matching identity",
        }
    }
}

impl FaceIdError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FaceIdError::Validation(_) => ErrorKind::ValidationError,
            FaceIdError::UploadTooLarge { .. } => ErrorKind::UploadTooLarge,
            FaceIdError::NoFaceDetected => ErrorKind::NoFaceDetected,
            FaceIdError::NoEnrolledIdentities => ErrorKind::NoEnrolledIdentities,
            FaceIdError::NoMatchFound { .. } => ErrorKind::NoMatchFound,
            FaceIdError::Store(StoreError::Corrupt { .. }) => ErrorKind::StoreCorrupt,
            FaceIdError::Store(StoreError::LengthMismatch(_)) | FaceIdError::LengthMismatch(_) => {
                ErrorKind::DescriptorLengthMismatch
            }
            FaceIdError::Store(_) => ErrorKind::StoreUnavailable,
            FaceIdError::ExtractionTimeout(_) => ErrorKind::ExtractionTimeout,
            FaceIdError::Extractor(ExtractorError::InvalidImage(_)) => ErrorKind::ValidationError,
            FaceIdError::Extractor(_) => ErrorKind::ExtractorFailed,
            FaceIdError::Task(_) => ErrorKind::Internal,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind().class()
    }

    /// Message suitable for a client: the error itself for user-facing
    /// kinds, fixed wording for faults so no paths or internals leak.
    pub fn public_message(&self) -> String {
        match self.class() {
            ErrorClass::UserInput | ErrorClass::Rejected => self.to_string(),
            ErrorClass::Transient | ErrorClass::Fault => self.kind().public_message().to_string(),
        }
    }

    /// Emit a log line at a level matching the error class.
    pub fn log(&self, operation: &str) {
        let kind = self.kind().as_str();
        match self.class() {
            ErrorClass::UserInput | ErrorClass::Rejected => {
                tracing::info!(operation, kind, error = %self, "request rejected")
            }
            ErrorClass::Transient => tracing::warn!(operation, kind, error = %self, "request timed out"),
            ErrorClass::Fault => tracing::error!(operation, kind, error = %self, "request failed"),
        }
    }
}
