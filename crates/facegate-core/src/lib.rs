//! facegate-core: face identity enrollment and verification engine.
//!
//! Holds the identity store, the Euclidean nearest-neighbour matcher and the
//! enrollment / verification services. Descriptor extraction is reached
//! through the [`DescriptorExtractor`] trait; the ONNX implementation lives
//! in `facegate-models`.

pub mod config;
pub mod error;
pub mod extractor;
pub mod matcher;
pub mod service;
pub mod store;
pub mod types;

pub use config::{Config, ConfigError};
pub use error::{ErrorClass, ErrorKind, FaceIdError};
pub use extractor::{DescriptorExtractor, ExtractorError, ExtractorLoader, ModelSlot, ModelState};
pub use matcher::{EuclideanMatcher, MatchOutcome, Matcher};
pub use service::{Enrollment, EnrollmentService, MatchPolicy, Verification, VerificationService};
pub use store::{open_store, IdentityStore, JsonFileStore, SqliteStore, StoreBackend, StoreError};
pub use types::{Descriptor, IdentityRecord, LengthMismatch};
