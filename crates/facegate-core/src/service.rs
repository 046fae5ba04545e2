//! Enrollment and verification services.
//!
//! Both are stateless per request. The extractor runs on the blocking pool
//! under a timeout and never while a store lock is held; store calls run on
//! the blocking pool as well. An extraction that outlives its timeout keeps
//! its permit until it returns, so abandoned work cannot pile up threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::FaceIdError;
use crate::extractor::{ExtractorError, ModelSlot};
use crate::matcher::{EuclideanMatcher, MatchOutcome, Matcher};
use crate::store::{IdentityStore, StoreError};
use crate::types::{Descriptor, IdentityRecord};

/// Default maximum Euclidean distance for a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Threshold policy applied to the best match distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl MatchPolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// A match requires a distance strictly below the threshold.
    pub fn accepts(&self, distance: f32) -> bool {
        distance < self.threshold
    }

    /// `1 - distance`. Illustrative only, not a probability: it ranges over
    /// `(-inf, 1]` and goes negative once the distance exceeds 1. It is
    /// reported as is, never clamped.
    pub fn confidence(distance: f32) -> f32 {
        1.0 - distance
    }
}

/// Successful enrollment.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub record: IdentityRecord,
    pub elapsed: Duration,
}

/// Successful verification.
#[derive(Debug, Clone)]
pub struct Verification {
    pub name: String,
    pub distance: f32,
    pub confidence: f32,
    pub elapsed: Duration,
}

/// Extractor access shared by both services.
#[derive(Clone)]
struct Extraction {
    models: Arc<ModelSlot>,
    timeout: Duration,
}

impl Extraction {
    async fn run(&self, image: Vec<u8>) -> Result<Descriptor, FaceIdError> {
        let extractor = self.models.ensure_ready().await?;
        let permits = self.models.extraction_permits();
        let work = async move {
            // Waiting for a permit counts against the timeout too.
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| FaceIdError::Task("extraction permits closed".into()))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                extractor.extract(&image)
            })
            .await
            .map_err(|join| FaceIdError::Task(format!("extractor task: {join}")))
        };

        let descriptor = match tokio::time::timeout(self.timeout, work).await {
            Err(_) => return Err(FaceIdError::ExtractionTimeout(self.timeout)),
            Ok(joined) => joined??.ok_or(FaceIdError::NoFaceDetected)?,
        };

        if descriptor.is_empty() || descriptor.values().iter().any(|v| !v.is_finite()) {
            return Err(ExtractorError::Inference(
                "extractor produced an empty or non-finite descriptor".into(),
            )
            .into());
        }
        Ok(descriptor)
    }
}

async fn blocking_store<T, F>(store: &Arc<dyn IdentityStore>, op: F) -> Result<T, FaceIdError>
where
    T: Send + 'static,
    F: FnOnce(&dyn IdentityStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|join| FaceIdError::Task(format!("store task: {join}")))?
        .map_err(FaceIdError::from)
}

fn require_image(image: Option<Vec<u8>>) -> Result<Vec<u8>, FaceIdError> {
    match image {
        Some(bytes) if !bytes.is_empty() => Ok(bytes),
        _ => Err(FaceIdError::Validation("an image is required".into())),
    }
}

/// Extracts a descriptor and appends it under the claimed name.
///
/// No uniqueness check: the same name may be enrolled any number of times
/// and every record takes part in matching.
#[derive(Clone)]
pub struct EnrollmentService {
    extraction: Extraction,
    store: Arc<dyn IdentityStore>,
}

impl EnrollmentService {
    pub fn new(models: Arc<ModelSlot>, store: Arc<dyn IdentityStore>, timeout: Duration) -> Self {
        Self {
            extraction: Extraction { models, timeout },
            store,
        }
    }

    /// Enroll `name` from `image`. Nothing is written unless a descriptor
    /// was extracted; the name is stored trimmed.
    pub async fn enroll(
        &self,
        image: Option<Vec<u8>>,
        name: &str,
    ) -> Result<Enrollment, FaceIdError> {
        let started = Instant::now();
        let name = name.trim();
        if name.is_empty() {
            return Err(FaceIdError::Validation("a non-empty name is required".into()));
        }
        let image = require_image(image)?;

        let descriptor = self.extraction.run(image).await?;
        let record = IdentityRecord::new(name, descriptor);

        let to_store = record.clone();
        blocking_store(&self.store, move |store| store.append(&to_store)).await?;

        let elapsed = started.elapsed();
        tracing::info!(
            name = %record.name,
            dims = record.descriptor.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "identity enrolled"
        );
        Ok(Enrollment { record, elapsed })
    }

    pub async fn clear(&self) -> Result<(), FaceIdError> {
        blocking_store(&self.store, |store| store.clear()).await?;
        tracing::info!("identity store cleared");
        Ok(())
    }
}

/// Extracts a descriptor and finds the closest enrolled identity.
#[derive(Clone)]
pub struct VerificationService {
    extraction: Extraction,
    store: Arc<dyn IdentityStore>,
    matcher: Arc<dyn Matcher>,
    policy: MatchPolicy,
}

impl VerificationService {
    pub fn new(
        models: Arc<ModelSlot>,
        store: Arc<dyn IdentityStore>,
        timeout: Duration,
        policy: MatchPolicy,
    ) -> Self {
        Self {
            extraction: Extraction { models, timeout },
            store,
            matcher: Arc::new(EuclideanMatcher),
            policy,
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub async fn verify(&self, image: Option<Vec<u8>>) -> Result<Verification, FaceIdError> {
        let started = Instant::now();
        let image = require_image(image)?;
        let query = self.extraction.run(image).await?;

        let records = blocking_store(&self.store, |store| store.load_all()).await?;
        if records.is_empty() {
            return Err(FaceIdError::NoEnrolledIdentities);
        }

        let (record, distance) = match self.matcher.find_best_match(&query, &records)? {
            MatchOutcome::Best { record, distance } => (record, distance),
            MatchOutcome::NoCandidates => return Err(FaceIdError::NoEnrolledIdentities),
        };

        tracing::debug!(
            candidates = records.len(),
            best = %record.name,
            distance,
            threshold = self.policy.threshold,
            "best match computed"
        );

        if !self.policy.accepts(distance) {
            return Err(FaceIdError::NoMatchFound {
                min_distance: distance,
            });
        }

        let elapsed = started.elapsed();
        tracing::info!(
            name = %record.name,
            distance,
            elapsed_ms = elapsed.as_millis() as u64,
            "identity verified"
        );
        Ok(Verification {
            name: record.name.clone(),
            distance,
            confidence: MatchPolicy::confidence(distance),
            elapsed,
        })
    }
}
