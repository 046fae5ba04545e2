//! Descriptor extractor contract and its load lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};

use crate::types::Descriptor;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("failed to load face models: {0}")]
    ModelLoad(String),
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Turns raw image bytes into a face descriptor.
///
/// Implementations return `Ok(None)` when no face is found. Extraction is
/// CPU-bound and blocking; async callers run it on the blocking pool.
pub trait DescriptorExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Option<Descriptor>, ExtractorError>;
}

/// Builds an extractor, typically by loading model files.
pub trait ExtractorLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn DescriptorExtractor>, ExtractorError>;
}

impl<F> ExtractorLoader for F
where
    F: Fn() -> Result<Arc<dyn DescriptorExtractor>, ExtractorError> + Send + Sync,
{
    fn load(&self) -> Result<Arc<dyn DescriptorExtractor>, ExtractorError> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Uninitialized,
    Loading,
    Ready,
}

/// Extractions allowed in flight at once, counting ones whose caller has
/// already timed out.
pub const DEFAULT_MAX_IN_FLIGHT_EXTRACTIONS: usize = 4;

/// Process-wide holder for the extractor: `Uninitialized → Loading → Ready`.
///
/// The first [`ensure_ready`](Self::ensure_ready) starts the loader on its
/// own task; concurrent callers wait on the same load. The load runs to
/// completion even if every waiting caller is dropped, so a finished load is
/// never thrown away. A failed load returns the slot to `Uninitialized` so
/// the next call tries again.
pub struct ModelSlot {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

struct Shared {
    loader: Arc<dyn ExtractorLoader>,
    extractor: OnceCell<Arc<dyn DescriptorExtractor>>,
    loading: AtomicBool,
}

/// Clears the loading flag however the load ends.
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Shared {
    async fn load(&self) -> Result<Arc<dyn DescriptorExtractor>, ExtractorError> {
        let extractor = self
            .extractor
            .get_or_try_init(|| async {
                let _flag = LoadingFlag::raise(&self.loading);
                tracing::info!("loading face models");
                let loader = Arc::clone(&self.loader);
                let result = tokio::task::spawn_blocking(move || loader.load())
                    .await
                    .map_err(|e| ExtractorError::ModelLoad(format!("loader task failed: {e}")))
                    .and_then(|r| r);
                match &result {
                    Ok(_) => tracing::info!("face models ready"),
                    Err(err) => tracing::error!(error = %err, "face model load failed"),
                }
                result
            })
            .await?;
        Ok(Arc::clone(extractor))
    }
}

impl ModelSlot {
    pub fn new(loader: impl ExtractorLoader + 'static) -> Self {
        Self::with_cell(Arc::new(loader), OnceCell::new())
    }

    /// A slot that starts out `Ready` with the given extractor.
    pub fn ready(extractor: Arc<dyn DescriptorExtractor>) -> Self {
        let reload = Arc::clone(&extractor);
        Self::with_cell(
            Arc::new(
                move || -> Result<Arc<dyn DescriptorExtractor>, ExtractorError> {
                    Ok(Arc::clone(&reload))
                },
            ),
            OnceCell::new_with(Some(extractor)),
        )
    }

    fn with_cell(
        loader: Arc<dyn ExtractorLoader>,
        extractor: OnceCell<Arc<dyn DescriptorExtractor>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                loader,
                extractor,
                loading: AtomicBool::new(false),
            }),
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT_EXTRACTIONS)),
        }
    }

    /// Cap the number of extractions running at once.
    pub fn with_extraction_limit(mut self, limit: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Permits bounding in-flight extractions. A permit is held until the
    /// blocking extraction returns, not until its caller gives up.
    pub fn extraction_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }

    pub fn state(&self) -> ModelState {
        if self.shared.extractor.initialized() {
            ModelState::Ready
        } else if self.shared.loading.load(Ordering::Acquire) {
            ModelState::Loading
        } else {
            ModelState::Uninitialized
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    /// Load the extractor if needed and return it.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn DescriptorExtractor>, ExtractorError> {
        if let Some(extractor) = self.shared.extractor.get() {
            return Ok(Arc::clone(extractor));
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.load().await })
            .await
            .map_err(|e| ExtractorError::ModelLoad(format!("load task failed: {e}")))?
    }
}
