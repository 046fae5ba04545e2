//! Detection → alignment → embedding, behind the core extractor trait.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use facegate_core::{Descriptor, DescriptorExtractor, ExtractorError, ExtractorLoader};
use image::RgbImage;

use crate::alignment::align_face;
use crate::detector::{most_prominent, DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

impl From<DetectorError> for ExtractorError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => {
                ExtractorError::ModelLoad(format!("detector model not found: {path}"))
            }
            other => ExtractorError::Inference(format!("detection: {other}")),
        }
    }
}

impl From<RecognizerError> for ExtractorError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => {
                ExtractorError::ModelLoad(format!("recognizer model not found: {path}"))
            }
            other => ExtractorError::Inference(format!("recognition: {other}")),
        }
    }
}

/// ONNX-backed extractor. Sessions need `&mut` to run, so each sits behind
/// its own mutex.
pub struct OnnxExtractor {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxExtractor {
    pub fn load(model_dir: &Path) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

/// Loader for [`facegate_core::ModelSlot`] reading models from `model_dir`.
pub fn loader(model_dir: PathBuf) -> impl ExtractorLoader + 'static {
    move || -> Result<Arc<dyn DescriptorExtractor>, ExtractorError> {
        tracing::debug!(dir = %model_dir.display(), "reading model files");
        Ok(Arc::new(OnnxExtractor::load(&model_dir)?))
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn extract(&self, image: &[u8]) -> Result<Option<Descriptor>, ExtractorError> {
        let rgb = decode(image)?;

        let faces = self
            .detector
            .lock()
            .map_err(|_| ExtractorError::Inference("detector lock poisoned".into()))?
            .detect(&rgb)?;

        let Some(face) = most_prominent(&faces) else {
            return Ok(None);
        };
        tracing::debug!(
            faces = faces.len(),
            confidence = face.confidence,
            "selected most prominent face"
        );

        // A box without landmarks can't be aligned; treat it as no usable face.
        let Some(aligned) = face.landmarks.as_ref().and_then(|lm| align_face(&rgb, lm)) else {
            return Ok(None);
        };

        let values = self
            .recognizer
            .lock()
            .map_err(|_| ExtractorError::Inference("recognizer lock poisoned".into()))?
            .embed(&aligned)?;
        Ok(Some(Descriptor::new(values)))
    }
}

fn decode(image: &[u8]) -> Result<RgbImage, ExtractorError> {
    image::load_from_memory(image)
        .map(|img| img.to_rgb8())
        .map_err(|e| ExtractorError::InvalidImage(e.to_string()))
}
