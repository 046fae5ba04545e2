//! facegate-models: ONNX face pipeline for Facegate.
//!
//! SCRFD finds faces and their landmarks, the most prominent face is warped
//! onto the ArcFace template, and ArcFace turns the crop into a 512-value
//! descriptor. [`OnnxExtractor`] exposes the pipeline as a
//! [`facegate_core::DescriptorExtractor`].

pub mod alignment;
pub mod detector;
pub mod pipeline;
pub mod recognizer;

pub use detector::{FaceBox, FaceDetector, Landmarks};
pub use pipeline::{loader, OnnxExtractor, DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE};
pub use recognizer::FaceRecognizer;
