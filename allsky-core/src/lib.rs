//! Core allsky monitoring pipeline.
//!
//! This crate fetches the latest all-sky camera frame over SFTP, converts it
//! into the tensor the cloud classifier was trained on, runs inference with
//! `tract-onnx`, maps the predicted condition onto a safe/unsafe verdict, and
//! drives the periodic monitor loop that publishes each verdict.

/// ONNX classifier loading and inference.
pub mod classifier;
/// Safety allow-list and verdict construction.
pub mod decision;
/// Remote image retrieval with bounded retries.
pub mod fetch;
/// The periodic monitoring cycle and daemon loop.
pub mod monitor;
/// Image pre-processing (crop, resize, tensor conversion).
pub mod preprocess;

pub use classifier::{
    Classification, Classifier, ClassifierLoader, LoadError, OnnxClassifierLoader, SkyClassifier,
};
pub use decision::{SafeConditionSet, decide};
pub use fetch::{FetchError, FetchRequest, ImageSource, SftpSource, fetch_with_retry};
pub use monitor::{Monitor, MonitorEvent, SettingsSlot};
pub use preprocess::{
    PreprocessConfig, PreprocessError, preprocess_dynamic_image, preprocess_image,
};
