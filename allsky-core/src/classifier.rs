//! ONNX sky-condition classifier.
//!
//! [`SkyClassifier`] couples a tract-onnx runnable model with its ordered
//! label list. Loading validates the model's declared input shape against
//! the configured preprocessing target, so a shape mismatch is a fatal
//! configuration error at load time rather than a garbage prediction at
//! inference time.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, info};
use thiserror::Error;
use tract_onnx::tract_hir::infer::Factoid;
use tract_onnx::tract_hir::internal::DimLike;
use tract_onnx::prelude::{
    Datum, Framework, Graph, InferenceFact, InferenceModelExt, IntoTensor, SimplePlan, Tensor,
    TypedFact, TypedOp, tvec,
};

use allsky_utils::{
    config::{InputDimensions, MonitorSettings},
    timing_guard,
};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// The label and probability the model assigned to a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// Errors surfaced while loading the classifier resources.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Model or labels file does not exist.
    #[error("classifier resource not found: {0}")]
    MissingResource(PathBuf),
    /// The model's declared input shape disagrees with the configured
    /// preprocessing target. Will not self-heal; an operator must fix the
    /// configuration or swap the model.
    #[error("model input shape {actual} does not match configured {expected}")]
    IncompatibleShape { expected: String, actual: String },
    /// Any other parse or optimization failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Inference seam the monitor loop drives; lets tests stub out the model.
pub trait Classifier: Send {
    /// Classify a preprocessed `[1, H, W, 3]` tensor.
    fn classify(&self, tensor: &Tensor) -> Result<Classification>;
}

/// Factory seam so the monitor loop can own an explicit
/// loaded/unloaded classifier slot and retry loading each cycle.
///
/// The loader receives the settings snapshot the cycle runs against, so a
/// reconfigured model path takes effect on the first reload after the swap.
pub trait ClassifierLoader: Send {
    fn load(&self, settings: &MonitorSettings) -> Result<Box<dyn Classifier>, LoadError>;
}

/// Wrapper around the cloud-detector ONNX model plus its label list.
pub struct SkyClassifier {
    runnable: RunnableModel,
    labels: Vec<String>,
}

impl std::fmt::Debug for SkyClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkyClassifier")
            .field("labels", &self.labels)
            .finish()
    }
}

impl SkyClassifier {
    /// Load model weights and labels, validating the input shape contract.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        model_path: P,
        labels_path: Q,
        input: InputDimensions,
    ) -> Result<Self, LoadError> {
        let model_path = model_path.as_ref();
        let labels_path = labels_path.as_ref();
        if !labels_path.exists() {
            return Err(LoadError::MissingResource(labels_path.to_path_buf()));
        }
        if !model_path.exists() {
            return Err(LoadError::MissingResource(model_path.to_path_buf()));
        }

        let labels = load_labels(labels_path)?;
        if labels.is_empty() {
            return Err(LoadError::Other(anyhow::anyhow!(
                "label file {} is empty",
                labels_path.display()
            )));
        }

        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to parse ONNX graph from {}", model_path.display()))?;

        let height = input.height as usize;
        let width = input.width as usize;
        validate_declared_shape(&model, height, width)?;

        let runnable = model
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec![1, height, width, 3]),
            )
            .map_err(|e| anyhow::anyhow!("unable to pin model input shape: {e}"))?
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("unable to optimize classifier graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make classifier graph runnable: {e}"))?;

        info!(
            "classifier loaded from {} ({} labels, input {}x{})",
            model_path.display(),
            labels.len(),
            input.width,
            input.height
        );
        Ok(Self { runnable, labels })
    }

    /// The ordered labels the model's output vector is aligned with.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl Classifier for SkyClassifier {
    fn classify(&self, tensor: &Tensor) -> Result<Classification> {
        let _guard = timing_guard("allsky_core::classify", log::Level::Debug);
        let outputs = self
            .runnable
            .run(tvec![tensor.clone().into()])
            .map_err(|e| anyhow::anyhow!("classifier execution failed: {e}"))?;

        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("classifier produced no outputs"))?
            .into_tensor();
        let probabilities = output
            .as_slice::<f32>()
            .map_err(|e| anyhow::anyhow!("classifier output not f32: {e}"))?;
        anyhow::ensure!(
            probabilities.len() == self.labels.len(),
            "classifier produced {} probabilities for {} labels",
            probabilities.len(),
            self.labels.len()
        );

        let (index, &confidence) = probabilities
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .ok_or_else(|| anyhow::anyhow!("classifier produced an empty probability vector"))?;

        debug!(
            "prediction: {} ({:.3})",
            self.labels[index], confidence
        );
        Ok(Classification {
            label: self.labels[index].clone(),
            confidence,
        })
    }
}

/// Loader for the production ONNX classifier.
///
/// Stateless: model, label, and input geometry all come from the settings
/// snapshot at load time.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxClassifierLoader;

impl ClassifierLoader for OnnxClassifierLoader {
    fn load(&self, settings: &MonitorSettings) -> Result<Box<dyn Classifier>, LoadError> {
        let classifier =
            SkyClassifier::load(&settings.model_path, &settings.labels_path, settings.input)?;
        Ok(Box::new(classifier))
    }
}

/// Read labels, one per line, stripping an optional leading index token
/// ("0 Clear" and "Clear" both yield "Clear").
fn load_labels(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read labels file {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(strip_label_index)
        .collect())
}

fn strip_label_index(line: &str) -> String {
    match line.split_once(char::is_whitespace) {
        Some((index, rest)) if index.parse::<u32>().is_ok() => rest.trim().to_string(),
        _ => line.to_string(),
    }
}

/// Compare the model's declared input dims (where concrete) against the
/// configured target. Symbolic dims (e.g. a batch of `N`) are accepted.
fn validate_declared_shape(
    model: &tract_onnx::prelude::InferenceModel,
    height: usize,
    width: usize,
) -> Result<(), LoadError> {
    let Ok(fact) = model.input_fact(0) else {
        return Ok(());
    };
    let Some(dims) = fact.shape.concretize() else {
        return Ok(());
    };

    let declared: Vec<Option<usize>> = dims.iter().map(|d| d.to_usize().ok()).collect();
    let expected = [Some(1), Some(height), Some(width), Some(3)];
    let compatible = declared.len() == expected.len()
        && declared
            .iter()
            .zip(expected.iter())
            .all(|(actual, wanted)| match (actual, wanted) {
                (Some(a), Some(w)) => a == w,
                _ => true,
            });

    if !compatible {
        let actual = declared
            .iter()
            .map(|d| d.map_or_else(|| "?".to_string(), |v| v.to_string()))
            .collect::<Vec<_>>()
            .join("x");
        return Err(LoadError::IncompatibleShape {
            expected: format!("1x{height}x{width}x3"),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_model_is_missing_resource() {
        let labels = NamedTempFile::new().expect("labels file");
        std::fs::write(labels.path(), "Clear\n").expect("write labels");

        let err = SkyClassifier::load("missing.onnx", labels.path(), InputDimensions::default())
            .expect_err("missing model should fail");
        assert!(matches!(err, LoadError::MissingResource(_)));
    }

    #[test]
    fn missing_labels_is_missing_resource() {
        let err = SkyClassifier::load(
            "missing.onnx",
            "missing_labels.txt",
            InputDimensions::default(),
        )
        .expect_err("missing labels should fail");
        assert!(matches!(err, LoadError::MissingResource(_)));
    }

    #[test]
    fn invalid_model_produces_useful_error() {
        let labels = NamedTempFile::new().expect("labels file");
        std::fs::write(labels.path(), "Clear\nCloudy\n").expect("write labels");

        let mut model = NamedTempFile::new().expect("model file");
        model
            .write_all(b"not a real onnx file")
            .expect("write mock model");

        let err = SkyClassifier::load(model.path(), labels.path(), InputDimensions::default())
            .expect_err("invalid ONNX should fail");
        let message = format!("{err}");
        assert!(
            message.contains("failed to parse ONNX"),
            "unexpected error message: {message}"
        );
    }

    #[test]
    fn labels_strip_leading_index_tokens() {
        let file = NamedTempFile::new().expect("labels file");
        std::fs::write(
            file.path(),
            "0 Clear\n1 Partially Clear\n2 Clear with Moon\nCloudy\n\n",
        )
        .expect("write labels");

        let labels = load_labels(file.path()).expect("load labels");
        assert_eq!(
            labels,
            vec!["Clear", "Partially Clear", "Clear with Moon", "Cloudy"]
        );
    }

    #[test]
    fn non_numeric_prefix_is_preserved() {
        assert_eq!(strip_label_index("Partly Cloudy"), "Partly Cloudy");
        assert_eq!(strip_label_index("3 Rain"), "Rain");
        assert_eq!(strip_label_index("Rain"), "Rain");
    }
}
