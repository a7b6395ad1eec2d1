//! Code for loading and running a pretrained (TorchScript) image classifier

use crate::config::{MODEL_CONFIG_FILE, MODEL_FILE, PREPROCESSOR_CONFIG_FILE};
use crate::preprocess::ImageProcessor;
use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use tch::{no_grad, Device, IValue, Kind, Tensor};
use tracing::*;

/// Anything that maps a preprocessed batch to per-class logits
pub trait Classifier: Send + Sync + Debug {
    /// Run one forward pass. `input` is `[1, 3, H, W]`, the result is
    /// `[1, num_classes]`
    fn logits(&self, input: &Tensor) -> Result<Tensor>;
}

/// A TorchScript classifier loaded from disk
#[derive(Debug)]
pub struct TorchModel {
    model: tch::jit::CModule,
    device: Device,
}

impl TorchModel {
    pub fn new(filename: impl AsRef<Path>, device: Device) -> Result<Self> {
        let mut model = tch::CModule::load_on_device(filename, device)?;
        model.set_eval();
        Ok(TorchModel { model, device })
    }
}

impl Classifier for TorchModel {
    fn logits(&self, input: &Tensor) -> Result<Tensor> {
        let input = IValue::Tensor(input.to_device(self.device));
        let output = no_grad(|| self.model.forward_is(&[input]))?;

        // Exported transformers models return a tuple or a dict
        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(values) => match values.into_iter().next() {
                Some(IValue::Tensor(t)) => t,
                _ => return Err(anyhow!("model returned a tuple without a logits tensor")),
            },
            IValue::GenericDict(entries) => entries
                .into_iter()
                .find_map(|(key, value)| match (key, value) {
                    (IValue::String(k), IValue::Tensor(t)) if k == "logits" => Some(t),
                    _ => None,
                })
                .ok_or_else(|| anyhow!("model returned a dict without `logits`"))?,
            other => return Err(anyhow!("unexpected model output: {other:?}")),
        };

        Ok(logits.to_device(Device::Cpu))
    }
}

/// The subset of a transformers `config.json` the server cares about
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub id2label: HashMap<String, String>,
    #[serde(default)]
    pub architectures: Vec<String>,
}

impl ModelConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("invalid {}", path.display()))
    }

    /// Human-readable name of a class index, if the model ships one
    pub fn label(&self, index: i64) -> Option<&str> {
        self.id2label.get(&index.to_string()).map(String::as_str)
    }
}

/// A class prediction outputted by the classifier
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Prediction {
    /// Index of the largest logit
    pub index: i64,
    /// Softmax probability at `index`
    pub score: f64,
    pub label: Option<String>,
}

impl Prediction {
    /// Argmax and softmax over the class dimension of a `[1, C]` (or `[C]`)
    /// logits tensor
    pub fn from_logits(logits: &Tensor) -> Result<Self> {
        let logits = match logits.dim() {
            1 => logits.unsqueeze(0),
            2 => logits.shallow_clone(),
            n => return Err(anyhow!("expected logits of rank 1 or 2, got rank {n}")),
        };
        let num_classes = logits.size()[1];
        if num_classes == 0 {
            return Err(anyhow!("model returned no classes"));
        }

        let index = logits.argmax(-1, false).int64_value(&[0]);
        let score = logits.softmax(-1, Kind::Float).double_value(&[0, index]);

        Ok(Prediction {
            index,
            score,
            label: None,
        })
    }
}

/// Everything needed to go from an uploaded image to a `Prediction`. Built
/// once at startup and shared read-only between requests
#[derive(Debug)]
pub struct Predictor {
    classifier: Box<dyn Classifier>,
    processor: ImageProcessor,
    config: ModelConfig,
}

impl Predictor {
    pub fn new(
        classifier: Box<dyn Classifier>,
        processor: ImageProcessor,
        config: ModelConfig,
    ) -> Self {
        Predictor {
            classifier,
            processor,
            config,
        }
    }

    /// Load the model, its architecture config and its image processor from
    /// a directory written by `fetch-model`. No network access
    pub fn load(dir: impl AsRef<Path>, device: Device) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(anyhow!("model directory {} does not exist", dir.display()));
        }

        let model_file = dir.join(MODEL_FILE);
        let classifier = TorchModel::new(&model_file, device)
            .with_context(|| format!("failed to load {}", model_file.display()))?;
        let processor = ImageProcessor::from_path(dir.join(PREPROCESSOR_CONFIG_FILE))?;
        let config = ModelConfig::from_path(dir.join(MODEL_CONFIG_FILE))?;

        info!(
            "loaded model from {} on {:?} ({} labels, architectures {:?})",
            dir.display(),
            device,
            config.id2label.len(),
            config.architectures
        );

        Ok(Self::new(Box::new(classifier), processor, config))
    }

    /// Preprocess, run one forward pass and pick the top class
    #[tracing::instrument(
        skip(self, image),
        fields(width = image.width(), height = image.height())
    )]
    pub fn predict(&self, image: &DynamicImage) -> Result<Prediction> {
        let input = self.processor.preprocess(image)?;
        let logits = self.classifier.logits(&input)?;
        let mut prediction = Prediction::from_logits(&logits)?;
        prediction.label = self.config.label(prediction.index).map(String::from);

        debug!("prediction: {prediction:?}");
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_from_logits() {
        let logits = Tensor::from_slice(&[1.0f32, 3.0, 2.0]).view([1, 3]);
        let prediction = Prediction::from_logits(&logits).unwrap();
        assert_eq!(prediction.index, 1);

        let denom = 1f64.exp() + 3f64.exp() + 2f64.exp();
        let expected = 3f64.exp() / denom;
        assert!((prediction.score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_prediction_tie_picks_first() {
        let logits = Tensor::from_slice(&[0.5f32, 2.0, 2.0, -1.0]);
        let prediction = Prediction::from_logits(&logits).unwrap();
        assert_eq!(prediction.index, 1);
        assert!(prediction.score > 0.0 && prediction.score <= 1.0);
    }

    #[test]
    fn test_prediction_rejects_bad_rank() {
        let logits = Tensor::from_slice(&[0.0f32; 8]).view([2, 2, 2]);
        assert!(Prediction::from_logits(&logits).is_err());
    }

    #[test]
    fn test_model_config_labels() {
        let config: ModelConfig = serde_json::from_str(
            r#"{"architectures": ["ViTForImageClassification"],
                "id2label": {"0": "normal", "1": "nsfw"}}"#,
        )
        .unwrap();
        assert_eq!(config.label(1), Some("nsfw"));
        assert_eq!(config.label(2), None);

        let bare: ModelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(bare.label(0), None);
    }

    #[test]
    fn test_load_missing_dir() {
        let err = Predictor::load("/nonexistent/imgserve/model", Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_load_corrupt_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MODEL_FILE), b"not a torchscript archive").unwrap();
        std::fs::write(dir.path().join(PREPROCESSOR_CONFIG_FILE), "{}").unwrap();
        std::fs::write(dir.path().join(MODEL_CONFIG_FILE), "{}").unwrap();

        assert!(Predictor::load(dir.path(), Device::Cpu).is_err());
    }
}
