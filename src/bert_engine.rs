use anyhow::{Context, Result, bail};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::ops::softmax;
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use std::path::PathBuf;
use tokenizers::{PaddingParams, Tokenizer};

#[derive(Debug, Clone)]
pub struct BertEngineConfig {
    /// Directory holding config.json, tokenizer.json and the weights file.
    pub model_dir: PathBuf,
    pub cpu: bool,
    pub max_sequence_length: usize,
    /// Head width when config.json carries no id2label.
    pub fallback_num_classes: usize,
}

/// Fine-tuned BERT sequence classifier loaded from the artifacts directory.
pub struct BertClassifier {
    bert: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
    num_classes: usize,
}

impl BertClassifier {
    fn device(cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else if metal_is_available() {
            tracing::info!("Using metal acceleration");
            Ok(Device::new_metal(0)?)
        } else if cuda_is_available() {
            tracing::info!("Using CUDA GPU acceleration");
            Ok(Device::new_cuda(0)?)
        } else {
            tracing::info!(
                "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
            );
            Ok(Device::Cpu)
        }
    }

    #[tracing::instrument(skip(config), fields(model_dir = %config.model_dir.display()))]
    pub fn load(config: &BertEngineConfig) -> Result<Self> {
        let base = &config.model_dir;
        if !base.is_dir() {
            bail!("transformer model directory {} not found", base.display());
        }

        let device = Self::device(config.cpu)?;

        let config_file = base.join("config.json");
        let tokenizer_file = base.join("tokenizer.json");
        // Safetensors weights preferred, PyTorch as the fallback layout.
        let (weights_file, use_pth) = if base.join("model.safetensors").exists() {
            (base.join("model.safetensors"), false)
        } else if base.join("pytorch_model.bin").exists() {
            (base.join("pytorch_model.bin"), true)
        } else {
            bail!("no model.safetensors or pytorch_model.bin in {}", base.display());
        };

        let raw_config = std::fs::read_to_string(&config_file)
            .with_context(|| format!("reading {}", config_file.display()))?;
        let model_config: BertConfig = serde_json::from_str(&raw_config)
            .with_context(|| format!("parsing {}", config_file.display()))?;
        let num_classes = num_classes_from_config(&raw_config, config.fallback_num_classes);

        let mut tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams::default()));
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: config.max_sequence_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Tokenizer truncation error: {e}"))?;

        let vb = if use_pth {
            VarBuilder::from_pth(&weights_file, DTYPE, &device)?
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], DTYPE, &device)? }
        };

        let bert = BertModel::load(vb.pp("bert"), &model_config)?;
        let pooler = candle_nn::linear(
            model_config.hidden_size,
            model_config.hidden_size,
            vb.pp("bert").pp("pooler").pp("dense"),
        )?;
        let classifier =
            candle_nn::linear(model_config.hidden_size, num_classes, vb.pp("classifier"))?;

        Ok(Self {
            bert,
            pooler,
            classifier,
            tokenizer,
            device,
            num_classes,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Classify a batch of texts, returning the arg-max class index and its
    /// softmax probability per text, in input order.
    #[tracing::instrument(skip(self, texts), fields(batch_size = texts.len()))]
    pub fn classify_batch(&self, texts: &[String]) -> Result<Vec<(usize, f32)>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

        let mut id_rows = Vec::with_capacity(encodings.len());
        let mut mask_rows = Vec::with_capacity(encodings.len());
        let mut type_rows = Vec::with_capacity(encodings.len());
        for encoding in &encodings {
            id_rows.push(Tensor::new(encoding.get_ids(), &self.device)?);
            mask_rows.push(Tensor::new(encoding.get_attention_mask(), &self.device)?);
            type_rows.push(Tensor::new(encoding.get_type_ids(), &self.device)?);
        }

        let input_ids = Tensor::stack(&id_rows, 0)?;
        let attention_mask = Tensor::stack(&mask_rows, 0)?;
        let token_type_ids = Tensor::stack(&type_rows, 0)?;

        let sequence_output =
            self.bert
                .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // Standard BERT pooling: CLS token -> dense -> tanh -> classifier.
        let cls_token = sequence_output.i((.., 0))?;
        let pooled = self.pooler.forward(&cls_token)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?.to_dtype(DType::F32)?;

        let predictions = logits.argmax(1)?.to_vec1::<u32>()?;
        let probabilities = softmax(&logits, 1)?.to_vec2::<f32>()?;

        Ok(predictions
            .into_iter()
            .zip(probabilities)
            .map(|(class, probs)| {
                let class = class as usize;
                let confidence = probs.get(class).copied().unwrap_or(0.0);
                (class, confidence)
            })
            .collect())
    }
}

/// Count the classifier head's classes from the raw config JSON. The typed
/// candle config drops id2label, so it is read from the untyped document.
fn num_classes_from_config(raw_config: &str, fallback: usize) -> usize {
    serde_json::from_str::<serde_json::Value>(raw_config)
        .ok()
        .and_then(|value| {
            value
                .get("id2label")
                .and_then(|m| m.as_object())
                .map(|m| m.len())
        })
        .filter(|&n| n > 0)
        .unwrap_or(fallback)
}
