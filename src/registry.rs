//! Model registry: artifact loading at startup and per-request dispatch.
//!
//! The registry is built once before the listener starts and is read-only
//! afterwards; handlers share it behind an `Arc` with no further locking.

use crate::bert_engine::{BertClassifier, BertEngineConfig};
use crate::classical::ClassicalModel;
use crate::types::HealthResponse;
use crate::vectorizer::TfidfVectorizer;
use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const VECTORIZER_FILE: &str = "tfidf_vectorizer.json";
pub const LABEL_ENCODER_FILE: &str = "label_encoder.json";
/// Subdirectory with the transformer's config/tokenizer/weights.
pub const BERT_DIR: &str = "bert";

/// Label shown when a predicted class index has no Label Map entry.
pub const UNKNOWN_LABEL: &str = "unknown";

/// The fixed set of servable model identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelId {
    LogisticRegression,
    NaiveBayes,
    Svm,
    RandomForest,
    Bert,
}

impl ModelId {
    pub const ALL: [ModelId; 5] = [
        ModelId::LogisticRegression,
        ModelId::NaiveBayes,
        ModelId::Svm,
        ModelId::RandomForest,
        ModelId::Bert,
    ];

    pub const CLASSICAL: [ModelId; 4] = [
        ModelId::LogisticRegression,
        ModelId::NaiveBayes,
        ModelId::Svm,
        ModelId::RandomForest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelId::LogisticRegression => "logistic_regression",
            ModelId::NaiveBayes => "naive_bayes",
            ModelId::Svm => "svm",
            ModelId::RandomForest => "random_forest",
            ModelId::Bert => "bert",
        }
    }

    pub fn parse(name: &str) -> Option<ModelId> {
        Self::ALL.iter().copied().find(|id| id.as_str() == name)
    }

    /// Artifact filename for classical models; the transformer uses a
    /// directory layout instead.
    pub fn artifact_file(&self) -> Option<&'static str> {
        match self {
            ModelId::LogisticRegression => Some("logistic_regression_sentiment_model.json"),
            ModelId::NaiveBayes => Some("naive_bayes_sentiment_model.json"),
            ModelId::Svm => Some("svm_sentiment_model.json"),
            ModelId::RandomForest => Some("random_forest_sentiment_model.json"),
            ModelId::Bert => None,
        }
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered class list from the persisted label encoder artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

/// Class index -> display label.
#[derive(Debug, Clone)]
pub struct LabelMap {
    labels: Vec<String>,
}

impl LabelMap {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    /// Hardcoded two-class map used when no encoder artifact is available.
    pub fn fallback() -> Self {
        Self::new(vec!["negative".to_string(), "positive".to_string()])
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// Classical model plus its probability capability, decided at load time.
pub struct LoadedClassical {
    pub model: ClassicalModel,
    pub supports_probability: bool,
}

/// Tagged dispatch target: one pattern match per request, no per-family
/// branching scattered through the handler.
pub enum SentimentModel {
    Classical(LoadedClassical),
    Transformer(BertClassifier),
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub artifacts_dir: PathBuf,
    pub enable_bert: bool,
    pub cpu: bool,
    pub max_sequence_length: usize,
}

/// Labels plus optional confidences for a normalized batch, in input order.
pub struct Prediction {
    pub labels: Vec<String>,
    /// Percentages in [0, 100], rounded to two decimals. `None` when the
    /// model has no probability support.
    pub confidences: Option<Vec<f64>>,
}

pub struct ModelRegistry {
    configured: Vec<ModelId>,
    models: HashMap<ModelId, SentimentModel>,
    vectorizer: TfidfVectorizer,
    labels: LabelMap,
}

impl ModelRegistry {
    /// Assemble a registry from already-loaded parts. The load phase and the
    /// tests build registries through this, keeping loading testable without
    /// a network listener.
    pub fn from_parts(
        configured: Vec<ModelId>,
        models: HashMap<ModelId, SentimentModel>,
        vectorizer: TfidfVectorizer,
        labels: LabelMap,
    ) -> Self {
        Self {
            configured,
            models,
            vectorizer,
            labels,
        }
    }

    /// Populate the registry from the artifacts directory.
    ///
    /// The vectorizer is required; individual model failures degrade the
    /// registry but only a fully-empty registry aborts startup.
    #[tracing::instrument(skip(options), fields(artifacts_dir = %options.artifacts_dir.display()))]
    pub fn load(options: &RegistryOptions) -> Result<Self> {
        let dir = &options.artifacts_dir;

        let vectorizer: TfidfVectorizer = load_artifact(&dir.join(VECTORIZER_FILE))
            .context("shared TF-IDF vectorizer is required for startup")?;
        vectorizer.validate()?;
        info!(
            vocabulary = vectorizer.vocabulary.len(),
            "Loaded shared vectorizer"
        );

        let labels = match load_artifact::<LabelEncoder>(&dir.join(LABEL_ENCODER_FILE)) {
            Ok(encoder) => {
                info!(classes = ?encoder.classes, "Label map derived from label encoder");
                LabelMap::new(encoder.classes)
            }
            Err(e) => {
                warn!("Label encoder unavailable ({e:#}); using fallback negative/positive map");
                LabelMap::fallback()
            }
        };

        let mut configured: Vec<ModelId> = ModelId::CLASSICAL.to_vec();
        let mut models = HashMap::new();

        for id in ModelId::CLASSICAL {
            let filename = id.artifact_file().expect("classical ids have artifacts");
            match load_classical(&dir.join(filename), &vectorizer, &labels) {
                Ok(loaded) => {
                    info!(model = %id, probability = loaded.supports_probability, "Loaded model");
                    models.insert(id, SentimentModel::Classical(loaded));
                }
                Err(e) => {
                    warn!(model = %id, "Failed to load model: {e:#}");
                }
            }
        }

        if options.enable_bert {
            configured.push(ModelId::Bert);
            let bert_config = BertEngineConfig {
                model_dir: dir.join(BERT_DIR),
                cpu: options.cpu,
                max_sequence_length: options.max_sequence_length,
                fallback_num_classes: labels.len(),
            };
            match BertClassifier::load(&bert_config) {
                Ok(bert) => {
                    info!(num_classes = bert.num_classes(), "Loaded transformer model");
                    models.insert(ModelId::Bert, SentimentModel::Transformer(bert));
                }
                Err(e) => {
                    tracing::error!("Failed to load transformer model: {e:#}");
                }
            }
        }

        if models.is_empty() {
            bail!("no models could be loaded from {}", dir.display());
        }
        info!(
            loaded = models.len(),
            configured = configured.len(),
            "Model registry initialized"
        );

        Ok(Self::from_parts(configured, models, vectorizer, labels))
    }

    pub fn contains(&self, id: ModelId) -> bool {
        self.models.contains_key(&id)
    }

    /// Identifiers with a live registry entry, in configuration order.
    pub fn loaded_ids(&self) -> Vec<String> {
        self.configured
            .iter()
            .filter(|id| self.models.contains_key(id))
            .map(|id| id.as_str().to_string())
            .collect()
    }

    /// Health report over the full configured set, loaded or not.
    pub fn health(&self) -> HealthResponse {
        let models_loaded: BTreeMap<String, bool> = self
            .configured
            .iter()
            .map(|id| (id.as_str().to_string(), self.models.contains_key(id)))
            .collect();
        HealthResponse {
            status: "healthy".to_string(),
            models_loaded,
            vectorizer_loaded: true,
        }
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Run a normalized batch through the named model.
    #[tracing::instrument(skip(self, texts), fields(model = %id, batch_size = texts.len()))]
    pub fn predict(&self, id: ModelId, texts: &[String]) -> Result<Prediction> {
        let model = self
            .models
            .get(&id)
            .with_context(|| format!("model '{id}' is not loaded"))?;

        let (indices, confidences) = match model {
            SentimentModel::Classical(loaded) => {
                let features = self.vectorizer.transform(texts);
                let indices = loaded.model.predict(features.view());
                let confidences = if loaded.supports_probability {
                    loaded.model.predict_proba(features.view()).map(|rows| {
                        rows.iter()
                            .map(|row| {
                                row.iter().copied().fold(f32::NEG_INFINITY, f32::max)
                            })
                            .map(round_percent)
                            .collect()
                    })
                } else {
                    None
                };
                (indices, confidences)
            }
            SentimentModel::Transformer(bert) => {
                let results = bert.classify_batch(texts)?;
                let indices = results.iter().map(|(class, _)| *class).collect();
                let confidences = results
                    .iter()
                    .map(|(_, probability)| round_percent(*probability))
                    .collect();
                (indices, Some(confidences))
            }
        };

        let labels = indices
            .into_iter()
            .map(|index| {
                self.labels
                    .label(index)
                    .unwrap_or(UNKNOWN_LABEL)
                    .to_string()
            })
            .collect();

        Ok(Prediction {
            labels,
            confidences,
        })
    }
}

/// Load a classical model artifact and check it against the shared
/// vectorizer and label map before admitting it to the registry.
fn load_classical(
    path: &Path,
    vectorizer: &TfidfVectorizer,
    labels: &LabelMap,
) -> Result<LoadedClassical> {
    let model: ClassicalModel = load_artifact(path)?;
    model.validate()?;

    if model.n_features() != vectorizer.n_features() {
        bail!(
            "model expects {} features but the vectorizer produces {}",
            model.n_features(),
            vectorizer.n_features()
        );
    }
    if model.n_classes() > labels.len() {
        bail!(
            "model predicts {} classes but the label map only names {}",
            model.n_classes(),
            labels.len()
        );
    }

    let supports_probability = model.supports_probability();
    Ok(LoadedClassical {
        model,
        supports_probability,
    })
}

/// Deserialize an artifact, trying JSON first and the legacy YAML layout as
/// a fallback, logging which path succeeded.
fn load_artifact<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    match serde_json::from_slice::<T>(&raw) {
        Ok(value) => {
            tracing::debug!(path = %path.display(), "Artifact deserialized as JSON");
            Ok(value)
        }
        Err(json_err) => match serde_yaml::from_slice::<T>(&raw) {
            Ok(value) => {
                info!(path = %path.display(), "Artifact deserialized via legacy YAML fallback");
                Ok(value)
            }
            Err(yaml_err) => bail!(
                "could not deserialize {}: json: {json_err}; yaml: {yaml_err}",
                path.display()
            ),
        },
    }
}

/// Probability as a display percentage, rounded to two decimals.
pub fn round_percent(probability: f32) -> f64 {
    (f64::from(probability) * 10_000.0).round() / 100.0
}
