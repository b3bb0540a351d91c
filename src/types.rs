use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A field whose JSON shape mirrors the request's `text` field: a bare value
/// for single-string requests, an array for batch requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn is_batch(&self) -> bool {
        matches!(self, OneOrMany::Many(_))
    }

    /// Re-shape a batch of values to match the shape of `self`.
    ///
    /// Callers guarantee the batch has exactly one element when `self` is
    /// scalar; this holds because the batch was produced from `self`.
    pub fn reshape<U>(&self, mut values: Vec<U>) -> OneOrMany<U> {
        if self.is_batch() {
            OneOrMany::Many(values)
        } else {
            OneOrMany::One(values.remove(0))
        }
    }
}

impl OneOrMany<String> {
    /// Normalize to a batch for internal processing.
    pub fn as_batch(&self) -> Vec<String> {
        match self {
            OneOrMany::One(text) => vec![text.clone()],
            OneOrMany::Many(texts) => texts.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub model: String,
    pub text: OneOrMany<String>,
    /// Accepted for wire compatibility, never consulted.
    #[serde(default)]
    pub labels: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub text: OneOrMany<String>,
    pub prediction: OneOrMany<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<OneOrMany<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_text: Option<OneOrMany<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub models_loaded: BTreeMap<String, bool>,
    pub vectorizer_loaded: bool,
}
