use anyhow::{Result, ensure};
use ndarray::Array2;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Word tokens of two or more characters, the same pattern the vectorizer
/// was fitted with.
fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?u)\b\w\w+\b").expect("valid token pattern"))
}

/// Shared TF-IDF transform, deserialized from the fitted vectorizer artifact.
///
/// Holds the fitted vocabulary and per-term inverse document frequencies.
/// Loaded once at startup and never mutated; every classical model projects
/// its input through this transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    /// Term -> column index in the feature space.
    pub vocabulary: HashMap<String, usize>,
    /// Inverse document frequency per column, same length as the vocabulary.
    pub idf: Vec<f32>,
    #[serde(default = "default_true")]
    pub lowercase: bool,
    /// Replace raw term counts with 1 + ln(count).
    #[serde(default)]
    pub sublinear_tf: bool,
}

fn default_true() -> bool {
    true
}

impl TfidfVectorizer {
    /// Number of columns in the feature space.
    pub fn n_features(&self) -> usize {
        self.idf.len()
    }

    /// Check the artifact is internally coherent before it is used.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.vocabulary.is_empty(),
            "vectorizer vocabulary is empty"
        );
        ensure!(
            self.vocabulary.len() == self.idf.len(),
            "vectorizer has {} vocabulary terms but {} idf weights",
            self.vocabulary.len(),
            self.idf.len()
        );
        for (term, &index) in &self.vocabulary {
            ensure!(
                index < self.idf.len(),
                "vocabulary term '{term}' maps to out-of-range column {index}"
            );
        }
        Ok(())
    }

    /// Transform a batch of texts into L2-normalized TF-IDF rows.
    ///
    /// Out-of-vocabulary tokens are dropped; a text with no known tokens
    /// yields an all-zero row rather than an error.
    pub fn transform(&self, texts: &[String]) -> Array2<f32> {
        let mut features = Array2::<f32>::zeros((texts.len(), self.n_features()));

        for (row, text) in texts.iter().enumerate() {
            let lowered;
            let haystack = if self.lowercase {
                lowered = text.to_lowercase();
                &lowered
            } else {
                text
            };

            for token in token_pattern().find_iter(haystack) {
                if let Some(&column) = self.vocabulary.get(token.as_str()) {
                    features[[row, column]] += 1.0;
                }
            }

            if self.sublinear_tf {
                for column in 0..self.n_features() {
                    let count = features[[row, column]];
                    if count > 0.0 {
                        features[[row, column]] = 1.0 + count.ln();
                    }
                }
            }

            for column in 0..self.n_features() {
                features[[row, column]] *= self.idf[column];
            }

            let norm = features
                .row(row)
                .iter()
                .map(|value| value * value)
                .sum::<f32>()
                .sqrt();
            if norm > 0.0 {
                for column in 0..self.n_features() {
                    features[[row, column]] /= norm;
                }
            }
        }

        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> TfidfVectorizer {
        TfidfVectorizer {
            vocabulary: HashMap::from([
                ("love".to_string(), 0),
                ("hate".to_string(), 1),
                ("movie".to_string(), 2),
            ]),
            idf: vec![1.0, 2.0, 1.5],
            lowercase: true,
            sublinear_tf: false,
        }
    }

    #[test]
    fn validate_accepts_coherent_artifact() {
        assert!(fixture().validate().is_ok());
    }

    #[test]
    fn validate_rejects_mismatched_idf_length() {
        let mut vectorizer = fixture();
        vectorizer.idf.pop();
        assert!(vectorizer.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_column() {
        let mut vectorizer = fixture();
        vectorizer.vocabulary.insert("extra".to_string(), 99);
        vectorizer.idf.push(1.0);
        assert!(vectorizer.validate().is_err());
    }

    #[test]
    fn transform_rows_are_l2_normalized() {
        let vectorizer = fixture();
        let features = vectorizer.transform(&["I love love this movie".to_string()]);
        let norm = features.row(0).iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        // "love" counted twice, weighted by its idf before normalization.
        assert!(features[[0, 0]] > features[[0, 2]]);
        assert_eq!(features[[0, 1]], 0.0);
    }

    #[test]
    fn transform_lowercases_input() {
        let vectorizer = fixture();
        let features = vectorizer.transform(&["LOVE".to_string()]);
        assert!(features[[0, 0]] > 0.0);
    }

    #[test]
    fn unknown_tokens_yield_zero_row() {
        let vectorizer = fixture();
        let features = vectorizer.transform(&["completely unrelated words".to_string()]);
        assert!(features.row(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn batch_transform_preserves_row_order() {
        let vectorizer = fixture();
        let features = vectorizer.transform(&[
            "love".to_string(),
            "hate".to_string(),
        ]);
        assert!(features[[0, 0]] > 0.0 && features[[0, 1]] == 0.0);
        assert!(features[[1, 1]] > 0.0 && features[[1, 0]] == 0.0);
    }

    #[test]
    fn short_tokens_are_ignored() {
        // Single-character words do not match the fitted token pattern.
        let vectorizer = TfidfVectorizer {
            vocabulary: HashMap::from([("a".to_string(), 0)]),
            idf: vec![1.0],
            lowercase: true,
            sublinear_tf: false,
        };
        let features = vectorizer.transform(&["a a a".to_string()]);
        assert_eq!(features[[0, 0]], 0.0);
    }
}
