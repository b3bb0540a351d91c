//! Prediction-side implementations of the serialized classical models.
//!
//! Artifacts carry fitted parameters only (coefficients, log-probabilities,
//! tree structure); all of the fitting happened offline. Each family exposes
//! `predict` over TF-IDF feature rows, and probability estimation where the
//! family supports it. Whether probabilities are available is a property of
//! the family, decided once at load time, never probed per request.

use anyhow::{Context, Result, ensure};
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// A deserialized classical sentiment classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ClassicalModel {
    /// Logistic regression: linear decision function with sigmoid/softmax
    /// probabilities.
    Linear(LinearClassifier),
    /// Multinomial naive Bayes over term counts.
    NaiveBayes(NaiveBayesClassifier),
    /// Linear-kernel SVM: decision function only, no probability estimates.
    LinearSvm(LinearClassifier),
    /// Random forest: averaged leaf class distributions.
    RandomForest(RandomForest),
}

impl ClassicalModel {
    pub fn n_features(&self) -> usize {
        match self {
            ClassicalModel::Linear(m) | ClassicalModel::LinearSvm(m) => m.n_features(),
            ClassicalModel::NaiveBayes(m) => m.n_features(),
            ClassicalModel::RandomForest(m) => m.n_features,
        }
    }

    pub fn n_classes(&self) -> usize {
        match self {
            ClassicalModel::Linear(m) | ClassicalModel::LinearSvm(m) => m.n_classes(),
            ClassicalModel::NaiveBayes(m) => m.class_log_prior.len(),
            ClassicalModel::RandomForest(m) => m.n_classes,
        }
    }

    /// Probability support is a per-family capability, not a runtime probe.
    pub fn supports_probability(&self) -> bool {
        !matches!(self, ClassicalModel::LinearSvm(_))
    }

    /// Structural checks on the deserialized parameters. Prediction walks
    /// tree nodes by stored index, so the artifact must not be able to send
    /// it out of bounds or into a loop.
    pub fn validate(&self) -> Result<()> {
        if let ClassicalModel::RandomForest(forest) = self {
            for (tree_index, tree) in forest.trees.iter().enumerate() {
                tree.validate()
                    .with_context(|| format!("tree {tree_index}"))?;
            }
        }
        Ok(())
    }

    /// Predicted class index per feature row.
    pub fn predict(&self, features: ArrayView2<'_, f32>) -> Vec<usize> {
        match self {
            ClassicalModel::Linear(m) | ClassicalModel::LinearSvm(m) => features
                .rows()
                .into_iter()
                .map(|row| {
                    let scores = m.decision_function(row);
                    if m.is_binary() {
                        usize::from(scores[0] > 0.0)
                    } else {
                        argmax(&scores)
                    }
                })
                .collect(),
            ClassicalModel::NaiveBayes(m) => features
                .rows()
                .into_iter()
                .map(|row| argmax(&m.joint_log_likelihood(row)))
                .collect(),
            ClassicalModel::RandomForest(m) => features
                .rows()
                .into_iter()
                .map(|row| argmax(&m.class_distribution(row)))
                .collect(),
        }
    }

    /// Per-row class probabilities, `None` for families without support.
    pub fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Option<Vec<Vec<f32>>> {
        match self {
            ClassicalModel::LinearSvm(_) => None,
            ClassicalModel::Linear(m) => Some(
                features
                    .rows()
                    .into_iter()
                    .map(|row| {
                        let scores = m.decision_function(row);
                        if m.is_binary() {
                            let positive = sigmoid(scores[0]);
                            vec![1.0 - positive, positive]
                        } else {
                            softmax(&scores)
                        }
                    })
                    .collect(),
            ),
            ClassicalModel::NaiveBayes(m) => Some(
                features
                    .rows()
                    .into_iter()
                    .map(|row| softmax(&m.joint_log_likelihood(row)))
                    .collect(),
            ),
            ClassicalModel::RandomForest(m) => Some(
                features
                    .rows()
                    .into_iter()
                    .map(|row| m.class_distribution(row))
                    .collect(),
            ),
        }
    }
}

/// Linear decision function shared by logistic regression and linear SVM.
///
/// Binary models carry a single coefficient row whose positive side is
/// class 1; multiclass models carry one row per class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearClassifier {
    pub coef: Vec<Vec<f32>>,
    pub intercept: Vec<f32>,
}

impl LinearClassifier {
    fn is_binary(&self) -> bool {
        self.coef.len() == 1
    }

    fn n_features(&self) -> usize {
        self.coef.first().map_or(0, Vec::len)
    }

    fn n_classes(&self) -> usize {
        if self.is_binary() { 2 } else { self.coef.len() }
    }

    fn decision_function(&self, row: ArrayView1<'_, f32>) -> Vec<f32> {
        self.coef
            .iter()
            .zip(&self.intercept)
            .map(|(weights, bias)| {
                weights.iter().zip(row.iter()).map(|(w, x)| w * x).sum::<f32>() + bias
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaiveBayesClassifier {
    pub class_log_prior: Vec<f32>,
    /// One row of per-term log-probabilities per class.
    pub feature_log_prob: Vec<Vec<f32>>,
}

impl NaiveBayesClassifier {
    fn n_features(&self) -> usize {
        self.feature_log_prob.first().map_or(0, Vec::len)
    }

    fn joint_log_likelihood(&self, row: ArrayView1<'_, f32>) -> Vec<f32> {
        self.class_log_prior
            .iter()
            .zip(&self.feature_log_prob)
            .map(|(prior, log_probs)| {
                prior + log_probs.iter().zip(row.iter()).map(|(lp, x)| lp * x).sum::<f32>()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    pub n_features: usize,
    pub n_classes: usize,
    pub trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Mean of the leaf class distributions across all trees.
    fn class_distribution(&self, row: ArrayView1<'_, f32>) -> Vec<f32> {
        let mut totals = vec![0.0f32; self.n_classes];
        for tree in &self.trees {
            let leaf = tree.leaf_for(row);
            for (total, p) in totals.iter_mut().zip(leaf) {
                *total += p;
            }
        }
        let count = self.trees.len().max(1) as f32;
        for total in &mut totals {
            *total /= count;
        }
        totals
    }
}

/// Flat node-array encoding; index 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        probabilities: Vec<f32>,
    },
}

impl DecisionTree {
    /// Children must exist and must come after their split in the node
    /// array; forward-only edges keep `leaf_for`'s walk finite.
    fn validate(&self) -> Result<()> {
        ensure!(!self.nodes.is_empty(), "tree has no nodes");
        for (index, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split { left, right, .. } = node {
                for child in [*left, *right] {
                    ensure!(
                        child < self.nodes.len(),
                        "node {index} points at missing child {child}"
                    );
                    ensure!(
                        child > index,
                        "node {index} points backwards at child {child}"
                    );
                }
            }
        }
        Ok(())
    }

    fn leaf_for<'a>(&'a self, row: ArrayView1<'_, f32>) -> &'a [f32] {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = row.get(*feature).copied().unwrap_or(0.0);
                    index = if value <= *threshold { *left } else { *right };
                }
                TreeNode::Leaf { probabilities } => return probabilities,
            }
        }
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn binary_linear() -> LinearClassifier {
        // Positive weight on feature 0, negative on feature 1.
        LinearClassifier {
            coef: vec![vec![2.0, -2.0]],
            intercept: vec![0.0],
        }
    }

    #[test]
    fn logistic_regression_predicts_and_scores() {
        let model = ClassicalModel::Linear(binary_linear());
        let features = array![[1.0, 0.0], [0.0, 1.0]];
        assert_eq!(model.predict(features.view()), vec![1, 0]);

        let probs = model.predict_proba(features.view()).unwrap();
        assert!(probs[0][1] > 0.5);
        assert!(probs[1][0] > 0.5);
        for row in &probs {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        assert!(model.supports_probability());
    }

    #[test]
    fn svm_has_no_probability_support() {
        let model = ClassicalModel::LinearSvm(binary_linear());
        let features = array![[1.0, 0.0]];
        assert_eq!(model.predict(features.view()), vec![1]);
        assert!(model.predict_proba(features.view()).is_none());
        assert!(!model.supports_probability());
    }

    #[test]
    fn multiclass_linear_uses_argmax() {
        let model = ClassicalModel::Linear(LinearClassifier {
            coef: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, -1.0]],
            intercept: vec![0.0, 0.0, 0.0],
        });
        let features = array![[0.0, 3.0]];
        assert_eq!(model.predict(features.view()), vec![1]);
        assert_eq!(model.n_classes(), 3);
    }

    #[test]
    fn naive_bayes_favors_likelier_class() {
        let model = ClassicalModel::NaiveBayes(NaiveBayesClassifier {
            class_log_prior: vec![0.5f32.ln(), 0.5f32.ln()],
            feature_log_prob: vec![
                vec![0.9f32.ln(), 0.1f32.ln()],
                vec![0.1f32.ln(), 0.9f32.ln()],
            ],
        });
        let features = array![[3.0, 0.0], [0.0, 3.0]];
        assert_eq!(model.predict(features.view()), vec![0, 1]);

        let probs = model.predict_proba(features.view()).unwrap();
        assert!(probs[0][0] > 0.9);
        assert!(probs[1][1] > 0.9);
    }

    fn stump(feature: usize, threshold: f32, low: Vec<f32>, high: Vec<f32>) -> DecisionTree {
        DecisionTree {
            nodes: vec![
                TreeNode::Split {
                    feature,
                    threshold,
                    left: 1,
                    right: 2,
                },
                TreeNode::Leaf { probabilities: low },
                TreeNode::Leaf { probabilities: high },
            ],
        }
    }

    #[test]
    fn random_forest_averages_tree_distributions() {
        let model = ClassicalModel::RandomForest(RandomForest {
            n_features: 2,
            n_classes: 2,
            trees: vec![
                stump(0, 0.5, vec![1.0, 0.0], vec![0.0, 1.0]),
                stump(0, 0.5, vec![0.8, 0.2], vec![0.4, 0.6]),
            ],
        });
        let features = array![[1.0, 0.0]];
        assert_eq!(model.predict(features.view()), vec![1]);

        let probs = model.predict_proba(features.view()).unwrap();
        assert!((probs[0][1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn forest_treats_missing_features_as_zero() {
        let model = ClassicalModel::RandomForest(RandomForest {
            n_features: 10,
            n_classes: 2,
            trees: vec![stump(9, 0.5, vec![1.0, 0.0], vec![0.0, 1.0])],
        });
        // Row narrower than the tree's split feature takes the low branch.
        let features = array![[0.0, 0.0]];
        assert_eq!(model.predict(features.view()), vec![0]);
    }

    #[test]
    fn validate_accepts_well_formed_forest() {
        let model = ClassicalModel::RandomForest(RandomForest {
            n_features: 2,
            n_classes: 2,
            trees: vec![stump(0, 0.5, vec![1.0, 0.0], vec![0.0, 1.0])],
        });
        assert!(model.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_child() {
        let model = ClassicalModel::RandomForest(RandomForest {
            n_features: 2,
            n_classes: 2,
            trees: vec![DecisionTree {
                nodes: vec![
                    TreeNode::Split {
                        feature: 0,
                        threshold: 0.5,
                        left: 1,
                        right: 7,
                    },
                    TreeNode::Leaf {
                        probabilities: vec![1.0, 0.0],
                    },
                ],
            }],
        });
        assert!(model.validate().is_err());
    }

    #[test]
    fn validate_rejects_cyclic_node_graph() {
        // A split pointing back at itself would walk forever.
        let model = ClassicalModel::RandomForest(RandomForest {
            n_features: 2,
            n_classes: 2,
            trees: vec![DecisionTree {
                nodes: vec![
                    TreeNode::Split {
                        feature: 0,
                        threshold: 0.5,
                        left: 0,
                        right: 1,
                    },
                    TreeNode::Leaf {
                        probabilities: vec![1.0, 0.0],
                    },
                ],
            }],
        });
        assert!(model.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_tree() {
        let model = ClassicalModel::RandomForest(RandomForest {
            n_features: 2,
            n_classes: 2,
            trees: vec![DecisionTree { nodes: vec![] }],
        });
        assert!(model.validate().is_err());
    }

    #[test]
    fn validate_passes_non_forest_families() {
        assert!(ClassicalModel::Linear(binary_linear()).validate().is_ok());
    }

    #[test]
    fn model_roundtrips_through_tagged_json() {
        let model = ClassicalModel::LinearSvm(binary_linear());
        let json = serde_json::to_string(&model).unwrap();
        assert!(json.contains(r#""family":"linear_svm""#));
        let restored: ClassicalModel = serde_json::from_str(&json).unwrap();
        assert!(!restored.supports_probability());
        assert_eq!(restored.n_features(), 2);
    }
}
