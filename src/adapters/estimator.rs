//! Evaluable estimators every adapter lowers its artifact into

use super::dense::DenseGraph;
use super::{AdapterError, PredictionOutput, PredictionValue};
use crate::input::FeatureMatrix;
use serde::Serialize;

/// A class label as stored by the training library
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClassLabel {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ClassLabel {
    fn to_prediction(&self) -> PredictionValue {
        match self {
            ClassLabel::Int(i) => PredictionValue::Integer(*i),
            ClassLabel::Float(f) => PredictionValue::Number(*f),
            ClassLabel::Str(s) => PredictionValue::Label(s.clone()),
        }
    }
}

/// Default labels `0..n` for classifiers that carry none
pub fn index_labels(n: usize) -> Vec<ClassLabel> {
    (0..n as i64).map(ClassLabel::Int).collect()
}

/// Score-to-probability mapping applied after the raw decision function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostTransform {
    None,
    Softmax,
    Logistic,
    /// Per-class sigmoid, renormalised to sum to one (one-vs-rest)
    OvrNormalized,
}

impl PostTransform {
    pub fn apply(&self, scores: &mut [f64]) {
        match self {
            PostTransform::None => {}
            PostTransform::Softmax => softmax(scores),
            PostTransform::Logistic => scores.iter_mut().for_each(|s| *s = sigmoid(*s)),
            PostTransform::OvrNormalized => {
                scores.iter_mut().for_each(|s| *s = sigmoid(*s));
                let sum: f64 = scores.iter().sum();
                if sum > 0.0 {
                    scores.iter_mut().for_each(|s| *s /= sum);
                }
            }
        }
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn softmax(scores: &mut [f64]) {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        scores.iter_mut().for_each(|s| *s /= sum);
    }
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
        .0
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `y = X · Wᵀ + b`, one row of `weights` per target
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub weights: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
}

impl LinearModel {
    pub fn new(weights: Vec<Vec<f64>>, intercept: Vec<f64>) -> Result<Self, AdapterError> {
        let width = weights.first().map(Vec::len).unwrap_or(0);
        if weights.is_empty() || width == 0 || weights.iter().any(|w| w.len() != width) {
            return Err(AdapterError::load("linear model has no usable coefficients"));
        }
        let intercept = broadcast_intercept(intercept, weights.len())?;
        Ok(Self { weights, intercept })
    }

    pub fn n_features(&self) -> usize {
        self.weights[0].len()
    }

    fn scores(&self, row: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.intercept)
            .map(|(w, b)| dot(w, row) + b)
            .collect()
    }
}

fn broadcast_intercept(intercept: Vec<f64>, targets: usize) -> Result<Vec<f64>, AdapterError> {
    match intercept.len() {
        0 => Ok(vec![0.0; targets]),
        1 if targets > 1 => Ok(vec![intercept[0]; targets]),
        n if n == targets => Ok(intercept),
        n => Err(AdapterError::load(format!(
            "intercept has {} values for {} targets",
            n, targets
        ))),
    }
}

/// Linear decision function followed by a probability mapping
#[derive(Debug, Clone, PartialEq)]
pub struct LinearClassifier {
    pub linear: LinearModel,
    pub classes: Vec<ClassLabel>,
    pub post: PostTransform,
}

impl LinearClassifier {
    pub fn new(
        linear: LinearModel,
        classes: Vec<ClassLabel>,
        post: PostTransform,
    ) -> Result<Self, AdapterError> {
        let rows = linear.weights.len();
        let ok = (rows == 1 && classes.len() == 2) || (rows > 1 && rows == classes.len());
        if !ok {
            return Err(AdapterError::load(format!(
                "classifier has {} coefficient rows for {} classes",
                rows,
                classes.len()
            )));
        }
        Ok(Self {
            linear,
            classes,
            post,
        })
    }

    fn probabilities(&self, row: &[f64]) -> Vec<f64> {
        let mut scores = self.linear.scores(row);
        if scores.len() == 1 {
            let p = match self.post {
                PostTransform::None => scores[0].clamp(0.0, 1.0),
                _ => sigmoid(scores[0]),
            };
            return vec![1.0 - p, p];
        }
        self.post.apply(&mut scores);
        scores
    }
}

/// Comparison that sends a sample down the "true" branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitRule {
    Leq,
    Lt,
    Gte,
    Gt,
    Eq,
    Neq,
}

impl SplitRule {
    fn holds(&self, x: f64, threshold: f64) -> bool {
        match self {
            SplitRule::Leq => x <= threshold,
            SplitRule::Lt => x < threshold,
            SplitRule::Gte => x >= threshold,
            SplitRule::Gt => x > threshold,
            SplitRule::Eq => x == threshold,
            SplitRule::Neq => x != threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        rule: SplitRule,
        when_true: usize,
        when_false: usize,
    },
    Leaf {
        value: Vec<f64>,
    },
}

/// One decision tree; node 0 is the root
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    pub fn new(nodes: Vec<TreeNode>) -> Result<Self, AdapterError> {
        if nodes.is_empty() {
            return Err(AdapterError::load("tree has no nodes"));
        }
        for node in &nodes {
            if let TreeNode::Split {
                when_true,
                when_false,
                ..
            } = node
                && (*when_true >= nodes.len() || *when_false >= nodes.len())
            {
                return Err(AdapterError::load("tree node points outside the tree"));
            }
        }
        Ok(Self { nodes })
    }

    fn max_feature(&self) -> Option<usize> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                TreeNode::Split { feature, .. } => Some(*feature),
                TreeNode::Leaf { .. } => None,
            })
            .max()
    }

    fn leaf(&self, row: &[f64]) -> Result<&[f64], AdapterError> {
        let mut index = 0;
        // A well-formed tree reaches a leaf in fewer steps than it has nodes
        for _ in 0..=self.nodes.len() {
            match &self.nodes[index] {
                TreeNode::Leaf { value } => return Ok(value),
                TreeNode::Split {
                    feature,
                    threshold,
                    rule,
                    when_true,
                    when_false,
                } => {
                    let x = *row.get(*feature).ok_or_else(|| {
                        AdapterError::prediction(format!("tree splits on missing feature {}", feature))
                    })?;
                    index = if rule.holds(x, *threshold) {
                        *when_true
                    } else {
                        *when_false
                    };
                }
            }
        }
        Err(AdapterError::prediction("tree contains a cycle"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Average,
    Sum,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnsembleTask {
    Regression { n_outputs: usize },
    Classification { classes: Vec<ClassLabel> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeEnsemble {
    pub trees: Vec<Tree>,
    pub task: EnsembleTask,
    pub aggregation: Aggregation,
    pub base_values: Vec<f64>,
    /// Normalise each leaf's class weights to a distribution before aggregating
    pub normalize_leaves: bool,
    pub post: PostTransform,
    pub n_features: usize,
}

impl TreeEnsemble {
    fn width(&self) -> usize {
        match &self.task {
            EnsembleTask::Regression { n_outputs } => *n_outputs,
            EnsembleTask::Classification { classes } => classes.len(),
        }
    }

    /// Smallest feature count the trees can be evaluated on
    pub fn required_features(trees: &[Tree]) -> usize {
        trees
            .iter()
            .filter_map(Tree::max_feature)
            .max()
            .map_or(0, |f| f + 1)
    }

    fn scores(&self, row: &[f64]) -> Result<Vec<f64>, AdapterError> {
        let width = self.width();
        let mut acc = vec![0.0; width];
        for tree in &self.trees {
            let leaf = tree.leaf(row)?;
            let total: f64 = leaf.iter().sum();
            let normalize = self.normalize_leaves && total > 0.0;
            for (slot, value) in acc.iter_mut().zip(leaf) {
                *slot += if normalize { value / total } else { *value };
            }
        }
        if self.aggregation == Aggregation::Average && !self.trees.is_empty() {
            let n = self.trees.len() as f64;
            acc.iter_mut().for_each(|v| *v /= n);
        }
        for (slot, base) in acc.iter_mut().zip(&self.base_values) {
            *slot += base;
        }
        Ok(acc)
    }
}

/// Affine per-feature transform `x' = x * mul + add`
#[derive(Debug, Clone, PartialEq)]
pub struct Affine {
    pub mul: Vec<f64>,
    pub add: Vec<f64>,
}

impl Affine {
    /// `StandardScaler`: `(x - mean) / scale`
    pub fn standard(mean: Option<Vec<f64>>, scale: Option<Vec<f64>>, n: usize) -> Self {
        let mean = mean.unwrap_or_else(|| vec![0.0; n]);
        let scale = scale.unwrap_or_else(|| vec![1.0; n]);
        let mul: Vec<f64> = scale
            .iter()
            .map(|s| if *s == 0.0 { 1.0 } else { 1.0 / s })
            .collect();
        let add = mean.iter().zip(&mul).map(|(m, k)| -m * k).collect();
        Self { mul, add }
    }

    fn width(&self) -> usize {
        self.mul.len()
    }

    fn apply(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mul.iter().zip(&self.add))
            .map(|(x, (m, a))| x * m + a)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Estimator {
    Linear(LinearModel),
    Classifier(LinearClassifier),
    Trees(TreeEnsemble),
    Dense(DenseGraph),
    Pipeline {
        steps: Vec<Affine>,
        last: Box<Estimator>,
    },
}

impl Estimator {
    /// Number of input features, when the estimator fixes it
    pub fn n_features(&self) -> Option<usize> {
        match self {
            Estimator::Linear(m) => Some(m.n_features()),
            Estimator::Classifier(c) => Some(c.linear.n_features()),
            Estimator::Trees(t) => Some(t.n_features),
            Estimator::Dense(g) => g.n_features(),
            Estimator::Pipeline { steps, last } => steps
                .first()
                .map(Affine::width)
                .or_else(|| last.n_features()),
        }
    }

    pub fn predict(&self, input: &FeatureMatrix) -> Result<PredictionOutput, AdapterError> {
        if let Some(expected) = self.n_features()
            && input.n_cols() != expected
        {
            return Err(AdapterError::prediction(format!(
                "expected {} features, got {}",
                expected,
                input.n_cols()
            )));
        }

        match self {
            Estimator::Linear(model) => Ok(regression_output(
                input.rows().map(|row| model.scores(row)).collect(),
            )),
            Estimator::Classifier(clf) => Ok(classification_output(
                input.rows().map(|row| clf.probabilities(row)).collect(),
                &clf.classes,
            )),
            Estimator::Trees(ensemble) => {
                let mut scores = Vec::with_capacity(input.n_rows());
                for row in input.rows() {
                    let mut s = ensemble.scores(row)?;
                    if let EnsembleTask::Classification { classes } = &ensemble.task {
                        s = class_probabilities(s, ensemble.post, classes.len());
                    }
                    scores.push(s);
                }
                Ok(match &ensemble.task {
                    EnsembleTask::Regression { .. } => regression_output(scores),
                    EnsembleTask::Classification { classes } => classification_output(scores, classes),
                })
            }
            Estimator::Dense(graph) => graph.predict(input),
            Estimator::Pipeline { steps, last } => {
                let rows = input
                    .rows()
                    .map(|row| {
                        steps.iter().try_fold(row.to_vec(), |x, step| {
                            if step.width() != x.len() {
                                return Err(AdapterError::prediction(format!(
                                    "transform expects {} features, got {}",
                                    step.width(),
                                    x.len()
                                )));
                            }
                            Ok(step.apply(&x))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let transformed =
                    FeatureMatrix::from_rows(rows).map_err(|e| AdapterError::prediction(e.to_string()))?;
                last.predict(&transformed)
            }
        }
    }
}

/// Turn ensemble class scores into a distribution
fn class_probabilities(mut scores: Vec<f64>, post: PostTransform, n_classes: usize) -> Vec<f64> {
    // Binary ensembles may only carry weights for the positive class
    if n_classes == 2 && scores.len() == 2 && scores[0] == 0.0 && post != PostTransform::None {
        let p = match post {
            PostTransform::Logistic => sigmoid(scores[1]),
            _ => scores[1],
        };
        return vec![1.0 - p, p];
    }
    post.apply(&mut scores);
    scores
}

pub(crate) fn regression_output(scores: Vec<Vec<f64>>) -> PredictionOutput {
    let predictions = scores
        .into_iter()
        .map(|s| {
            if s.len() == 1 {
                PredictionValue::Number(s[0])
            } else {
                PredictionValue::Vector(s)
            }
        })
        .collect();
    PredictionOutput {
        predictions,
        confidence: None,
    }
}

pub(crate) fn classification_output(
    probabilities: Vec<Vec<f64>>,
    classes: &[ClassLabel],
) -> PredictionOutput {
    let mut predictions = Vec::with_capacity(probabilities.len());
    let mut confidence = Vec::with_capacity(probabilities.len());
    for probs in probabilities {
        let best = argmax(&probs);
        predictions.push(
            classes
                .get(best)
                .map(ClassLabel::to_prediction)
                .unwrap_or(PredictionValue::Integer(best as i64)),
        );
        confidence.push(probs.get(best).copied().unwrap_or(0.0));
    }
    PredictionOutput {
        predictions,
        confidence: Some(confidence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: Vec<Vec<f64>>) -> FeatureMatrix {
        FeatureMatrix::from_rows(rows).unwrap()
    }

    #[test]
    fn test_linear_regression_prediction() {
        let model = LinearModel::new(vec![vec![10000.0, 5000.0, 100.0, -500.0]], vec![50000.0]).unwrap();
        let out = Estimator::Linear(model)
            .predict(&matrix(vec![vec![3.0, 2.0, 1500.0, 10.0]]))
            .unwrap();
        // 30000 + 10000 + 150000 - 5000 + 50000
        assert_eq!(out.predictions, vec![PredictionValue::Number(235000.0)]);
        assert!(out.confidence.is_none());
    }

    #[test]
    fn test_width_mismatch_is_prediction_error() {
        let model = LinearModel::new(vec![vec![1.0, 2.0]], vec![0.0]).unwrap();
        let err = Estimator::Linear(model)
            .predict(&matrix(vec![vec![1.0, 2.0, 3.0]]))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Prediction(_)));
        assert_eq!(err.to_string(), "expected 2 features, got 3");
    }

    #[test]
    fn test_binary_logistic() {
        let linear = LinearModel::new(vec![vec![1.0]], vec![0.0]).unwrap();
        let clf = LinearClassifier::new(
            linear,
            vec![ClassLabel::Str("stay".into()), ClassLabel::Str("churn".into())],
            PostTransform::Logistic,
        )
        .unwrap();
        let out = Estimator::Classifier(clf)
            .predict(&matrix(vec![vec![3.0], vec![-3.0]]))
            .unwrap();
        assert_eq!(
            out.predictions,
            vec![
                PredictionValue::Label("churn".into()),
                PredictionValue::Label("stay".into())
            ]
        );
        let conf = out.confidence.unwrap();
        assert!((conf[0] - sigmoid(3.0)).abs() < 1e-12);
        assert!((conf[1] - sigmoid(3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_forest_averages_normalized_leaves() {
        // stump on feature 0 at 0.5: left all class 0, right all class 1
        let stump = |left: Vec<f64>, right: Vec<f64>| {
            Tree::new(vec![
                TreeNode::Split {
                    feature: 0,
                    threshold: 0.5,
                    rule: SplitRule::Leq,
                    when_true: 1,
                    when_false: 2,
                },
                TreeNode::Leaf { value: left },
                TreeNode::Leaf { value: right },
            ])
            .unwrap()
        };
        let ensemble = TreeEnsemble {
            trees: vec![stump(vec![10.0, 0.0], vec![0.0, 4.0]), stump(vec![3.0, 1.0], vec![1.0, 3.0])],
            task: EnsembleTask::Classification {
                classes: index_labels(2),
            },
            aggregation: Aggregation::Average,
            base_values: Vec::new(),
            normalize_leaves: true,
            post: PostTransform::None,
            n_features: 1,
        };
        let out = Estimator::Trees(ensemble)
            .predict(&matrix(vec![vec![0.0], vec![1.0]]))
            .unwrap();
        assert_eq!(
            out.predictions,
            vec![PredictionValue::Integer(0), PredictionValue::Integer(1)]
        );
        let conf = out.confidence.unwrap();
        assert!((conf[0] - 0.875).abs() < 1e-12);
        assert!((conf[1] - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_tree_rejects_dangling_child() {
        let err = Tree::new(vec![TreeNode::Split {
            feature: 0,
            threshold: 0.0,
            rule: SplitRule::Leq,
            when_true: 1,
            when_false: 2,
        }])
        .unwrap_err();
        assert!(matches!(err, AdapterError::Load(_)));
    }

    #[test]
    fn test_pipeline_scales_before_estimating() {
        let scaler = Affine::standard(Some(vec![10.0]), Some(vec![2.0]), 1);
        let model = LinearModel::new(vec![vec![1.0]], vec![0.0]).unwrap();
        let pipeline = Estimator::Pipeline {
            steps: vec![scaler],
            last: Box::new(Estimator::Linear(model)),
        };
        let out = pipeline.predict(&matrix(vec![vec![14.0]])).unwrap();
        assert_eq!(out.predictions, vec![PredictionValue::Number(2.0)]);
    }

    #[test]
    fn test_softmax_is_stable() {
        let mut s = vec![1000.0, 1000.0];
        softmax(&mut s);
        assert_eq!(s, vec![0.5, 0.5]);
    }
}
