//! ONNX models: `ai.onnx.ml` linear and tree-ensemble operators, or a small
//! dense graph of standard operators.

use super::dense::{DenseGraph, GraphTask, Matrix, Op, OpKind};
use super::estimator::{
    Affine, Aggregation, ClassLabel, EnsembleTask, Estimator, LinearClassifier, LinearModel,
    PostTransform, SplitRule, Tree, TreeEnsemble, TreeNode,
};
use super::{
    AdapterError, EstimatorModel, FormatAdapter, InputSchema, ModelHandle, PredictionOutput,
    estimator_schema, predict_estimator, read_artifact,
};
use crate::format::ModelFormat;
use crate::input::FeatureMatrix;
use crate::proto::onnx::{GraphProto, ModelProto, NodeProto};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Metadata key holding comma-separated input feature names
pub const FEATURE_NAMES_KEY: &str = "feature_names";

const ESTIMATOR_OPS: [&str; 4] = [
    "LinearRegressor",
    "LinearClassifier",
    "TreeEnsembleRegressor",
    "TreeEnsembleClassifier",
];

/// Operators that do not change which value an estimator predicts
const PASS_THROUGH_OPS: [&str; 4] = ["ZipMap", "Normalizer", "Cast", "Identity"];

#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxAdapter;

impl FormatAdapter for OnnxAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Onnx
    }

    fn load(&self, path: &Path) -> Result<ModelHandle, AdapterError> {
        let bytes = read_artifact(path)?;
        let model = ModelProto::decode_bytes(&bytes)
            .map_err(|e| AdapterError::load(format!("onnx protobuf: {}", e)))?;
        let lowered = lower_model(&model)?;
        tracing::debug!(
            path = %path.display(),
            producer = %model.producer_name,
            features = ?lowered.estimator.n_features(),
            "Lowered ONNX model"
        );
        Ok(lowered.into_handle())
    }

    fn predict(
        &self,
        handle: &ModelHandle,
        input: &FeatureMatrix,
    ) -> Result<PredictionOutput, AdapterError> {
        predict_estimator(handle, input)
    }

    fn describe_input_schema(&self, handle: &ModelHandle) -> Option<InputSchema> {
        estimator_schema(handle)
    }
}

pub(crate) fn lower_model(model: &ModelProto) -> Result<EstimatorModel, AdapterError> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| AdapterError::load("onnx model has no graph"))?;
    let (input, declared_width) = graph_input(graph)?;

    let estimator = if graph.node.iter().any(|n| ESTIMATOR_OPS.contains(&n.op_type.as_str())) {
        lower_ml_graph(graph, declared_width)?
    } else {
        let output = graph
            .output
            .first()
            .ok_or_else(|| AdapterError::load("onnx graph declares no output"))?;
        Estimator::Dense(
            dense_graph(graph, input, &output.name)?.with_n_features(declared_width),
        )
    };

    let feature_names = model.metadata(FEATURE_NAMES_KEY).map(|names| {
        names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    });
    EstimatorModel::new(estimator, feature_names.filter(|n| !n.is_empty()))
}

/// Name and declared width of the first graph input that is not an initializer
fn graph_input(graph: &GraphProto) -> Result<(&str, Option<usize>), AdapterError> {
    let input = graph
        .input
        .iter()
        .find(|i| !graph.initializer.iter().any(|t| t.name == i.name))
        .ok_or_else(|| AdapterError::load("onnx graph declares no input"))?;
    let width = input
        .r#type
        .as_ref()
        .and_then(|t| t.tensor_type.as_ref())
        .and_then(|t| t.shape.as_ref())
        .and_then(|s| s.dim.get(1))
        .and_then(|d| d.dim_value)
        .and_then(|v| usize::try_from(v).ok())
        .filter(|v| *v > 0);
    Ok((input.name.as_str(), width))
}

fn post_transform(node: &NodeProto) -> Result<PostTransform, AdapterError> {
    match node.attr_s("post_transform").as_deref() {
        None | Some("NONE") => Ok(PostTransform::None),
        Some("SOFTMAX") | Some("SOFTMAX_ZERO") => Ok(PostTransform::Softmax),
        Some("LOGISTIC") => Ok(PostTransform::Logistic),
        Some(other) => Err(AdapterError::load(format!(
            "unsupported post_transform {}",
            other
        ))),
    }
}

fn class_labels(node: &NodeProto) -> Vec<ClassLabel> {
    let ints = node.attr_ints("classlabels_ints");
    if !ints.is_empty() {
        return ints.iter().map(|i| ClassLabel::Int(*i)).collect();
    }
    node.attr_strings("classlabels_strings")
        .into_iter()
        .map(ClassLabel::Str)
        .collect()
}

fn floats(values: &[f32]) -> Vec<f64> {
    values.iter().map(|v| *v as f64).collect()
}

fn rows_of(values: Vec<f64>, rows: usize) -> Result<Vec<Vec<f64>>, AdapterError> {
    if rows == 0 || values.is_empty() || values.len() % rows != 0 {
        return Err(AdapterError::load(format!(
            "{} coefficients cannot be split into {} rows",
            values.len(),
            rows
        )));
    }
    let width = values.len() / rows;
    Ok(values.chunks(width).map(<[f64]>::to_vec).collect())
}

/// Graph of optional `Scaler` steps followed by one `ai.onnx.ml` estimator
fn lower_ml_graph(graph: &GraphProto, declared_width: Option<usize>) -> Result<Estimator, AdapterError> {
    let mut steps = Vec::new();
    let mut estimator = None;
    for node in &graph.node {
        let op = node.op_type.as_str();
        if PASS_THROUGH_OPS.contains(&op) {
            continue;
        }
        if estimator.is_some() {
            return Err(AdapterError::load(format!(
                "operator {} follows the estimator",
                op
            )));
        }
        match op {
            "Scaler" => {
                let offset = floats(node.attr_floats("offset"));
                let scale = floats(node.attr_floats("scale"));
                if offset.len() != scale.len() {
                    return Err(AdapterError::load("Scaler offset and scale differ in width"));
                }
                let add = offset.iter().zip(&scale).map(|(o, s)| -o * s).collect();
                steps.push(Affine { mul: scale, add });
            }
            "LinearRegressor" => estimator = Some(linear_regressor(node)?),
            "LinearClassifier" => estimator = Some(linear_classifier(node)?),
            "TreeEnsembleRegressor" | "TreeEnsembleClassifier" => {
                estimator = Some(tree_ensemble(node, declared_width)?)
            }
            other => {
                return Err(AdapterError::load(format!(
                    "unsupported operator {} in ml graph",
                    other
                )));
            }
        }
    }
    let estimator = estimator.ok_or_else(|| AdapterError::load("onnx graph has no estimator"))?;
    if steps.is_empty() {
        return Ok(estimator);
    }
    Ok(Estimator::Pipeline {
        steps,
        last: Box::new(estimator),
    })
}

fn linear_regressor(node: &NodeProto) -> Result<Estimator, AdapterError> {
    let targets = node.attr_i("targets").unwrap_or(1).max(1) as usize;
    let weights = rows_of(floats(node.attr_floats("coefficients")), targets)?;
    let linear = LinearModel::new(weights, floats(node.attr_floats("intercepts")))?;
    Ok(Estimator::Linear(linear))
}

fn linear_classifier(node: &NodeProto) -> Result<Estimator, AdapterError> {
    let classes = class_labels(node);
    if classes.len() < 2 {
        return Err(AdapterError::load("LinearClassifier needs at least two class labels"));
    }
    let coefficients = floats(node.attr_floats("coefficients"));
    let intercepts = floats(node.attr_floats("intercepts"));
    // Binary classifiers may carry one row or one per class
    let rows = if intercepts.len() == 1 { 1 } else { classes.len() };
    let linear = LinearModel::new(rows_of(coefficients, rows)?, intercepts)?;
    let post = match post_transform(node)? {
        PostTransform::None if rows == 1 => PostTransform::Logistic,
        other => other,
    };
    Ok(Estimator::Classifier(LinearClassifier::new(linear, classes, post)?))
}

fn split_rule(mode: &str) -> Result<Option<SplitRule>, AdapterError> {
    Ok(Some(match mode {
        "LEAF" => return Ok(None),
        "BRANCH_LEQ" => SplitRule::Leq,
        "BRANCH_LT" => SplitRule::Lt,
        "BRANCH_GTE" => SplitRule::Gte,
        "BRANCH_GT" => SplitRule::Gt,
        "BRANCH_EQ" => SplitRule::Eq,
        "BRANCH_NEQ" => SplitRule::Neq,
        other => return Err(AdapterError::load(format!("unknown node mode {}", other))),
    }))
}

fn tree_ensemble(node: &NodeProto, declared_width: Option<usize>) -> Result<Estimator, AdapterError> {
    let classifier = node.op_type == "TreeEnsembleClassifier";
    let tree_ids = node.attr_ints("nodes_treeids");
    let node_ids = node.attr_ints("nodes_nodeids");
    let features = node.attr_ints("nodes_featureids");
    let thresholds = node.attr_floats("nodes_values");
    let modes = node.attr_strings("nodes_modes");
    let true_ids = node.attr_ints("nodes_truenodeids");
    let false_ids = node.attr_ints("nodes_falsenodeids");
    let n = tree_ids.len();
    if n == 0
        || [node_ids.len(), features.len(), thresholds.len(), true_ids.len(), false_ids.len()]
            .iter()
            .any(|len| *len != n)
        || modes.len() != n
    {
        return Err(AdapterError::load("tree ensemble node attributes differ in length"));
    }

    let (prefix, task) = if classifier {
        let classes = class_labels(node);
        if classes.is_empty() {
            return Err(AdapterError::load("TreeEnsembleClassifier has no class labels"));
        }
        ("class", EnsembleTask::Classification { classes })
    } else {
        let n_targets = node.attr_i("n_targets").unwrap_or(1).max(1) as usize;
        ("target", EnsembleTask::Regression { n_outputs: n_targets })
    };
    let width = match &task {
        EnsembleTask::Classification { classes } => classes.len(),
        EnsembleTask::Regression { n_outputs } => *n_outputs,
    };

    // (tree id, node id) -> position inside that tree
    let mut trees: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    let mut local: HashMap<(i64, i64), usize> = HashMap::new();
    for i in 0..n {
        let members = trees.entry(tree_ids[i]).or_default();
        local.insert((tree_ids[i], node_ids[i]), members.len());
        members.push(i);
    }

    let mut leaf_values: HashMap<(i64, i64), Vec<f64>> = HashMap::new();
    let w_tree = node.attr_ints(&format!("{}_treeids", prefix));
    let w_node = node.attr_ints(&format!("{}_nodeids", prefix));
    let w_id = node.attr_ints(&format!("{}_ids", prefix));
    let w_weight = node.attr_floats(&format!("{}_weights", prefix));
    if [w_node.len(), w_id.len(), w_weight.len()].iter().any(|len| *len != w_tree.len()) {
        return Err(AdapterError::load("tree ensemble leaf attributes differ in length"));
    }
    for j in 0..w_tree.len() {
        let slot = usize::try_from(w_id[j])
            .ok()
            .filter(|s| *s < width)
            .ok_or_else(|| AdapterError::load(format!("leaf weight targets output {}", w_id[j])))?;
        leaf_values
            .entry((w_tree[j], w_node[j]))
            .or_insert_with(|| vec![0.0; width])[slot] += w_weight[j] as f64;
    }

    let child = |tree: i64, id: i64| {
        local
            .get(&(tree, id))
            .copied()
            .ok_or_else(|| AdapterError::load(format!("tree {} has no node {}", tree, id)))
    };
    let mut built = Vec::with_capacity(trees.len());
    for (tree_id, members) in &trees {
        let nodes = members
            .iter()
            .map(|&i| -> Result<TreeNode, AdapterError> {
                Ok(match split_rule(&modes[i])? {
                    None => TreeNode::Leaf {
                        value: leaf_values
                            .get(&(*tree_id, node_ids[i]))
                            .cloned()
                            .unwrap_or_else(|| vec![0.0; width]),
                    },
                    Some(rule) => TreeNode::Split {
                        feature: usize::try_from(features[i])
                            .map_err(|_| AdapterError::load("negative feature id"))?,
                        threshold: thresholds[i] as f64,
                        rule,
                        when_true: child(*tree_id, true_ids[i])?,
                        when_false: child(*tree_id, false_ids[i])?,
                    },
                })
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;
        // the first listed node of each tree is its root
        built.push(Tree::new(nodes)?);
    }

    let aggregation = match node.attr_s("aggregate_function").as_deref() {
        None | Some("SUM") => Aggregation::Sum,
        Some("AVERAGE") => Aggregation::Average,
        Some(other) => {
            return Err(AdapterError::load(format!(
                "unsupported aggregate_function {}",
                other
            )));
        }
    };
    let required = TreeEnsemble::required_features(&built);
    Ok(Estimator::Trees(TreeEnsemble {
        trees: built,
        task,
        aggregation,
        base_values: floats(node.attr_floats("base_values")),
        normalize_leaves: false,
        post: post_transform(node)?,
        n_features: declared_width.filter(|w| *w >= required).unwrap_or(required),
    }))
}

fn dense_op(node: &NodeProto) -> Result<OpKind, AdapterError> {
    Ok(match node.op_type.as_str() {
        "MatMul" => OpKind::MatMul,
        "Gemm" => OpKind::Gemm {
            alpha: node.attr_f("alpha").unwrap_or(1.0) as f64,
            beta: node.attr_f("beta").unwrap_or(1.0) as f64,
            trans_a: node.attr_i("transA").unwrap_or(0) != 0,
            trans_b: node.attr_i("transB").unwrap_or(0) != 0,
        },
        "Add" => OpKind::Add,
        "Sub" => OpKind::Sub,
        "Mul" => OpKind::Mul,
        "Relu" => OpKind::Relu,
        "Sigmoid" => OpKind::Sigmoid,
        "Tanh" => OpKind::Tanh,
        "Softmax" => OpKind::Softmax,
        "Identity" | "Cast" | "Flatten" | "Dropout" => OpKind::Identity,
        other => {
            return Err(AdapterError::load(format!(
                "unsupported operator {}",
                other
            )));
        }
    })
}

fn dense_graph(graph: &GraphProto, input: &str, output: &str) -> Result<DenseGraph, AdapterError> {
    let mut constants = HashMap::new();
    for tensor in &graph.initializer {
        let values = tensor
            .to_f64()
            .map_err(|e| AdapterError::load(format!("initializer: {}", e)))?;
        constants.insert(tensor.name.clone(), Matrix::from_shape(&tensor.shape(), values)?);
    }

    let mut ops = Vec::with_capacity(graph.node.len());
    for node in &graph.node {
        let out = node
            .output
            .first()
            .ok_or_else(|| AdapterError::load(format!("node '{}' has no output", node.name)))?;
        if node.op_type == "Constant" {
            let tensor = node
                .attr("value")
                .and_then(|a| a.t.as_ref())
                .ok_or_else(|| AdapterError::load("Constant without a tensor value"))?;
            let values = tensor
                .to_f64()
                .map_err(|e| AdapterError::load(format!("constant: {}", e)))?;
            constants.insert(out.clone(), Matrix::from_shape(&tensor.shape(), values)?);
            continue;
        }
        let kind = dense_op(node)?;
        // Dropout and friends carry optional extra inputs
        let inputs: Vec<String> = match kind {
            OpKind::Identity => node.input.iter().take(1).cloned().collect(),
            _ => node.input.iter().filter(|i| !i.is_empty()).cloned().collect(),
        };
        ops.push(Op {
            kind,
            inputs,
            output: out.clone(),
        });
    }

    DenseGraph::new(input.to_string(), output.to_string(), ops, constants, GraphTask::Infer)
}
