//! Lowering of unpickled scikit-learn estimators
//!
//! Reads fitted parameters (`coef_`, `tree_`, `mean_`, ...) out of the inert
//! object graph and builds an [`Estimator`]. Linear models, logistic and SGD
//! classifiers, decision trees, random and extra-trees forests, the two
//! common scalers and `Pipeline` are understood.

use super::estimator::{
    Affine, Aggregation, ClassLabel, EnsembleTask, Estimator, LinearClassifier, LinearModel,
    PostTransform, SplitRule, Tree, TreeEnsemble, TreeNode,
};
use super::{AdapterError, EstimatorModel};
use crate::pickle::numpy::{self, Tensor, Value};
use crate::pickle::{Heap, NodeId};

/// Lower the root object of an unpickled artifact
pub fn lower(heap: &Heap, root: NodeId) -> Result<EstimatorModel, AdapterError> {
    let estimator = lower_estimator(heap, root)?;
    let feature_names = feature_names(heap, root)?;
    EstimatorModel::new(estimator, feature_names)
}

fn class_name(heap: &Heap, id: NodeId) -> Result<&str, AdapterError> {
    let class = heap
        .class_of(id)
        .ok_or_else(|| AdapterError::load("artifact root is not an estimator object"))?;
    if !class.module.starts_with("sklearn.") {
        return Err(AdapterError::load(format!("unsupported model class {}", class)));
    }
    Ok(class.name.as_str())
}

fn lower_estimator(heap: &Heap, id: NodeId) -> Result<Estimator, AdapterError> {
    let name = class_name(heap, id)?;
    match name {
        "LinearRegression" | "Ridge" | "Lasso" | "ElasticNet" | "SGDRegressor" => {
            Ok(Estimator::Linear(linear(heap, id, name)?))
        }
        "LogisticRegression" | "SGDClassifier" => {
            let linear = linear(heap, id, name)?;
            let classes = classes(heap, id, name)?;
            let post = if classes.len() == 2 {
                PostTransform::Logistic
            } else if name == "SGDClassifier"
                || attr(heap, id, "multi_class").and_then(|m| heap.str(m)) == Some("ovr")
            {
                PostTransform::OvrNormalized
            } else {
                PostTransform::Softmax
            };
            Ok(Estimator::Classifier(LinearClassifier::new(
                linear, classes, post,
            )?))
        }
        "DecisionTreeRegressor" | "ExtraTreeRegressor" => {
            tree_ensemble(heap, id, name, &[id], false)
        }
        "DecisionTreeClassifier" | "ExtraTreeClassifier" => tree_ensemble(heap, id, name, &[id], true),
        "RandomForestRegressor" | "ExtraTreesRegressor" | "RandomForestClassifier"
        | "ExtraTreesClassifier" => {
            let members = required(heap, id, name, "estimators_")?;
            let members = heap
                .seq(members)
                .ok_or_else(|| AdapterError::load(format!("{}.estimators_ is not a list", name)))?;
            tree_ensemble(heap, id, name, members, name.ends_with("Classifier"))
        }
        "StandardScaler" | "MinMaxScaler" => Err(AdapterError::load(format!(
            "{} is a transformer and cannot serve predictions on its own",
            name
        ))),
        "Pipeline" => pipeline(heap, id),
        other => Err(AdapterError::load(format!(
            "unsupported estimator class {}",
            other
        ))),
    }
}

fn attr(heap: &Heap, id: NodeId, name: &str) -> Option<NodeId> {
    heap.attr(id, name).filter(|v| !heap.is_none(*v))
}

fn required(heap: &Heap, id: NodeId, class: &str, name: &str) -> Result<NodeId, AdapterError> {
    attr(heap, id, name).ok_or_else(|| {
        AdapterError::load(format!("{} has no fitted attribute '{}'", class, name))
    })
}

fn tensor_attr(heap: &Heap, id: NodeId, class: &str, name: &str) -> Result<Tensor, AdapterError> {
    let node = required(heap, id, class, name)?;
    numpy::tensor(heap, node).map_err(|e| AdapterError::load(format!("{}.{}: {}", class, name, e)))
}

fn optional_vector(heap: &Heap, id: NodeId, class: &str, name: &str) -> Result<Option<Vec<f64>>, AdapterError> {
    match attr(heap, id, name) {
        Some(_) => Ok(Some(tensor_attr(heap, id, class, name)?.values)),
        None => Ok(None),
    }
}

fn linear(heap: &Heap, id: NodeId, class: &str) -> Result<LinearModel, AdapterError> {
    let coef = tensor_attr(heap, id, class, "coef_")?;
    let weights = if coef.shape.len() <= 1 {
        vec![coef.values]
    } else {
        coef.values.chunks(coef.cols().max(1)).map(<[f64]>::to_vec).collect()
    };
    let intercept = optional_vector(heap, id, class, "intercept_")?.unwrap_or_default();
    LinearModel::new(weights, intercept)
}

fn label(value: Value) -> ClassLabel {
    match value {
        Value::Bool(b) => ClassLabel::Int(b as i64),
        Value::Int(i) => ClassLabel::Int(i),
        Value::Float(f) => ClassLabel::Float(f),
        Value::Str(s) => ClassLabel::Str(s),
    }
}

fn classes(heap: &Heap, id: NodeId, class: &str) -> Result<Vec<ClassLabel>, AdapterError> {
    let node = required(heap, id, class, "classes_")?;
    let values = numpy::values(heap, node)
        .map_err(|e| AdapterError::load(format!("{}.classes_: {}", class, e)))?;
    if values.len() < 2 {
        return Err(AdapterError::load(format!("{} was fitted on fewer than two classes", class)));
    }
    Ok(values.into_iter().map(label).collect())
}

fn as_index(value: f64, what: &str) -> Result<usize, AdapterError> {
    if value < 0.0 || value.fract() != 0.0 {
        return Err(AdapterError::load(format!("tree has invalid {} {}", what, value)));
    }
    Ok(value as usize)
}

/// One fitted `sklearn.tree._tree.Tree`
fn tree(heap: &Heap, estimator: NodeId, class: &str) -> Result<(Tree, usize), AdapterError> {
    let tree = required(heap, estimator, class, "tree_")?;
    let nodes = required(heap, tree, "Tree", "nodes")?;
    let nodes = numpy::array(heap, nodes).map_err(|e| AdapterError::load(format!("tree nodes: {}", e)))?;
    let column = |name: &str| {
        nodes
            .record_column(name)
            .map_err(|e| AdapterError::load(format!("tree nodes: {}", e)))
    };
    let left = column("left_child")?;
    let right = column("right_child")?;
    let feature = column("feature")?;
    let threshold = column("threshold")?;
    let values = tensor_attr(heap, tree, "Tree", "values")?;

    let count = left.len();
    if count == 0 || values.values.len() % count != 0 {
        return Err(AdapterError::load("tree values do not match its node count"));
    }
    let stride = values.values.len() / count;

    let nodes = (0..count)
        .map(|i| -> Result<TreeNode, AdapterError> {
            if left[i] < 0.0 {
                return Ok(TreeNode::Leaf {
                    value: values.values[i * stride..(i + 1) * stride].to_vec(),
                });
            }
            Ok(TreeNode::Split {
                feature: as_index(feature[i], "feature")?,
                threshold: threshold[i],
                rule: SplitRule::Leq,
                when_true: as_index(left[i], "child")?,
                when_false: as_index(right[i], "child")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((Tree::new(nodes)?, stride))
}

fn tree_ensemble(
    heap: &Heap,
    id: NodeId,
    class: &str,
    members: &[NodeId],
    classification: bool,
) -> Result<Estimator, AdapterError> {
    if members.is_empty() {
        return Err(AdapterError::load(format!("{} has no fitted trees", class)));
    }
    let mut trees = Vec::with_capacity(members.len());
    let mut width = None;
    for member in members {
        let (tree, stride) = tree(heap, *member, class)?;
        if width.is_some_and(|w| w != stride) {
            return Err(AdapterError::load(format!("{} trees disagree on output width", class)));
        }
        width = Some(stride);
        trees.push(tree);
    }
    let width = width.unwrap_or(1);

    let task = if classification {
        let classes = classes(heap, id, class)?;
        if classes.len() != width {
            return Err(AdapterError::load(format!(
                "{} leaves hold {} values for {} classes",
                class,
                width,
                classes.len()
            )));
        }
        EnsembleTask::Classification { classes }
    } else {
        EnsembleTask::Regression { n_outputs: width }
    };

    let required = TreeEnsemble::required_features(&trees);
    let n_features = n_features_in(heap, id)
        .filter(|n| *n >= required)
        .unwrap_or(required);

    Ok(Estimator::Trees(TreeEnsemble {
        trees,
        task,
        aggregation: Aggregation::Average,
        base_values: Vec::new(),
        normalize_leaves: classification,
        post: PostTransform::None,
        n_features,
    }))
}

fn n_features_in(heap: &Heap, id: NodeId) -> Option<usize> {
    attr(heap, id, "n_features_in_")
        .and_then(|n| heap.int(n))
        .and_then(|n| usize::try_from(n).ok())
}

fn transformer(heap: &Heap, id: NodeId) -> Result<Affine, AdapterError> {
    let name = class_name(heap, id)?;
    match name {
        "StandardScaler" => {
            let mean = optional_vector(heap, id, name, "mean_")?;
            let scale = optional_vector(heap, id, name, "scale_")?;
            let n = mean
                .as_ref()
                .or(scale.as_ref())
                .map(Vec::len)
                .or_else(|| n_features_in(heap, id))
                .ok_or_else(|| AdapterError::load("StandardScaler has no fitted width"))?;
            Ok(Affine::standard(mean, scale, n))
        }
        "MinMaxScaler" => {
            let mul = tensor_attr(heap, id, name, "scale_")?.values;
            let add = tensor_attr(heap, id, name, "min_")?.values;
            if mul.len() != add.len() {
                return Err(AdapterError::load("MinMaxScaler scale_ and min_ differ in width"));
            }
            Ok(Affine { mul, add })
        }
        other => Err(AdapterError::load(format!(
            "pipeline step {} is not a supported transformer",
            other
        ))),
    }
}

fn pipeline(heap: &Heap, id: NodeId) -> Result<Estimator, AdapterError> {
    let steps = required(heap, id, "Pipeline", "steps")?;
    let estimators: Vec<NodeId> = heap
        .seq(steps)
        .ok_or_else(|| AdapterError::load("Pipeline.steps is not a list"))?
        .iter()
        .map(|step| {
            heap.seq(*step)
                .and_then(|pair| pair.get(1).copied())
                .ok_or_else(|| AdapterError::load("pipeline step is not a (name, estimator) pair"))
        })
        .collect::<Result<_, _>>()?;

    // `None` and "passthrough" steps are no-ops
    let active: Vec<NodeId> = estimators
        .into_iter()
        .filter(|e| !heap.is_none(*e) && heap.str(*e) != Some("passthrough"))
        .collect();
    let Some((last, transforms)) = active.split_last() else {
        return Err(AdapterError::load("pipeline has no estimator"));
    };

    let steps = transforms
        .iter()
        .map(|t| transformer(heap, *t))
        .collect::<Result<Vec<_>, _>>()?;
    for pair in steps.windows(2) {
        if pair[0].mul.len() != pair[1].mul.len() {
            return Err(AdapterError::load("pipeline transforms differ in width"));
        }
    }
    let last = lower_estimator(heap, *last)?;
    if let (Some(step), Some(n)) = (steps.last(), last.n_features())
        && step.mul.len() != n
    {
        return Err(AdapterError::load(format!(
            "pipeline transforms emit {} features but the estimator takes {}",
            step.mul.len(),
            n
        )));
    }
    if steps.is_empty() {
        return Ok(last);
    }
    Ok(Estimator::Pipeline {
        steps,
        last: Box::new(last),
    })
}

/// `feature_names_in_` of the estimator, or of a pipeline's first step
fn feature_names(heap: &Heap, root: NodeId) -> Result<Option<Vec<String>>, AdapterError> {
    let mut candidate = attr(heap, root, "feature_names_in_");
    if candidate.is_none() && heap.class_name(root) == Some("Pipeline") {
        candidate = attr(heap, root, "steps")
            .and_then(|steps| heap.seq(steps)?.first().copied())
            .and_then(|first| heap.seq(first)?.get(1).copied())
            .and_then(|first| attr(heap, first, "feature_names_in_"));
    }
    let Some(node) = candidate else {
        return Ok(None);
    };
    let names = numpy::values(heap, node)
        .map_err(|e| AdapterError::load(format!("feature_names_in_: {}", e)))?
        .into_iter()
        .map(|v| match v {
            Value::Str(s) => Ok(s),
            other => Err(AdapterError::load(format!(
                "feature name {:?} is not a string",
                other
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(names))
}
