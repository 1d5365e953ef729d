//! Frozen TensorFlow inference graphs (`GraphDef` protobuf)

use super::dense::{DenseGraph, GraphTask, Matrix, Op, OpKind};
use super::estimator::Estimator;
use super::{
    AdapterError, EstimatorModel, FormatAdapter, InputSchema, ModelHandle, PredictionOutput,
    estimator_schema, predict_estimator, read_artifact,
};
use crate::format::ModelFormat;
use crate::input::FeatureMatrix;
use crate::proto::tensorflow::{GraphDef, NodeDef};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Ops that produce no value the dense evaluator consumes
const INERT_OPS: [&str; 3] = ["NoOp", "Placeholder", "Const"];

#[derive(Debug, Default, Clone, Copy)]
pub struct TensorflowAdapter;

impl FormatAdapter for TensorflowAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Tensorflow
    }

    fn load(&self, path: &Path) -> Result<ModelHandle, AdapterError> {
        let bytes = read_artifact(path)?;
        let graph = GraphDef::decode_bytes(&bytes)
            .map_err(|e| AdapterError::load(format!("graphdef protobuf: {}", e)))?;
        let lowered = lower_graph(&graph)?;
        tracing::debug!(
            path = %path.display(),
            nodes = graph.node.len(),
            features = ?lowered.estimator.n_features(),
            "Lowered TensorFlow graph"
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

fn op_kind(node: &NodeDef) -> Result<OpKind, AdapterError> {
    Ok(match node.op.as_str() {
        "MatMul" => {
            let trans_a = node.attr_bool("transpose_a").unwrap_or(false);
            let trans_b = node.attr_bool("transpose_b").unwrap_or(false);
            if trans_a || trans_b {
                OpKind::Gemm {
                    alpha: 1.0,
                    beta: 1.0,
                    trans_a,
                    trans_b,
                }
            } else {
                OpKind::MatMul
            }
        }
        "BiasAdd" | "Add" | "AddV2" => OpKind::Add,
        "Sub" => OpKind::Sub,
        "Mul" => OpKind::Mul,
        "Relu" => OpKind::Relu,
        "Sigmoid" => OpKind::Sigmoid,
        "Tanh" => OpKind::Tanh,
        "Softmax" => OpKind::Softmax,
        "Identity" | "StopGradient" => OpKind::Identity,
        other => {
            return Err(AdapterError::load(format!(
                "unsupported TensorFlow op {}",
                other
            )));
        }
    })
}

pub(crate) fn lower_graph(graph: &GraphDef) -> Result<EstimatorModel, AdapterError> {
    let mut placeholders = graph.node.iter().filter(|n| n.op == "Placeholder");
    let input = placeholders
        .next()
        .ok_or_else(|| AdapterError::load("graph has no Placeholder input"))?;
    if placeholders.next().is_some() {
        return Err(AdapterError::load("graphs with several inputs are not supported"));
    }
    let declared_width = input
        .attr_shape("shape")
        .and_then(|s| s.dim.get(1))
        .and_then(|d| usize::try_from(d.size).ok())
        .filter(|w| *w > 0);

    let mut constants = HashMap::new();
    for node in graph.node.iter().filter(|n| n.op == "Const") {
        let tensor = node
            .attr_tensor("value")
            .ok_or_else(|| AdapterError::load(format!("Const '{}' has no value", node.name)))?;
        let values = tensor
            .to_f64()
            .map_err(|e| AdapterError::load(format!("Const '{}': {}", node.name, e)))?;
        constants.insert(node.name.clone(), Matrix::from_shape(&tensor.shape(), values)?);
    }

    let compute: Vec<&NodeDef> = graph
        .node
        .iter()
        .filter(|n| !INERT_OPS.contains(&n.op.as_str()))
        .collect();
    let ops = ordered_ops(&compute, &input.name, &constants)?;

    let consumed: HashSet<&str> = compute.iter().copied().flat_map(NodeDef::data_inputs).collect();
    let output = compute
        .iter()
        .rev()
        .find(|n| !consumed.contains(n.name.as_str()))
        .ok_or_else(|| AdapterError::load("graph has no output op"))?;

    let dense = DenseGraph::new(
        input.name.clone(),
        output.name.clone(),
        ops,
        constants,
        GraphTask::Infer,
    )?
    .with_n_features(declared_width);
    EstimatorModel::new(Estimator::Dense(dense), None)
}

/// Order ops so every input is produced before it is read
fn ordered_ops(
    nodes: &[&NodeDef],
    input: &str,
    constants: &HashMap<String, Matrix>,
) -> Result<Vec<Op>, AdapterError> {
    let mut known: HashSet<&str> = constants.keys().map(String::as_str).collect();
    known.insert(input);
    let mut pending: Vec<&NodeDef> = nodes.to_vec();
    let mut ops = Vec::with_capacity(nodes.len());

    while !pending.is_empty() {
        let before = pending.len();
        let mut waiting = Vec::new();
        for node in pending {
            if node.data_inputs().all(|i| known.contains(i)) {
                ops.push(Op {
                    kind: op_kind(node)?,
                    inputs: node.data_inputs().map(str::to_string).collect(),
                    output: node.name.clone(),
                });
                known.insert(node.name.as_str());
            } else {
                waiting.push(node);
            }
        }
        if waiting.len() == before {
            return Err(AdapterError::load(format!(
                "op '{}' reads a value that is never produced",
                waiting[0].name
            )));
        }
        pending = waiting;
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PredictionValue;
    use crate::proto::tensorflow::{
        AttrValue, DT_FLOAT, TensorProto, TensorShapeDim, TensorShapeProto, attr_value,
    };

    fn node(name: &str, op: &str, inputs: &[&str]) -> NodeDef {
        NodeDef {
            name: name.into(),
            op: op.into(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn shape(dims: &[i64]) -> TensorShapeProto {
        TensorShapeProto {
            dim: dims
                .iter()
                .map(|d| TensorShapeDim {
                    size: *d,
                    name: String::new(),
                })
                .collect(),
            unknown_rank: false,
        }
    }

    fn constant(name: &str, dims: &[i64], values: &[f32]) -> NodeDef {
        let mut n = node(name, "Const", &[]);
        n.attr.insert(
            "value".into(),
            AttrValue {
                value: Some(attr_value::Value::Tensor(TensorProto {
                    dtype: DT_FLOAT,
                    tensor_shape: Some(shape(dims)),
                    float_val: values.to_vec(),
                    ..Default::default()
                })),
            },
        );
        n
    }

    fn placeholder(width: i64) -> NodeDef {
        let mut n = node("x", "Placeholder", &[]);
        n.attr.insert(
            "shape".into(),
            AttrValue {
                value: Some(attr_value::Value::Shape(shape(&[-1, width]))),
            },
        );
        n
    }

    #[test]
    fn test_out_of_order_nodes_are_sorted() {
        // output op listed before the op it reads
        let graph = GraphDef {
            node: vec![
                node("y", "BiasAdd", &["mm", "b"]),
                placeholder(2),
                constant("w", &[2, 1], &[1.0, 2.0]),
                constant("b", &[1], &[0.5]),
                node("mm", "MatMul", &["x", "w"]),
            ],
            library: None,
        };
        let lowered = lower_graph(&graph).unwrap();
        assert_eq!(lowered.estimator.n_features(), Some(2));
        let out = lowered
            .estimator
            .predict(&FeatureMatrix::from_rows(vec![vec![1.0, 1.0]]).unwrap())
            .unwrap();
        assert_eq!(out.predictions, vec![PredictionValue::Number(3.5)]);
    }

    #[test]
    fn test_softmax_output_classifies() {
        let graph = GraphDef {
            node: vec![
                placeholder(1),
                constant("w", &[1, 2], &[1.0, -1.0]),
                node("logits", "MatMul", &["x", "w"]),
                node("probs", "Softmax", &["logits"]),
            ],
            library: None,
        };
        let lowered = lower_graph(&graph).unwrap();
        let out = lowered
            .estimator
            .predict(&FeatureMatrix::from_rows(vec![vec![-2.0]]).unwrap())
            .unwrap();
        assert_eq!(out.predictions, vec![PredictionValue::Integer(1)]);
        assert!(out.confidence.is_some());
    }

    #[test]
    fn test_dangling_input_rejected() {
        let graph = GraphDef {
            node: vec![placeholder(1), node("y", "Relu", &["missing"])],
            library: None,
        };
        let err = lower_graph(&graph).unwrap_err();
        assert!(err.to_string().contains("never produced"));
    }

    #[test]
    fn test_unsupported_op_rejected() {
        let graph = GraphDef {
            node: vec![placeholder(1), node("y", "Conv2D", &["x"])],
            library: None,
        };
        assert!(lower_graph(&graph).unwrap_err().to_string().contains("Conv2D"));
    }
}
