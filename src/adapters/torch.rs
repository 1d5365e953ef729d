//! PyTorch zip checkpoints holding the weights of a feed-forward network
//!
//! The archive's `data.pkl` is interpreted symbolically. Tensors are
//! `torch._utils._rebuild_tensor_v2` calls over persistent storage ids, and
//! their bytes are gathered from `data/<key>` entries. A state dict of
//! `*.weight` / `*.bias` pairs is lowered to a chain of dense layers.

use super::dense::{DenseGraph, GraphTask, Matrix, Op, OpKind, activation};
use super::estimator::{ClassLabel, Estimator};
use super::{
    AdapterError, EstimatorModel, FormatAdapter, InputSchema, ModelHandle, PredictionOutput,
    estimator_schema, predict_estimator, read_artifact,
};
use crate::container::{ExpansionLimits, TorchArchive};
use crate::format::ModelFormat;
use crate::input::FeatureMatrix;
use crate::pickle::numpy::{self, f16_to_f32};
use crate::pickle::{Flavor, Heap, Node, NodeId, unpickle};
use std::collections::HashMap;
use std::path::Path;

const STATE_DICT_KEYS: [&str; 2] = ["state_dict", "model_state_dict"];

#[derive(Debug, Clone, Copy)]
pub struct TorchAdapter {
    limits: ExpansionLimits,
}

impl TorchAdapter {
    pub fn new(limits: ExpansionLimits) -> Self {
        Self { limits }
    }
}

impl FormatAdapter for TorchAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Pytorch
    }

    fn load(&self, path: &Path) -> Result<ModelHandle, AdapterError> {
        let bytes = read_artifact(path)?;
        let archive = TorchArchive::open(&bytes, self.limits)
            .map_err(|e| AdapterError::load(format!("torch archive: {}", e)))?;
        let model = lower_archive(&archive)?;
        tracing::debug!(
            path = %path.display(),
            features = ?model.estimator.n_features(),
            "Lowered torch checkpoint"
        );
        Ok(model.into_handle())
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

/// Element type of a legacy typed storage class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageKind {
    F32,
    F64,
    F16,
    BF16,
    I64,
    I32,
    U8,
}

impl StorageKind {
    fn from_class(name: &str) -> Option<Self> {
        Some(match name {
            "FloatStorage" => Self::F32,
            "DoubleStorage" => Self::F64,
            "HalfStorage" => Self::F16,
            "BFloat16Storage" => Self::BF16,
            "LongStorage" => Self::I64,
            "IntStorage" => Self::I32,
            "ByteStorage" | "BoolStorage" => Self::U8,
            _ => return None,
        })
    }

    fn size(&self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::U8 => 1,
        }
    }

    fn decode(&self, b: &[u8]) -> f64 {
        match self {
            Self::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Self::F64 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            Self::F16 => f16_to_f32(u16::from_le_bytes([b[0], b[1]])) as f64,
            Self::BF16 => f32::from_bits((u16::from_le_bytes([b[0], b[1]]) as u32) << 16) as f64,
            Self::I64 => i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64,
            Self::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Self::U8 => b[0] as f64,
        }
    }
}

/// A materialised tensor from the checkpoint
#[derive(Debug, Clone, PartialEq)]
struct TorchTensor {
    shape: Vec<usize>,
    values: Vec<f64>,
}

struct Reader<'a> {
    heap: &'a Heap,
    archive: &'a TorchArchive,
    prefix: &'a str,
}

impl Reader<'_> {
    fn usizes(&self, id: NodeId, what: &str) -> Result<Vec<usize>, AdapterError> {
        let items = self
            .heap
            .seq(id)
            .ok_or_else(|| AdapterError::load(format!("tensor {} is not a tuple", what)))?;
        items
            .iter()
            .map(|i| {
                self.heap
                    .int(*i)
                    .and_then(|v| usize::try_from(v).ok())
                    .ok_or_else(|| AdapterError::load(format!("tensor {} holds a negative value", what)))
            })
            .collect()
    }

    /// Storage bytes and element kind behind a persistent id
    fn storage(&self, id: NodeId) -> Result<(&[u8], StorageKind), AdapterError> {
        let Node::Persistent(pid) = self.heap.get(id) else {
            return Err(AdapterError::load("tensor storage is not a persistent reference"));
        };
        let parts = self
            .heap
            .seq(*pid)
            .ok_or_else(|| AdapterError::load("persistent id is not a tuple"))?;
        let [tag, class, key, ..] = parts else {
            return Err(AdapterError::load("persistent id is too short"));
        };
        if self.heap.str(*tag) != Some("storage") {
            return Err(AdapterError::load("persistent id is not a storage"));
        }
        let class = self
            .heap
            .global(*class)
            .ok_or_else(|| AdapterError::load("storage type is not a class"))?;
        let kind = StorageKind::from_class(&class.name)
            .ok_or_else(|| AdapterError::load(format!("unsupported storage type {}", class)))?;
        let key = self
            .heap
            .str(*key)
            .ok_or_else(|| AdapterError::load("storage key is not a string"))?;
        let data = self
            .archive
            .storage(self.prefix, key)
            .ok_or_else(|| AdapterError::load(format!("storage '{}' missing from archive", key)))?;
        Ok((data, kind))
    }

    fn is_tensor(&self, id: NodeId) -> bool {
        self.heap
            .class_of(id)
            .is_some_and(|g| g.is("torch._utils", "_rebuild_tensor_v2") || g.is("torch._utils", "_rebuild_tensor"))
    }

    /// `_rebuild_tensor_v2(storage, offset, size, stride, ...)`
    fn tensor(&self, id: NodeId) -> Result<TorchTensor, AdapterError> {
        let object = self
            .heap
            .object(id)
            .ok_or_else(|| AdapterError::load("tensor is not a rebuild call"))?;
        let [storage, offset, size, stride, ..] = object.args.as_slice() else {
            return Err(AdapterError::load("tensor rebuild call has too few arguments"));
        };
        let (data, kind) = self.storage(*storage)?;
        let offset = self
            .heap
            .int(*offset)
            .and_then(|o| usize::try_from(o).ok())
            .ok_or_else(|| AdapterError::load("tensor offset is invalid"))?;
        let shape = self.usizes(*size, "size")?;
        let stride = self.usizes(*stride, "stride")?;
        if shape.len() != stride.len() {
            return Err(AdapterError::load("tensor size and stride differ in rank"));
        }

        let count: usize = shape.iter().product();
        let available = data.len() / kind.size();
        let mut values = Vec::with_capacity(count);
        let mut index = vec![0usize; shape.len()];
        for _ in 0..count {
            let position = offset + index.iter().zip(&stride).map(|(i, s)| i * s).sum::<usize>();
            if position >= available {
                return Err(AdapterError::load("tensor reaches past its storage"));
            }
            let start = position * kind.size();
            values.push(kind.decode(&data[start..start + kind.size()]));
            // advance the C-order multi-index
            for axis in (0..shape.len()).rev() {
                index[axis] += 1;
                if index[axis] < shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Ok(TorchTensor { shape, values })
    }
}

/// Options a training script may store next to the weights
#[derive(Debug, Default)]
struct CheckpointOptions {
    feature_names: Option<Vec<String>>,
    classes: Option<Vec<ClassLabel>>,
    task: Option<String>,
    activation: Option<String>,
}

fn checkpoint_options(heap: &Heap, root: NodeId) -> Result<CheckpointOptions, AdapterError> {
    let mut options = CheckpointOptions::default();
    let Some(entries) = heap.entries(root) else {
        return Ok(options);
    };
    for (key, value) in entries {
        match heap.str(*key) {
            Some("feature_names") => {
                options.feature_names = Some(
                    heap.strings(*value)
                        .ok_or_else(|| AdapterError::load("feature_names must be a list of strings"))?,
                );
            }
            Some("classes") => {
                let values = numpy::values(heap, *value)
                    .map_err(|e| AdapterError::load(format!("classes: {}", e)))?;
                options.classes = Some(
                    values
                        .into_iter()
                        .map(|v| match v {
                            numpy::Value::Str(s) => ClassLabel::Str(s),
                            numpy::Value::Float(f) => ClassLabel::Float(f),
                            numpy::Value::Int(i) => ClassLabel::Int(i),
                            numpy::Value::Bool(b) => ClassLabel::Int(b as i64),
                        })
                        .collect(),
                );
            }
            Some("task") => options.task = heap.str(*value).map(str::to_string),
            Some("activation") => options.activation = heap.str(*value).map(str::to_string),
            _ => {}
        }
    }
    Ok(options)
}

fn lower_archive(archive: &TorchArchive) -> Result<EstimatorModel, AdapterError> {
    let (prefix, data) = archive
        .data_pickle()
        .map_err(|e| AdapterError::load(format!("torch archive: {}", e)))?;
    let unpickled = unpickle(data, Flavor::Plain)
        .map_err(|e| AdapterError::load(format!("data.pkl: {}", e)))?;
    let heap = &unpickled.heap;
    let reader = Reader {
        heap,
        archive,
        prefix,
    };

    let root = unpickled.root;
    let state_dict = STATE_DICT_KEYS
        .iter()
        .find_map(|k| heap.dict_get(root, k))
        .unwrap_or(root);
    let options = if state_dict == root {
        CheckpointOptions::default()
    } else {
        checkpoint_options(heap, root)?
    };

    let entries = heap
        .entries(state_dict)
        .ok_or_else(|| AdapterError::load("checkpoint is not a state dict"))?;
    let mut tensors = Vec::new();
    for (key, value) in entries {
        if let Some(name) = heap.str(*key)
            && reader.is_tensor(*value)
        {
            tensors.push((name.to_string(), reader.tensor(*value)?));
        }
    }

    let estimator = Estimator::Dense(dense_layers(tensors, &options)?);
    EstimatorModel::new(estimator, options.feature_names)
}

/// Chain `<layer>.weight` / `<layer>.bias` pairs into Gemm layers
fn dense_layers(
    tensors: Vec<(String, TorchTensor)>,
    options: &CheckpointOptions,
) -> Result<DenseGraph, AdapterError> {
    let act = match options.activation.as_deref() {
        Some(name) => activation(name)
            .ok_or_else(|| AdapterError::load(format!("unsupported activation '{}'", name)))?,
        None => OpKind::Relu,
    };

    let mut constants = HashMap::new();
    let mut ops = Vec::new();
    let mut current = "input".to_string();
    let mut width: Option<usize> = None;
    let mut layers = 0;

    for (name, weight) in &tensors {
        let Some(layer) = name.strip_suffix(".weight") else {
            continue;
        };
        let &[out_dim, in_dim] = weight.shape.as_slice() else {
            continue;
        };
        if let Some(w) = width
            && w != in_dim
        {
            return Err(AdapterError::load(format!(
                "layer '{}' takes {} inputs but the previous layer emits {}",
                layer, in_dim, w
            )));
        }
        if layers > 0 {
            let activated = format!("act{}", layers);
            ops.push(Op {
                kind: act.clone(),
                inputs: vec![current],
                output: activated.clone(),
            });
            current = activated;
        }

        constants.insert(name.clone(), Matrix::new(out_dim, in_dim, weight.values.clone())?);
        let mut inputs = vec![current, name.clone()];
        let bias_name = format!("{}.bias", layer);
        if let Some((_, bias)) = tensors.iter().find(|(n, _)| *n == bias_name) {
            if bias.values.len() != out_dim {
                return Err(AdapterError::load(format!("bias '{}' has the wrong width", bias_name)));
            }
            constants.insert(bias_name.clone(), Matrix::new(1, out_dim, bias.values.clone())?);
            inputs.push(bias_name);
        }
        let output = format!("layer{}", layers);
        ops.push(Op {
            kind: OpKind::Gemm {
                alpha: 1.0,
                beta: 1.0,
                trans_a: false,
                trans_b: true,
            },
            inputs,
            output: output.clone(),
        });
        current = output;
        width = Some(out_dim);
        layers += 1;
    }

    let out_width = width.ok_or_else(|| AdapterError::load("checkpoint holds no dense layers"))?;
    let classify = match options.task.as_deref() {
        Some("classification") => true,
        Some("regression") => false,
        Some(other) => return Err(AdapterError::load(format!("unknown task '{}'", other))),
        None => out_width > 1,
    };
    let task = if classify {
        if let Some(classes) = &options.classes
            && classes.len() != out_width
        {
            return Err(AdapterError::load(format!(
                "{} class labels for {} outputs",
                classes.len(),
                out_width
            )));
        }
        ops.push(Op {
            kind: OpKind::Softmax,
            inputs: vec![current.clone()],
            output: "probabilities".to_string(),
        });
        current = "probabilities".to_string();
        GraphTask::Classification {
            classes: options.classes.clone(),
        }
    } else {
        GraphTask::Regression
    };

    DenseGraph::new("input".to_string(), current, ops, constants, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(shape: &[usize], values: &[f64]) -> TorchTensor {
        TorchTensor {
            shape: shape.to_vec(),
            values: values.to_vec(),
        }
    }

    #[test]
    fn test_two_layer_regression() {
        let tensors = vec![
            ("fc1.weight".to_string(), t(&[2, 2], &[1.0, 0.0, 0.0, 1.0])),
            ("fc1.bias".to_string(), t(&[2], &[0.0, -5.0])),
            ("fc2.weight".to_string(), t(&[1, 2], &[1.0, 1.0])),
            ("fc2.bias".to_string(), t(&[1], &[0.5])),
        ];
        let graph = dense_layers(tensors, &CheckpointOptions::default()).unwrap();
        assert_eq!(graph.n_features(), Some(2));
        let out = graph
            .predict(&FeatureMatrix::from_rows(vec![vec![2.0, 3.0]]).unwrap())
            .unwrap();
        // relu([2, -2]) = [2, 0] -> 2.5
        assert_eq!(out.predictions, vec![crate::adapters::PredictionValue::Number(2.5)]);
    }

    #[test]
    fn test_wide_output_classifies() {
        let tensors = vec![("head.weight".to_string(), t(&[3, 1], &[1.0, 0.0, -1.0]))];
        let options = CheckpointOptions {
            classes: Some(vec![
                ClassLabel::Str("a".into()),
                ClassLabel::Str("b".into()),
                ClassLabel::Str("c".into()),
            ]),
            ..Default::default()
        };
        let graph = dense_layers(tensors, &options).unwrap();
        let out = graph
            .predict(&FeatureMatrix::from_rows(vec![vec![4.0]]).unwrap())
            .unwrap();
        assert_eq!(out.predictions, vec![crate::adapters::PredictionValue::Label("a".into())]);
        assert!(out.confidence.unwrap()[0] > 0.9);
    }

    #[test]
    fn test_mismatched_layers_rejected() {
        let tensors = vec![
            ("a.weight".to_string(), t(&[3, 2], &[0.0; 6])),
            ("b.weight".to_string(), t(&[1, 2], &[0.0; 2])),
        ];
        let err = dense_layers(tensors, &CheckpointOptions::default()).unwrap_err();
        assert!(err.to_string().contains("previous layer emits 3"));
    }

    #[test]
    fn test_unknown_activation_rejected() {
        let tensors = vec![("a.weight".to_string(), t(&[1, 1], &[1.0]))];
        let options = CheckpointOptions {
            activation: Some("swish".into()),
            ..Default::default()
        };
        assert!(dense_layers(tensors, &options).is_err());
    }

    #[test]
    fn test_storage_kinds() {
        assert_eq!(StorageKind::F32.decode(&1.5f32.to_le_bytes()), 1.5);
        assert_eq!(StorageKind::I64.decode(&(-3i64).to_le_bytes()), -3.0);
        assert_eq!(StorageKind::BF16.decode(&[0x80, 0x3f]), 1.0);
        assert_eq!(StorageKind::from_class("ComplexFloatStorage"), None);
    }
}
