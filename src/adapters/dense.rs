//! Small feed-forward graph evaluator over 2-D `f64` matrices
//!
//! Shared by the ONNX, TensorFlow and PyTorch adapters. Values are named;
//! every op reads named inputs and writes one named output.

use super::estimator::{ClassLabel, classification_output, regression_output, sigmoid, softmax};
use super::{AdapterError, PredictionOutput};
use crate::input::FeatureMatrix;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, AdapterError> {
        if rows * cols != data.len() {
            return Err(AdapterError::load(format!(
                "matrix {}x{} given {} values",
                rows,
                cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Lay out a tensor of rank 0, 1 or 2; vectors become a single row
    pub fn from_shape(shape: &[usize], data: Vec<f64>) -> Result<Self, AdapterError> {
        match shape {
            [] => Self::new(1, 1, data),
            [n] => Self::new(1, *n, data),
            [r, c] => Self::new(*r, *c, data),
            other => Err(AdapterError::load(format!(
                "tensors of rank {} are not supported",
                other.len()
            ))),
        }
    }

    fn at(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    pub fn transpose(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len());
        for c in 0..self.cols {
            for r in 0..self.rows {
                data.push(self.at(r, c));
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    fn matmul(&self, other: &Matrix) -> Result<Matrix, AdapterError> {
        if self.cols != other.rows {
            return Err(AdapterError::prediction(format!(
                "cannot multiply {}x{} by {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        let mut data = vec![0.0; self.rows * other.cols];
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self.at(i, k);
                if a == 0.0 {
                    continue;
                }
                for j in 0..other.cols {
                    data[i * other.cols + j] += a * other.at(k, j);
                }
            }
        }
        Ok(Matrix {
            rows: self.rows,
            cols: other.cols,
            data,
        })
    }

    fn scale(&self, k: f64) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|v| v * k).collect(),
        }
    }

    /// Element-wise op with row-vector and scalar broadcasting on either side
    fn zip_broadcast(
        &self,
        other: &Matrix,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Matrix, AdapterError> {
        let rows = self.rows.max(other.rows);
        let cols = self.cols.max(other.cols);
        let fits = |m: &Matrix| (m.rows == rows || m.rows == 1) && (m.cols == cols || m.cols == 1);
        if !fits(self) || !fits(other) {
            return Err(AdapterError::prediction(format!(
                "cannot broadcast {}x{} with {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        let pick = |m: &Matrix, r: usize, c: usize| {
            m.at(if m.rows == 1 { 0 } else { r }, if m.cols == 1 { 0 } else { c })
        };
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(pick(self, r, c), pick(other, r, c)));
            }
        }
        Ok(Matrix { rows, cols, data })
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    fn row_softmax(&self) -> Matrix {
        let mut out = self.clone();
        for row in out.data.chunks_exact_mut(self.cols.max(1)) {
            softmax(row);
        }
        out
    }

    fn into_rows(self) -> Vec<Vec<f64>> {
        self.data
            .chunks_exact(self.cols.max(1))
            .map(<[f64]>::to_vec)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    MatMul,
    /// `alpha * A' * B' + beta * C`
    Gemm {
        alpha: f64,
        beta: f64,
        trans_a: bool,
        trans_b: bool,
    },
    Add,
    Sub,
    Mul,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    Identity,
}

impl OpKind {
    fn arity(&self) -> std::ops::RangeInclusive<usize> {
        match self {
            OpKind::MatMul | OpKind::Add | OpKind::Sub | OpKind::Mul => 2..=2,
            OpKind::Gemm { .. } => 2..=3,
            _ => 1..=1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub kind: OpKind,
    pub inputs: Vec<String>,
    pub output: String,
}

/// How the graph's final output is interpreted
#[derive(Debug, Clone, PartialEq)]
pub enum GraphTask {
    Regression,
    Classification { classes: Option<Vec<ClassLabel>> },
    /// Classification when the graph ends in softmax over several columns
    Infer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DenseGraph {
    input: String,
    output: String,
    ops: Vec<Op>,
    constants: HashMap<String, Matrix>,
    n_features: Option<usize>,
    task: GraphTask,
}

/// Activations accepted between layers
pub fn activation(name: &str) -> Option<OpKind> {
    match name.to_ascii_lowercase().as_str() {
        "relu" => Some(OpKind::Relu),
        "sigmoid" => Some(OpKind::Sigmoid),
        "tanh" => Some(OpKind::Tanh),
        "identity" | "linear" | "none" => Some(OpKind::Identity),
        _ => None,
    }
}

impl DenseGraph {
    /// Validate and build a graph.
    ///
    /// Ops must be in evaluation order: every input is the graph input, a
    /// constant, or the output of an earlier op.
    pub fn new(
        input: String,
        output: String,
        ops: Vec<Op>,
        constants: HashMap<String, Matrix>,
        task: GraphTask,
    ) -> Result<Self, AdapterError> {
        if ops.is_empty() {
            return Err(AdapterError::load("graph has no operations"));
        }
        let mut known: Vec<&str> = vec![input.as_str()];
        known.extend(constants.keys().map(String::as_str));
        for op in &ops {
            if !op.kind.arity().contains(&op.inputs.len()) {
                return Err(AdapterError::load(format!(
                    "{:?} given {} inputs",
                    op.kind,
                    op.inputs.len()
                )));
            }
            if let Some(missing) = op.inputs.iter().find(|i| !known.contains(&i.as_str())) {
                return Err(AdapterError::load(format!(
                    "value '{}' is used before it is produced",
                    missing
                )));
            }
            known.push(op.output.as_str());
        }
        if !known.contains(&output.as_str()) {
            return Err(AdapterError::load(format!(
                "graph output '{}' is never produced",
                output
            )));
        }

        let n_features = infer_input_width(&input, &ops, &constants);
        Ok(Self {
            input,
            output,
            ops,
            constants,
            n_features,
            task,
        })
    }

    pub fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    /// Force the input width when the artifact declares it
    pub fn with_n_features(mut self, n: Option<usize>) -> Self {
        if n.is_some() {
            self.n_features = n;
        }
        self
    }

    fn ends_in_softmax(&self) -> bool {
        self.ops
            .iter()
            .rev()
            .find(|op| op.kind != OpKind::Identity)
            .is_some_and(|op| op.kind == OpKind::Softmax)
    }

    pub fn evaluate(&self, x: Matrix) -> Result<Matrix, AdapterError> {
        let mut values: HashMap<&str, Matrix> = HashMap::new();
        values.insert(self.input.as_str(), x);

        for op in &self.ops {
            let args = op
                .inputs
                .iter()
                .map(|name| {
                    values
                        .get(name.as_str())
                        .or_else(|| self.constants.get(name))
                        .ok_or_else(|| AdapterError::prediction(format!("value '{}' missing", name)))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let out = match &op.kind {
                OpKind::MatMul => args[0].matmul(args[1])?,
                OpKind::Gemm {
                    alpha,
                    beta,
                    trans_a,
                    trans_b,
                } => {
                    let a = if *trans_a { args[0].transpose() } else { args[0].clone() };
                    let b = if *trans_b { args[1].transpose() } else { args[1].clone() };
                    let mut y = a.matmul(&b)?;
                    if *alpha != 1.0 {
                        y = y.scale(*alpha);
                    }
                    if let Some(c) = args.get(2) {
                        let c = c.scale(*beta);
                        y = y.zip_broadcast(&c, |p, q| p + q)?;
                    }
                    y
                }
                OpKind::Add => args[0].zip_broadcast(args[1], |p, q| p + q)?,
                OpKind::Sub => args[0].zip_broadcast(args[1], |p, q| p - q)?,
                OpKind::Mul => args[0].zip_broadcast(args[1], |p, q| p * q)?,
                OpKind::Relu => args[0].map(|v| v.max(0.0)),
                OpKind::Sigmoid => args[0].map(sigmoid),
                OpKind::Tanh => args[0].map(f64::tanh),
                OpKind::Softmax => args[0].row_softmax(),
                OpKind::Identity => args[0].clone(),
            };
            values.insert(op.output.as_str(), out);
        }

        values
            .remove(self.output.as_str())
            .or_else(|| self.constants.get(&self.output).cloned())
            .ok_or_else(|| AdapterError::prediction("graph output was not produced"))
    }

    pub fn predict(&self, input: &FeatureMatrix) -> Result<PredictionOutput, AdapterError> {
        let x = Matrix {
            rows: input.n_rows(),
            cols: input.n_cols(),
            data: input.values().to_vec(),
        };
        let y = self.evaluate(x)?;
        if y.rows != input.n_rows() {
            return Err(AdapterError::prediction(format!(
                "graph produced {} rows for {} inputs",
                y.rows,
                input.n_rows()
            )));
        }

        let classes = match &self.task {
            GraphTask::Regression => None,
            GraphTask::Classification { classes } => Some(classes.clone()),
            GraphTask::Infer if y.cols > 1 && self.ends_in_softmax() => Some(None),
            GraphTask::Infer => None,
        };

        match classes {
            None => Ok(regression_output(y.into_rows())),
            Some(classes) => {
                let probs = if self.ends_in_softmax() { y } else { y.row_softmax() };
                let labels = classes.unwrap_or_else(|| super::estimator::index_labels(probs.cols));
                Ok(classification_output(probs.into_rows(), &labels))
            }
        }
    }
}

/// Input width implied by the first op that multiplies the graph input
fn infer_input_width(input: &str, ops: &[Op], constants: &HashMap<String, Matrix>) -> Option<usize> {
    ops.iter().find_map(|op| {
        if op.inputs.first().map(String::as_str) != Some(input) {
            return None;
        }
        let weight = constants.get(op.inputs.get(1)?)?;
        match op.kind {
            OpKind::MatMul => Some(weight.rows),
            OpKind::Gemm { trans_a: false, trans_b, .. } => {
                Some(if trans_b { weight.cols } else { weight.rows })
            }
            _ => None,
        }
    })
}
