//! Subset of TensorFlow's `graph.proto`, `node_def.proto`, `attr_value.proto`
//! and `tensor.proto` needed to read frozen inference graphs.

use prost::Message;
use std::collections::HashMap;

pub const DT_FLOAT: i32 = 1;
pub const DT_DOUBLE: i32 = 2;
pub const DT_INT32: i32 = 3;
pub const DT_INT64: i32 = 9;
pub const DT_HALF: i32 = 19;

#[derive(Clone, PartialEq, Message)]
pub struct GraphDef {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeDef>,
    #[prost(message, optional, tag = "2")]
    pub library: Option<FunctionDefLibrary>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FunctionDefLibrary {
    #[prost(message, repeated, tag = "1")]
    pub function: Vec<FunctionDef>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FunctionDef {
    #[prost(message, repeated, tag = "3")]
    pub node_def: Vec<NodeDef>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeDef {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub op: String,
    #[prost(string, repeated, tag = "3")]
    pub input: Vec<String>,
    #[prost(string, tag = "4")]
    pub device: String,
    #[prost(map = "string, message", tag = "5")]
    pub attr: HashMap<String, AttrValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttrValue {
    #[prost(oneof = "attr_value::Value", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub value: Option<attr_value::Value>,
}

pub mod attr_value {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        List(super::ListValue),
        #[prost(bytes = "vec", tag = "2")]
        S(Vec<u8>),
        #[prost(int64, tag = "3")]
        I(i64),
        #[prost(float, tag = "4")]
        F(f32),
        #[prost(bool, tag = "5")]
        B(bool),
        #[prost(int32, tag = "6")]
        Type(i32),
        #[prost(message, tag = "7")]
        Shape(super::TensorShapeProto),
        #[prost(message, tag = "8")]
        Tensor(super::TensorProto),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ListValue {
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub s: Vec<Vec<u8>>,
    #[prost(int64, repeated, tag = "3")]
    pub i: Vec<i64>,
    #[prost(float, repeated, tag = "4")]
    pub f: Vec<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "2")]
    pub dim: Vec<TensorShapeDim>,
    #[prost(bool, tag = "3")]
    pub unknown_rank: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeDim {
    #[prost(int64, tag = "1")]
    pub size: i64,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int32, tag = "1")]
    pub dtype: i32,
    #[prost(message, optional, tag = "2")]
    pub tensor_shape: Option<TensorShapeProto>,
    #[prost(bytes = "vec", tag = "4")]
    pub tensor_content: Vec<u8>,
    #[prost(float, repeated, tag = "5")]
    pub float_val: Vec<f32>,
    #[prost(double, repeated, tag = "6")]
    pub double_val: Vec<f64>,
    #[prost(int32, repeated, tag = "7")]
    pub int_val: Vec<i32>,
    #[prost(int64, repeated, tag = "10")]
    pub int64_val: Vec<i64>,
    #[prost(int32, repeated, tag = "13")]
    pub half_val: Vec<i32>,
}

impl GraphDef {
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }

    /// Every node in the graph and in its function library
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeDef> {
        let library = self
            .library
            .iter()
            .flat_map(|l| l.function.iter())
            .flat_map(|f| f.node_def.iter());
        self.node.iter().chain(library)
    }
}

impl NodeDef {
    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        match self.attr.get(name)?.value.as_ref()? {
            attr_value::Value::B(b) => Some(*b),
            _ => None,
        }
    }

    pub fn attr_tensor(&self, name: &str) -> Option<&TensorProto> {
        match self.attr.get(name)?.value.as_ref()? {
            attr_value::Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn attr_shape(&self, name: &str) -> Option<&TensorShapeProto> {
        match self.attr.get(name)?.value.as_ref()? {
            attr_value::Value::Shape(s) => Some(s),
            _ => None,
        }
    }

    /// Input names with control-dependency markers and output ports stripped
    pub fn data_inputs(&self) -> impl Iterator<Item = &str> {
        self.input
            .iter()
            .filter(|i| !i.starts_with('^'))
            .map(|i| i.split(':').next().unwrap_or(i))
    }
}

impl TensorProto {
    pub fn shape(&self) -> Vec<usize> {
        self.tensor_shape
            .as_ref()
            .map(|s| s.dim.iter().map(|d| d.size.max(0) as usize).collect())
            .unwrap_or_default()
    }

    /// Element values widened to `f64`.
    ///
    /// A single typed value with a larger shape is broadcast, matching how
    /// TensorFlow serializes constant-filled tensors.
    pub fn to_f64(&self) -> Result<Vec<f64>, String> {
        let expected: usize = self.shape().iter().product();

        let values: Vec<f64> = if !self.tensor_content.is_empty() {
            let raw = &self.tensor_content;
            match self.dtype {
                DT_FLOAT => raw
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                    .collect(),
                DT_DOUBLE => raw
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        f64::from_le_bytes(b)
                    })
                    .collect(),
                DT_INT32 => raw
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                    .collect(),
                DT_INT64 => raw
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        i64::from_le_bytes(b) as f64
                    })
                    .collect(),
                DT_HALF => raw
                    .chunks_exact(2)
                    .map(|c| crate::pickle::numpy::f16_to_f32(u16::from_le_bytes([c[0], c[1]])) as f64)
                    .collect(),
                other => return Err(format!("unsupported tensor dtype {}", other)),
            }
        } else {
            match self.dtype {
                DT_FLOAT => self.float_val.iter().map(|v| *v as f64).collect(),
                DT_DOUBLE => self.double_val.clone(),
                DT_INT32 => self.int_val.iter().map(|v| *v as f64).collect(),
                DT_INT64 => self.int64_val.iter().map(|v| *v as f64).collect(),
                DT_HALF => self
                    .half_val
                    .iter()
                    .map(|v| crate::pickle::numpy::f16_to_f32(*v as u16) as f64)
                    .collect(),
                other => return Err(format!("unsupported tensor dtype {}", other)),
            }
        };

        match values.len() {
            n if n == expected => Ok(values),
            1 if expected > 1 => Ok(vec![values[0]; expected]),
            n => Err(format!("tensor holds {} values for shape {:?}", n, self.shape())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dims: &[i64]) -> Option<TensorShapeProto> {
        Some(TensorShapeProto {
            dim: dims
                .iter()
                .map(|d| TensorShapeDim {
                    size: *d,
                    name: String::new(),
                })
                .collect(),
            unknown_rank: false,
        })
    }

    #[test]
    fn test_tensor_content_decoding() {
        let t = TensorProto {
            dtype: DT_FLOAT,
            tensor_shape: shape(&[2, 2]),
            tensor_content: [1.0f32, 2.0, 3.0, 4.0]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            ..Default::default()
        };
        assert_eq!(t.to_f64().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_single_value_broadcasts() {
        let t = TensorProto {
            dtype: DT_FLOAT,
            tensor_shape: shape(&[3]),
            float_val: vec![0.5],
            ..Default::default()
        };
        assert_eq!(t.to_f64().unwrap(), vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_data_inputs_strip_ports_and_control_edges() {
        let node = NodeDef {
            name: "add".into(),
            op: "Add".into(),
            input: vec!["x:0".into(), "^init".into(), "bias".into()],
            ..Default::default()
        };
        let inputs: Vec<_> = node.data_inputs().collect();
        assert_eq!(inputs, vec!["x", "bias"]);
    }

    #[test]
    fn test_library_nodes_are_visited() {
        let graph = GraphDef {
            node: vec![NodeDef {
                op: "Placeholder".into(),
                ..Default::default()
            }],
            library: Some(FunctionDefLibrary {
                function: vec![FunctionDef {
                    node_def: vec![NodeDef {
                        op: "PyFunc".into(),
                        ..Default::default()
                    }],
                }],
            }),
        };
        let decoded = GraphDef::decode_bytes(&graph.encode_to_vec()).unwrap();
        let ops: Vec<_> = decoded.all_nodes().map(|n| n.op.as_str()).collect();
        assert_eq!(ops, vec!["Placeholder", "PyFunc"]);
    }
}
