//! Subset of `onnx.proto` needed to inspect and evaluate small models.
//!
//! Field tags follow the upstream schema; fields not listed here are skipped
//! by the decoder.

use prost::Message;

pub const DATA_TYPE_FLOAT: i32 = 1;
pub const DATA_TYPE_UINT8: i32 = 2;
pub const DATA_TYPE_INT8: i32 = 3;
pub const DATA_TYPE_INT32: i32 = 6;
pub const DATA_TYPE_INT64: i32 = 7;
pub const DATA_TYPE_STRING: i32 = 8;
pub const DATA_TYPE_BOOL: i32 = 9;
pub const DATA_TYPE_FLOAT16: i32 = 10;
pub const DATA_TYPE_DOUBLE: i32 = 11;

/// `TensorProto.DataLocation.EXTERNAL`
pub const DATA_LOCATION_EXTERNAL: i32 = 1;

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(string, tag = "3")]
    pub producer_version: String,
    #[prost(string, tag = "4")]
    pub domain: String,
    #[prost(int64, tag = "5")]
    pub model_version: i64,
    #[prost(string, tag = "6")]
    pub doc_string: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
    #[prost(message, repeated, tag = "14")]
    pub metadata_props: Vec<StringStringEntryProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    pub domain: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringStringEntryProto {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
    #[prost(string, tag = "7")]
    pub domain: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(float, tag = "2")]
    pub f: f32,
    #[prost(int64, tag = "3")]
    pub i: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub s: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub t: Option<TensorProto>,
    #[prost(float, repeated, tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, tag = "8")]
    pub ints: Vec<i64>,
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub strings: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    #[prost(int32, repeated, tag = "5")]
    pub int32_data: Vec<i32>,
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub string_data: Vec<Vec<u8>>,
    #[prost(int64, repeated, tag = "7")]
    pub int64_data: Vec<i64>,
    #[prost(string, tag = "8")]
    pub name: String,
    #[prost(bytes = "vec", tag = "9")]
    pub raw_data: Vec<u8>,
    #[prost(double, repeated, tag = "10")]
    pub double_data: Vec<f64>,
    #[prost(message, repeated, tag = "13")]
    pub external_data: Vec<StringStringEntryProto>,
    #[prost(int32, tag = "14")]
    pub data_location: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

/// Only the `tensor_type` arm of the `TypeProto.value` oneof
#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(message, optional, tag = "1")]
    pub tensor_type: Option<TypeProtoTensor>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TypeProtoTensor {
    #[prost(int32, tag = "1")]
    pub elem_type: i32,
    #[prost(message, optional, tag = "2")]
    pub shape: Option<TensorShapeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<Dimension>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Dimension {
    #[prost(int64, optional, tag = "1")]
    pub dim_value: Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub dim_param: Option<String>,
}

impl ModelProto {
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata_props
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }
}

impl NodeProto {
    pub fn attr(&self, name: &str) -> Option<&AttributeProto> {
        self.attribute.iter().find(|a| a.name == name)
    }

    pub fn attr_i(&self, name: &str) -> Option<i64> {
        self.attr(name).map(|a| a.i)
    }

    pub fn attr_f(&self, name: &str) -> Option<f32> {
        self.attr(name).map(|a| a.f)
    }

    pub fn attr_s(&self, name: &str) -> Option<String> {
        self.attr(name)
            .map(|a| String::from_utf8_lossy(&a.s).into_owned())
    }

    pub fn attr_floats(&self, name: &str) -> &[f32] {
        self.attr(name).map(|a| a.floats.as_slice()).unwrap_or_default()
    }

    pub fn attr_ints(&self, name: &str) -> &[i64] {
        self.attr(name).map(|a| a.ints.as_slice()).unwrap_or_default()
    }

    pub fn attr_strings(&self, name: &str) -> Vec<String> {
        self.attr(name).map_or_else(Vec::new, |a| {
            a.strings
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect()
        })
    }

    /// Whether the operator belongs to the default or `ai.onnx.ml` domain
    pub fn is_standard_domain(&self) -> bool {
        matches!(self.domain.as_str(), "" | "ai.onnx" | "ai.onnx.ml")
    }
}

impl TensorProto {
    pub fn is_external(&self) -> bool {
        self.data_location == DATA_LOCATION_EXTERNAL || !self.external_data.is_empty()
    }

    pub fn external_location(&self) -> Option<&str> {
        self.external_data
            .iter()
            .find(|e| e.key == "location")
            .map(|e| e.value.as_str())
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|d| (*d).max(0) as usize).collect()
    }

    /// Element values widened to `f64`, in row-major order
    pub fn to_f64(&self) -> Result<Vec<f64>, String> {
        if self.is_external() {
            return Err(format!("tensor '{}' uses external data", self.name));
        }

        let values: Vec<f64> = if !self.raw_data.is_empty() {
            let raw = &self.raw_data;
            match self.data_type {
                DATA_TYPE_FLOAT => le_chunks::<4>(raw).map(|b| f32::from_le_bytes(b) as f64).collect(),
                DATA_TYPE_DOUBLE => le_chunks::<8>(raw).map(f64::from_le_bytes).collect(),
                DATA_TYPE_INT64 => le_chunks::<8>(raw).map(|b| i64::from_le_bytes(b) as f64).collect(),
                DATA_TYPE_INT32 => le_chunks::<4>(raw).map(|b| i32::from_le_bytes(b) as f64).collect(),
                DATA_TYPE_FLOAT16 => le_chunks::<2>(raw)
                    .map(|b| crate::pickle::numpy::f16_to_f32(u16::from_le_bytes(b)) as f64)
                    .collect(),
                DATA_TYPE_INT8 => raw.iter().map(|b| *b as i8 as f64).collect(),
                DATA_TYPE_UINT8 | DATA_TYPE_BOOL => raw.iter().map(|b| *b as f64).collect(),
                other => return Err(format!("unsupported tensor data type {}", other)),
            }
        } else {
            match self.data_type {
                DATA_TYPE_FLOAT => self.float_data.iter().map(|v| *v as f64).collect(),
                DATA_TYPE_DOUBLE => self.double_data.clone(),
                DATA_TYPE_INT64 => self.int64_data.iter().map(|v| *v as f64).collect(),
                DATA_TYPE_INT32 | DATA_TYPE_INT8 | DATA_TYPE_UINT8 | DATA_TYPE_BOOL => {
                    self.int32_data.iter().map(|v| *v as f64).collect()
                }
                DATA_TYPE_FLOAT16 => self
                    .int32_data
                    .iter()
                    .map(|v| crate::pickle::numpy::f16_to_f32(*v as u16) as f64)
                    .collect(),
                other => return Err(format!("unsupported tensor data type {}", other)),
            }
        };

        let expected: usize = self.shape().iter().product();
        if values.len() != expected {
            return Err(format!(
                "tensor '{}' holds {} values for shape {:?}",
                self.name,
                values.len(),
                self.dims
            ));
        }
        Ok(values)
    }
}

fn le_chunks<const N: usize>(raw: &[u8]) -> impl Iterator<Item = [u8; N]> + '_ {
    raw.chunks_exact(N).map(|c| {
        let mut out = [0u8; N];
        out.copy_from_slice(c);
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_and_typed_float_tensors_agree() {
        let typed = TensorProto {
            dims: vec![2],
            data_type: DATA_TYPE_FLOAT,
            float_data: vec![1.5, -2.0],
            ..Default::default()
        };
        let raw = TensorProto {
            dims: vec![2],
            data_type: DATA_TYPE_FLOAT,
            raw_data: [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect(),
            ..Default::default()
        };
        assert_eq!(typed.to_f64().unwrap(), raw.to_f64().unwrap());
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let t = TensorProto {
            dims: vec![3],
            data_type: DATA_TYPE_DOUBLE,
            double_data: vec![1.0],
            ..Default::default()
        };
        assert!(t.to_f64().is_err());
    }

    #[test]
    fn test_model_round_trips_through_prost() {
        let model = ModelProto {
            ir_version: 8,
            graph: Some(GraphProto {
                name: "g".into(),
                ..Default::default()
            }),
            metadata_props: vec![StringStringEntryProto {
                key: "feature_names".into(),
                value: "a,b".into(),
            }],
            ..Default::default()
        };
        let decoded = ModelProto::decode_bytes(&model.encode_to_vec()).unwrap();
        assert_eq!(decoded.metadata("feature_names"), Some("a,b"));
        assert_eq!(decoded.graph.unwrap().name, "g");
    }
}
