//! Protobuf messages for the data-graph formats, declared with `prost` derives

pub mod onnx;
pub mod tensorflow;
