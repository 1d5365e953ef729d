//! Static analysis of data-graph artifacts (ONNX, TensorFlow)

use super::{Finding, FindingSink, Severity};
use crate::proto::{onnx, tensorflow};
use std::path::{Component, Path};

/// TensorFlow ops that embed Python or reach the filesystem
const DANGEROUS_TF_OPS: &[&str] = &[
    "PyFunc",
    "PyFuncStateless",
    "EagerPyFunc",
    "ReadFile",
    "WriteFile",
    "MatchingFiles",
    "Save",
    "SaveV2",
    "SaveSlices",
    "MergeV2Checkpoints",
    "ShardedFilename",
    "ShardedFilespec",
    "PrintV2",
];

fn is_dangerous_tf_op(op: &str) -> bool {
    DANGEROUS_TF_OPS.contains(&op) || op.starts_with("Restore")
}

/// Whether an external-data location leaves the artifact directory
fn escapes_artifact_dir(location: &str) -> bool {
    let path = Path::new(location);
    path.is_absolute()
        || location.starts_with('/')
        || location.starts_with('\\')
        || location.as_bytes().get(1) == Some(&b':')
        || path.components().any(|c| matches!(c, Component::ParentDir))
        || location.split(['/', '\\']).any(|part| part == "..")
}

pub(crate) fn analyze_onnx(bytes: &[u8], sink: &mut FindingSink) -> bool {
    let model = match onnx::ModelProto::decode_bytes(bytes) {
        Ok(model) => model,
        Err(e) => {
            sink.push(Finding::new(
                Severity::Critical,
                "MALFORMED_ARTIFACT",
                format!("not a valid ONNX model: {}", e),
            ));
            return false;
        }
    };
    let Some(graph) = model.graph.as_ref() else {
        sink.push(Finding::new(
            Severity::Critical,
            "MALFORMED_ARTIFACT",
            "ONNX model has no graph",
        ));
        return false;
    };

    let attribute_tensors = graph
        .node
        .iter()
        .flat_map(|n| n.attribute.iter())
        .filter_map(|a| a.t.as_ref());
    for tensor in graph.initializer.iter().chain(attribute_tensors) {
        if !tensor.is_external() {
            continue;
        }
        let location = tensor.external_location().unwrap_or_default();
        if escapes_artifact_dir(location) {
            sink.push(Finding::new(
                Severity::Critical,
                "EXTERNAL_DATA_ESCAPE",
                format!(
                    "tensor '{}' reads external data from '{}' outside the artifact",
                    tensor.name, location
                ),
            ));
        } else {
            sink.push_unique(
                format!("external:{}", location),
                Finding::new(
                    Severity::Warning,
                    "EXTERNAL_DATA",
                    format!(
                        "tensor '{}' references external data file '{}', which is not uploaded with the model",
                        tensor.name, location
                    ),
                ),
            );
        }
    }

    for node in &graph.node {
        if !node.is_standard_domain() {
            sink.push_unique(
                format!("domain:{}", node.domain),
                Finding::new(
                    Severity::Warning,
                    "CUSTOM_OPERATOR_DOMAIN",
                    format!(
                        "operator '{}' comes from custom domain '{}'",
                        node.op_type, node.domain
                    ),
                ),
            );
        }
    }
    true
}

pub(crate) fn analyze_tensorflow(bytes: &[u8], sink: &mut FindingSink) -> bool {
    let graph = match tensorflow::GraphDef::decode_bytes(bytes) {
        Ok(graph) => graph,
        Err(e) => {
            sink.push(Finding::new(
                Severity::Critical,
                "MALFORMED_ARTIFACT",
                format!("not a valid TensorFlow GraphDef: {}", e),
            ));
            return false;
        }
    };
    if graph.node.is_empty() {
        sink.push(Finding::new(
            Severity::Critical,
            "MALFORMED_ARTIFACT",
            "TensorFlow graph has no nodes",
        ));
        return false;
    }

    for node in graph.all_nodes() {
        if is_dangerous_tf_op(&node.op) {
            sink.push_unique(
                format!("op:{}", node.op),
                Finding::new(
                    Severity::Critical,
                    "DANGEROUS_OP",
                    format!(
                        "op '{}' (node '{}') can run Python or access files",
                        node.op, node.name
                    ),
                ),
            );
        }
    }
    true
}
