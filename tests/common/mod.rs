//! Shared fixtures for the integration tests: artifact builders and an
//! in-process server wired from a temporary data directory.

#![allow(dead_code)]

use axum_test::TestServer;
use axum_test::multipart::{MultipartForm, Part};
use model_serve::proto::onnx::{
    AttributeProto, Dimension, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorShapeProto, TypeProto, TypeProtoTensor, ValueInfoProto,
};
use model_serve::proto::tensorflow::{
    AttrValue, DT_FLOAT, GraphDef, NodeDef, TensorProto, TensorShapeDim, attr_value,
};
use model_serve::{AdapterSet, ServeConfig, api, metrics};
use prost::Message;
use std::sync::OnceLock;
use tempfile::TempDir;

pub const OWNER: &str = "alice";
pub const STRANGER: &str = "mallory";

pub const HOUSE_FEATURES: [&str; 4] = ["bedrooms", "bathrooms", "sqft", "age"];
pub const HOUSE_COEFFICIENTS: [f32; 4] = [10_000.0, 5_000.0, 100.0, -500.0];
pub const HOUSE_INTERCEPT: f32 = 50_000.0;

/// Protocol 0 `os.system` call
pub const MALICIOUS_PICKLE: &[u8] = b"cos\nsystem\n(S'rm -rf /'\ntR.";

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

pub fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

pub fn test_config(temp_dir: &TempDir) -> ServeConfig {
    ServeConfig {
        data_dir: temp_dir.path().join("models"),
        state_file: temp_dir.path().join("state.toml"),
        max_resident_models: 4,
        ..Default::default()
    }
}

/// Wire the full application on top of `config`
pub async fn server_with_config(config: ServeConfig) -> (TestServer, api::AppState) {
    config.validate().expect("test config must be valid");
    let adapters = AdapterSet::builtin(config.expansion_limits());
    let state = api::AppState::from_config(&config, adapters, get_metrics_handle())
        .expect("Failed to build app state");
    state
        .state_manager
        .restore()
        .await
        .expect("Failed to restore state");

    let app = api::create_router(state.clone());
    let server = TestServer::new(app);
    (server, state)
}

pub async fn create_test_server() -> (TestServer, api::AppState, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (server, state) = server_with_config(test_config(&temp_dir)).await;
    (server, state, temp_dir)
}

pub fn upload_form(name: &str, filename: &str, bytes: Vec<u8>) -> MultipartForm {
    MultipartForm::new().add_text("modelName", name.to_string()).add_part(
        "modelFile",
        Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_type("application/octet-stream"),
    )
}

fn float_attr(name: &str, values: &[f32]) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        floats: values.to_vec(),
        ..Default::default()
    }
}

fn input_with_width(name: &str, width: i64) -> ValueInfoProto {
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            tensor_type: Some(TypeProtoTensor {
                elem_type: 1,
                shape: Some(TensorShapeProto {
                    dim: vec![
                        Dimension {
                            dim_value: None,
                            dim_param: Some("N".into()),
                        },
                        Dimension {
                            dim_value: Some(width),
                            dim_param: None,
                        },
                    ],
                }),
            }),
        }),
    }
}

/// ONNX `LinearRegressor` over the four house features.
///
/// `padding` bytes of doc string bring the artifact to a realistic size.
pub fn house_price_onnx(padding: usize) -> Vec<u8> {
    let model = ModelProto {
        ir_version: 8,
        producer_name: "skl2onnx".into(),
        doc_string: "x".repeat(padding),
        graph: Some(GraphProto {
            node: vec![NodeProto {
                input: vec!["X".into()],
                output: vec!["Y".into()],
                name: "LinearRegressor".into(),
                op_type: "LinearRegressor".into(),
                attribute: vec![
                    float_attr("coefficients", &HOUSE_COEFFICIENTS),
                    float_attr("intercepts", &[HOUSE_INTERCEPT]),
                ],
                domain: "ai.onnx.ml".into(),
            }],
            name: "house_prices".into(),
            initializer: vec![],
            input: vec![input_with_width("X", 4)],
            output: vec![ValueInfoProto {
                name: "Y".into(),
                r#type: None,
            }],
        }),
        opset_import: vec![OperatorSetIdProto {
            domain: "ai.onnx.ml".into(),
            version: 1,
        }],
        metadata_props: vec![StringStringEntryProto {
            key: "feature_names".into(),
            value: HOUSE_FEATURES.join(","),
        }],
        ..Default::default()
    };
    model.encode_to_vec()
}

/// Expected output of [`house_price_onnx`] for one row
pub fn house_price(bedrooms: f64, bathrooms: f64, sqft: f64, age: f64) -> f64 {
    let row = [bedrooms, bathrooms, sqft, age];
    HOUSE_COEFFICIENTS
        .iter()
        .zip(row)
        .map(|(c, x)| f64::from(*c) * x)
        .sum::<f64>()
        + f64::from(HOUSE_INTERCEPT)
}

fn tf_node(name: &str, op: &str, inputs: &[&str]) -> NodeDef {
    NodeDef {
        name: name.into(),
        op: op.into(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn tf_shape(dims: &[i64]) -> model_serve::proto::tensorflow::TensorShapeProto {
    model_serve::proto::tensorflow::TensorShapeProto {
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

fn tf_const(name: &str, dims: &[i64], values: &[f32]) -> NodeDef {
    let mut node = tf_node(name, "Const", &[]);
    node.attr.insert(
        "value".into(),
        AttrValue {
            value: Some(attr_value::Value::Tensor(TensorProto {
                dtype: DT_FLOAT,
                tensor_shape: Some(tf_shape(dims)),
                float_val: values.to_vec(),
                ..Default::default()
            })),
        },
    );
    node
}

/// Frozen TensorFlow graph computing `x . [1, 2] + 0.5` over two features
pub fn affine_tensorflow() -> Vec<u8> {
    let mut placeholder = tf_node("x", "Placeholder", &[]);
    placeholder.attr.insert(
        "shape".into(),
        AttrValue {
            value: Some(attr_value::Value::Shape(tf_shape(&[-1, 2]))),
        },
    );
    let graph = GraphDef {
        node: vec![
            placeholder,
            tf_const("w", &[2, 1], &[1.0, 2.0]),
            tf_const("b", &[1], &[0.5]),
            tf_node("mm", "MatMul", &["x", "w"]),
            tf_node("y", "BiasAdd", &["mm", "b"]),
        ],
        library: None,
    };
    graph.encode_to_vec()
}

/// Minimal protocol 2 pickle writer for the fixtures below
struct PickleWriter(Vec<u8>);

impl PickleWriter {
    fn new() -> Self {
        Self(vec![0x80, 2])
    }

    fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.0.push(b'c');
        self.0.extend_from_slice(format!("{}\n{}\n", module, name).as_bytes());
        self
    }

    fn op(&mut self, opcode: u8) -> &mut Self {
        self.0.push(opcode);
        self
    }

    fn string(&mut self, value: &str) -> &mut Self {
        self.0.push(b'X');
        self.0.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.0.extend_from_slice(value.as_bytes());
        self
    }

    fn float(&mut self, value: f64) -> &mut Self {
        self.0.push(b'G');
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn float_list(&mut self, values: &[f64]) -> &mut Self {
        self.op(b']').op(b'(');
        for v in values {
            self.float(*v);
        }
        self.op(b'e')
    }

    fn string_list(&mut self, values: &[&str]) -> &mut Self {
        self.op(b']').op(b'(');
        for v in values {
            self.string(v);
        }
        self.op(b'e')
    }

    fn finish(&mut self) -> Vec<u8> {
        self.op(b'.');
        std::mem::take(&mut self.0)
    }
}

/// Pickled `sklearn.linear_model.LinearRegression` with fitted attributes
pub fn linear_regression_pickle(names: &[&str], coef: &[f64], intercept: f64) -> Vec<u8> {
    let mut w = PickleWriter::new();
    w.global("sklearn.linear_model._base", "LinearRegression")
        .op(b')')
        .op(0x81)
        .op(b'}')
        .op(b'(')
        .string("coef_")
        .float_list(coef)
        .string("intercept_")
        .float(intercept)
        .string("feature_names_in_")
        .string_list(names)
        .op(b'u')
        .op(b'b');
    w.finish()
}

/// The same estimator as [`linear_regression_pickle`], gzip-compressed the
/// way `joblib.dump(..., compress=3)` writes it
pub fn linear_regression_joblib(names: &[&str], coef: &[f64], intercept: f64) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&linear_regression_pickle(names, coef, intercept))
        .unwrap();
    encoder.finish().unwrap()
}

impl PickleWriter {
    fn int(&mut self, value: u8) -> &mut Self {
        self.0.extend_from_slice(&[b'K', value]);
        self
    }

    fn int_tuple(&mut self, values: &[u8]) -> &mut Self {
        self.op(b'(');
        for v in values {
            self.int(*v);
        }
        self.op(b't')
    }

    /// `name: _rebuild_tensor_v2(storage, 0, size, stride, False, {})`
    fn float_tensor(&mut self, name: &str, key: &str, size: &[u8], stride: &[u8]) -> &mut Self {
        let numel = size.iter().product::<u8>();
        self.string(name)
            .global("torch._utils", "_rebuild_tensor_v2")
            .op(b'(')
            .op(b'(')
            .string("storage")
            .global("torch", "FloatStorage")
            .string(key)
            .string("cpu")
            .int(numel)
            .op(b't')
            .op(b'Q')
            .int(0)
            .int_tuple(size)
            .int_tuple(stride)
            .op(0x89)
            .op(b'}')
            .op(b't')
            .op(b'R')
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// `torch.save(nn.Linear(2, 1).state_dict())` with weight `[1, 2]` and
/// bias `0.5`
pub fn linear_torch_checkpoint() -> Vec<u8> {
    use std::io::{Cursor, Write};

    let mut w = PickleWriter::new();
    w.op(b'}')
        .op(b'(')
        .float_tensor("fc.weight", "0", &[1, 2], &[2, 1])
        .float_tensor("fc.bias", "1", &[1], &[1])
        .op(b'u');
    let data_pkl = w.finish();

    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let opts = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in [
            ("model/data.pkl", data_pkl),
            ("model/data/0", f32_bytes(&[1.0, 2.0])),
            ("model/data/1", f32_bytes(&[0.5])),
            ("model/version", b"3\n".to_vec()),
        ] {
            writer.start_file(name, opts).unwrap();
            writer.write_all(&data).unwrap();
        }
        writer.finish().unwrap();
    }
    buf.into_inner()
}

// =============================================================================
// joblib framing
// =============================================================================

/// The eight churn features, in training order
pub const CHURN_FEATURES: [&str; 8] = [
    "age",
    "tenure",
    "monthly_charges",
    "total_charges",
    "contract_type",
    "payment_method",
    "internet_service",
    "tech_support",
];

/// Field layout of `sklearn.tree._tree.NODE_DTYPE`
const TREE_NODE_FIELDS: [(&str, &str, i64); 8] = [
    ("left_child", "<i8", 0),
    ("right_child", "<i8", 8),
    ("feature", "<i8", 16),
    ("threshold", "<f8", 24),
    ("impurity", "<f8", 32),
    ("n_node_samples", "<i8", 40),
    ("weighted_n_node_samples", "<f8", 48),
    ("missing_go_to_left", "|u1", 56),
];
const TREE_NODE_SIZE: i64 = 64;

/// Alignment joblib applies to inline array data
const JOBLIB_ALIGNMENT: usize = 16;

enum ArrayDtype<'a> {
    /// Endian-prefixed descriptor such as `<f8`
    Scalar(&'a str),
    Record(&'a [(&'a str, &'a str, i64)], i64),
}

impl PickleWriter {
    fn with_protocol(protocol: u8) -> Self {
        Self(vec![0x80, protocol])
    }

    fn long(&mut self, value: i64) -> &mut Self {
        match value {
            0..=0xff => self.int(value as u8),
            0x100..=0xffff => {
                self.0.push(b'M');
                self.0.extend_from_slice(&(value as u16).to_le_bytes());
                self
            }
            _ => {
                self.0.push(b'J');
                self.0.extend_from_slice(&(value as i32).to_le_bytes());
                self
            }
        }
    }

    fn short_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.0.push(b'C');
        self.0.push(value.len() as u8);
        self.0.extend_from_slice(value);
        self
    }

    /// `numpy.dtype(descr, False, True)` with its BUILD state
    fn numpy_dtype(&mut self, descr: &str) -> &mut Self {
        let (endian, code) = descr.split_at(1);
        self.global("numpy", "dtype")
            .op(b'(')
            .string(code)
            .op(0x89)
            .op(0x88)
            .op(b't')
            .op(b'R')
            .op(b'(')
            .int(3)
            .string(endian)
            .op(b'N')
            .op(b'N')
            .op(b'N')
            .long(-1)
            .long(-1)
            .int(if code.starts_with('O') { 63 } else { 0 })
            .op(b't')
            .op(b'b')
    }

    fn record_dtype(&mut self, fields: &[(&str, &str, i64)], itemsize: i64) -> &mut Self {
        self.global("numpy", "dtype")
            .op(b'(')
            .string(&format!("V{}", itemsize))
            .op(0x89)
            .op(0x88)
            .op(b't')
            .op(b'R')
            .op(b'(')
            .int(3)
            .string("|")
            .op(b'N')
            .op(b'(');
        for (name, _, _) in fields {
            self.string(name);
        }
        self.op(b't').op(b'}').op(b'(');
        for (name, descr, offset) in fields {
            self.string(name)
                .op(b'(')
                .numpy_dtype(descr)
                .long(*offset)
                .op(b't');
        }
        self.op(b'u').long(itemsize).int(8).int(16).op(b't').op(b'b')
    }

    /// `NumpyArrayWrapper` state dict, shared by every wrapped array
    fn wrapper_header(&mut self, shape: &[i64], allow_mmap: bool) -> &mut Self {
        self.global("joblib.numpy_pickle", "NumpyArrayWrapper")
            .op(b')')
            .op(0x81)
            .op(b'}')
            .op(b'(')
            .string("subclass")
            .global("numpy", "ndarray")
            .string("shape")
            .op(b'(');
        for dim in shape {
            self.long(*dim);
        }
        self.op(b't')
            .string("order")
            .string("C")
            .string("allow_mmap")
            .op(if allow_mmap { 0x88 } else { 0x89 })
            .string("numpy_array_alignment_bytes")
            .int(JOBLIB_ALIGNMENT as u8)
            .string("dtype")
    }

    /// A numeric or structured array followed by its padded inline bytes
    fn array(&mut self, shape: &[i64], dtype: ArrayDtype<'_>, data: &[u8]) -> &mut Self {
        self.wrapper_header(shape, true);
        match dtype {
            ArrayDtype::Scalar(descr) => self.numpy_dtype(descr),
            ArrayDtype::Record(fields, itemsize) => self.record_dtype(fields, itemsize),
        };
        self.op(b'u').op(b'b');

        // one byte holding the padding length, then the padding itself
        let after_length_byte = self.0.len() + 1;
        let padding = JOBLIB_ALIGNMENT - after_length_byte % JOBLIB_ALIGNMENT;
        self.0.push(padding as u8);
        self.0.extend(std::iter::repeat_n(0xff, padding));
        self.0.extend_from_slice(data);
        self
    }

    /// An object array of strings: the wrapper is followed by a nested
    /// protocol 2 pickle of the whole ndarray
    fn object_array(&mut self, values: &[&str]) -> &mut Self {
        self.wrapper_header(&[values.len() as i64], false)
            .numpy_dtype("|O8")
            .op(b'u')
            .op(b'b');

        let mut nested = PickleWriter::new();
        nested
            .global("numpy.core.multiarray", "_reconstruct")
            .op(b'(')
            .global("numpy", "ndarray")
            .op(b'(')
            .int(0)
            .op(b't')
            .global("_codecs", "encode")
            .op(b'(')
            .string("b")
            .string("latin1")
            .op(b't')
            .op(b'R')
            .op(b't')
            .op(b'R')
            .op(b'(')
            .int(1)
            .op(b'(')
            .long(values.len() as i64)
            .op(b't')
            .numpy_dtype("|O8")
            .op(0x89)
            .string_list(values)
            .op(b't')
            .op(b'b');
        let nested = nested.finish();
        self.0.extend_from_slice(&nested);
        self
    }

    /// `numpy.float64` scalar
    fn numpy_f64(&mut self, value: f64) -> &mut Self {
        self.global("numpy.core.multiarray", "scalar")
            .op(b'(')
            .numpy_dtype("<f8")
            .short_bytes(&value.to_le_bytes())
            .op(b't')
            .op(b'R')
    }

    /// A fitted depth-one `DecisionTreeClassifier` over the churn features
    fn churn_stump(&mut self, feature: i64, threshold: f64, left: [f64; 2], right: [f64; 2]) -> &mut Self {
        let samples = |counts: [f64; 2]| (counts[0] + counts[1]) as i64;
        let total = [left[0] + right[0], left[1] + right[1]];
        let nodes = tree_nodes(&[
            (1, 2, feature, threshold, samples(total)),
            (-1, -1, -2, -2.0, samples(left)),
            (-1, -1, -2, -2.0, samples(right)),
        ]);
        let values = f64_bytes(&[total[0], total[1], left[0], left[1], right[0], right[1]]);

        self.global("sklearn.tree._classes", "DecisionTreeClassifier")
            .op(b')')
            .op(0x81)
            .op(b'}')
            .op(b'(')
            .string("n_features_in_")
            .int(CHURN_FEATURES.len() as u8)
            .string("n_outputs_")
            .int(1)
            .string("classes_")
            .array(&[2], ArrayDtype::Scalar("<i8"), &i64_bytes(&[0, 1]))
            .string("tree_")
            .global("sklearn.tree._tree", "Tree")
            .op(b'(')
            .int(CHURN_FEATURES.len() as u8)
            .array(&[1], ArrayDtype::Scalar("<i8"), &i64_bytes(&[2]))
            .int(1)
            .op(b't')
            .op(b'R')
            .op(b'}')
            .op(b'(')
            .string("max_depth")
            .int(1)
            .string("node_count")
            .int(3)
            .string("nodes")
            .array(
                &[3],
                ArrayDtype::Record(&TREE_NODE_FIELDS, TREE_NODE_SIZE),
                &nodes,
            )
            .string("values")
            .array(&[3, 1, 2], ArrayDtype::Scalar("<f8"), &values)
            .op(b'u')
            .op(b'b')
            .op(b'u')
            .op(b'b')
    }
}

fn f64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i64_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Rows of `(left, right, feature, threshold, samples)` in `NODE_DTYPE` layout
fn tree_nodes(rows: &[(i64, i64, i64, f64, i64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rows.len() * TREE_NODE_SIZE as usize);
    for (left, right, feature, threshold, samples) in rows {
        let start = out.len();
        out.extend_from_slice(&left.to_le_bytes());
        out.extend_from_slice(&right.to_le_bytes());
        out.extend_from_slice(&feature.to_le_bytes());
        out.extend_from_slice(&threshold.to_le_bytes());
        out.extend_from_slice(&0.0f64.to_le_bytes());
        out.extend_from_slice(&samples.to_le_bytes());
        out.extend_from_slice(&(*samples as f64).to_le_bytes());
        out.push(0);
        out.resize(start + TREE_NODE_SIZE as usize, 0);
    }
    out
}

/// `joblib.dump(LinearRegression().fit(...), "house_price_model.pkl")`
/// with [`HOUSE_COEFFICIENTS`] and [`HOUSE_INTERCEPT`]
pub fn house_price_joblib() -> Vec<u8> {
    let coef: Vec<f64> = HOUSE_COEFFICIENTS.iter().map(|c| *c as f64).collect();
    let mut w = PickleWriter::with_protocol(4);
    w.global("sklearn.linear_model._base", "LinearRegression")
        .op(b')')
        .op(0x81)
        .op(b'}')
        .op(b'(')
        .string("fit_intercept")
        .op(0x88)
        .string("feature_names_in_")
        .object_array(&HOUSE_FEATURES)
        .string("n_features_in_")
        .int(HOUSE_FEATURES.len() as u8)
        .string("coef_")
        .array(&[4], ArrayDtype::Scalar("<f8"), &f64_bytes(&coef))
        .string("rank_")
        .int(4)
        .string("intercept_")
        .numpy_f64(HOUSE_INTERCEPT as f64)
        .op(b'u')
        .op(b'b');
    w.finish()
}

/// `joblib.dump(RandomForestClassifier(n_estimators=2), "customer_churn_model.pkl")`.
///
/// One stump splits on `tenure <= 12.5`, the other on
/// `monthly_charges <= 70`; short-tenure, high-charge customers churn.
pub fn churn_forest_joblib() -> Vec<u8> {
    let mut w = PickleWriter::with_protocol(4);
    w.global("sklearn.ensemble._forest", "RandomForestClassifier")
        .op(b')')
        .op(0x81)
        .op(b'}')
        .op(b'(')
        .string("n_estimators")
        .int(2)
        .string("feature_names_in_")
        .object_array(&CHURN_FEATURES)
        .string("n_features_in_")
        .int(CHURN_FEATURES.len() as u8)
        .string("n_outputs_")
        .int(1)
        .string("classes_")
        .array(&[2], ArrayDtype::Scalar("<i8"), &i64_bytes(&[0, 1]))
        .string("n_classes_")
        .int(2)
        .string("estimators_")
        .op(b']')
        .op(b'(')
        .churn_stump(1, 12.5, [10.0, 30.0], [40.0, 5.0])
        .churn_stump(2, 70.0, [30.0, 10.0], [5.0, 20.0])
        .op(b'e')
        .op(b'u')
        .op(b'b');
    w.finish()
}

/// A churn customer as a JSON object keyed by feature name
pub fn churn_customer(tenure: f64, monthly_charges: f64) -> serde_json::Value {
    serde_json::json!({
        "age": 42,
        "tenure": tenure,
        "monthly_charges": monthly_charges,
        "total_charges": tenure * monthly_charges,
        "contract_type": 0,
        "payment_method": 1,
        "internet_service": 1,
        "tech_support": 0,
    })
}
