//! Decoding of pickled numpy dtypes, arrays and scalars
//!
//! numpy pickles arrays in three shapes:
//! - `multiarray._reconstruct(ndarray, (0,), b'b')` followed by a BUILD state
//!   `(version, shape, dtype, is_fortran, rawdata)`
//! - `numeric._frombuffer(buffer, dtype, shape, order)` (protocol 5)
//! - joblib's inline buffer, already turned into [`Node::Array`] by the machine
//!
//! Scalars are `multiarray.scalar(dtype, raw_bytes)`.

use super::heap::{Heap, Node, NodeId};
use std::borrow::Cow;

const MULTIARRAY_MODULES: [&str; 2] = ["numpy.core.multiarray", "numpy._core.multiarray"];
const NUMERIC_MODULES: [&str; 2] = ["numpy.core.numeric", "numpy._core.numeric"];

#[derive(Debug, Clone, PartialEq)]
pub enum DTypeKind {
    Bool,
    Int { signed: bool },
    Float,
    /// `U`: fixed-width UTF-32
    Unicode,
    /// `S`: fixed-width bytes
    Bytes,
    Object,
    /// Structured dtype, fields as `(name, dtype, offset)`
    Record(Vec<(String, DTypeSpec, usize)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DTypeSpec {
    pub kind: DTypeKind,
    pub itemsize: usize,
    pub little_endian: bool,
}

impl DTypeSpec {
    pub fn is_object(&self) -> bool {
        matches!(self.kind, DTypeKind::Object)
    }

    /// Parse a descriptor such as `f8`, `<i4`, `U12`, `V64` or `O8`
    pub fn parse(descr: &str) -> Result<Self, String> {
        let (little_endian, rest) = match descr.as_bytes().first() {
            Some(b'>') => (false, &descr[1..]),
            Some(b'<' | b'|' | b'=') => (true, &descr[1..]),
            _ => (true, descr),
        };
        let mut chars = rest.chars();
        let code = chars.next().ok_or("empty dtype descriptor")?;
        let width: usize = if chars.as_str().is_empty() {
            0
        } else {
            chars
                .as_str()
                .parse()
                .map_err(|_| format!("invalid dtype descriptor '{}'", descr))?
        };

        let (kind, itemsize) = match code {
            'b' if width <= 1 => (DTypeKind::Bool, 1),
            '?' => (DTypeKind::Bool, 1),
            'i' => (DTypeKind::Int { signed: true }, width),
            'u' => (DTypeKind::Int { signed: false }, width),
            'f' => (DTypeKind::Float, width),
            'U' => (DTypeKind::Unicode, width * 4),
            'S' | 'a' => (DTypeKind::Bytes, width),
            'O' => (DTypeKind::Object, if width == 0 { 8 } else { width }),
            'V' => (DTypeKind::Record(Vec::new()), width),
            _ => return Err(format!("unsupported dtype '{}'", descr)),
        };

        match kind {
            DTypeKind::Int { .. } if ![1, 2, 4, 8].contains(&itemsize) => {
                Err(format!("unsupported integer width in '{}'", descr))
            }
            DTypeKind::Float if ![2, 4, 8].contains(&itemsize) => {
                Err(format!("unsupported float width in '{}'", descr))
            }
            _ => Ok(Self {
                kind,
                itemsize,
                little_endian,
            }),
        }
    }

    fn decode_f64(&self, bytes: &[u8]) -> Option<f64> {
        let bytes = bytes.get(..self.itemsize)?;
        let value = match &self.kind {
            DTypeKind::Bool => (bytes[0] != 0) as u8 as f64,
            DTypeKind::Int { signed } => {
                let raw = self.read_u64(bytes);
                if *signed {
                    let shift = 64 - self.itemsize * 8;
                    (((raw << shift) as i64) >> shift) as f64
                } else {
                    raw as f64
                }
            }
            DTypeKind::Float => match self.itemsize {
                2 => f16_to_f32(self.read_u64(bytes) as u16) as f64,
                4 => f32::from_bits(self.read_u64(bytes) as u32) as f64,
                8 => f64::from_bits(self.read_u64(bytes)),
                _ => return None,
            },
            _ => return None,
        };
        Some(value)
    }

    fn decode_value(&self, bytes: &[u8]) -> Option<Value> {
        let bytes = bytes.get(..self.itemsize)?;
        match &self.kind {
            DTypeKind::Bool => Some(Value::Bool(bytes[0] != 0)),
            DTypeKind::Int { .. } => self.decode_f64(bytes).map(|v| Value::Int(v as i64)),
            DTypeKind::Float => self.decode_f64(bytes).map(Value::Float),
            DTypeKind::Unicode => {
                let text: String = bytes
                    .chunks_exact(4)
                    .map(|c| {
                        let raw = [c[0], c[1], c[2], c[3]];
                        if self.little_endian {
                            u32::from_le_bytes(raw)
                        } else {
                            u32::from_be_bytes(raw)
                        }
                    })
                    .take_while(|cp| *cp != 0)
                    .filter_map(char::from_u32)
                    .collect();
                Some(Value::Str(text))
            }
            DTypeKind::Bytes => {
                let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                Some(Value::Str(super::machine::latin1(&bytes[..end])))
            }
            DTypeKind::Object | DTypeKind::Record(_) => None,
        }
    }

    fn read_u64(&self, bytes: &[u8]) -> u64 {
        let mut value = 0u64;
        if self.little_endian {
            for b in bytes.iter().rev() {
                value = (value << 8) | *b as u64;
            }
        } else {
            for b in bytes {
                value = (value << 8) | *b as u64;
            }
        }
        value
    }
}

/// Build a [`DTypeSpec`] from a pickled `numpy.dtype` object or a bare descriptor string
pub fn dtype_from_node(heap: &Heap, id: NodeId) -> Result<DTypeSpec, String> {
    if let Some(descr) = heap.str(id) {
        return DTypeSpec::parse(descr);
    }

    let object = heap
        .object(id)
        .ok_or_else(|| "dtype is neither a descriptor nor a dtype object".to_string())?;
    let descr = object
        .args
        .first()
        .and_then(|a| heap.str(*a))
        .ok_or_else(|| "dtype object without descriptor".to_string())?;
    let mut spec = DTypeSpec::parse(descr)?;

    // State: (version, endian, subarray, names, fields, elsize, alignment, flags)
    let Some(state) = object.state.and_then(|s| heap.seq(s)) else {
        return Ok(spec);
    };
    if let Some(endian) = state.get(1).and_then(|e| heap.str(*e)) {
        spec.little_endian = endian != ">";
    }
    if let DTypeKind::Record(_) = spec.kind {
        let names = state
            .get(3)
            .and_then(|n| heap.strings(*n))
            .ok_or_else(|| "structured dtype without field names".to_string())?;
        let fields = *state
            .get(4)
            .ok_or_else(|| "structured dtype without fields".to_string())?;
        let mut parsed = Vec::with_capacity(names.len());
        for name in names {
            let entry = heap
                .dict_get(fields, &name)
                .and_then(|e| heap.seq(e))
                .ok_or_else(|| format!("structured dtype field '{}' missing", name))?;
            let (Some(dtype), Some(offset)) = (entry.first(), entry.get(1)) else {
                return Err(format!("structured dtype field '{}' malformed", name));
            };
            let field = dtype_from_node(heap, *dtype)?;
            let offset = heap
                .int(*offset)
                .filter(|o| *o >= 0)
                .ok_or_else(|| format!("structured dtype field '{}' has bad offset", name))?;
            parsed.push((name, field, offset as usize));
        }
        if let Some(elsize) = state.get(5).and_then(|e| heap.int(*e)).filter(|e| *e > 0) {
            spec.itemsize = elsize as usize;
        }
        spec.kind = DTypeKind::Record(parsed);
    }
    Ok(spec)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Raw(Vec<u8>),
    /// Elements of an object array, as heap nodes
    Objects(Vec<NodeId>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: DTypeSpec,
    pub shape: Vec<usize>,
    pub fortran: bool,
    pub data: ArrayData,
}

/// A decoded array element
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as u8 as f64),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(_) => None,
        }
    }
}

/// Numeric tensor in C order
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl Tensor {
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    pub fn cols(&self) -> usize {
        match self.shape.len() {
            0 => 1,
            1 => self.shape[0],
            _ => self.shape[1..].iter().product(),
        }
    }
}

impl NdArray {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage position of the `i`-th element in C order
    fn storage_index(&self, i: usize) -> usize {
        if !self.fortran || self.shape.len() < 2 {
            return i;
        }
        let mut rem = i;
        let mut index = vec![0usize; self.shape.len()];
        for (axis, dim) in self.shape.iter().enumerate().rev() {
            index[axis] = rem % dim.max(&1);
            rem /= dim.max(&1);
        }
        let mut stride = 1;
        let mut offset = 0;
        for (axis, dim) in self.shape.iter().enumerate() {
            offset += index[axis] * stride;
            stride *= dim;
        }
        offset
    }

    fn raw_element<'r>(&self, raw: &'r [u8], i: usize) -> Result<&'r [u8], String> {
        let start = self.storage_index(i) * self.dtype.itemsize;
        raw.get(start..start + self.dtype.itemsize)
            .ok_or_else(|| "array buffer shorter than its shape".to_string())
    }

    /// All elements in C order
    pub fn elements(&self, heap: &Heap) -> Result<Vec<Value>, String> {
        (0..self.len())
            .map(|i| match &self.data {
                ArrayData::Raw(raw) => {
                    let bytes = self.raw_element(raw, i)?;
                    self.dtype
                        .decode_value(bytes)
                        .ok_or_else(|| "array dtype has no scalar representation".to_string())
                }
                ArrayData::Objects(nodes) => {
                    let node = nodes
                        .get(self.storage_index(i))
                        .ok_or_else(|| "object array shorter than its shape".to_string())?;
                    node_value(heap, *node)
                        .ok_or_else(|| "object array holds a non-scalar element".to_string())
                }
            })
            .collect()
    }

    pub fn to_f64(&self, heap: &Heap) -> Result<Vec<f64>, String> {
        if let ArrayData::Raw(raw) = &self.data {
            return (0..self.len())
                .map(|i| {
                    let bytes = self.raw_element(raw, i)?;
                    self.dtype
                        .decode_f64(bytes)
                        .ok_or_else(|| "array is not numeric".to_string())
                })
                .collect();
        }
        self.elements(heap)?
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| "array is not numeric".to_string()))
            .collect()
    }

    /// One field of a structured array as floats, in C order
    pub fn record_column(&self, name: &str) -> Result<Vec<f64>, String> {
        let DTypeKind::Record(fields) = &self.dtype.kind else {
            return Err("array is not structured".to_string());
        };
        let ArrayData::Raw(raw) = &self.data else {
            return Err("structured array without raw data".to_string());
        };
        let (_, field, offset) = fields
            .iter()
            .find(|(n, _, _)| n == name)
            .ok_or_else(|| format!("structured array has no field '{}'", name))?;
        (0..self.len())
            .map(|i| {
                let element = self.raw_element(raw, i)?;
                element
                    .get(*offset..)
                    .and_then(|b| field.decode_f64(b))
                    .ok_or_else(|| format!("field '{}' is not numeric", name))
            })
            .collect()
    }
}

fn class_in(heap: &Heap, id: NodeId, modules: &[&str], name: &str) -> bool {
    heap.class_of(id)
        .is_some_and(|g| g.name == name && modules.contains(&g.module.as_str()))
}

/// Raw buffer behind a `bytes`, latin-1 `str`, `bytearray(...)` or `_codecs.encode(...)`
fn buffer_bytes(heap: &Heap, id: NodeId) -> Option<Cow<'_, [u8]>> {
    match heap.get(id) {
        Node::Bytes(b) => Some(Cow::Borrowed(b.as_slice())),
        Node::Str(s) => Some(Cow::Owned(s.chars().map(|c| c as u32 as u8).collect())),
        Node::Object(object) => {
            let callable = heap.global(object.callable)?;
            let arg = *object.args.first()?;
            if callable.is("_codecs", "encode") || callable.is("builtins", "bytearray") {
                buffer_bytes(heap, arg)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn shape_of(heap: &Heap, id: NodeId) -> Result<Vec<usize>, String> {
    if let Some(dim) = heap.int(id) {
        return usize::try_from(dim).map(|d| vec![d]).map_err(|_| "negative dimension".into());
    }
    heap.seq(id)
        .ok_or_else(|| "array shape is not a tuple".to_string())?
        .iter()
        .map(|d| {
            heap.int(*d)
                .and_then(|d| usize::try_from(d).ok())
                .ok_or_else(|| "array shape has an invalid dimension".to_string())
        })
        .collect()
}

/// Whether `id` looks like any pickled numpy array
pub fn is_array(heap: &Heap, id: NodeId) -> bool {
    matches!(heap.get(id), Node::Array(_))
        || class_in(heap, id, &MULTIARRAY_MODULES, "_reconstruct")
        || class_in(heap, id, &NUMERIC_MODULES, "_frombuffer")
}

/// Decode a pickled ndarray
pub fn array(heap: &Heap, id: NodeId) -> Result<Cow<'_, NdArray>, String> {
    if let Node::Array(array) = heap.get(id) {
        return Ok(Cow::Borrowed(array));
    }

    if class_in(heap, id, &MULTIARRAY_MODULES, "_reconstruct") {
        let object = heap.object(id).ok_or("malformed ndarray")?;
        let state = object
            .state
            .and_then(|s| heap.seq(s))
            .ok_or("ndarray without state")?;
        let [_, shape, dtype, fortran, rawdata] = state else {
            return Err("ndarray state has unexpected arity".to_string());
        };
        let shape = shape_of(heap, *shape)?;
        let dtype = dtype_from_node(heap, *dtype)?;
        let fortran = heap.int(*fortran).unwrap_or(0) != 0;
        let data = if dtype.is_object() {
            ArrayData::Objects(
                heap.seq(*rawdata)
                    .ok_or("object ndarray without element list")?
                    .to_vec(),
            )
        } else {
            ArrayData::Raw(
                buffer_bytes(heap, *rawdata)
                    .ok_or("ndarray data is not a buffer")?
                    .into_owned(),
            )
        };
        return Ok(Cow::Owned(NdArray {
            dtype,
            shape,
            fortran,
            data,
        }));
    }

    if class_in(heap, id, &NUMERIC_MODULES, "_frombuffer") {
        let object = heap.object(id).ok_or("malformed ndarray")?;
        let [buffer, dtype, shape, order, ..] = object.args.as_slice() else {
            return Err("_frombuffer with unexpected arguments".to_string());
        };
        let data = buffer_bytes(heap, *buffer)
            .ok_or("_frombuffer buffer is not bytes")?
            .into_owned();
        return Ok(Cow::Owned(NdArray {
            dtype: dtype_from_node(heap, *dtype)?,
            shape: shape_of(heap, *shape)?,
            fortran: heap.str(*order) == Some("F"),
            data: ArrayData::Raw(data),
        }));
    }

    Err("value is not an ndarray".to_string())
}

/// Decode a numpy scalar (`multiarray.scalar(dtype, bytes)`)
pub fn scalar(heap: &Heap, id: NodeId) -> Option<Value> {
    if !class_in(heap, id, &MULTIARRAY_MODULES, "scalar") {
        return None;
    }
    let object = heap.object(id)?;
    let dtype = dtype_from_node(heap, *object.args.first()?).ok()?;
    let raw = buffer_bytes(heap, *object.args.get(1)?)?;
    dtype.decode_value(&raw)
}

/// Scalar value of a plain pickle node or numpy scalar
pub fn node_value(heap: &Heap, id: NodeId) -> Option<Value> {
    match heap.get(id) {
        Node::Bool(b) => Some(Value::Bool(*b)),
        Node::Int(i) => Some(Value::Int(*i)),
        Node::Float(f) => Some(Value::Float(*f)),
        Node::Str(s) => Some(Value::Str(s.clone())),
        Node::Object(_) => scalar(heap, id),
        _ => None,
    }
}

/// Numeric tensor from an ndarray, numpy scalar, number or nested list of numbers
pub fn tensor(heap: &Heap, id: NodeId) -> Result<Tensor, String> {
    if is_array(heap, id) {
        let array = array(heap, id)?;
        return Ok(Tensor {
            shape: array.shape.clone(),
            values: array.to_f64(heap)?,
        });
    }
    if let Some(value) = node_value(heap, id) {
        let value = value.as_f64().ok_or("expected a number")?;
        return Ok(Tensor {
            shape: Vec::new(),
            values: vec![value],
        });
    }
    let items = heap.seq(id).ok_or("expected a numeric array")?;
    let mut values = Vec::new();
    let mut inner: Option<Vec<usize>> = None;
    for item in items {
        let t = tensor(heap, *item)?;
        match &inner {
            Some(shape) if *shape != t.shape => return Err("ragged nested list".to_string()),
            Some(_) => {}
            None => inner = Some(t.shape.clone()),
        }
        values.extend(t.values);
    }
    let mut shape = vec![items.len()];
    shape.extend(inner.unwrap_or_default());
    Ok(Tensor { shape, values })
}

/// Flat element values from an ndarray or a list of scalars
pub fn values(heap: &Heap, id: NodeId) -> Result<Vec<Value>, String> {
    if is_array(heap, id) {
        return array(heap, id)?.elements(heap);
    }
    heap.seq(id)
        .ok_or("expected an array")?
        .iter()
        .map(|item| node_value(heap, *item).ok_or_else(|| "expected scalar elements".to_string()))
        .collect()
}

/// IEEE 754 half precision to single precision
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) & 1) as u32;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let frac = (bits & 0x3ff) as u32;
    let out = match (exp, frac) {
        (0, 0) => sign << 31,
        (0, _) => {
            // subnormal: renormalise
            let mut e = 127 - 15 + 1;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            (sign << 31) | ((e as u32) << 23) | ((f & 0x3ff) << 13)
        }
        (0x1f, _) => (sign << 31) | 0x7f80_0000 | (frac << 13),
        _ => (sign << 31) | ((exp + 127 - 15) << 23) | (frac << 13),
    };
    f32::from_bits(out)
}
