//! Prediction request bodies and their validation against a model's schema

use crate::adapters::InputSchema;
use crate::error::ServeError;
use serde_json::{Map, Value};

/// Keys a client may wrap its rows in
const WRAPPER_KEYS: [&str; 4] = ["instances", "inputs", "features", "data"];

/// Dense row-major matrix of feature values handed to adapters
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    n_cols: usize,
    values: Vec<f64>,
}

impl FeatureMatrix {
    /// Build from rows of equal, non-zero width
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ServeError> {
        let n_cols = rows.first().map(Vec::len).unwrap_or(0);
        if n_cols == 0 {
            return Err(ServeError::MissingInput {
                message: "input rows contain no features".to_string(),
            });
        }
        if let Some(bad) = rows.iter().position(|r| r.len() != n_cols) {
            return Err(ServeError::validation(format!(
                "row {} has {} features, expected {}",
                bad,
                rows[bad].len(),
                n_cols
            )));
        }
        Ok(Self {
            n_cols,
            values: rows.into_iter().flatten().collect(),
        })
    }

    pub fn n_rows(&self) -> usize {
        self.values.len() / self.n_cols
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.n_cols)
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.values[index * self.n_cols..(index + 1) * self.n_cols]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputRow {
    /// Named features in the order the client sent them
    Named(Vec<(String, f64)>),
    Positional(Vec<f64>),
}

impl InputRow {
    fn width(&self) -> usize {
        match self {
            InputRow::Named(f) => f.len(),
            InputRow::Positional(v) => v.len(),
        }
    }

    fn into_values(self) -> Vec<f64> {
        match self {
            InputRow::Named(f) => f.into_iter().map(|(_, v)| v).collect(),
            InputRow::Positional(v) => v,
        }
    }
}

/// Parsed prediction body
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionInput {
    pub rows: Vec<InputRow>,
}

impl PredictionInput {
    /// Parse any accepted body shape.
    ///
    /// Accepts a single object of named features, a single array of numbers,
    /// a batch of either, and any of those wrapped under `instances`,
    /// `inputs`, `features` or `data`.
    pub fn parse(body: &Value) -> Result<Self, ServeError> {
        let body = unwrap_envelope(body);
        let rows = match body {
            Value::Null => return Err(missing("request body is empty")),
            Value::Object(map) if map.is_empty() => return Err(missing("request body is empty")),
            Value::Object(map) => vec![named_row(map)?],
            Value::Array(items) if items.is_empty() => return Err(missing("no input rows supplied")),
            Value::Array(items) if items.iter().all(is_scalar) => vec![positional_row(items)?],
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(map) if !map.is_empty() => named_row(map),
                    Value::Array(values) if !values.is_empty() => positional_row(values),
                    _ => Err(ServeError::validation(format!(
                        "row {} must be a non-empty object or array of numbers",
                        i
                    ))),
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(ServeError::validation(
                    "input must be an object of features or an array of rows",
                ));
            }
        };
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Validate rows against `schema` and lay them out as a matrix.
    ///
    /// With known feature names every name is required, unknown names are
    /// rejected and named rows are reordered to the schema order. With only a
    /// feature count the row width must match.
    pub fn to_matrix(&self, schema: Option<&InputSchema>) -> Result<FeatureMatrix, ServeError> {
        let names = schema.and_then(|s| s.feature_names.as_deref());
        let expected = schema.and_then(InputSchema::width);

        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| match (row, names) {
                (InputRow::Named(features), Some(names)) => order_by_schema(i, features, names),
                (row, _) => {
                    if let Some(expected) = expected
                        && row.width() != expected
                    {
                        return Err(ServeError::validation(format!(
                            "row {} has {} features, model expects {}",
                            i,
                            row.width(),
                            expected
                        )));
                    }
                    Ok(row.clone().into_values())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        FeatureMatrix::from_rows(rows)
    }
}

fn missing(message: &str) -> ServeError {
    ServeError::MissingInput {
        message: message.to_string(),
    }
}

fn unwrap_envelope(body: &Value) -> &Value {
    if let Value::Object(map) = body
        && map.len() == 1
        && let Some((key, inner)) = map.iter().next()
        && WRAPPER_KEYS.contains(&key.as_str())
        && (inner.is_array() || inner.is_object())
    {
        return inner;
    }
    body
}

fn is_scalar(value: &Value) -> bool {
    !value.is_array() && !value.is_object()
}

fn number(value: &Value, what: impl Fn() -> String) -> Result<f64, ServeError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ServeError::validation(format!("{} is not a finite number", what()))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Err(ServeError::validation(format!("{} is null", what()))),
        _ => Err(ServeError::validation(format!("{} must be numeric", what()))),
    }
}

fn named_row(map: &Map<String, Value>) -> Result<InputRow, ServeError> {
    map.iter()
        .map(|(name, value)| {
            let value = number(value, || format!("feature '{}'", name))?;
            Ok::<_, ServeError>((name.clone(), value))
        })
        .collect::<Result<_, _>>()
        .map(InputRow::Named)
}

fn positional_row(values: &[Value]) -> Result<InputRow, ServeError> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| number(value, || format!("feature at position {}", i)))
        .collect::<Result<_, _>>()
        .map(InputRow::Positional)
}

fn order_by_schema(
    row: usize,
    features: &[(String, f64)],
    names: &[String],
) -> Result<Vec<f64>, ServeError> {
    if let Some((unknown, _)) = features.iter().find(|(n, _)| !names.contains(n)) {
        return Err(ServeError::validation(format!(
            "row {}: unknown feature '{}'",
            row, unknown
        )));
    }
    names
        .iter()
        .map(|name| {
            features
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| *v)
                .ok_or_else(|| {
                    ServeError::validation(format!("row {}: missing feature '{}'", row, name))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn house_schema() -> InputSchema {
        InputSchema::named(vec![
            "bedrooms".into(),
            "bathrooms".into(),
            "sqft".into(),
            "age".into(),
        ])
    }

    #[test]
    fn test_single_named_row_is_reordered() {
        let input =
            PredictionInput::parse(&json!({"sqft": 1500, "age": 10, "bedrooms": 3, "bathrooms": 2}))
                .unwrap();
        let m = input.to_matrix(Some(&house_schema())).unwrap();
        assert_eq!(m.n_rows(), 1);
        assert_eq!(m.row(0), &[3.0, 2.0, 1500.0, 10.0]);
    }

    #[test]
    fn test_wrapped_batch() {
        let input = PredictionInput::parse(&json!({"instances": [[1, 2], [3, 4]]})).unwrap();
        assert_eq!(input.len(), 2);
        let m = input.to_matrix(Some(&InputSchema::width_only(2))).unwrap();
        assert_eq!(m.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_feature_named_data_is_not_unwrapped() {
        let input = PredictionInput::parse(&json!({"data": 4.0})).unwrap();
        assert_eq!(input.rows, vec![InputRow::Named(vec![("data".into(), 4.0)])]);
    }

    #[test]
    fn test_bools_coerce() {
        let input = PredictionInput::parse(&json!([true, false, 2])).unwrap();
        assert_eq!(input.rows, vec![InputRow::Positional(vec![1.0, 0.0, 2.0])]);
    }

    #[test]
    fn test_missing_input() {
        for body in [json!(null), json!({}), json!([]), json!({"inputs": []})] {
            let err = PredictionInput::parse(&body).unwrap_err();
            assert_eq!(err.code(), "MISSING_INPUT_DATA", "body: {}", body);
        }
    }

    #[test]
    fn test_non_numeric_rejected() {
        let err = PredictionInput::parse(&json!({"bedrooms": "three"})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("bedrooms"));
    }

    #[test]
    fn test_schema_mismatches() {
        let schema = house_schema();
        let missing = PredictionInput::parse(&json!({"bedrooms": 3, "bathrooms": 2, "sqft": 1500}))
            .unwrap()
            .to_matrix(Some(&schema))
            .unwrap_err();
        assert!(missing.to_string().contains("missing feature 'age'"));

        let unknown = PredictionInput::parse(
            &json!({"bedrooms": 3, "bathrooms": 2, "sqft": 1500, "age": 1, "pool": 1}),
        )
        .unwrap()
        .to_matrix(Some(&schema))
        .unwrap_err();
        assert!(unknown.to_string().contains("unknown feature 'pool'"));

        let narrow = PredictionInput::parse(&json!([1, 2, 3]))
            .unwrap()
            .to_matrix(Some(&schema))
            .unwrap_err();
        assert_eq!(narrow.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_ragged_rows_without_schema() {
        let err = PredictionInput::parse(&json!([[1, 2], [3]]))
            .unwrap()
            .to_matrix(None)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
