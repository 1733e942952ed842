//! Record transformations.
//!
//! A transformation writes one target field. It runs only when its
//! condition (if any) holds for the record, and its output must match the
//! declared target type. A failing transformation fails the record, never
//! the run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// One row flowing through a pipeline.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
        }
    }

    /// Convert `value` to this type, or `None` if it has no sensible
    /// conversion.
    pub fn cast(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (_, v) if self.matches(v) => Some(v.clone()),
            (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (FieldType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (FieldType::Integer, Value::Number(n)) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| Value::from(f as i64)),
            (FieldType::Float, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
            (FieldType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Exists,
    Eq,
    Ne,
    Gt,
    Lt,
}

/// Guard evaluated against the record before a transformation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: Comparison,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn holds(&self, record: &Record) -> bool {
        let actual = record.get(&self.field);
        match self.op {
            Comparison::Exists => actual.is_some_and(|v| !v.is_null()),
            Comparison::Eq => actual == Some(&self.value),
            Comparison::Ne => actual != Some(&self.value),
            Comparison::Gt | Comparison::Lt => {
                let (Some(a), Some(b)) = (actual.and_then(Value::as_f64), self.value.as_f64()) else {
                    return false;
                };
                if self.op == Comparison::Gt {
                    a > b
                } else {
                    a < b
                }
            }
        }
    }
}

/// How the target value is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Copy a source field unchanged.
    Direct { source: String },
    /// Convert a source field to the target type.
    Cast { source: String },
    /// Join several source fields into one string.
    Concat {
        sources: Vec<String>,
        #[serde(default)]
        separator: String,
    },
    Constant { value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(flatten)]
    pub operation: Operation,
    pub target: String,
    pub target_type: FieldType,
}

impl Transformation {
    pub fn new(
        name: impl Into<String>,
        operation: Operation,
        target: impl Into<String>,
        target_type: FieldType,
    ) -> Self {
        Self {
            name: name.into(),
            condition: None,
            operation,
            target: target.into(),
            target_type,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Apply to `record` in place. Returns `false` if the condition did not
    /// hold.
    ///
    /// # Errors
    ///
    /// `ValidationFailure` when a source field is missing or the output does
    /// not match the target type.
    pub fn apply(&self, record: &mut Record) -> Result<bool> {
        if let Some(condition) = &self.condition {
            if !condition.holds(record) {
                return Ok(false);
            }
        }
        let value = match &self.operation {
            Operation::Direct { source } => self.source_value(record, source)?.clone(),
            Operation::Cast { source } => {
                let raw = self.source_value(record, source)?;
                self.target_type.cast(raw).ok_or_else(|| {
                    Error::ValidationFailure(format!(
                        "{}: cannot cast {raw} to {}",
                        self.name, self.target_type
                    ))
                })?
            }
            Operation::Concat { sources, separator } => {
                let mut parts = Vec::with_capacity(sources.len());
                for source in sources {
                    let part = match self.source_value(record, source)? {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    parts.push(part);
                }
                Value::String(parts.join(separator))
            }
            Operation::Constant { value } => value.clone(),
        };

        if !self.target_type.matches(&value) {
            return Err(Error::ValidationFailure(format!(
                "{}: {} is not a valid {} for {}",
                self.name, value, self.target_type, self.target
            )));
        }
        record.insert(self.target.clone(), value);
        Ok(true)
    }

    fn source_value<'a>(&self, record: &'a Record, source: &str) -> Result<&'a Value> {
        record.get(source).ok_or_else(|| {
            Error::ValidationFailure(format!("{}: missing source field {source}", self.name))
        })
    }
}

/// A record that failed transformation, kept with its error for the
/// operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record: Record,
    pub transformation: Option<String>,
    pub error: String,
}

/// What an execution applies to every record, read from the pipeline once
/// when the execution starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub transformations: Vec<Transformation>,
    /// Transformed records that are dropped instead of delivered.
    pub skipped: Vec<Record>,
}

impl ExecutionPlan {
    /// Transform `record`. `Ok(None)` when the result is excluded.
    pub fn apply(&self, record: &Record) -> std::result::Result<Option<Record>, RecordFailure> {
        let output = apply_all(&self.transformations, record)?;
        if self.skipped.contains(&output) {
            return Ok(None);
        }
        Ok(Some(output))
    }
}

/// Apply `transformations` in order.
///
/// The input is left untouched on failure, and the failure names the
/// transformation that rejected the record.
pub fn apply_all(
    transformations: &[Transformation],
    record: &Record,
) -> std::result::Result<Record, RecordFailure> {
    let mut output = record.clone();
    for transformation in transformations {
        if let Err(e) = transformation.apply(&mut output) {
            return Err(RecordFailure {
                record: record.clone(),
                transformation: Some(transformation.name.clone()),
                error: e.to_string(),
            });
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_cast_string_to_integer() {
        let t = Transformation::new(
            "amount",
            Operation::Cast {
                source: "amount_raw".into(),
            },
            "amount",
            FieldType::Integer,
        );
        let mut r = record(&[("amount_raw", json!(" 42 "))]);

        assert!(t.apply(&mut r).unwrap());
        assert_eq!(r["amount"], json!(42));
    }

    #[test]
    fn test_condition_skips_record() {
        let t = Transformation::new(
            "flag",
            Operation::Constant { value: json!(true) },
            "large",
            FieldType::Boolean,
        )
        .when(Condition {
            field: "amount".into(),
            op: Comparison::Gt,
            value: json!(100),
        });
        let mut small = record(&[("amount", json!(10))]);
        let mut large = record(&[("amount", json!(500))]);

        assert!(!t.apply(&mut small).unwrap());
        assert!(!small.contains_key("large"));
        assert!(t.apply(&mut large).unwrap());
        assert_eq!(large["large"], json!(true));
    }

    #[test]
    fn test_type_mismatch_is_validation_failure() {
        let t = Transformation::new(
            "copy",
            Operation::Direct {
                source: "name".into(),
            },
            "count",
            FieldType::Integer,
        );
        let mut r = record(&[("name", json!("alice"))]);

        let err = t.apply(&mut r).unwrap_err();
        assert!(matches!(err, Error::ValidationFailure(_)));
        assert!(!r.contains_key("count"));
    }

    #[test]
    fn test_concat_joins_sources() {
        let t = Transformation::new(
            "full_name",
            Operation::Concat {
                sources: vec!["first".into(), "last".into()],
                separator: " ".into(),
            },
            "full_name",
            FieldType::String,
        );
        let mut r = record(&[("first", json!("Ada")), ("last", json!("Lovelace"))]);
        t.apply(&mut r).unwrap();
        assert_eq!(r["full_name"], json!("Ada Lovelace"));
    }

    #[test]
    fn test_apply_all_keeps_original_on_failure() {
        let transformations = vec![
            Transformation::new(
                "tag",
                Operation::Constant { value: json!("x") },
                "tag",
                FieldType::String,
            ),
            Transformation::new(
                "id",
                Operation::Cast { source: "id".into() },
                "id",
                FieldType::Integer,
            ),
        ];
        let input = record(&[("id", json!("not-a-number"))]);

        let failure = apply_all(&transformations, &input).unwrap_err();

        assert_eq!(failure.record, input);
        assert_eq!(failure.transformation.as_deref(), Some("id"));
        assert!(failure.error.contains("cannot cast"));
    }

    #[test]
    fn test_execution_plan_drops_skipped_output() {
        let plan = ExecutionPlan {
            transformations: vec![Transformation::new(
                "id",
                Operation::Cast { source: "id".into() },
                "id",
                FieldType::Integer,
            )],
            skipped: vec![record(&[("id", json!(2))])],
        };

        assert_eq!(
            plan.apply(&record(&[("id", json!("1"))])).unwrap(),
            Some(record(&[("id", json!(1))]))
        );
        assert_eq!(plan.apply(&record(&[("id", json!("2"))])).unwrap(), None);
        assert!(plan.apply(&record(&[("id", json!("x"))])).is_err());
    }

    #[test]
    fn test_transformation_toml_shape() {
        let t: Transformation = toml::from_str(
            r#"
            name = "amount"
            op = "cast"
            source = "amount_raw"
            target = "amount"
            target_type = "float"
            "#,
        )
        .unwrap();
        assert_eq!(
            t.operation,
            Operation::Cast {
                source: "amount_raw".into()
            }
        );
        assert_eq!(t.target_type, FieldType::Float);
    }
}
