use std::{fmt, sync::Arc};

use crate::write_service::MeasureValueType;

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Double(f64),
    Bigint(i64),
    Varchar(String),
    Boolean(bool),
}

impl FieldValue {
    /// Parse a textual value: finite numbers are doubles, `true`/`false`
    /// booleans, anything else (including `nan` and `inf`) a varchar.
    pub fn parse(s: &str) -> Self {
        match s {
            "true" => Self::Boolean(true),
            "false" => Self::Boolean(false),
            _ => match s.parse::<f64>() {
                Ok(v) if v.is_finite() => Self::Double(v),
                _ => Self::Varchar(s.to_owned()),
            },
        }
    }

    pub fn measure_value_type(&self) -> MeasureValueType {
        match self {
            Self::Double(_) => MeasureValueType::Double,
            Self::Bigint(_) => MeasureValueType::Bigint,
            Self::Varchar(_) => MeasureValueType::Varchar,
            Self::Boolean(_) => MeasureValueType::Boolean,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Double(v) => write!(f, "{v}"),
            Self::Bigint(v) => write!(f, "{v}"),
            Self::Varchar(v) => f.write_str(v),
            Self::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// A point as read from a data source.
///
/// Tag values are positionally aligned to the run's tag keys; sources check
/// the arity before building a point.
#[derive(Debug, Clone, PartialEq)]
pub struct DeserializedPoint {
    table: Arc<str>,
    tags: Vec<Arc<str>>,
    fields: Vec<(Arc<str>, FieldValue)>,
    timestamp_nanos: i64,
}

impl DeserializedPoint {
    pub fn new(
        table: Arc<str>,
        tags: Vec<Arc<str>>,
        fields: Vec<(Arc<str>, FieldValue)>,
        timestamp_nanos: i64,
    ) -> Self {
        Self {
            table,
            tags,
            fields,
            timestamp_nanos,
        }
    }

    pub fn table(&self) -> &Arc<str> {
        &self.table
    }

    pub fn tags(&self) -> &[Arc<str>] {
        &self.tags
    }

    pub fn fields(&self) -> &[(Arc<str>, FieldValue)] {
        &self.fields
    }

    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp_nanos
    }

    pub fn set_timestamp_nanos(&mut self, timestamp_nanos: i64) {
        self.timestamp_nanos = timestamp_nanos;
    }
}
