use tsload_data_generator::{DataSpec, Generator, GeneratorConfig, SimulatedPoint, Value};
use tsload_targets::Headers;

use super::{SourceError, now_nanos};
use crate::point::{DeserializedPoint, FieldValue};

/// Points produced by the data generator.
#[derive(Debug)]
pub struct SimulatorDataSource {
    generator: Generator,
    use_current_time: bool,
}

impl SimulatorDataSource {
    pub fn new(
        spec: &DataSpec,
        config: GeneratorConfig,
        use_current_time: bool,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            generator: Generator::new(spec, config)?,
            use_current_time,
        })
    }

    pub fn headers(&self) -> &Headers {
        self.generator.headers()
    }

    pub fn next_point(&mut self) -> Option<DeserializedPoint> {
        let SimulatedPoint {
            table,
            tags,
            fields,
            timestamp_nanos,
        } = self.generator.next()?;

        let fields = fields
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::Integer(v) => FieldValue::Bigint(v),
                    Value::Float(v) => FieldValue::Double(v),
                    Value::String(v) => FieldValue::Varchar(v.to_string()),
                    Value::Boolean(v) => FieldValue::Boolean(v),
                };
                (key, value)
            })
            .collect();

        let timestamp_nanos = if self.use_current_time {
            now_nanos()
        } else {
            timestamp_nanos
        };

        Some(DeserializedPoint::new(table, tags, fields, timestamp_nanos))
    }
}
