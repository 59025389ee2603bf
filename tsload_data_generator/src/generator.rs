//! Turns a [`DataSpec`] into an iterator of points.

use std::{fmt, ops::Range, sync::Arc, time::Duration};

use indexmap::IndexSet;
use rand::{Rng, SeedableRng, distributions::Alphanumeric, rngs::StdRng};
use tracing::debug;
use tsload_targets::Headers;

use crate::{
    Error,
    specification::{DataSpec, FieldKind, MeasurementSpec},
};

/// A generated field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(Arc<str>),
    Boolean(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// One generated line.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPoint {
    pub table: Arc<str>,
    /// Tag values aligned to [`Generator::headers`] tag keys; empty for tags
    /// the table does not carry.
    pub tags: Vec<Arc<str>>,
    /// Non-null field values in declaration order.
    pub fields: Vec<(Arc<str>, Value)>,
    pub timestamp_nanos: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub seed: u64,
    /// Timestamp of the first sample, in nanoseconds since the epoch.
    pub start_nanos: i64,
    /// Time between samples.
    pub interval: Duration,
    /// Stop after this many points; unbounded otherwise.
    pub max_points: Option<u64>,
}

/// Produces samples of every measurement in a spec, one line at a time.
///
/// Each sample emits `lines_per_sample` lines for every measurement copy, all
/// stamped with the sample time. Lines within a sample are made distinct by
/// adding the line number in nanoseconds, so low cardinality tags do not
/// collapse lines into the same series and timestamp.
#[derive(Debug)]
pub struct Generator {
    headers: Headers,
    measurements: Vec<Measurement>,
    rng: StdRng,
    sample_nanos: i64,
    interval_nanos: i64,
    measurement_idx: usize,
    line_idx: usize,
    emitted: u64,
    max_points: Option<u64>,
    empty: Arc<str>,
}

impl Generator {
    pub fn new(spec: &DataSpec, config: GeneratorConfig) -> Result<Self, Error> {
        spec.validate()?;

        let mut tag_keys = IndexSet::new();
        for m in &spec.measurements {
            for t in &m.tags {
                for copy_id in 1..=t.copies.unwrap_or(1) {
                    tag_keys.insert(copy_name(&t.key, copy_id));
                }
            }
        }

        let mut headers = Headers::new(tag_keys.iter());
        let mut measurements = vec![];
        for m in &spec.measurements {
            for copy_id in 1..=m.copies.unwrap_or(1) {
                let measurement = Measurement::new(m, copy_id, &tag_keys);
                headers = headers.with_table(
                    &measurement.name,
                    measurement.fields.iter().map(|f| Arc::clone(&f.key)),
                );
                measurements.push(measurement);
            }
        }

        let interval_nanos = i64::try_from(config.interval.as_nanos()).unwrap_or(i64::MAX);
        debug!(
            spec = %spec.name,
            tables = measurements.len(),
            tag_keys = tag_keys.len(),
            interval_nanos,
            "created generator"
        );

        Ok(Self {
            headers,
            measurements,
            rng: StdRng::seed_from_u64(config.seed),
            sample_nanos: config.start_nanos,
            interval_nanos,
            measurement_idx: 0,
            line_idx: 0,
            emitted: 0,
            max_points: config.max_points,
            empty: Arc::from(""),
        })
    }

    /// The schema of every point this generator yields.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Lines emitted per sample across all measurements.
    pub fn points_per_sample(&self) -> usize {
        self.measurements.iter().map(|m| m.lines_per_sample).sum()
    }
}

impl Iterator for Generator {
    type Item = SimulatedPoint;

    fn next(&mut self) -> Option<SimulatedPoint> {
        if self.max_points.is_some_and(|max| self.emitted >= max) {
            return None;
        }

        loop {
            if self.measurement_idx == self.measurements.len() {
                self.measurement_idx = 0;
                self.sample_nanos = self.sample_nanos.saturating_add(self.interval_nanos);
            }

            let m = &mut self.measurements[self.measurement_idx];
            if self.line_idx < m.lines_per_sample {
                let timestamp_nanos = self.sample_nanos.saturating_add(self.line_idx as i64);
                self.line_idx += 1;
                self.emitted += 1;
                return Some(m.next_point(timestamp_nanos, &self.empty, &mut self.rng));
            }

            self.line_idx = 0;
            self.measurement_idx += 1;
        }
    }
}

fn copy_name(name: &str, copy_id: usize) -> String {
    if copy_id > 1 {
        format!("{name}_{copy_id}")
    } else {
        name.to_owned()
    }
}

#[derive(Debug)]
struct Measurement {
    name: Arc<str>,
    tags: Vec<Tag>,
    fields: Vec<Field>,
    lines_per_sample: usize,
    tag_count: usize,
}

impl Measurement {
    fn new(spec: &MeasurementSpec, copy_id: usize, tag_keys: &IndexSet<String>) -> Self {
        let mut tags = vec![];
        for t in &spec.tags {
            for tag_copy in 1..=t.copies.unwrap_or(1) {
                let key = copy_name(&t.key, tag_copy);
                let position = tag_keys
                    .get_index_of(&key)
                    .expect("tag keys were collected from the same spec");

                let mut prefix = t.value.clone().unwrap_or_default();
                if t.append_copy_id.unwrap_or(false) {
                    prefix.push_str(&tag_copy.to_string());
                }

                tags.push(Tag {
                    position,
                    fixed: Arc::from(prefix.as_str()),
                    prefix,
                    cardinality: t.cardinality,
                    current: 0,
                });
            }
        }

        let mut fields = vec![];
        for f in &spec.fields {
            for field_copy in 1..=f.copies.unwrap_or(1) {
                fields.push(Field {
                    key: Arc::from(copy_name(&f.key, field_copy)),
                    null_probability: f.null_probability,
                    value: FieldValue::from(&f.kind),
                });
            }
        }

        Self {
            name: Arc::from(copy_name(&spec.name, copy_id)),
            tags,
            fields,
            lines_per_sample: spec.lines_per_sample.unwrap_or_else(|| spec.max_cardinality()),
            tag_count: tag_keys.len(),
        }
    }

    fn next_point(
        &mut self,
        timestamp_nanos: i64,
        empty: &Arc<str>,
        rng: &mut impl Rng,
    ) -> SimulatedPoint {
        let mut tags = vec![Arc::clone(empty); self.tag_count];
        for tag in &mut self.tags {
            tags[tag.position] = tag.next_value();
        }

        let fields = self
            .fields
            .iter_mut()
            .filter_map(|f| f.next_value(rng).map(|v| (Arc::clone(&f.key), v)))
            .collect();

        SimulatedPoint {
            table: Arc::clone(&self.name),
            tags,
            fields,
            timestamp_nanos,
        }
    }
}

#[derive(Debug)]
struct Tag {
    position: usize,
    prefix: String,
    fixed: Arc<str>,
    cardinality: Option<usize>,
    current: usize,
}

impl Tag {
    fn next_value(&mut self) -> Arc<str> {
        match self.cardinality {
            None => Arc::clone(&self.fixed),
            Some(cardinality) => {
                // cycle through 1..=cardinality
                self.current = self.current % cardinality + 1;
                Arc::from(format!("{}{}", self.prefix, self.current))
            }
        }
    }
}

#[derive(Debug)]
struct Field {
    key: Arc<str>,
    null_probability: Option<f64>,
    value: FieldValue,
}

#[derive(Debug)]
enum FieldValue {
    RandomBool,
    Toggle(bool),
    FixedString(Arc<str>),
    RandomString(usize),
    SequentialString(String, u64),
    FixedInteger(i64),
    RandomInteger(Range<i64>),
    SequentialInteger(i64),
    FixedFloat(f64),
    RandomFloat(Range<f64>),
    SequentialFloat { next: f64, inc: f64 },
}

impl From<&FieldKind> for FieldValue {
    fn from(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Bool(_) => Self::RandomBool,
            FieldKind::BoolToggle(start) => Self::Toggle(*start),
            FieldKind::String(s) => Self::FixedString(Arc::from(s.as_str())),
            FieldKind::StringRandom(len) => Self::RandomString(*len),
            FieldKind::StringSeq(prefix) => Self::SequentialString(prefix.clone(), 0),
            FieldKind::Integer(v) => Self::FixedInteger(*v),
            FieldKind::IntegerRange(min, max) => Self::RandomInteger(*min..*max),
            FieldKind::IntegerSeq(start) => Self::SequentialInteger(*start),
            FieldKind::Float(v) => Self::FixedFloat(*v),
            FieldKind::FloatRange(min, max) => Self::RandomFloat(*min..*max),
            FieldKind::FloatSeqWithInc(inc) => Self::SequentialFloat { next: 0., inc: *inc },
        }
    }
}

impl Field {
    fn next_value(&mut self, rng: &mut impl Rng) -> Option<Value> {
        if let Some(probability) = self.null_probability {
            let val: f64 = rng.r#gen();
            if val < probability {
                return None;
            }
        }

        let value = match &mut self.value {
            FieldValue::RandomBool => Value::Boolean(rng.r#gen()),
            FieldValue::Toggle(current) => {
                let v = *current;
                *current = !v;
                Value::Boolean(v)
            }
            FieldValue::FixedString(v) => Value::String(Arc::clone(v)),
            FieldValue::RandomString(len) => {
                let random: String = rng
                    .sample_iter(&Alphanumeric)
                    .take(*len)
                    .map(char::from)
                    .collect();
                Value::String(Arc::from(random))
            }
            FieldValue::SequentialString(prefix, n) => {
                let v = format!("{prefix}{n}");
                *n += 1;
                Value::String(Arc::from(v))
            }
            FieldValue::FixedInteger(v) => Value::Integer(*v),
            FieldValue::RandomInteger(range) => Value::Integer(rng.gen_range(range.clone())),
            FieldValue::SequentialInteger(n) => {
                let v = *n;
                *n = n.wrapping_add(1);
                Value::Integer(v)
            }
            FieldValue::FixedFloat(v) => Value::Float(*v),
            FieldValue::RandomFloat(range) => Value::Float(rng.gen_range(range.clone())),
            FieldValue::SequentialFloat { next, inc } => {
                let v = *next;
                *next += *inc;
                Value::Float(v)
            }
        };

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::specification::{FieldSpec, TagSpec};

    fn config(max_points: Option<u64>) -> GeneratorConfig {
        GeneratorConfig {
            seed: 42,
            start_nanos: 1_000_000_000,
            interval: Duration::from_secs(10),
            max_points,
        }
    }

    fn field(key: &str, kind: FieldKind) -> FieldSpec {
        FieldSpec {
            key: key.to_owned(),
            copies: None,
            null_probability: None,
            kind,
        }
    }

    fn tag(key: &str, value: &str, cardinality: Option<usize>) -> TagSpec {
        TagSpec {
            key: key.to_owned(),
            copies: None,
            append_copy_id: None,
            value: Some(value.to_owned()),
            cardinality,
        }
    }

    fn two_tables() -> DataSpec {
        DataSpec {
            name: "test".to_owned(),
            measurements: vec![
                MeasurementSpec {
                    name: "cpu".to_owned(),
                    tags: vec![tag("host", "h", Some(2)), tag("region", "us-east", None)],
                    fields: vec![
                        field("usage", FieldKind::Float(0.5)),
                        field("count", FieldKind::IntegerSeq(10)),
                    ],
                    copies: None,
                    lines_per_sample: None,
                },
                MeasurementSpec {
                    name: "mem".to_owned(),
                    tags: vec![tag("host", "m", None), tag("rack", "r", None)],
                    fields: vec![field("up", FieldKind::BoolToggle(true))],
                    copies: None,
                    lines_per_sample: None,
                },
            ],
        }
    }

    #[test]
    fn test_headers() {
        let generator = Generator::new(&two_tables(), config(None)).unwrap();
        let headers = generator.headers();

        let tag_keys = headers.tag_keys().iter().map(|k| k.as_ref()).collect::<Vec<_>>();
        assert_eq!(tag_keys, ["host", "region", "rack"]);
        assert_eq!(headers.field_keys("cpu").unwrap().len(), 2);
        assert_eq!(headers.field_keys("mem").unwrap()[0].as_ref(), "up");
        assert_eq!(generator.points_per_sample(), 3);
    }

    #[test]
    fn test_samples() {
        let points = Generator::new(&two_tables(), config(Some(4)))
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(points.len(), 4);

        // first sample: two cpu lines (one per host), one mem line
        assert_eq!(points[0].table.as_ref(), "cpu");
        assert_eq!(points[0].tags[0].as_ref(), "h1");
        assert_eq!(points[0].tags[1].as_ref(), "us-east");
        assert_eq!(points[0].tags[2].as_ref(), "");
        assert_eq!(points[0].timestamp_nanos, 1_000_000_000);
        assert_eq!(points[0].fields[1], (Arc::from("count"), Value::Integer(10)));

        assert_eq!(points[1].tags[0].as_ref(), "h2");
        assert_eq!(points[1].timestamp_nanos, 1_000_000_001);
        assert_eq!(points[1].fields[1].1, Value::Integer(11));

        assert_eq!(points[2].table.as_ref(), "mem");
        assert_eq!(points[2].tags[1].as_ref(), "");
        assert_eq!(points[2].tags[2].as_ref(), "r");
        assert_eq!(points[2].fields, vec![(Arc::<str>::from("up"), Value::Boolean(true))]);

        // second sample starts one interval later and the host cycles around
        assert_eq!(points[3].table.as_ref(), "cpu");
        assert_eq!(points[3].tags[0].as_ref(), "h1");
        assert_eq!(points[3].timestamp_nanos, 11_000_000_000);
    }

    #[test]
    fn test_seed_determinism() {
        let spec = DataSpec::builtin_cpu();
        let a = Generator::new(&spec, config(Some(500))).unwrap().collect::<Vec<_>>();
        let b = Generator::new(&spec, config(Some(500))).unwrap().collect::<Vec<_>>();
        assert_eq!(a, b);

        let c = Generator::new(
            &spec,
            GeneratorConfig {
                seed: 7,
                ..config(Some(500))
            },
        )
        .unwrap()
        .collect::<Vec<_>>();
        assert_ne!(a, c);
    }

    #[test]
    fn test_copies() {
        let spec = DataSpec {
            name: "copies".to_owned(),
            measurements: vec![MeasurementSpec {
                name: "m".to_owned(),
                tags: vec![TagSpec {
                    copies: Some(2),
                    append_copy_id: Some(true),
                    ..tag("t", "v", None)
                }],
                fields: vec![FieldSpec {
                    copies: Some(3),
                    ..field("f", FieldKind::Integer(1))
                }],
                copies: Some(2),
                lines_per_sample: None,
            }],
        };

        let generator = Generator::new(&spec, config(Some(2))).unwrap();
        let headers = generator.headers().clone();
        let tables = headers.tables().map(|t| t.as_ref()).collect::<Vec<_>>();
        assert_eq!(tables, ["m", "m_2"]);
        let fields = headers
            .field_keys("m_2")
            .unwrap()
            .iter()
            .map(|k| k.as_ref())
            .collect::<Vec<_>>();
        assert_eq!(fields, ["f", "f_2", "f_3"]);

        let points = generator.collect::<Vec<_>>();
        let tags = points[0].tags.iter().map(|t| t.as_ref()).collect::<Vec<_>>();
        assert_eq!(tags, ["v1", "v2"]);
        assert_eq!(points[1].table.as_ref(), "m_2");
    }

    #[test]
    fn test_null_probability() {
        let spec = DataSpec {
            name: "nulls".to_owned(),
            measurements: vec![MeasurementSpec {
                name: "m".to_owned(),
                tags: vec![],
                fields: vec![
                    FieldSpec {
                        null_probability: Some(1.),
                        ..field("never", FieldKind::Float(1.))
                    },
                    field("always", FieldKind::StringRandom(8)),
                ],
                copies: None,
                lines_per_sample: None,
            }],
        };

        for point in Generator::new(&spec, config(Some(50))).unwrap() {
            assert_eq!(point.fields.len(), 1);
            let (key, value) = &point.fields[0];
            assert_eq!(key.as_ref(), "always");
            assert!(matches!(value, Value::String(s) if s.len() == 8));
        }
    }

    #[test]
    fn test_random_ranges() {
        let spec = DataSpec {
            name: "ranges".to_owned(),
            measurements: vec![MeasurementSpec {
                name: "m".to_owned(),
                tags: vec![],
                fields: vec![
                    field("i", FieldKind::IntegerRange(-5, 5)),
                    field("f", FieldKind::FloatRange(1., 2.)),
                ],
                copies: None,
                lines_per_sample: None,
            }],
        };

        for point in Generator::new(&spec, config(Some(200))).unwrap() {
            match (&point.fields[0].1, &point.fields[1].1) {
                (Value::Integer(i), Value::Float(f)) => {
                    assert!((-5..5).contains(i));
                    assert!((1. ..2.).contains(f));
                }
                other => panic!("unexpected values {other:?}"),
            }
        }
    }
}
