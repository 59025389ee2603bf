use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Error;

/// The specification for the data to be generated
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DataSpec {
    /// The name of this spec
    pub name: String,
    /// The measurements to be generated for each sample
    pub measurements: Vec<MeasurementSpec>,
}

impl DataSpec {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let spec: Self = serde_json::from_str(&contents)?;
        spec.validate()?;

        Ok(spec)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(&self)?)
    }

    /// Host CPU usage: one `cpu` table with ten float fields and 100 hosts
    /// spread over a handful of regions.
    pub fn builtin_cpu() -> Self {
        let tag = |key: &str, value: &str, cardinality: Option<usize>| TagSpec {
            key: key.to_owned(),
            copies: None,
            append_copy_id: None,
            value: Some(value.to_owned()),
            cardinality,
        };
        let usage = |key: &str| FieldSpec {
            key: key.to_owned(),
            copies: None,
            null_probability: None,
            kind: FieldKind::FloatRange(0., 100.),
        };

        Self {
            name: "cpu".to_owned(),
            measurements: vec![MeasurementSpec {
                name: "cpu".to_owned(),
                tags: vec![
                    tag("hostname", "host_", Some(100)),
                    tag("region", "region_", Some(3)),
                    tag("datacenter", "dc_", Some(6)),
                    tag("os", "Ubuntu16.04LTS", None),
                    tag("arch", "x64", None),
                ],
                fields: [
                    "usage_user",
                    "usage_system",
                    "usage_idle",
                    "usage_nice",
                    "usage_iowait",
                    "usage_irq",
                    "usage_softirq",
                    "usage_steal",
                    "usage_guest",
                    "usage_guest_nice",
                ]
                .into_iter()
                .map(usage)
                .collect(),
                copies: None,
                lines_per_sample: None,
            }],
        }
    }

    /// Reject specs the generator cannot produce points from.
    pub fn validate(&self) -> Result<(), Error> {
        if self.measurements.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "spec '{}' has no measurements",
                self.name
            )));
        }

        for m in &self.measurements {
            let invalid = |msg: String| Error::InvalidSpec(format!("measurement '{}': {msg}", m.name));

            if m.copies == Some(0) {
                return Err(invalid("copies must be at least 1".to_owned()));
            }
            if m.lines_per_sample == Some(0) {
                return Err(invalid("lines_per_sample must be at least 1".to_owned()));
            }

            for t in &m.tags {
                if t.copies == Some(0) {
                    return Err(invalid(format!("tag '{}': copies must be at least 1", t.key)));
                }
                if t.cardinality == Some(0) {
                    return Err(invalid(format!(
                        "tag '{}': cardinality must be at least 1",
                        t.key
                    )));
                }
            }

            for f in &m.fields {
                if f.copies == Some(0) {
                    return Err(invalid(format!("field '{}': copies must be at least 1", f.key)));
                }
                if let Some(p) = f.null_probability {
                    if !(0. ..=1.).contains(&p) {
                        return Err(invalid(format!(
                            "field '{}': null_probability {p} is not within [0, 1]",
                            f.key
                        )));
                    }
                }
                match f.kind {
                    FieldKind::IntegerRange(min, max) if min >= max => {
                        return Err(invalid(format!(
                            "field '{}': empty integer range {min}..{max}",
                            f.key
                        )));
                    }
                    FieldKind::FloatRange(min, max) if min.is_nan() || max.is_nan() || min >= max => {
                        return Err(invalid(format!(
                            "field '{}': empty float range {min}..{max}",
                            f.key
                        )));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

/// Specification for a measurement to be generated
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MeasurementSpec {
    /// The name of the measurement
    pub name: String,
    /// The tags to be generated for each line
    pub tags: Vec<TagSpec>,
    /// The fields to be generated for each line
    pub fields: Vec<FieldSpec>,
    /// Create this many copies of this measurement in each sample. The copy number will be
    /// appended to the measurement name to uniquely identify it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copies: Option<usize>,
    /// The number of lines output per sample. Defaults to the cardinality of the highest
    /// cardinality tag, so every tag value appears once per sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_per_sample: Option<usize>,
}

impl MeasurementSpec {
    /// The highest tag cardinality, 1 without cardinality tags.
    pub fn max_cardinality(&self) -> usize {
        self.tags
            .iter()
            .filter_map(|t| t.cardinality)
            .max()
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TagSpec {
    /// the key/name of the tag
    pub key: String,

    /// have this many copies of this tag in the measurement. Will add the copy number to
    /// the key of the tag to uniquely identify it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copies: Option<usize>,
    /// if set, appends the copy id of the tag to the value of the tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_copy_id: Option<bool>,

    /// output this string value for every line this tag is present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// will add a number to the value of the tag, with this number of unique values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FieldSpec {
    /// the key/name of the field
    pub key: String,
    /// have this many copies of this field in the measurement. Random values will be generated
    /// independently (i.e. copies won't share the same random value). Will add the copy number to
    /// the key of the field to uniquely identify it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copies: Option<usize>,
    /// probability in `[0, 1]` of the field being absent from a line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null_probability: Option<f64>,

    #[serde(flatten)]
    pub kind: FieldKind,
}

/// How the values of a field are produced; exactly one per field.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// a random bool; the value is ignored
    Bool(bool),
    /// alternate between true and false, starting with the given value
    BoolToggle(bool),
    /// output this string value for every line this field is present
    String(String),
    /// a random alphanumeric string of this length
    StringRandom(usize),
    /// the given prefix followed by a counter
    StringSeq(String),
    /// output this integer value for every line this field is present
    Integer(i64),
    /// a random integer in `[min, max)`
    IntegerRange(i64, i64),
    /// a counter starting at the given value
    IntegerSeq(i64),
    /// output this float value for every line this field is present
    Float(f64),
    /// a random float in `[min, max)`
    FloatRange(f64, f64),
    /// a sequence starting at 0 and incremented by the given value
    FloatSeqWithInc(f64),
}
