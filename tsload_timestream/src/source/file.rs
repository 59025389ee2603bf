use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    sync::Arc,
};

use tracing::debug;
use tsload_targets::{DEFAULT_TAG_TYPE, Headers};

use super::{SourceError, now_nanos};
use crate::point::{DeserializedPoint, FieldValue};

const TAGS_PREFIX: &str = "tags";

/// Replays points from the benchmark's text format.
///
/// The input opens with a header: a `tags,<key>[ <type>],...` line, one
/// `<table>,<field key>,...` line per table and a blank line. Every point is
/// then a pair of lines, `tags,<value>,...` followed by
/// `<table>,<timestamp ns>,<field value>,...`. Empty field values are nulls.
pub struct FileDataSource {
    reader: Box<dyn BufRead + Send>,
    headers: Headers,
    line: usize,
    buf: String,
    use_current_time: bool,
}

impl fmt::Debug for FileDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDataSource")
            .field("headers", &self.headers)
            .field("line", &self.line)
            .field("use_current_time", &self.use_current_time)
            .finish_non_exhaustive()
    }
}

impl FileDataSource {
    /// Open `path`, or stdin when `path` is `None` or `-`.
    pub fn open(path: Option<&Path>, use_current_time: bool) -> Result<Self, SourceError> {
        let reader: Box<dyn BufRead + Send> = match path {
            Some(path) if path != Path::new("-") => {
                let file = File::open(path).map_err(|source| SourceError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
                Box::new(BufReader::new(file))
            }
            _ => Box::new(BufReader::new(std::io::stdin())),
        };

        Self::from_reader(reader, use_current_time)
    }

    /// Read the header from `reader`, leaving it positioned at the first point.
    pub fn from_reader(
        reader: Box<dyn BufRead + Send>,
        use_current_time: bool,
    ) -> Result<Self, SourceError> {
        let mut source = Self {
            reader,
            headers: Headers::default(),
            line: 0,
            buf: String::new(),
            use_current_time,
        };

        if !source.read_line()? {
            return Err(SourceError::MissingHeader);
        }
        let mut tags = source.buf.split(',');
        if tags.next() != Some(TAGS_PREFIX) {
            return Err(SourceError::MissingHeader);
        }
        let mut headers = Headers::with_typed_tags(tags.map(|tag| {
            let tag = tag.trim();
            tag.split_once(' ')
                .map(|(key, tag_type)| (key.to_owned(), tag_type.trim().to_owned()))
                .unwrap_or_else(|| (tag.to_owned(), DEFAULT_TAG_TYPE.to_owned()))
        }));

        // table lines up to the first blank line
        while source.read_line()? && !source.buf.is_empty() {
            let mut parts = source.buf.split(',');
            let table = parts.next().unwrap_or_default();
            if table.is_empty() {
                return Err(source.malformed("empty table name in header"));
            }
            headers = headers.with_table(table, parts);
        }

        debug!(
            tag_keys = headers.tag_keys().len(),
            tables = headers.tables().count(),
            "read data file header"
        );
        source.headers = headers;
        Ok(source)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Read the next point, `None` at the end of the input.
    pub fn next_point(&mut self) -> Result<Option<DeserializedPoint>, SourceError> {
        // skip blank lines between points
        loop {
            if !self.read_line()? {
                return Ok(None);
            }
            if !self.buf.is_empty() {
                break;
            }
        }

        let tags = self.parse_tags()?;

        if !self.read_line()? {
            return Err(self.malformed("unexpected end of input, expected a field line"));
        }
        let mut parts = self.buf.split(',');

        let table_name = parts.next().unwrap_or_default();
        let Some(table) = self.headers.table(table_name).cloned() else {
            return Err(self.malformed(format!("unknown table '{table_name}'")));
        };

        let timestamp = parts.next().unwrap_or_default();
        let mut timestamp_nanos = match timestamp.parse::<i64>() {
            Ok(ts) => ts,
            Err(_) => return Err(self.malformed(format!("invalid timestamp '{timestamp}'"))),
        };

        let field_keys = self.headers.field_keys(&table).unwrap_or_default();
        let values = parts.collect::<Vec<_>>();
        if values.len() > field_keys.len() {
            return Err(self.malformed(format!(
                "{} field value(s) for table '{table}' which has {} field key(s)",
                values.len(),
                field_keys.len()
            )));
        }

        let fields = field_keys
            .iter()
            .zip(values)
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (Arc::clone(k), FieldValue::parse(v)))
            .collect();

        if self.use_current_time {
            timestamp_nanos = now_nanos();
        }

        Ok(Some(DeserializedPoint::new(
            table,
            tags,
            fields,
            timestamp_nanos,
        )))
    }

    fn parse_tags(&self) -> Result<Vec<Arc<str>>, SourceError> {
        let mut parts = self.buf.split(',');
        if parts.next() != Some(TAGS_PREFIX) {
            return Err(self.malformed("expected a 'tags' line"));
        }

        let tags = parts.map(Arc::<str>::from).collect::<Vec<_>>();
        let expected = self.headers.tag_keys().len();
        if tags.len() != expected {
            return Err(self.malformed(format!(
                "{} tag value(s), the header declares {expected} tag key(s)",
                tags.len()
            )));
        }

        Ok(tags)
    }

    /// Read the next line into `buf` without its line ending. Returns false at
    /// the end of the input.
    fn read_line(&mut self) -> Result<bool, SourceError> {
        self.buf.clear();
        let n = self
            .reader
            .read_line(&mut self.buf)
            .map_err(|source| SourceError::Read {
                line: self.line + 1,
                source,
            })?;
        if n == 0 {
            return Ok(false);
        }

        self.line += 1;
        let trimmed = self.buf.trim_end_matches(['\n', '\r']).len();
        self.buf.truncate(trimmed);
        Ok(true)
    }

    fn malformed(&self, message: impl Into<String>) -> SourceError {
        SourceError::Malformed {
            line: self.line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use pretty_assertions::assert_eq;

    use super::*;

    const DATA: &str = "\
tags,hostname string,region string
cpu,usage_user,usage_system,status
mem,used

tags,host_0,us-east
cpu,1451606400000000000,58,2.5,ok
tags,host_1,
mem,1451606400000000000,
tags,host_2,eu-west
cpu,1451606410000000000,,,true
";

    fn source(data: &str) -> FileDataSource {
        FileDataSource::from_reader(Box::new(Cursor::new(data.to_owned())), false).unwrap()
    }

    fn read_all(source: &mut FileDataSource) -> Vec<DeserializedPoint> {
        std::iter::from_fn(|| source.next_point().unwrap()).collect()
    }

    #[test]
    fn test_headers() {
        let source = source(DATA);
        let headers = source.headers();

        let tag_keys = headers.tag_keys().iter().map(|k| k.as_ref()).collect::<Vec<_>>();
        assert_eq!(tag_keys, ["hostname", "region"]);
        assert_eq!(headers.tag_types()[0].as_ref(), "string");
        assert_eq!(headers.field_keys("cpu").unwrap().len(), 3);
        assert_eq!(headers.field_keys("mem").unwrap().len(), 1);
    }

    #[test]
    fn test_points() {
        let mut source = source(DATA);
        let points = read_all(&mut source);
        assert_eq!(points.len(), 3);

        let p = &points[0];
        assert_eq!(p.table().as_ref(), "cpu");
        assert_eq!(p.tags()[0].as_ref(), "host_0");
        assert_eq!(p.timestamp_nanos(), 1451606400000000000);
        assert_eq!(
            p.fields().to_vec(),
            vec![
                (Arc::<str>::from("usage_user"), FieldValue::Double(58.)),
                (Arc::<str>::from("usage_system"), FieldValue::Double(2.5)),
                (Arc::<str>::from("status"), FieldValue::Varchar("ok".to_owned())),
            ]
        );

        // empty tag value is kept, empty field value is a null
        assert_eq!(points[1].tags()[1].as_ref(), "");
        assert!(points[1].fields().is_empty());

        assert_eq!(
            points[2].fields().to_vec(),
            vec![(Arc::<str>::from("status"), FieldValue::Boolean(true))]
        );
    }

    #[test]
    fn test_header_only() {
        let mut source = source("tags,hostname\ncpu,usage\n");
        assert!(source.next_point().unwrap().is_none());
    }

    #[test]
    fn test_missing_header() {
        let err = FileDataSource::from_reader(Box::new(Cursor::new("cpu,usage\n")), false)
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingHeader), "{err}");

        let err = FileDataSource::from_reader(Box::new(Cursor::new("")), false).unwrap_err();
        assert!(matches!(err, SourceError::MissingHeader), "{err}");
    }

    #[test]
    fn test_malformed_points() {
        let header = "tags,hostname\ncpu,usage\n\n";
        let cases = [
            ("tags,a,b\ncpu,1,1\n", 4),
            ("tags,a\ndisk,1,1\n", 5),
            ("tags,a\ncpu,yesterday,1\n", 5),
            ("tags,a\ncpu,1,1,2\n", 5),
            ("tags,a\n", 4),
            ("cpu,1,1\n", 4),
        ];

        for (body, want_line) in cases {
            let mut source = source(&format!("{header}{body}"));
            match source.next_point() {
                Err(SourceError::Malformed { line, .. }) => assert_eq!(line, want_line, "{body}"),
                other => panic!("expected malformed error for {body:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_use_current_time() {
        let mut source =
            FileDataSource::from_reader(Box::new(Cursor::new(DATA.to_owned())), true).unwrap();
        let before = now_nanos();
        let point = source.next_point().unwrap().unwrap();
        assert!(point.timestamp_nanos() >= before);
    }

    #[test]
    fn test_open_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DATA.as_bytes()).unwrap();

        let mut source = FileDataSource::open(Some(file.path()), false).unwrap();
        assert_eq!(read_all(&mut source).len(), 3);

        let err = FileDataSource::open(Some(Path::new("/does/not/exist")), false).unwrap_err();
        assert!(matches!(err, SourceError::Open { .. }), "{err}");
    }
}
