use std::sync::Arc;

use indexmap::IndexMap;

/// Tag type reported for tag keys declared without one.
pub const DEFAULT_TAG_TYPE: &str = "string";

/// The schema of a run: ordered tag keys shared by every table and the
/// ordered field keys of each table.
///
/// Supplied once by the data source and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    tag_keys: Vec<Arc<str>>,
    tag_types: Vec<Arc<str>>,
    field_keys: IndexMap<Arc<str>, Vec<Arc<str>>>,
}

impl Headers {
    /// Headers with untyped tag keys and no tables.
    pub fn new<I, S>(tag_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_typed_tags(tag_keys.into_iter().map(|k| (k, DEFAULT_TAG_TYPE)))
    }

    /// Headers from `(tag key, tag type)` pairs.
    pub fn with_typed_tags<I, K, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: AsRef<str>,
    {
        let (tag_keys, tag_types): (Vec<Arc<str>>, Vec<Arc<str>>) = tags
            .into_iter()
            .map(|(k, t)| (Arc::from(k.as_ref()), Arc::from(t.as_ref())))
            .unzip();

        Self {
            tag_keys,
            tag_types,
            field_keys: IndexMap::new(),
        }
    }

    /// Declare `table` with its ordered field keys, replacing any previous
    /// declaration of the same table.
    pub fn with_table<I, S>(mut self, table: &str, field_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.field_keys.insert(
            Arc::from(table),
            field_keys
                .into_iter()
                .map(|k| Arc::from(k.as_ref()))
                .collect(),
        );
        self
    }

    pub fn tag_keys(&self) -> &[Arc<str>] {
        &self.tag_keys
    }

    pub fn tag_types(&self) -> &[Arc<str>] {
        &self.tag_types
    }

    /// Position of `tag_key` in [`Self::tag_keys`].
    pub fn tag_index(&self, tag_key: &str) -> Option<usize> {
        self.tag_keys.iter().position(|k| k.as_ref() == tag_key)
    }

    /// The interned name of `table`, if declared.
    pub fn table(&self, table: &str) -> Option<&Arc<str>> {
        self.field_keys.get_key_value(table).map(|(k, _)| k)
    }

    pub fn field_keys(&self, table: &str) -> Option<&[Arc<str>]> {
        self.field_keys.get(table).map(Vec::as_slice)
    }

    /// Declared tables, in declaration order.
    pub fn tables(&self) -> impl Iterator<Item = &Arc<str>> {
        self.field_keys.keys()
    }
}
