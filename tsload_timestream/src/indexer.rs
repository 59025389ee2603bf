//! Partitioning points by the value of one dimension.

use std::{num::NonZeroUsize, sync::Arc};

use tsload_targets::{Headers, HashProvider, indexer::GenericPointIndexer};

use crate::{config::ConfigError, point::DeserializedPoint};

/// The indexer the Timestream target hands to the loader.
pub type TimestreamPointIndexer = GenericPointIndexer<HashPropertyProvider>;

/// Extracts the value of the configured hash dimension from a point.
///
/// The position of the dimension is resolved once against the run's
/// [`Headers`].
#[derive(Debug, Clone)]
pub struct HashPropertyProvider {
    tag_key: Arc<str>,
    tag_index: usize,
}

impl HashPropertyProvider {
    pub fn new(headers: &Headers, hash_property: &str) -> Result<Self, ConfigError> {
        let tag_index = headers
            .tag_index(hash_property)
            .ok_or_else(|| ConfigError::UnknownHashProperty(hash_property.to_owned()))?;

        Ok(Self {
            tag_key: Arc::clone(&headers.tag_keys()[tag_index]),
            tag_index,
        })
    }

    pub fn tag_key(&self) -> &str {
        &self.tag_key
    }

    pub fn tag_index(&self) -> usize {
        self.tag_index
    }
}

impl HashProvider<DeserializedPoint> for HashPropertyProvider {
    fn hash_key<'a>(&self, point: &'a DeserializedPoint) -> &'a [u8] {
        point.tags()[self.tag_index].as_bytes()
    }
}

/// Build the indexer partitioning by `hash_property` into `max_partitions`
/// partitions.
pub fn point_indexer(
    headers: &Headers,
    hash_property: &str,
    max_partitions: NonZeroUsize,
) -> Result<TimestreamPointIndexer, ConfigError> {
    let provider = HashPropertyProvider::new(headers, hash_property)?;
    Ok(GenericPointIndexer::new(max_partitions, provider))
}
