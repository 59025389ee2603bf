//! The interface of the managed write API, modelled after its request and
//! error types.

use std::{fmt, fmt::Debug};

use async_trait::async_trait;

use crate::config::RetentionProperties;

mod mem;

pub use mem::MemWriteService;

/// Most records a single `write_records` call accepts.
pub const MAX_RECORDS_PER_REQUEST: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasureValueType {
    Double,
    Bigint,
    Varchar,
    Boolean,
}

impl MeasureValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Double => "DOUBLE",
            Self::Bigint => "BIGINT",
            Self::Varchar => "VARCHAR",
            Self::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for MeasureValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Microseconds,
    Nanoseconds,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Milliseconds => "MILLISECONDS",
            Self::Seconds => "SECONDS",
            Self::Microseconds => "MICROSECONDS",
            Self::Nanoseconds => "NANOSECONDS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A record, or the attributes shared by all records of a request.
///
/// Every attribute is optional so the same type can describe both; a record
/// is only complete once merged with its request's common attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub dimensions: Vec<Dimension>,
    pub measure_name: Option<String>,
    pub measure_value: Option<String>,
    pub measure_value_type: Option<MeasureValueType>,
    pub time: Option<String>,
    pub time_unit: Option<TimeUnit>,
}

impl Record {
    /// `self` with the attributes it leaves unset taken from `common`.
    ///
    /// Dimensions are concatenated, common ones first.
    pub fn resolve(&self, common: &Self) -> Self {
        let mut dimensions = common.dimensions.clone();
        dimensions.extend(self.dimensions.iter().cloned());

        Self {
            dimensions,
            measure_name: self.measure_name.clone().or_else(|| common.measure_name.clone()),
            measure_value: self
                .measure_value
                .clone()
                .or_else(|| common.measure_value.clone()),
            measure_value_type: self.measure_value_type.or(common.measure_value_type),
            time: self.time.clone().or_else(|| common.time.clone()),
            time_unit: self.time_unit.or(common.time_unit),
        }
    }

    /// Approximate size of the record on the wire.
    pub fn encoded_len(&self) -> usize {
        let dims: usize = self
            .dimensions
            .iter()
            .map(|d| d.name.len() + d.value.len())
            .sum();

        dims + self.measure_name.as_ref().map_or(0, String::len)
            + self.measure_value.as_ref().map_or(0, String::len)
            + self.measure_value_type.map_or(0, |t| t.as_str().len())
            + self.time.as_ref().map_or(0, String::len)
            + self.time_unit.map_or(0, |u| u.as_str().len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecordsRequest {
    pub database_name: String,
    pub table_name: String,
    pub common_attributes: Option<Record>,
    pub records: Vec<Record>,
}

impl WriteRecordsRequest {
    /// The records as the service stores them, with the common attributes
    /// merged in.
    pub fn resolved_records(&self) -> Vec<Record> {
        match &self.common_attributes {
            Some(common) => self.records.iter().map(|r| r.resolve(common)).collect(),
            None => self.records.clone(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.database_name.len()
            + self.table_name.len()
            + self.common_attributes.as_ref().map_or(0, Record::encoded_len)
            + self.records.iter().map(Record::encoded_len).sum::<usize>()
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordsIngested {
    pub total: u64,
    pub memory_store: u64,
    pub magnetic_store: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDescription {
    pub database_name: String,
    pub table_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub database_name: String,
    pub table_name: String,
    pub retention: RetentionProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub record_index: usize,
    pub reason: String,
}

/// Errors the write API reports.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("request throttled: {0}")]
    Throttling(String),

    #[error("internal server error: {0}")]
    InternalServer(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{} record(s) rejected: {message}", rejected.len())]
    RejectedRecords {
        message: String,
        rejected: Vec<RejectedRecord>,
    },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("access denied: {0}")]
    AccessDenied(String),
}

impl ServiceError {
    /// Whether repeating the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Throttling(_)
            | Self::InternalServer(_)
            | Self::ServiceUnavailable(_)
            | Self::Network(_) => true,
            Self::Validation(_)
            | Self::RejectedRecords { .. }
            | Self::ResourceNotFound(_)
            | Self::Conflict(_)
            | Self::AccessDenied(_) => false,
        }
    }
}

/// The managed time-series write API.
///
/// Implementations are stateless handles, shared by every worker.
#[async_trait]
pub trait WriteService: Debug + Send + Sync + 'static {
    async fn write_records(
        &self,
        request: WriteRecordsRequest,
    ) -> Result<RecordsIngested, ServiceError>;

    async fn describe_database(
        &self,
        database_name: &str,
    ) -> Result<DatabaseDescription, ServiceError>;

    async fn create_database(&self, database_name: &str) -> Result<(), ServiceError>;

    /// Fails unless every table of the database was deleted first.
    async fn delete_database(&self, database_name: &str) -> Result<(), ServiceError>;

    async fn list_tables(&self, database_name: &str) -> Result<Vec<String>, ServiceError>;

    async fn describe_table(
        &self,
        database_name: &str,
        table_name: &str,
    ) -> Result<TableDescription, ServiceError>;

    async fn create_table(
        &self,
        database_name: &str,
        table_name: &str,
        retention: RetentionProperties,
    ) -> Result<(), ServiceError>;

    async fn delete_table(&self, database_name: &str, table_name: &str)
    -> Result<(), ServiceError>;
}
