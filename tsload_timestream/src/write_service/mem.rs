use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;

use super::{
    DatabaseDescription, MAX_RECORDS_PER_REQUEST, MeasureValueType, Record, RecordsIngested,
    RejectedRecord, ServiceError, TableDescription, WriteRecordsRequest, WriteService,
};
use crate::config::RetentionProperties;

#[derive(Debug, Default)]
struct MemTable {
    retention: Option<RetentionProperties>,
    records: Vec<Record>,
}

#[derive(Debug, Default)]
struct MemDatabase {
    tables: IndexMap<String, MemTable>,
}

/// An in-process [`WriteService`] that validates requests the way the managed
/// API does and keeps every accepted record.
///
/// A write is all or nothing: one rejected record rejects the whole request.
///
/// Errors queued with [`MemWriteService::fail_next`] are returned, in order,
/// by the next calls instead of executing them.
#[derive(Debug, Default)]
pub struct MemWriteService {
    databases: Mutex<HashMap<String, MemDatabase>>,
    injected: Mutex<VecDeque<ServiceError>>,
    write_calls: AtomicU64,
}

impl MemWriteService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with `error`.
    pub fn fail_next(&self, error: ServiceError) {
        self.injected.lock().push_back(error);
    }

    /// Number of `write_records` calls received, failed ones included.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Resolved records stored in `database_name.table_name`.
    pub fn records(&self, database_name: &str, table_name: &str) -> Vec<Record> {
        self.databases
            .lock()
            .get(database_name)
            .and_then(|db| db.tables.get(table_name))
            .map(|t| t.records.clone())
            .unwrap_or_default()
    }

    /// Total number of stored records.
    pub fn record_count(&self) -> usize {
        self.databases
            .lock()
            .values()
            .flat_map(|db| db.tables.values())
            .map(|t| t.records.len())
            .sum()
    }

    fn injected_error(&self) -> Result<(), ServiceError> {
        match self.injected.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn database_not_found(database_name: &str) -> ServiceError {
    ServiceError::ResourceNotFound(format!("database {database_name} does not exist"))
}

fn table_not_found(database_name: &str, table_name: &str) -> ServiceError {
    ServiceError::ResourceNotFound(format!(
        "table {database_name}.{table_name} does not exist"
    ))
}

/// Why `record` would be rejected, if it would be.
fn rejection_reason(record: &Record) -> Option<String> {
    if record.measure_name.as_deref().is_none_or(str::is_empty) {
        return Some("missing measure name".to_owned());
    }
    let Some(value) = record.measure_value.as_deref() else {
        return Some("missing measure value".to_owned());
    };
    let Some(value_type) = record.measure_value_type else {
        return Some("missing measure value type".to_owned());
    };
    let valid_value = match value_type {
        MeasureValueType::Double => value.parse::<f64>().is_ok_and(f64::is_finite),
        MeasureValueType::Bigint => value.parse::<i64>().is_ok(),
        MeasureValueType::Boolean => matches!(value, "true" | "false"),
        MeasureValueType::Varchar => true,
    };
    if !valid_value {
        return Some(format!("measure value '{value}' is not a valid {value_type}"));
    }
    if record
        .time
        .as_deref()
        .is_none_or(|t| t.parse::<i64>().is_err())
    {
        return Some("missing or invalid time".to_owned());
    }
    if record.time_unit.is_none() {
        return Some("missing time unit".to_owned());
    }
    if let Some(d) = record.dimensions.iter().find(|d| d.value.is_empty()) {
        return Some(format!("dimension '{}' has an empty value", d.name));
    }

    None
}

#[async_trait]
impl WriteService for MemWriteService {
    async fn write_records(
        &self,
        request: WriteRecordsRequest,
    ) -> Result<RecordsIngested, ServiceError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_error()?;

        let n = request.records.len();
        if n == 0 || n > MAX_RECORDS_PER_REQUEST {
            return Err(ServiceError::Validation(format!(
                "a request must contain between 1 and {MAX_RECORDS_PER_REQUEST} records, got {n}"
            )));
        }

        let mut databases = self.databases.lock();
        let table = databases
            .get_mut(&request.database_name)
            .ok_or_else(|| database_not_found(&request.database_name))?
            .tables
            .get_mut(&request.table_name)
            .ok_or_else(|| table_not_found(&request.database_name, &request.table_name))?;

        let records = request.resolved_records();
        let rejected = records
            .iter()
            .enumerate()
            .filter_map(|(record_index, record)| {
                rejection_reason(record).map(|reason| RejectedRecord {
                    record_index,
                    reason,
                })
            })
            .collect::<Vec<_>>();

        if !rejected.is_empty() {
            return Err(ServiceError::RejectedRecords {
                message: format!(
                    "{} of {n} record(s) in {}.{} were rejected",
                    rejected.len(),
                    request.database_name,
                    request.table_name
                ),
                rejected,
            });
        }

        let ingested = records.len() as u64;
        table.records.extend(records);
        Ok(RecordsIngested {
            total: ingested,
            memory_store: ingested,
            magnetic_store: 0,
        })
    }

    async fn describe_database(
        &self,
        database_name: &str,
    ) -> Result<DatabaseDescription, ServiceError> {
        self.injected_error()?;

        self.databases
            .lock()
            .get(database_name)
            .map(|db| DatabaseDescription {
                database_name: database_name.to_owned(),
                table_count: db.tables.len() as u64,
            })
            .ok_or_else(|| database_not_found(database_name))
    }

    async fn create_database(&self, database_name: &str) -> Result<(), ServiceError> {
        self.injected_error()?;

        let mut databases = self.databases.lock();
        if databases.contains_key(database_name) {
            return Err(ServiceError::Conflict(format!(
                "database {database_name} already exists"
            )));
        }
        databases.insert(database_name.to_owned(), MemDatabase::default());
        Ok(())
    }

    async fn delete_database(&self, database_name: &str) -> Result<(), ServiceError> {
        self.injected_error()?;

        let mut databases = self.databases.lock();
        let db = databases
            .get(database_name)
            .ok_or_else(|| database_not_found(database_name))?;
        if !db.tables.is_empty() {
            return Err(ServiceError::Validation(format!(
                "database {database_name} still has {} table(s)",
                db.tables.len()
            )));
        }
        databases.remove(database_name);
        Ok(())
    }

    async fn list_tables(&self, database_name: &str) -> Result<Vec<String>, ServiceError> {
        self.injected_error()?;

        self.databases
            .lock()
            .get(database_name)
            .map(|db| db.tables.keys().cloned().collect())
            .ok_or_else(|| database_not_found(database_name))
    }

    async fn describe_table(
        &self,
        database_name: &str,
        table_name: &str,
    ) -> Result<TableDescription, ServiceError> {
        self.injected_error()?;

        let databases = self.databases.lock();
        let table = databases
            .get(database_name)
            .and_then(|db| db.tables.get(table_name))
            .ok_or_else(|| table_not_found(database_name, table_name))?;
        let retention = table.retention.ok_or_else(|| {
            ServiceError::InternalServer(format!("table {table_name} has no retention"))
        })?;

        Ok(TableDescription {
            database_name: database_name.to_owned(),
            table_name: table_name.to_owned(),
            retention,
        })
    }

    async fn create_table(
        &self,
        database_name: &str,
        table_name: &str,
        retention: RetentionProperties,
    ) -> Result<(), ServiceError> {
        self.injected_error()?;

        let mut databases = self.databases.lock();
        let db = databases
            .get_mut(database_name)
            .ok_or_else(|| database_not_found(database_name))?;
        if db.tables.contains_key(table_name) {
            return Err(ServiceError::Conflict(format!(
                "table {database_name}.{table_name} already exists"
            )));
        }
        db.tables.insert(
            table_name.to_owned(),
            MemTable {
                retention: Some(retention),
                records: vec![],
            },
        );
        Ok(())
    }

    async fn delete_table(
        &self,
        database_name: &str,
        table_name: &str,
    ) -> Result<(), ServiceError> {
        self.injected_error()?;

        self.databases
            .lock()
            .get_mut(database_name)
            .and_then(|db| db.tables.shift_remove(table_name))
            .map(|_| ())
            .ok_or_else(|| table_not_found(database_name, table_name))
    }
}
