//! Encoding batches into write requests and flushing them.
//!
//! Two strategies share the flushing logic here and differ only in how a
//! batch becomes requests:
//!
//! * [`CommonDimensionsProcessor`]: one request per point, the point's
//!   dimensions and time carried once as common attributes.
//! * [`EachValueARecordProcessor`]: every field value a self-contained record,
//!   packed per table into as few requests as the record limit allows.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tsload_targets::{
    Batch, BatchFailure, Headers, ProcessedBatch, Processor,
    backoff::{Backoff, BackoffConfig, RetryError},
};

use crate::{
    batch::{BatchPool, TimestreamBatch},
    point::{DeserializedPoint, FieldValue},
    write_service::{
        Dimension, Record, ServiceError, TimeUnit, WriteRecordsRequest, WriteService,
    },
};

mod common_dimensions;
mod each_value;

pub use common_dimensions::CommonDimensionsProcessor;
pub use each_value::EachValueARecordProcessor;

/// A write request that failed for good.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write to table '{table}' failed with a non-retryable error: {source}")]
    Permanent {
        table: String,
        attempts: usize,
        #[source]
        source: ServiceError,
    },

    #[error("write to table '{table}' still failing after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        table: String,
        attempts: usize,
        #[source]
        source: ServiceError,
    },
}

impl WriteError {
    fn new(table: String, e: RetryError<ServiceError>) -> Self {
        match e {
            RetryError::Permanent {
                attempts, source, ..
            } => Self::Permanent {
                table,
                attempts,
                source,
            },
            RetryError::RetriesExhausted {
                attempts, source, ..
            } => Self::RetriesExhausted {
                table,
                attempts,
                source,
            },
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            Self::Permanent { attempts, .. } | Self::RetriesExhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// Read-only state shared by every processor of a run.
#[derive(Debug)]
pub struct ProcessorContext {
    database_name: String,
    headers: Arc<Headers>,
    write_service: Arc<dyn WriteService>,
    pool: Arc<BatchPool>,
    backoff: BackoffConfig,
}

impl ProcessorContext {
    pub fn new(
        database_name: impl Into<String>,
        headers: Arc<Headers>,
        write_service: Arc<dyn WriteService>,
        pool: Arc<BatchPool>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            headers,
            write_service,
            pool,
            backoff,
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    fn request(
        &self,
        table: &str,
        common: Option<Record>,
        records: Vec<Record>,
    ) -> WriteRecordsRequest {
        WriteRecordsRequest {
            database_name: self.database_name.clone(),
            table_name: table.to_owned(),
            common_attributes: common,
            records,
        }
    }

    /// Send `requests` in order, then return `batch` to the pool whatever
    /// the outcome.
    async fn flush(
        &self,
        batch: TimestreamBatch,
        requests: Vec<EncodedRequest>,
        do_load: bool,
    ) -> Result<ProcessedBatch, BatchFailure> {
        let points = batch.len() as u64;
        let result = if do_load {
            self.send_all(points, requests).await
        } else {
            Ok(ProcessedBatch {
                metrics: batch.metrics(),
                rows: points,
                ..Default::default()
            })
        };

        self.pool.put(batch);
        result
    }

    /// Stops at the first request that fails for good; what was written
    /// before it is reported with the failure.
    async fn send_all(
        &self,
        points: u64,
        requests: Vec<EncodedRequest>,
    ) -> Result<ProcessedBatch, BatchFailure> {
        let mut written = ProcessedBatch::default();
        for EncodedRequest { request, rows } in requests {
            let records = request.records.len() as u64;
            let bytes = request.encoded_len() as u64;
            let table = request.table_name.clone();

            let result = Backoff::new(&self.backoff)
                .retry_with_classifier(
                    "write records",
                    || self.write_service.write_records(request.clone()),
                    ServiceError::is_transient,
                )
                .await;

            if let Err(e) = result {
                let e = WriteError::new(table, e);
                return Err(BatchFailure {
                    rows: points,
                    written,
                    attempts: e.attempts(),
                    retryable: e.is_transient(),
                    source: Box::new(e),
                });
            }

            written.metrics += records;
            written.rows += rows;
            written.requests += 1;
            written.bytes += bytes;
        }

        debug!(
            db_name = %self.database_name,
            points,
            records = written.metrics,
            requests = written.requests,
            "flushed batch"
        );

        // points without fields need no request
        written.rows = points;
        Ok(written)
    }
}

/// A request together with the points it completes.
#[derive(Debug)]
struct EncodedRequest {
    request: WriteRecordsRequest,
    /// Points fully written once this request succeeds.
    rows: u64,
}

/// The dimensions of `point`: one per tag key with a non-empty value.
fn dimensions(headers: &Headers, point: &DeserializedPoint) -> Vec<Dimension> {
    headers
        .tag_keys()
        .iter()
        .zip(point.tags())
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| Dimension::new(&**key, &**value))
        .collect()
}

/// A record carrying only the measure of one field.
fn measure(key: &str, value: &FieldValue) -> Record {
    Record {
        measure_name: Some(key.to_owned()),
        measure_value: Some(value.to_string()),
        measure_value_type: Some(value.measure_value_type()),
        ..Default::default()
    }
}

fn time_attributes(point: &DeserializedPoint) -> (Option<String>, Option<TimeUnit>) {
    (
        Some(point.timestamp_nanos().to_string()),
        Some(TimeUnit::Nanoseconds),
    )
}

/// The processor selected for a run.
#[derive(Debug)]
pub enum RecordProcessor {
    CommonDimensions(CommonDimensionsProcessor),
    EachValueARecord(EachValueARecordProcessor),
}

impl RecordProcessor {
    pub fn new(context: Arc<ProcessorContext>, use_common_attributes: bool) -> Self {
        if use_common_attributes {
            Self::CommonDimensions(CommonDimensionsProcessor::new(context))
        } else {
            Self::EachValueARecord(EachValueARecordProcessor::new(context))
        }
    }
}

#[async_trait]
impl Processor for RecordProcessor {
    type Batch = TimestreamBatch;

    async fn process_batch(
        &self,
        batch: TimestreamBatch,
        do_load: bool,
    ) -> Result<ProcessedBatch, BatchFailure> {
        match self {
            Self::CommonDimensions(p) => p.process_batch(batch, do_load).await,
            Self::EachValueARecord(p) => p.process_batch(batch, do_load).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::{test_utils::*, *};
    use crate::{
        config::RetentionProperties,
        write_service::{
            DatabaseDescription, MAX_RECORDS_PER_REQUEST, MemWriteService, RecordsIngested,
            TableDescription,
        },
    };

    /// Notes how many batches sat idle in the pool at every write.
    #[derive(Debug)]
    struct PoolWatcher {
        inner: Arc<MemWriteService>,
        pool: Arc<BatchPool>,
        idle_at_write: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl WriteService for PoolWatcher {
        async fn write_records(
            &self,
            request: WriteRecordsRequest,
        ) -> Result<RecordsIngested, ServiceError> {
            self.idle_at_write.lock().push(self.pool.idle());
            self.inner.write_records(request).await
        }

        async fn describe_database(
            &self,
            database_name: &str,
        ) -> Result<DatabaseDescription, ServiceError> {
            self.inner.describe_database(database_name).await
        }

        async fn create_database(&self, database_name: &str) -> Result<(), ServiceError> {
            self.inner.create_database(database_name).await
        }

        async fn delete_database(&self, database_name: &str) -> Result<(), ServiceError> {
            self.inner.delete_database(database_name).await
        }

        async fn list_tables(&self, database_name: &str) -> Result<Vec<String>, ServiceError> {
            self.inner.list_tables(database_name).await
        }

        async fn describe_table(
            &self,
            database_name: &str,
            table_name: &str,
        ) -> Result<TableDescription, ServiceError> {
            self.inner.describe_table(database_name, table_name).await
        }

        async fn create_table(
            &self,
            database_name: &str,
            table_name: &str,
            retention: RetentionProperties,
        ) -> Result<(), ServiceError> {
            self.inner
                .create_table(database_name, table_name, retention)
                .await
        }

        async fn delete_table(
            &self,
            database_name: &str,
            table_name: &str,
        ) -> Result<(), ServiceError> {
            self.inner.delete_table(database_name, table_name).await
        }
    }

    fn sample_points() -> Vec<DeserializedPoint> {
        vec![
            point(
                "cpu",
                "host_0",
                "us-east",
                &[
                    ("usage_user", FieldValue::Double(58.)),
                    ("usage_system", FieldValue::Double(2.)),
                    ("status", FieldValue::Varchar("ok".to_owned())),
                ],
                10,
            ),
            point("mem", "host_0", "", &[("used", FieldValue::Bigint(4096))], 10),
            point("cpu", "host_1", "eu-west", &[], 20),
            point(
                "cpu",
                "host_1",
                "eu-west",
                &[("status", FieldValue::Boolean(true))],
                30,
            ),
        ]
    }

    async fn flush_with(
        use_common_attributes: bool,
        points: Vec<DeserializedPoint>,
    ) -> (Arc<MemWriteService>, ProcessedBatch) {
        let service = service().await;
        let processor = RecordProcessor::new(context(&service), use_common_attributes);
        let written = processor
            .process_batch(batch(points), true)
            .await
            .unwrap();
        (service, written)
    }

    #[tokio::test]
    async fn test_strategies_write_the_same_records() {
        let (common, common_written) = flush_with(true, sample_points()).await;
        let (each, each_written) = flush_with(false, sample_points()).await;

        // sum of fields per point
        assert_eq!(common_written.metrics, 5);
        assert_eq!(each_written.metrics, 5);
        assert_eq!(common_written.rows, 4);
        assert_eq!(each_written.rows, 4);

        // one request per point with fields, versus one per table
        assert_eq!(common_written.requests, 3);
        assert_eq!(each_written.requests, 2);
        assert_eq!(common.write_calls(), 3);

        assert_eq!(stored(&common), stored(&each));
        assert_eq!(stored(&common).len(), 5);
    }

    #[tokio::test]
    async fn test_empty_dimension_values_are_skipped() {
        let (service, _) = flush_with(false, sample_points()).await;

        let mem = service.records(DB, "mem");
        assert_eq!(mem.len(), 1);
        assert_eq!(mem[0].dimensions, vec![Dimension::new("hostname", "host_0")]);
    }

    #[tokio::test]
    async fn test_no_load_counts_without_writing() {
        let service = service().await;
        let processor = RecordProcessor::new(context(&service), true);

        let written = processor
            .process_batch(batch(sample_points()), false)
            .await
            .unwrap();
        assert_eq!(written.metrics, 5);
        assert_eq!(written.rows, 4);
        assert_eq!(written.requests, 0);
        assert_eq!(service.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_returned_to_pool_after_requests() {
        let pool = Arc::new(BatchPool::default());
        let watcher = Arc::new(PoolWatcher {
            inner: service().await,
            pool: Arc::clone(&pool),
            idle_at_write: Mutex::new(vec![]),
        });
        let write_service: Arc<dyn WriteService> = Arc::<PoolWatcher>::clone(&watcher);
        let processor = RecordProcessor::new(context_with(write_service, Arc::clone(&pool)), false);

        processor
            .process_batch(batch(sample_points()), true)
            .await
            .unwrap();
        // the batch was still out while both requests were sent
        assert_eq!(*watcher.idle_at_write.lock(), vec![0, 0]);
        assert_eq!(pool.idle(), 1);

        watcher.idle_at_write.lock().clear();
        watcher
            .inner
            .fail_next(ServiceError::AccessDenied("no".to_owned()));
        processor
            .process_batch(batch(sample_points()), true)
            .await
            .unwrap_err();
        assert_eq!(*watcher.idle_at_write.lock(), vec![1]);
        assert_eq!(pool.idle(), 2);

        processor
            .process_batch(batch(sample_points()), false)
            .await
            .unwrap();
        assert_eq!(pool.idle(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_transient_errors_are_retried() {
        let service = service().await;
        service.fail_next(ServiceError::Throttling("slow down".to_owned()));
        service.fail_next(ServiceError::ServiceUnavailable("busy".to_owned()));

        let processor = RecordProcessor::new(context(&service), true);
        let written = processor
            .process_batch(batch(sample_points()), true)
            .await
            .unwrap();

        assert_eq!(written.requests, 3);
        // two failed attempts of the first request, then every request once
        assert_eq!(service.write_calls(), 5);
        assert_eq!(service.record_count(), 5);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let service = service().await;
        for _ in 0..3 {
            service.fail_next(ServiceError::InternalServer("oops".to_owned()));
        }

        let processor = RecordProcessor::new(context(&service), false);
        let failure = processor
            .process_batch(batch(sample_points()), true)
            .await
            .unwrap_err();

        assert!(failure.retryable);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.rows, 4);
        assert_eq!(failure.written, ProcessedBatch::default());
        assert_eq!(service.write_calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_the_batch() {
        let service = service().await;
        let processor = RecordProcessor::new(context(&service), true);

        // the first request succeeds, the second is rejected
        processor
            .process_batch(batch(sample_points().into_iter().take(1)), true)
            .await
            .unwrap();
        service.fail_next(ServiceError::Validation("bad".to_owned()));

        let failure = processor
            .process_batch(batch(sample_points()), true)
            .await
            .unwrap_err();
        assert!(!failure.retryable);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.written.requests, 0);
        assert!(failure.to_string().contains("non-retryable"), "{failure}");
        // one call for the first batch, one for the rejected request
        assert_eq!(service.write_calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_request_stores_nothing() {
        for use_common_attributes in [true, false] {
            let service = service().await;
            let processor = RecordProcessor::new(context(&service), use_common_attributes);
            let points = vec![point(
                "cpu",
                "host_0",
                "us-east",
                &[
                    ("usage_user", FieldValue::Double(f64::NAN)),
                    ("usage_system", FieldValue::Double(2.)),
                ],
                10,
            )];

            let failure = processor
                .process_batch(batch(points), true)
                .await
                .unwrap_err();
            assert!(!failure.retryable);
            assert_eq!(failure.written.metrics, 0);
            // what the service holds matches what was reported written
            assert_eq!(service.record_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_partial_write_is_reported() {
        let service = service().await;
        let processor = RecordProcessor::new(context(&service), true);

        // lose the mem table so the second request is rejected
        service.delete_table(DB, "mem").await.unwrap();
        let failure = processor
            .process_batch(batch(sample_points()), true)
            .await
            .unwrap_err();

        assert!(!failure.retryable);
        assert_eq!(failure.written.requests, 1);
        assert_eq!(failure.written.metrics, 3);
        assert_eq!(failure.written.rows, 1);
    }

    #[tokio::test]
    async fn test_requests_respect_record_limit() {
        let fields = (0..250)
            .map(|i| (format!("f{i}"), FieldValue::Bigint(i)))
            .collect::<Vec<_>>();
        let field_refs = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect::<Vec<_>>();

        let service = Arc::new(MemWriteService::new());
        service.create_database(DB).await.unwrap();
        service
            .create_table(
                DB,
                "wide",
                crate::config::RetentionProperties::try_new(1, 1).unwrap(),
            )
            .await
            .unwrap();

        for use_common_attributes in [true, false] {
            let write_service: Arc<dyn WriteService> = Arc::<MemWriteService>::clone(&service);
            let ctx = Arc::new(ProcessorContext::new(
                DB,
                Arc::new(
                    Headers::new(["hostname", "region"])
                        .with_table("wide", fields.iter().map(|(k, _)| k)),
                ),
                write_service,
                Arc::new(BatchPool::default()),
                BackoffConfig::default(),
            ));
            let processor = RecordProcessor::new(ctx, use_common_attributes);

            let written = processor
                .process_batch(batch([point("wide", "h", "r", &field_refs, 1)]), true)
                .await
                .unwrap();
            assert_eq!(written.metrics, 250);
            assert_eq!(
                written.requests,
                250_u64.div_ceil(MAX_RECORDS_PER_REQUEST as u64)
            );
        }
        assert_eq!(service.records(DB, "wide").len(), 500);
    }

    proptest! {
        #[test]
        fn prop_record_count_is_sum_of_fields(
            field_counts in proptest::collection::vec(0usize..4, 0..20),
            use_common_attributes in any::<bool>(),
        ) {
            let keys = ["usage_user", "usage_system", "status"];
            let points = field_counts
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    let fields = keys[..(*n).min(3)]
                        .iter()
                        .map(|k| (*k, FieldValue::Double(i as f64)))
                        .collect::<Vec<_>>();
                    point("cpu", &format!("host_{i}"), "r", &fields, i as i64)
                })
                .collect::<Vec<_>>();
            let want = points.iter().map(|p| p.fields().len()).sum::<usize>();

            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (service, written) = rt.block_on(flush_with(use_common_attributes, points));

            prop_assert_eq!(written.metrics as usize, want);
            prop_assert_eq!(service.record_count(), want);
        }
    }
}
