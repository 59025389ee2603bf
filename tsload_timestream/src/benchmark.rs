//! The Timestream target assembled for the generic loader.

use std::{num::NonZeroUsize, sync::Arc};

use tracing::info;
use tsload_targets::{Benchmark, DataSource, DynError, Headers};

use crate::{
    batch::{BatchPool, TimestreamBatch, TimestreamBatchFactory},
    config::{ConfigError, RetentionProperties, TimestreamConfig},
    db_creator::TimestreamDbCreator,
    indexer::{TimestreamPointIndexer, point_indexer},
    point::DeserializedPoint,
    processor::{ProcessorContext, RecordProcessor},
    source::{DataSourceConfig, SourceError, TimestreamDataSource, init_data_source},
    write_service::WriteService,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to initialize data source: {0}")]
    Source(#[from] SourceError),
}

/// Everything a run against one write service needs.
///
/// The data source is opened on construction so its [`Headers`] are known
/// before the target is created.
#[derive(Debug)]
pub struct TimestreamBenchmark {
    config: TimestreamConfig,
    retention: RetentionProperties,
    source: Option<TimestreamDataSource>,
    headers: Arc<Headers>,
    write_service: Arc<dyn WriteService>,
    pool: Arc<BatchPool>,
    context: Arc<ProcessorContext>,
}

impl TimestreamBenchmark {
    pub fn new(
        db_name: impl Into<String>,
        config: TimestreamConfig,
        source: DataSourceConfig,
        write_service: Arc<dyn WriteService>,
    ) -> Result<Self, Error> {
        let retention = config.retention()?;
        let source = init_data_source(source, config.use_current_time)?;
        let headers = Arc::new(source.headers().clone());
        let pool = Arc::new(BatchPool::default());

        let context = Arc::new(ProcessorContext::new(
            db_name,
            Arc::clone(&headers),
            Arc::clone(&write_service),
            Arc::clone(&pool),
            config.backoff_config(),
        ));

        info!(
            db_name = context.database_name(),
            hash_property = %config.hash_property,
            use_common_attributes = config.use_common_attributes,
            %retention,
            tables = headers.tables().count(),
            "initialized timestream target"
        );

        Ok(Self {
            config,
            retention,
            source: Some(source),
            headers,
            write_service,
            pool,
            context,
        })
    }

    pub fn headers(&self) -> &Arc<Headers> {
        &self.headers
    }

    pub fn config(&self) -> &TimestreamConfig {
        &self.config
    }
}

impl Benchmark for TimestreamBenchmark {
    type Point = DeserializedPoint;
    type Source = TimestreamDataSource;
    type Batch = TimestreamBatch;
    type BatchFactory = TimestreamBatchFactory;
    type Indexer = TimestreamPointIndexer;
    type Processor = RecordProcessor;
    type DbCreator = TimestreamDbCreator;

    fn take_data_source(&mut self) -> Option<TimestreamDataSource> {
        self.source.take()
    }

    fn batch_factory(&self) -> TimestreamBatchFactory {
        TimestreamBatchFactory::new(Arc::clone(&self.pool))
    }

    fn point_indexer(
        &self,
        max_partitions: NonZeroUsize,
    ) -> Result<TimestreamPointIndexer, DynError> {
        Ok(point_indexer(
            &self.headers,
            &self.config.hash_property,
            max_partitions,
        )?)
    }

    fn processor(&self) -> RecordProcessor {
        RecordProcessor::new(
            Arc::clone(&self.context),
            self.config.use_common_attributes,
        )
    }

    fn db_creator(&self) -> TimestreamDbCreator {
        TimestreamDbCreator::new(
            Arc::clone(&self.write_service),
            Arc::clone(&self.headers),
            self.retention.magnetic_days(),
            self.retention.memory_hours(),
            self.config.backoff_config(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use pretty_assertions::assert_eq;
    use tsload_data_generator::{DataSpec, GeneratorConfig};
    use tsload_targets::loader::{BenchmarkRunner, Error as LoaderError, LoaderConfig};

    use super::*;
    use crate::write_service::MemWriteService;

    const DB: &str = "benchmark";

    fn simulator(max_points: u64) -> DataSourceConfig {
        DataSourceConfig::Simulator {
            spec: DataSpec::builtin_cpu(),
            config: GeneratorConfig {
                seed: 42,
                start_nanos: 1_451_606_400_000_000_000,
                interval: Duration::from_secs(10),
                max_points: Some(max_points),
            },
        }
    }

    fn loader_config() -> LoaderConfig {
        LoaderConfig {
            db_name: DB.to_owned(),
            batch_size: NonZeroUsize::new(64).unwrap(),
            workers: NonZeroUsize::new(4).unwrap(),
            ..Default::default()
        }
    }

    fn benchmark(
        config: TimestreamConfig,
        source: DataSourceConfig,
    ) -> (Arc<MemWriteService>, TimestreamBenchmark) {
        let service = Arc::new(MemWriteService::new());
        let write_service: Arc<dyn WriteService> = Arc::<MemWriteService>::clone(&service);
        let benchmark = TimestreamBenchmark::new(DB, config, source, write_service).unwrap();
        (service, benchmark)
    }

    #[test_log::test(tokio::test)]
    async fn test_load_simulated_points() {
        for use_common_attributes in [true, false] {
            let config = TimestreamConfig {
                use_common_attributes,
                mag_store_retention_in_days: 7,
                mem_store_retention_in_hours: 24,
                ..Default::default()
            };
            let (service, benchmark) = benchmark(config, simulator(500));

            let summary = BenchmarkRunner::new(loader_config(), benchmark)
                .run()
                .await
                .unwrap();

            assert_eq!(summary.points_read, 500);
            assert_eq!(summary.failed_batches(), 0);
            let written = summary.written();
            assert_eq!(written.rows, 500);
            // ten fields per cpu point
            assert_eq!(written.metrics, 5000);
            assert_eq!(service.record_count(), 5000);

            let table = service.describe_table(DB, "cpu").await.unwrap();
            assert_eq!(
                table.retention,
                RetentionProperties::try_new(7, 24).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "tags,hostname string,region string\n\
             cpu,usage_user,usage_system\n\
             \n\
             tags,host_0,us-east\n\
             cpu,1451606400000000000,1.5,2\n\
             tags,host_1,us-west\n\
             cpu,1451606400000000000,3,\n"
        )
        .unwrap();

        let (service, benchmark) = benchmark(
            TimestreamConfig {
                use_common_attributes: false,
                ..Default::default()
            },
            DataSourceConfig::File {
                path: Some(file.path().to_owned()),
            },
        );
        let summary = BenchmarkRunner::new(loader_config(), benchmark)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.written().rows, 2);
        assert_eq!(summary.written().metrics, 3);
        assert_eq!(service.records(DB, "cpu").len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_hash_property() {
        let (service, benchmark) = benchmark(
            TimestreamConfig {
                hash_property: "rack".to_owned(),
                ..Default::default()
            },
            simulator(10),
        );

        let err = BenchmarkRunner::new(loader_config(), benchmark)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Indexer(_)), "{err}");
        assert!(
            err.to_string()
                .contains("no dimension named 'rack' found in data points"),
            "{err}"
        );
        assert_eq!(service.record_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_hash_property_keeps_existing_table() {
        let (service, benchmark) = benchmark(
            TimestreamConfig {
                hash_property: "rack".to_owned(),
                mag_store_retention_in_days: 30,
                ..Default::default()
            },
            simulator(10),
        );
        let existing = RetentionProperties::try_new(7, 24).unwrap();
        service.create_database(DB).await.unwrap();
        service.create_table(DB, "cpu", existing).await.unwrap();
        let config = LoaderConfig {
            recreate_db: true,
            ..loader_config()
        };

        let err = BenchmarkRunner::new(config, benchmark)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Indexer(_)), "{err}");

        let table = service.describe_table(DB, "cpu").await.unwrap();
        assert_eq!(table.retention, existing);
        assert_eq!(service.list_tables(DB).await.unwrap(), vec!["cpu".to_owned()]);
    }

    #[test]
    fn test_invalid_retention() {
        let service: Arc<dyn WriteService> = Arc::new(MemWriteService::new());
        let err = TimestreamBenchmark::new(
            DB,
            TimestreamConfig {
                mag_store_retention_in_days: 0,
                ..Default::default()
            },
            simulator(1),
            service,
        )
        .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Config(ConfigError::MagneticRetentionOutOfRange(0))
            ),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (service, benchmark) = benchmark(TimestreamConfig::default(), simulator(100));
        let summary = BenchmarkRunner::new(
            LoaderConfig {
                do_load: false,
                ..loader_config()
            },
            benchmark,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(summary.written().rows, 100);
        assert_eq!(summary.written().requests, 0);
        assert_eq!(service.write_calls(), 0);
        assert!(service.list_tables(DB).await.is_err());
    }
}
