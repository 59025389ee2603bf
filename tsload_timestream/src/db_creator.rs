//! Creating and tearing down the target database and its tables.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use tracing::{error, info, warn};
use tsload_targets::{
    DbCreator, DynError, Headers,
    backoff::{Backoff, BackoffConfig, RetryError},
};

use crate::{
    config::{ConfigError, RetentionProperties},
    write_service::{ServiceError, WriteService},
};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{operation} failed: {source}")]
    Service {
        operation: String,
        #[source]
        source: RetryError<ServiceError>,
    },
}

impl LifecycleError {
    fn service(operation: impl Into<String>, source: RetryError<ServiceError>) -> Self {
        Self::Service {
            operation: operation.into(),
            source,
        }
    }
}

/// Makes sure the target database and one table per table in the run's
/// [`Headers`] exist with the configured retention.
#[derive(Debug)]
pub struct TimestreamDbCreator {
    write_service: Arc<dyn WriteService>,
    headers: Arc<Headers>,
    magnetic_days: u64,
    memory_hours: u64,
    backoff: BackoffConfig,
}

impl TimestreamDbCreator {
    pub fn new(
        write_service: Arc<dyn WriteService>,
        headers: Arc<Headers>,
        magnetic_days: u64,
        memory_hours: u64,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            write_service,
            headers,
            magnetic_days,
            memory_hours,
            backoff,
        }
    }

    async fn retry<T, F, Fut>(&self, task_name: &str, f: F) -> Result<T, RetryError<ServiceError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        Backoff::new(&self.backoff)
            .retry_with_classifier(task_name, f, ServiceError::is_transient)
            .await
            .map(|(v, _)| v)
    }

    pub async fn target_exists(&self, db_name: &str) -> Result<bool, LifecycleError> {
        match self
            .retry("describe database", || {
                self.write_service.describe_database(db_name)
            })
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.inner(), ServiceError::ResourceNotFound(_)) => Ok(false),
            Err(e) => Err(LifecycleError::service(
                format!("describing database {db_name}"),
                e,
            )),
        }
    }

    /// Create the database and its tables with the given retention, leaving
    /// whatever already exists with the same retention untouched.
    ///
    /// A table that exists with a different retention is a configuration
    /// error; retention cannot change after a table is created.
    pub async fn ensure_target(
        &self,
        db_name: &str,
        magnetic_days: u64,
        memory_hours: u64,
    ) -> Result<(), LifecycleError> {
        let retention = RetentionProperties::try_new(magnetic_days, memory_hours)?;

        if !self.target_exists(db_name).await? {
            match self
                .retry("create database", || {
                    self.write_service.create_database(db_name)
                })
                .await
            {
                Ok(()) => info!(%db_name, "created database"),
                // created concurrently by another loader
                Err(e) if matches!(e.inner(), ServiceError::Conflict(_)) => {
                    info!(%db_name, "database already exists");
                }
                Err(e) => {
                    error!(error=%e, %db_name, "failed to create database");
                    return Err(LifecycleError::service(
                        format!("creating database {db_name}"),
                        e,
                    ));
                }
            }
        }

        for table in self.headers.tables() {
            self.ensure_table(db_name, table, retention).await?;
        }

        Ok(())
    }

    async fn ensure_table(
        &self,
        db_name: &str,
        table: &str,
        retention: RetentionProperties,
    ) -> Result<(), LifecycleError> {
        if self.check_existing_table(db_name, table, retention).await? {
            return Ok(());
        }

        match self
            .retry("create table", || {
                self.write_service.create_table(db_name, table, retention)
            })
            .await
        {
            Ok(()) => {
                info!(
                    %db_name,
                    table,
                    memory_hours = retention.memory_hours(),
                    magnetic_days = retention.magnetic_days(),
                    "created table"
                );
                Ok(())
            }
            Err(e) if matches!(e.inner(), ServiceError::Conflict(_)) => {
                // lost a race with another creator, its retention must match
                if self.check_existing_table(db_name, table, retention).await? {
                    Ok(())
                } else {
                    Err(LifecycleError::service(
                        format!("creating table {db_name}.{table}"),
                        e,
                    ))
                }
            }
            Err(e) => {
                error!(error=%e, %db_name, table, "failed to create table");
                Err(LifecycleError::service(
                    format!("creating table {db_name}.{table}"),
                    e,
                ))
            }
        }
    }

    /// Returns true when `table` exists with `retention`, false when it does
    /// not exist.
    async fn check_existing_table(
        &self,
        db_name: &str,
        table: &str,
        retention: RetentionProperties,
    ) -> Result<bool, LifecycleError> {
        match self
            .retry("describe table", || {
                self.write_service.describe_table(db_name, table)
            })
            .await
        {
            Ok(existing) if existing.retention == retention => Ok(true),
            Ok(existing) => Err(ConfigError::IncompatibleRetention {
                database: db_name.to_owned(),
                table: table.to_owned(),
                existing: existing.retention,
                requested: retention,
            }
            .into()),
            Err(e) if matches!(e.inner(), ServiceError::ResourceNotFound(_)) => Ok(false),
            Err(e) => Err(LifecycleError::service(
                format!("describing table {db_name}.{table}"),
                e,
            )),
        }
    }

    /// Delete every table of the database, then the database itself.
    ///
    /// Anything already gone is skipped.
    pub async fn remove_target(&self, db_name: &str) -> Result<(), LifecycleError> {
        let tables = match self
            .retry("list tables", || self.write_service.list_tables(db_name))
            .await
        {
            Ok(tables) => tables,
            Err(e) if matches!(e.inner(), ServiceError::ResourceNotFound(_)) => {
                warn!(%db_name, "database to remove does not exist");
                return Ok(());
            }
            Err(e) => {
                return Err(LifecycleError::service(
                    format!("listing tables of {db_name}"),
                    e,
                ));
            }
        };

        for table in &tables {
            match self
                .retry("delete table", || {
                    self.write_service.delete_table(db_name, table)
                })
                .await
            {
                Ok(()) => info!(%db_name, table, "deleted table"),
                Err(e) if matches!(e.inner(), ServiceError::ResourceNotFound(_)) => {}
                Err(e) => {
                    return Err(LifecycleError::service(
                        format!("deleting table {db_name}.{table}"),
                        e,
                    ));
                }
            }
        }

        match self
            .retry("delete database", || {
                self.write_service.delete_database(db_name)
            })
            .await
        {
            Ok(()) => {
                info!(%db_name, "deleted database");
                Ok(())
            }
            Err(e) if matches!(e.inner(), ServiceError::ResourceNotFound(_)) => Ok(()),
            Err(e) => Err(LifecycleError::service(
                format!("deleting database {db_name}"),
                e,
            )),
        }
    }
}

#[async_trait]
impl DbCreator for TimestreamDbCreator {
    async fn db_exists(&self, db_name: &str) -> Result<bool, DynError> {
        Ok(self.target_exists(db_name).await?)
    }

    async fn create_db(&self, db_name: &str) -> Result<(), DynError> {
        Ok(self
            .ensure_target(db_name, self.magnetic_days, self.memory_hours)
            .await?)
    }

    async fn remove_old_db(&self, db_name: &str) -> Result<(), DynError> {
        Ok(self.remove_target(db_name).await?)
    }
}
