//! PostgreSQL client over `sqlx`.
//!
//! One single-connection pool per database, created on first use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row, TypeInfo};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use rolesync_core::{
    CollaboratorError, CollaboratorResult, PgClient, SqlRow, SqlValue, SyncResult,
};

use crate::config::PgSettings;

/// SQLSTATE class 28: invalid authorization specification.
const AUTH_SQLSTATE_PREFIX: &str = "28";

pub struct PostgresClient {
    settings: PgSettings,
    options: PgConnectOptions,

    /// Pools keyed by database name, `""` for the default database.
    pools: Arc<RwLock<HashMap<String, PgPool>>>,
}

impl PostgresClient {
    pub fn new(settings: PgSettings) -> SyncResult<Self> {
        let options = settings.connect_options()?;
        Ok(Self {
            settings,
            options,
            pools: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Close every pool.
    pub async fn close(&self) {
        let mut pools = self.pools.write().await;
        for (database, pool) in pools.drain() {
            debug!(database = %database, "Closing connection pool");
            pool.close().await;
        }
    }

    async fn get_pool(&self, database: Option<&str>) -> CollaboratorResult<PgPool> {
        let key = database.unwrap_or_default();
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(key) {
                return Ok(pool.clone());
            }
        }

        let pool = self.create_pool(database).await?;
        {
            let mut pools = self.pools.write().await;
            pools.insert(key.to_string(), pool.clone());
        }
        Ok(pool)
    }

    async fn create_pool(&self, database: Option<&str>) -> CollaboratorResult<PgPool> {
        let options = match database {
            Some(name) => self.options.clone().database(name),
            None => self.options.clone(),
        };
        let target = format!(
            "{}:{}/{}",
            options.get_host(),
            options.get_port(),
            options.get_database().unwrap_or_default()
        );
        debug!(target = %target, "Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.settings.timeout)
            .connect_with(options)
            .await
            .map_err(|e| map_connect_error(e, &target, self.settings.timeout.as_secs()))?;

        info!(target = %target, "PostgreSQL connection established");
        Ok(pool)
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.to_string()),
        _ => None,
    }
}

fn map_connect_error(err: sqlx::Error, target: &str, timeout_secs: u64) -> CollaboratorError {
    if sqlstate(&err).is_some_and(|code| code.starts_with(AUTH_SQLSTATE_PREFIX)) {
        return CollaboratorError::AuthenticationFailed {
            message: format!("{target}: {err}"),
        };
    }
    match err {
        sqlx::Error::PoolTimedOut => CollaboratorError::Timeout {
            operation: format!("connect to {target}"),
            timeout_secs,
        },
        other => CollaboratorError::connection_failed_with_source(
            format!("Failed to connect to {target}"),
            other,
        ),
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

fn map_query_error(err: sqlx::Error) -> CollaboratorError {
    if is_connection_error(&err) {
        CollaboratorError::connection_failed_with_source("connection lost during query", err)
    } else {
        CollaboratorError::query_failed_with_source(err.to_string(), err)
    }
}

fn map_exec_error(err: sqlx::Error, statement: &str) -> CollaboratorError {
    CollaboratorError::exec_failed_with_source(format!("{statement}: {err}"), err)
}

/// Decode one row into scalar values according to each column's type.
fn decode_row(row: &PgRow) -> CollaboratorResult<SqlRow> {
    let decode_err = |e: sqlx::Error| CollaboratorError::invalid_response(e.to_string());
    let mut values = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)
                .map_err(decode_err)?
                .map_or(SqlValue::Null, SqlValue::Bool),
            "INT2" => row
                .try_get::<Option<i16>, _>(i)
                .map_err(decode_err)?
                .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
            "INT4" => row
                .try_get::<Option<i32>, _>(i)
                .map_err(decode_err)?
                .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
            "INT8" => row
                .try_get::<Option<i64>, _>(i)
                .map_err(decode_err)?
                .map_or(SqlValue::Null, SqlValue::Int),
            "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" | "UNKNOWN" => row
                .try_get::<Option<String>, _>(i)
                .map_err(decode_err)?
                .map_or(SqlValue::Null, SqlValue::Text),
            other => {
                return Err(CollaboratorError::invalid_response(format!(
                    "unsupported type {other} for column {}",
                    column.name()
                )))
            }
        };
        values.push(value);
    }
    Ok(values)
}

#[async_trait]
impl PgClient for PostgresClient {
    #[instrument(skip(self, sql, args))]
    async fn query(
        &self,
        database: Option<&str>,
        sql: &str,
        args: &[String],
    ) -> CollaboratorResult<Vec<SqlRow>> {
        let pool = self.get_pool(database).await?;
        let mut query = sqlx::query(sql);
        for arg in args {
            query = query.bind(arg);
        }
        let rows = query.fetch_all(&pool).await.map_err(map_query_error)?;
        debug!(rows = rows.len(), "Query completed");
        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self, statements), fields(count = statements.len()))]
    async fn execute(&self, database: Option<&str>, statements: &[String]) -> CollaboratorResult<()> {
        let pool = self.get_pool(database).await?;
        let mut tx = pool.begin().await.map_err(map_query_error)?;
        for statement in statements {
            debug!(sql = %statement, "Executing statement");
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_exec_error(e, statement))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_exec_error(e, "COMMIT"))?;
        Ok(())
    }
}

impl std::fmt::Debug for PostgresClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresClient")
            .field("settings", &self.settings)
            .finish()
    }
}
