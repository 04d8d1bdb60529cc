//! Adaptateur PostgreSQL du moteur de sessions
//!
//! Le moteur travaille sur des threads dédiés et appelle la base de façon
//! synchrone: chaque requête est exécutée avec `Handle::block_on` sur le
//! runtime tokio de l'outil. Les sessions doivent donc être pilotées hors du
//! contexte async (`tokio::task::spawn_blocking`).

use citydb_ops::{Connection, DatabaseAdapter, DbError, Row, SqlParam, SqlValue, Statement};
use deadpool_postgres::{Object, Pool};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, warn};

/// Taille de lot par défaut
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
/// Limite des listes `= ANY(...)`
pub const MAX_IN_OPERATOR_SIZE: usize = 10_000;

/// Adaptateur sur un pool deadpool-postgres
#[derive(Clone)]
pub struct PostgresAdapter {
    pool: Pool,
    handle: Handle,
    schema: String,
    srid: u32,
    max_batch_size: usize,
}

impl PostgresAdapter {
    pub fn new(pool: Pool, handle: Handle, schema: impl Into<String>, srid: u32) -> Self {
        Self {
            pool,
            handle,
            schema: schema.into(),
            srid,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl DatabaseAdapter for PostgresAdapter {
    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let client = self
            .handle
            .block_on(self.pool.get())
            .map_err(|e| DbError::new(format!("failed to get connection from pool: {}", e)))?;
        Ok(Box::new(PgConnection {
            client: Some(client),
            handle: self.handle.clone(),
            in_transaction: Mutex::new(false),
        }))
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    fn srid(&self) -> u32 {
        self.srid
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn max_in_operator_size(&self) -> usize {
        MAX_IN_OPERATOR_SIZE
    }
}

/// Connexion en commit manuel
///
/// `BEGIN` est envoyé avec la première requête. Les requêtes concurrentes
/// des workers partagent le même client (pipeline tokio-postgres).
pub struct PgConnection {
    client: Option<Object>,
    handle: Handle,
    in_transaction: Mutex<bool>,
}

fn db_error(e: tokio_postgres::Error) -> DbError {
    match e.as_db_error() {
        Some(db) => DbError::with_sqlstate(db.message(), db.code().code()),
        None => DbError::new(e.to_string()),
    }
}

fn bind(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|param| -> &(dyn ToSql + Sync) {
            match param {
                SqlParam::BigInt(v) => v,
                SqlParam::Text(v) => v,
                SqlParam::BigIntArray(v) => v,
                SqlParam::DoubleArray(v) => v,
                SqlParam::TextArray(v) => v,
                SqlParam::JsonArray(v) => v,
            }
        })
        .collect()
}

fn convert_row(row: &tokio_postgres::Row) -> Result<Row, DbError> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let value: Result<SqlValue, tokio_postgres::Error> = match *column.type_() {
                Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(SqlValue::from),
                Type::INT4 => row
                    .try_get::<_, Option<i32>>(idx)
                    .map(|v| v.map(i64::from).into()),
                Type::INT2 => row
                    .try_get::<_, Option<i16>>(idx)
                    .map(|v| v.map(i64::from).into()),
                Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(SqlValue::from),
                Type::FLOAT4 => row
                    .try_get::<_, Option<f32>>(idx)
                    .map(|v| v.map(f64::from).into()),
                Type::JSON | Type::JSONB => row
                    .try_get::<_, Option<serde_json::Value>>(idx)
                    .map(|v| v.map(SqlValue::Json).unwrap_or(SqlValue::Null)),
                _ => row.try_get::<_, Option<String>>(idx).map(SqlValue::from),
            };
            value.map_err(db_error)
        })
        .collect()
}

impl PgConnection {
    fn client(&self) -> Result<&Object, DbError> {
        self.client
            .as_ref()
            .ok_or_else(|| DbError::new("connection is closed"))
    }

    fn begin(&self) -> Result<(), DbError> {
        let mut open = self.in_transaction.lock();
        if !*open {
            self.handle
                .block_on(self.client()?.batch_execute("BEGIN"))
                .map_err(db_error)?;
            *open = true;
        }
        Ok(())
    }

    fn finish(&self, sql: &str) -> Result<(), DbError> {
        let mut open = self.in_transaction.lock();
        if !*open {
            return Ok(());
        }
        *open = false;
        debug!(sql, "Closing transaction");
        self.handle
            .block_on(self.client()?.batch_execute(sql))
            .map_err(db_error)
    }
}

impl Connection for PgConnection {
    fn execute(&self, statement: &Statement, params: &[SqlParam]) -> Result<u64, DbError> {
        self.begin()?;
        let client = self.client()?;
        self.handle.block_on(async {
            let prepared = client.prepare_cached(&statement.sql).await.map_err(db_error)?;
            let bound = bind(params);
            client.execute(&prepared, &bound).await.map_err(db_error)
        })
    }

    fn query(&self, statement: &Statement, params: &[SqlParam]) -> Result<Vec<Row>, DbError> {
        self.begin()?;
        let client = self.client()?;
        let rows = self.handle.block_on(async {
            let prepared = client.prepare_cached(&statement.sql).await.map_err(db_error)?;
            let bound = bind(params);
            client.query(&prepared, &bound).await.map_err(db_error)
        })?;
        rows.iter().map(convert_row).collect()
    }

    fn commit(&self) -> Result<(), DbError> {
        self.finish("COMMIT")
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.finish("ROLLBACK")
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        let open = *self.in_transaction.get_mut();
        let Some(client) = self.client.take() else {
            return;
        };
        if open {
            // Rollback avant retour au pool, sans bloquer le thread courant
            warn!("Connection dropped with an open transaction, rolling back");
            self.handle.spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    warn!(error = %e, "Rollback on drop failed");
                }
            });
        }
    }
}
