use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
};
use sqlx::{Column, Connection, Postgres, Row as _, Sqlite, TypeInfo, ValueRef};
use tracing::{debug, instrument, warn};

use super::backend::Backend;
use super::error::StorageError;
use super::schema::Table;
use super::sql;
use super::value::{FetchMode, Outcome, Row, SqlValue, Statement};
use crate::config::{ExternalConnection, StorageConfig};

/// Executes a batch of statements against one backend. Every batch runs on a
/// freshly opened connection inside a single transaction.
#[rocket::async_trait]
pub trait QueryHandler: Send + Sync {
    fn backend(&self) -> Backend;

    async fn run_batch(&self, statements: &[Statement]) -> Result<Vec<Outcome>, StorageError>;
}

pub fn handler_for(
    backend: Backend,
    config: &StorageConfig,
) -> Result<Box<dyn QueryHandler>, StorageError> {
    match backend {
        Backend::ExternalRelational => {
            let connection = config.external_connection().ok_or_else(|| {
                StorageError::Unavailable("no external database configured".to_string())
            })?;
            Ok(Box::new(PostgresHandler::new(&connection)?))
        }
        Backend::Embedded => Ok(Box::new(SqliteHandler::new(
            config.embedded_path(),
            Backend::Embedded,
        ))),
        Backend::EmbeddedWithSync => Ok(Box::new(SqliteHandler::new(
            config.sync_path(),
            Backend::EmbeddedWithSync,
        ))),
    }
}

fn check_arity(sql: &str, params: &[SqlValue]) -> Result<(), StorageError> {
    let expected = sql::count_placeholders(sql);
    if expected != params.len() {
        return Err(StorageError::QueryFailed(format!(
            "statement expects {} parameters but {} were supplied",
            expected,
            params.len()
        )));
    }
    Ok(())
}

pub struct SqliteHandler {
    path: PathBuf,
    backend: Backend,
}

impl SqliteHandler {
    pub fn new(path: impl AsRef<Path>, backend: Backend) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            backend,
        }
    }

    async fn connect(&self) -> Result<SqliteConnection, StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        }

        // The blob sync ships the single database file, so no WAL sidecar.
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        SqliteConnection::connect_with(&options)
            .await
            .map_err(StorageError::connect)
    }
}

#[rocket::async_trait]
impl QueryHandler for SqliteHandler {
    fn backend(&self) -> Backend {
        self.backend
    }

    #[instrument(skip(self, statements), fields(backend = %self.backend, count = statements.len()))]
    async fn run_batch(&self, statements: &[Statement]) -> Result<Vec<Outcome>, StorageError> {
        let mut conn = self.connect().await?;
        let result = sqlite_transaction(&mut conn, statements).await;

        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close embedded connection");
        }

        result
    }
}

async fn sqlite_transaction(
    conn: &mut SqliteConnection,
    statements: &[Statement],
) -> Result<Vec<Outcome>, StorageError> {
    // A deferred transaction that reads before it writes cannot wait for the
    // write lock, so any batch that writes takes it up front.
    let begin = if statements.iter().any(Statement::changes_data) {
        "BEGIN IMMEDIATE"
    } else {
        "BEGIN"
    };
    sqlx::query(begin)
        .execute(&mut *conn)
        .await
        .map_err(StorageError::execution)?;

    let mut outcomes = Vec::with_capacity(statements.len());
    for statement in statements {
        match sqlite_statement(conn, statement).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!(error = %e, "Rollback failed");
                }
                return Err(err);
            }
        }
    }

    sqlx::query("COMMIT")
        .execute(&mut *conn)
        .await
        .map_err(StorageError::execution)?;
    Ok(outcomes)
}

fn bind_sqlite<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
    }
}

async fn sqlite_statement(
    conn: &mut SqliteConnection,
    statement: &Statement,
) -> Result<Outcome, StorageError> {
    match statement {
        Statement::Query { sql, params, fetch } => {
            check_arity(sql, params)?;
            let query = params
                .iter()
                .fold(sqlx::query(sql.as_str()), |query, value| bind_sqlite(query, value));

            let rows = match fetch.resolve(sql) {
                FetchMode::None | FetchMode::Auto => {
                    query.execute(&mut *conn).await.map_err(StorageError::execution)?;
                    Vec::new()
                }
                FetchMode::One => query
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(StorageError::execution)?
                    .into_iter()
                    .collect(),
                FetchMode::All => query
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(StorageError::execution)?,
            };

            rows.iter()
                .map(decode_sqlite_row)
                .collect::<Result<Vec<_>, _>>()
                .map(Outcome::Rows)
        }
        Statement::Insert { table, columns } => sqlite_insert(conn, *table, columns).await,
    }
}

/// The embedded store has no identity generation we rely on, so the next id
/// is read inside the same transaction as the insert.
async fn sqlite_insert(
    conn: &mut SqliteConnection,
    table: Table,
    columns: &[(&'static str, SqlValue)],
) -> Result<Outcome, StorageError> {
    let next_id: i64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(MAX(id), 0) + 1 FROM {}",
        table.name()
    ))
    .fetch_one(&mut *conn)
    .await
    .map_err(StorageError::execution)?;

    let names: Vec<&str> = std::iter::once("id")
        .chain(columns.iter().map(|(name, _)| *name))
        .collect();
    let placeholders = vec!["?"; names.len()].join(", ");
    let statement = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        names.join(", "),
        placeholders
    );

    let query = columns
        .iter()
        .fold(sqlx::query(&statement).bind(next_id), |query, (_, value)| {
            bind_sqlite(query, value)
        });
    query.execute(&mut *conn).await.map_err(StorageError::execution)?;

    debug!(table = table.name(), id = next_id, "Inserted row");
    Ok(Outcome::Inserted(next_id))
}

fn decode_sqlite_row(row: &SqliteRow) -> Result<Row, StorageError> {
    let decode_err = |e: sqlx::Error| StorageError::Decode(e.to_string());
    let mut out = Row::new();

    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index).map_err(decode_err)?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => {
                    Value::from(row.try_get_unchecked::<i64, _>(index).map_err(decode_err)?)
                }
                "REAL" | "NUMERIC" => {
                    Value::from(row.try_get_unchecked::<f64, _>(index).map_err(decode_err)?)
                }
                "BLOB" => {
                    let bytes = row
                        .try_get_unchecked::<Vec<u8>, _>(index)
                        .map_err(decode_err)?;
                    Value::from(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::from(
                    row.try_get_unchecked::<String, _>(index)
                        .map_err(decode_err)?,
                ),
            }
        };

        out.insert(column.name(), value);
    }

    Ok(out)
}

pub struct PostgresHandler {
    options: PgConnectOptions,
}

impl PostgresHandler {
    pub fn new(connection: &ExternalConnection) -> Result<Self, StorageError> {
        let options = match connection {
            ExternalConnection::Url(url) => {
                let options = PgConnectOptions::from_str(url)
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                if url.contains("sslmode=") {
                    options
                } else if url.contains("supabase.co") || url.contains("neon.tech") {
                    options.ssl_mode(PgSslMode::Require)
                } else {
                    options.ssl_mode(PgSslMode::Prefer)
                }
            }
            ExternalConnection::Parts {
                host,
                port,
                name,
                user,
                password,
            } => PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(name)
                .username(user)
                .password(password)
                .ssl_mode(PgSslMode::Prefer),
        };

        Ok(Self { options })
    }
}

#[rocket::async_trait]
impl QueryHandler for PostgresHandler {
    fn backend(&self) -> Backend {
        Backend::ExternalRelational
    }

    #[instrument(skip(self, statements), fields(backend = "external-relational", count = statements.len()))]
    async fn run_batch(&self, statements: &[Statement]) -> Result<Vec<Outcome>, StorageError> {
        let mut conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(StorageError::connect)?;
        let result = postgres_transaction(&mut conn, statements).await;

        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close external connection");
        }

        result
    }
}

async fn postgres_transaction(
    conn: &mut PgConnection,
    statements: &[Statement],
) -> Result<Vec<Outcome>, StorageError> {
    let mut tx = conn.begin().await.map_err(StorageError::execution)?;
    let mut outcomes = Vec::with_capacity(statements.len());

    for statement in statements {
        match postgres_statement(&mut tx, statement).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Rollback failed");
                }
                return Err(err);
            }
        }
    }

    tx.commit().await.map_err(StorageError::execution)?;
    Ok(outcomes)
}

fn bind_postgres<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
    }
}

async fn postgres_statement(
    conn: &mut PgConnection,
    statement: &Statement,
) -> Result<Outcome, StorageError> {
    match statement {
        Statement::Query { sql, params, fetch } => {
            check_arity(sql, params)?;
            let (text, bound) = sql::inline_nulls(sql, params);
            let query = bound
                .into_iter()
                .fold(sqlx::query(&text), |query, value| bind_postgres(query, value));

            let rows = match fetch.resolve(sql) {
                FetchMode::None | FetchMode::Auto => {
                    query.execute(&mut *conn).await.map_err(StorageError::execution)?;
                    Vec::new()
                }
                FetchMode::One => query
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(StorageError::execution)?
                    .into_iter()
                    .collect(),
                FetchMode::All => query
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(StorageError::execution)?,
            };

            rows.iter()
                .map(decode_postgres_row)
                .collect::<Result<Vec<_>, _>>()
                .map(Outcome::Rows)
        }
        Statement::Insert { table, columns } => {
            let values: Vec<SqlValue> = columns.iter().map(|(_, value)| value.clone()).collect();
            let statement = if columns.is_empty() {
                format!("INSERT INTO {} DEFAULT VALUES RETURNING id", table.name())
            } else {
                let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
                    table.name(),
                    names.join(", "),
                    vec!["?"; names.len()].join(", ")
                )
            };

            let (text, bound) = sql::inline_nulls(&statement, &values);
            let query = bound
                .into_iter()
                .fold(sqlx::query(&text), |query, value| bind_postgres(query, value));
            let row = query
                .fetch_one(&mut *conn)
                .await
                .map_err(StorageError::execution)?;
            let id: i64 = row
                .try_get("id")
                .map_err(|e| StorageError::Decode(e.to_string()))?;

            debug!(table = table.name(), id, "Inserted row");
            Ok(Outcome::Inserted(id))
        }
    }
}

fn decode_postgres_row(row: &PgRow) -> Result<Row, StorageError> {
    let decode_err = |e: sqlx::Error| StorageError::Decode(e.to_string());
    let mut out = Row::new();

    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "INT2" => row
                .try_get::<Option<i16>, _>(index)
                .map_err(decode_err)?
                .map(|v| Value::from(i64::from(v))),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)
                .map_err(decode_err)?
                .map(|v| Value::from(i64::from(v))),
            "INT8" => row
                .try_get::<Option<i64>, _>(index)
                .map_err(decode_err)?
                .map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)
                .map_err(decode_err)?
                .map(|v| Value::from(f64::from(v))),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(index)
                .map_err(decode_err)?
                .map(Value::from),
            "BOOL" => row
                .try_get::<Option<bool>, _>(index)
                .map_err(decode_err)?
                .map(Value::from),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(index)
                .map_err(decode_err)?
                .map(|v| Value::from(v.format("%Y-%m-%d %H:%M:%S").to_string())),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(index)
                .map_err(decode_err)?
                .map(|v| Value::from(v.format("%Y-%m-%d %H:%M:%S").to_string())),
            _ => {
                let raw = row.try_get_raw(index).map_err(decode_err)?;
                if raw.is_null() {
                    None
                } else {
                    Some(Value::from(
                        row.try_get_unchecked::<String, _>(index)
                            .map_err(decode_err)?,
                    ))
                }
            }
        };

        out.insert(column.name(), value.unwrap_or(Value::Null));
    }

    Ok(out)
}
