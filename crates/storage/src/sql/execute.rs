//! Statement execution with error classification, one retry for transient
//! failures, and cleanup of statements abandoned by their caller.

use super::dialect::Dialect;
use super::pool::{AcquireError, BacklogPool};
use crate::error::{StorageError, StorageResult};
use crate::metrics::{QUERIES_INTERRUPTED, QUERY_DURATION, QUERY_ERRORS, QUERY_RETRIES};
use sqlx::any::{AnyArguments, AnyConnectOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, ConnectOptions, Connection, Row};
use std::sync::Arc;

/// A bind parameter. Nulls keep their type so every driver can bind them.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(Option<i32>),
    BigInt(Option<i64>),
    Double(Option<f64>),
    Text(Option<String>),
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(Some(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(Some(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Double(Some(v))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(Some(v))
    }
}

/// Leading keyword of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    pub fn of(sql: &str) -> Self {
        let keyword = sql.trim_start().split_whitespace().next().unwrap_or_default();
        match keyword.to_ascii_uppercase().as_str() {
            "SELECT" => StatementKind::Select,
            "INSERT" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            _ => StatementKind::Other,
        }
    }

    /// Whether an abandoned statement of this kind may be killed on the
    /// server. Deletes always run to completion.
    pub fn killable(self) -> bool {
        matches!(
            self,
            StatementKind::Select | StatementKind::Insert | StatementKind::Update
        )
    }
}

/// How a database error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Duplicate key. Surfaces as a write conflict.
    UniqueViolation,
    /// Transient: retried once, then treated as operational.
    Retryable,
    /// The connection or server is in trouble. The pool is disposed.
    Operational,
    Other,
}

impl ErrorClass {
    pub fn label(self) -> &'static str {
        match self {
            ErrorClass::UniqueViolation => "unique_violation",
            ErrorClass::Retryable => "retryable",
            ErrorClass::Operational => "operational",
            ErrorClass::Other => "other",
        }
    }
}

// MySQL server error numbers.
const MYSQL_LOCK_WAIT_TIMEOUT: u16 = 1205;
const MYSQL_DEADLOCK: u16 = 1213;
const MYSQL_QUERY_INTERRUPTED: u16 = 1317;

// SQLite primary result codes.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

pub fn classify(dialect: Dialect, err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => ErrorClass::Retryable,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => ErrorClass::Operational,
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return ErrorClass::UniqueViolation;
            }
            match dialect {
                Dialect::Mysql => {
                    let number = db
                        .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                        .map(|e| e.number());
                    match number {
                        Some(MYSQL_LOCK_WAIT_TIMEOUT | MYSQL_DEADLOCK) => ErrorClass::Retryable,
                        Some(MYSQL_QUERY_INTERRUPTED) => ErrorClass::Operational,
                        _ => ErrorClass::Other,
                    }
                }
                Dialect::Postgres => match db.code().as_deref() {
                    Some("40001" | "40P01" | "55P03") => ErrorClass::Retryable,
                    Some("57014" | "57P01" | "57P02" | "57P03") => ErrorClass::Operational,
                    _ => ErrorClass::Other,
                },
                Dialect::Sqlite => {
                    let primary = db
                        .code()
                        .and_then(|code| code.parse::<i32>().ok())
                        .map(|code| code & 0xff);
                    match primary {
                        Some(SQLITE_BUSY | SQLITE_LOCKED) => ErrorClass::Retryable,
                        _ => ErrorClass::Other,
                    }
                }
            }
        }
        _ => ErrorClass::Other,
    }
}

/// Errors after which the connection itself cannot be trusted.
fn breaks_connection(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed
    )
}

/// A checked-out connection running one statement.
///
/// Dropping it before [`InflightQuery::finish`] means the caller went away
/// mid-statement. The connection is then never reused, and when the server
/// id of the connection is known the statement is killed from a fresh
/// connection in the background.
pub(crate) struct InflightQuery {
    conn: Option<PoolConnection<Any>>,
    kind: StatementKind,
    dialect: Dialect,
    options: Arc<AnyConnectOptions>,
    backend_id: Option<i64>,
}

impl InflightQuery {
    fn new(
        conn: PoolConnection<Any>,
        kind: StatementKind,
        dialect: Dialect,
        options: Arc<AnyConnectOptions>,
    ) -> Self {
        Self {
            conn: Some(conn),
            kind,
            dialect,
            options,
            backend_id: None,
        }
    }

    fn connection(&mut self) -> Option<&mut AnyConnection> {
        self.conn.as_deref_mut()
    }

    /// Remember the server-side id of the connection so an abandoned
    /// statement can be killed.
    async fn load_backend_id(&mut self) {
        let Some(sql) = self.dialect.backend_id_query() else {
            return;
        };
        let Some(conn) = self.conn.as_deref_mut() else {
            return;
        };
        match sqlx::query_scalar::<Any, i64>(sql).fetch_one(conn).await {
            Ok(id) => self.backend_id = Some(id),
            Err(e) => tracing::debug!(error = %e, "Could not read connection id"),
        }
    }

    /// Statement completed: return the connection to the pool.
    fn finish(mut self) {
        self.conn.take();
    }

    /// The connection is broken: close it instead of returning it.
    fn discard(mut self) {
        if let Some(conn) = self.conn.take()
            && self.dialect != Dialect::Sqlite
        {
            drop(conn.detach());
        }
    }
}

impl Drop for InflightQuery {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        QUERIES_INTERRUPTED.inc();

        // SQLite is exempt from discarding: its pool holds a single
        // connection, and for `:memory:` databases that connection is the
        // database, so detaching it would drop every table. The driver
        // completes the pending command on its worker thread before the
        // connection is handed out again, and SQLite has no server-side
        // statement to kill.
        if self.dialect == Dialect::Sqlite {
            tracing::debug!(kind = ?self.kind, "Statement interrupted");
            return;
        }
        drop(conn.detach());

        let kill = match (self.kind.killable(), self.backend_id) {
            (true, Some(id)) => self.dialect.kill_query(id).map(|sql| (id, sql)),
            _ => None,
        };
        let Some((backend_id, sql)) = kill else {
            tracing::warn!(kind = ?self.kind, "Statement interrupted, connection discarded");
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(backend_id, "Statement interrupted outside a runtime, not killed");
            return;
        };
        tracing::warn!(kind = ?self.kind, backend_id, "Statement interrupted, killing it");
        let options = self.options.clone();
        handle.spawn(async move {
            match options.connect().await {
                Ok(mut conn) => {
                    if let Err(e) = sqlx::query::<Any>(&sql).execute(&mut conn).await {
                        tracing::warn!(backend_id, error = %e, "Failed to kill interrupted statement");
                    }
                    let _ = conn.close().await;
                }
                Err(e) => {
                    tracing::warn!(backend_id, error = %e, "Failed to connect to kill interrupted statement");
                }
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum Fetch {
    Execute,
    All,
}

enum Output {
    Affected(u64),
    Rows(Vec<AnyRow>),
}

enum AttemptError {
    Backlog,
    Sql(sqlx::Error),
}

impl From<AcquireError> for AttemptError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::BacklogExceeded => AttemptError::Backlog,
            AcquireError::Sql(e) => AttemptError::Sql(e),
        }
    }
}

fn bind_all<'q>(sql: &'q str, params: &[SqlValue]) -> Query<'q, Any, AnyArguments<'q>> {
    params.iter().fold(sqlx::query::<Any>(sql), |query, param| match param {
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::BigInt(v) => query.bind(*v),
        SqlValue::Double(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
    })
}

async fn run_statement(
    conn: &mut AnyConnection,
    sql: &str,
    params: &[SqlValue],
    fetch: Fetch,
) -> Result<Output, sqlx::Error> {
    let query = bind_all(sql, params);
    match fetch {
        Fetch::Execute => Ok(Output::Affected(query.execute(conn).await?.rows_affected())),
        Fetch::All => Ok(Output::Rows(query.fetch_all(conn).await?)),
    }
}

/// Runs statements against a [`BacklogPool`].
///
/// Statements are written with `?` placeholders.
pub struct SqlExecutor {
    pool: BacklogPool,
    kill_interrupted: bool,
}

impl SqlExecutor {
    pub fn new(pool: BacklogPool, kill_interrupted: bool) -> Self {
        Self {
            pool,
            kill_interrupted,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.pool.dialect()
    }

    pub fn pool(&self) -> &BacklogPool {
        &self.pool
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> StorageResult<u64> {
        match self.run(sql, params, Fetch::Execute).await? {
            Output::Affected(n) => Ok(n),
            Output::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    pub async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> StorageResult<Vec<AnyRow>> {
        match self.run(sql, params, Fetch::All).await? {
            Output::Rows(rows) => Ok(rows),
            Output::Affected(_) => Ok(Vec::new()),
        }
    }

    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> StorageResult<Option<AnyRow>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    async fn run(&self, sql: &str, params: &[SqlValue], fetch: Fetch) -> StorageResult<Output> {
        let dialect = self.dialect();
        let sql = dialect.bind_sql(sql);
        let kind = StatementKind::of(&sql);
        let _timer = QUERY_DURATION.start_timer();

        let mut retried = false;
        loop {
            let err = match self.attempt(&sql, params, fetch, kind).await {
                Ok(output) => return Ok(output),
                Err(AttemptError::Backlog) => return Err(StorageError::PoolBacklogExceeded),
                Err(AttemptError::Sql(err)) => err,
            };

            let class = classify(dialect, &err);
            QUERY_ERRORS.with_label_values(&[class.label()]).inc();
            match class {
                ErrorClass::UniqueViolation => {
                    return Err(StorageError::Conflict(err.to_string()));
                }
                ErrorClass::Retryable if !retried => {
                    retried = true;
                    QUERY_RETRIES.inc();
                    tracing::debug!(error = %err, "Retrying statement after transient error");
                    continue;
                }
                ErrorClass::Retryable | ErrorClass::Operational => {
                    tracing::error!(
                        error = %err,
                        class = class.label(),
                        dialect = dialect.name(),
                        "Database error, disposing connection pool"
                    );
                    self.pool.dispose();
                }
                ErrorClass::Other => {
                    tracing::error!(error = %err, sql = %sql, "Database error");
                }
            }
            return Err(StorageError::Backend(format!(
                "database {} error",
                class.label()
            )));
        }
    }

    async fn attempt(
        &self,
        sql: &str,
        params: &[SqlValue],
        fetch: Fetch,
        kind: StatementKind,
    ) -> Result<Output, AttemptError> {
        let conn = self.pool.acquire().await?;
        let mut inflight =
            InflightQuery::new(conn, kind, self.dialect(), self.pool.connect_options());
        if self.kill_interrupted && kind.killable() {
            inflight.load_backend_id().await;
        }

        let Some(conn) = inflight.connection() else {
            return Err(AttemptError::Sql(sqlx::Error::PoolClosed));
        };
        let result = run_statement(conn, sql, params, fetch).await;
        match result {
            Ok(output) => {
                inflight.finish();
                Ok(output)
            }
            Err(e) => {
                if breaks_connection(&e) {
                    inflight.discard();
                } else {
                    inflight.finish();
                }
                Err(AttemptError::Sql(e))
            }
        }
    }
}

// =============================================================================
// Row decoding
// =============================================================================

fn decode_error(column: usize, err: sqlx::Error) -> StorageError {
    tracing::error!(column, error = %err, "Failed to decode database row");
    StorageError::Backend("failed to decode database row".to_string())
}

/// Integer column of any width.
pub(crate) fn get_int(row: &AnyRow, column: usize) -> StorageResult<Option<i64>> {
    row.try_get::<Option<i64>, _>(column)
        .map_err(|e| decode_error(column, e))
}

pub(crate) fn get_text(row: &AnyRow, column: usize) -> StorageResult<Option<String>> {
    row.try_get::<Option<String>, _>(column)
        .map_err(|e| decode_error(column, e))
}
