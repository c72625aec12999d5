//! SQL dialect differences between SQLite, PostgreSQL and MySQL.

use crate::error::{StorageError, StorageResult};

/// The database flavour behind a connection URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
}

impl Dialect {
    pub fn from_url(url: &str) -> StorageResult<Self> {
        match url.split(':').next().unwrap_or_default() {
            "sqlite" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::Mysql),
            other => Err(StorageError::Config(format!(
                "unsupported database url scheme '{other}'"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
        }
    }

    /// Rewrite `?` placeholders into the dialect's bind syntax.
    ///
    /// Queries are written with `?`. PostgreSQL wants `$1..$n`; question
    /// marks inside quoted literals are left alone.
    pub fn bind_sql(self, sql: &str) -> String {
        if self != Dialect::Postgres {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 16);
        let mut n = 0;
        let mut quote: Option<char> = None;
        for c in sql.chars() {
            match (quote, c) {
                (Some(q), c) if c == q => {
                    quote = None;
                    out.push(c);
                }
                (Some(_), c) => out.push(c),
                (None, '\'' | '"') => {
                    quote = Some(c);
                    out.push(c);
                }
                (None, '?') => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                (None, c) => out.push(c),
            }
        }
        out
    }

    /// Target type for `CAST(SUM(..) AS ..)` so sums decode as 64-bit integers.
    pub fn bigint_cast(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER",
            Dialect::Postgres => "BIGINT",
            Dialect::Mysql => "SIGNED",
        }
    }

    pub fn payload_type(self) -> &'static str {
        match self {
            Dialect::Mysql => "MEDIUMTEXT",
            Dialect::Sqlite | Dialect::Postgres => "TEXT",
        }
    }

    /// Whether secondary indexes are declared inside `CREATE TABLE`.
    pub fn inline_indexes(self) -> bool {
        self == Dialect::Mysql
    }

    pub fn table_suffix(self) -> &'static str {
        match self {
            Dialect::Mysql => " ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            Dialect::Sqlite | Dialect::Postgres => "",
        }
    }

    /// `DELETE ... ORDER BY ... LIMIT` is accepted natively.
    pub fn native_delete_limit(self) -> bool {
        self == Dialect::Mysql
    }

    /// The value an upsert tried to insert into `column`.
    pub fn excluded(self, column: &str) -> String {
        match self {
            Dialect::Sqlite | Dialect::Postgres => format!("excluded.{column}"),
            Dialect::Mysql => format!("VALUES({column})"),
        }
    }

    /// Upsert clause. Columns in `keep` retain their stored value when
    /// bound as NULL; columns in `overwrite` always take the new value.
    pub fn upsert_clause(
        self,
        table: &str,
        conflict: &str,
        keep: &[&str],
        overwrite: &[&str],
    ) -> String {
        let mut sets: Vec<String> = keep
            .iter()
            .map(|c| match self {
                Dialect::Sqlite | Dialect::Postgres => {
                    format!("{c} = COALESCE({}, {table}.{c})", self.excluded(c))
                }
                Dialect::Mysql => format!("{c} = COALESCE({}, {c})", self.excluded(c)),
            })
            .collect();
        sets.extend(overwrite.iter().map(|c| format!("{c} = {}", self.excluded(c))));
        match self {
            Dialect::Sqlite | Dialect::Postgres => {
                format!(" ON CONFLICT ({conflict}) DO UPDATE SET {}", sets.join(", "))
            }
            Dialect::Mysql => format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", ")),
        }
    }

    /// Query returning the server-side id of the current connection.
    pub fn backend_id_query(self) -> Option<&'static str> {
        match self {
            Dialect::Sqlite => None,
            Dialect::Postgres => Some("SELECT CAST(pg_backend_pid() AS BIGINT)"),
            Dialect::Mysql => Some("SELECT CAST(CONNECTION_ID() AS SIGNED)"),
        }
    }

    /// Statement cancelling whatever runs on connection `backend_id`.
    pub fn kill_query(self, backend_id: i64) -> Option<String> {
        match self {
            Dialect::Sqlite => None,
            Dialect::Postgres => Some(format!("SELECT pg_cancel_backend({backend_id})")),
            Dialect::Mysql => Some(format!("KILL QUERY {backend_id}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_dialect_from_url() {
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert_eq!(Dialect::from_url("postgres://u@h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("postgresql://u@h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("mysql://u@h/db").unwrap(), Dialect::Mysql);
        assert!(matches!(
            Dialect::from_url("oracle://x"),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn numbers_placeholders_for_postgres_only() {
        let sql = "SELECT a FROM t WHERE b = ? AND c = '?' AND d IN (?, ?)";
        assert_eq!(
            Dialect::Postgres.bind_sql(sql),
            "SELECT a FROM t WHERE b = $1 AND c = '?' AND d IN ($2, $3)"
        );
        assert_eq!(Dialect::Mysql.bind_sql(sql), sql);
        assert_eq!(Dialect::Sqlite.bind_sql(sql), sql);
    }

    #[test]
    fn upsert_clauses() {
        let pg = Dialect::Postgres.upsert_clause("wbo", "username, collection, id", &["payload"], &["ttl"]);
        assert_eq!(
            pg,
            " ON CONFLICT (username, collection, id) DO UPDATE SET payload = COALESCE(excluded.payload, wbo.payload), ttl = excluded.ttl"
        );
        let my = Dialect::Mysql.upsert_clause("wbo", "", &["payload"], &["ttl"]);
        assert_eq!(
            my,
            " ON DUPLICATE KEY UPDATE payload = COALESCE(VALUES(payload), payload), ttl = VALUES(ttl)"
        );
    }

    #[test]
    fn kill_statements() {
        assert_eq!(Dialect::Mysql.kill_query(7).as_deref(), Some("KILL QUERY 7"));
        assert_eq!(
            Dialect::Postgres.kill_query(7).as_deref(),
            Some("SELECT pg_cancel_backend(7)")
        );
        assert!(Dialect::Sqlite.kill_query(7).is_none());
        assert!(Dialect::Sqlite.backend_id_query().is_none());
    }
}
