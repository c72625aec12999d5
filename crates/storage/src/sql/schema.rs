//! Table definitions.
//!
//! Statements are generated per dialect and executed one at a time, since
//! PostgreSQL does not accept several statements in one prepared query.

use super::dialect::Dialect;
use weave_core::MAX_TTL;

/// Name of item table `shard` out of `shards`.
pub fn item_table_name(shards: u32, shard: u32) -> String {
    if shards <= 1 {
        "wbo".to_string()
    } else {
        format!("wbo{shard}")
    }
}

fn users_table(dialect: Dialect) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS users (
            id BIGINT NOT NULL PRIMARY KEY,
            username VARCHAR(255),
            email VARCHAR(255),
            status INTEGER NOT NULL DEFAULT 1
        ){}",
        dialect.table_suffix()
    )
}

fn collections_table(dialect: Dialect) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS collections (
            userid BIGINT NOT NULL,
            collectionid INTEGER NOT NULL,
            name VARCHAR(32) NOT NULL,
            PRIMARY KEY (userid, collectionid),
            UNIQUE (userid, name)
        ){}",
        dialect.table_suffix()
    )
}

fn item_table(dialect: Dialect, table: &str) -> Vec<String> {
    let inline_index = if dialect.inline_indexes() {
        format!(",\n            INDEX {table}_modified_idx (username, collection, modified)")
    } else {
        String::new()
    };
    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            username BIGINT NOT NULL,
            collection INTEGER NOT NULL,
            id VARCHAR(64) NOT NULL,
            parentid VARCHAR(64),
            predecessorid VARCHAR(64),
            sortindex INTEGER,
            modified BIGINT,
            payload {payload},
            payload_size INTEGER DEFAULT 0,
            ttl BIGINT NOT NULL DEFAULT {MAX_TTL},
            PRIMARY KEY (username, collection, id){inline_index}
        ){suffix}",
        payload = dialect.payload_type(),
        suffix = dialect.table_suffix(),
    )];
    if !dialect.inline_indexes() {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {table}_modified_idx ON {table} (username, collection, modified)"
        ));
    }
    statements
}

/// Every statement needed to create the schema, in order.
pub fn create_statements(dialect: Dialect, shards: u32) -> Vec<String> {
    let mut statements = vec![users_table(dialect), collections_table(dialect)];
    for shard in 0..shards.max(1) {
        statements.extend(item_table(dialect, &item_table_name(shards, shard)));
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_table_per_shard() {
        let statements = create_statements(Dialect::Sqlite, 3);
        let tables: Vec<_> = statements
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE IF NOT EXISTS wbo"))
            .collect();
        assert_eq!(tables.len(), 3);
        assert!(statements.iter().any(|s| s.contains("wbo2_modified_idx ON wbo2")));
    }

    #[test]
    fn unsharded_uses_plain_name() {
        assert_eq!(item_table_name(1, 0), "wbo");
        assert_eq!(item_table_name(4, 3), "wbo3");
        let statements = create_statements(Dialect::Postgres, 1);
        assert_eq!(statements.len(), 4);
    }

    #[test]
    fn mysql_declares_indexes_inline() {
        let statements = create_statements(Dialect::Mysql, 1);
        assert_eq!(statements.len(), 3);
        assert!(statements[2].contains("INDEX wbo_modified_idx"));
        assert!(statements[2].contains("MEDIUMTEXT"));
        assert!(statements[2].ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"));
    }
}
