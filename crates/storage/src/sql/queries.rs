//! SQL text for the users, collections and item tables.
//!
//! Fixed statements are rendered once per item table when the engine
//! starts. Statements whose shape depends on filters or projections are
//! built by [`ItemTable`] from the same table name, so every item query for
//! a user goes through the shard picked by [`ItemTables::for_user`].

use super::dialect::Dialect;
use super::execute::SqlValue;
use super::schema::item_table_name;
use weave_core::{CollectionId, ItemFilters, ItemQuery, UserId, WboField};

// =============================================================================
// Users
// =============================================================================

pub const USER_EXISTS: &str = "SELECT id FROM users WHERE id = ?";
pub const INSERT_USER: &str = "INSERT INTO users (id, username, email, status) VALUES (?, ?, ?, ?)";
pub const DELETE_USER: &str = "DELETE FROM users WHERE id = ?";

// =============================================================================
// Collections
// =============================================================================

pub const COLLECTION_ID: &str = "SELECT collectionid FROM collections WHERE userid = ? AND name = ?";
pub const COLLECTION_NAMES: &str =
    "SELECT collectionid, name FROM collections WHERE userid = ? ORDER BY collectionid";
pub const INSERT_COLLECTION: &str =
    "INSERT INTO collections (userid, collectionid, name) VALUES (?, ?, ?)";
/// Allocate the next id at or above a floor in one statement. Bound as
/// `(userid, floor, name, userid, floor)`. Concurrent allocations for the
/// same user collide on the primary key and surface as conflicts.
pub const ALLOCATE_COLLECTION: &str = "INSERT INTO collections (userid, collectionid, name) \
     SELECT ?, COALESCE(MAX(collectionid) + 1, ?), ? FROM collections \
     WHERE userid = ? AND collectionid >= ?";
pub const DELETE_COLLECTION: &str = "DELETE FROM collections WHERE userid = ? AND name = ?";
pub const DELETE_USER_COLLECTIONS: &str = "DELETE FROM collections WHERE userid = ?";

const ITEM_KEY: &str = "username, collection, id";
const INSERT_COLUMNS: [&str; 10] = [
    "username",
    "collection",
    "id",
    "parentid",
    "predecessorid",
    "sortindex",
    "modified",
    "payload",
    "payload_size",
    "ttl",
];
/// Columns an upsert leaves alone when the incoming value is NULL.
const UPSERT_KEEP: [&str; 6] = [
    "parentid",
    "predecessorid",
    "sortindex",
    "modified",
    "payload",
    "payload_size",
];

/// A statement together with its bind parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Columns to select for a projection. `id` always comes first.
pub fn projection(fields: Option<&[WboField]>) -> Vec<WboField> {
    let requested = fields.unwrap_or(WboField::ALL);
    let mut columns = vec![WboField::Id];
    columns.extend(
        WboField::ALL
            .iter()
            .copied()
            .filter(|f| *f != WboField::Id && requested.contains(f)),
    );
    columns
}

fn column_list(columns: &[WboField]) -> String {
    columns
        .iter()
        .map(|f| f.column())
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Append `AND ...` conditions for `filters`. With `now_secs`, expired items
/// are excluded unless the filters ask for them.
fn push_filters(
    sql: &mut String,
    params: &mut Vec<SqlValue>,
    filters: &ItemFilters,
    now_secs: Option<i64>,
) {
    if let Some(older) = filters.older {
        sql.push_str(" AND modified < ?");
        params.push(older.as_centis().into());
    }
    if let Some(newer) = filters.newer {
        sql.push_str(" AND modified > ?");
        params.push(newer.as_centis().into());
    }
    if let Some(above) = filters.index_above {
        sql.push_str(" AND sortindex > ?");
        params.push(above.into());
    }
    if let Some(below) = filters.index_below {
        sql.push_str(" AND sortindex < ?");
        params.push(below.into());
    }
    if let Some(ids) = &filters.ids {
        push_id_list(sql, params, ids);
    }
    if let Some(parentid) = &filters.parentid {
        sql.push_str(" AND parentid = ?");
        params.push(parentid.as_str().into());
    }
    if let Some(predecessorid) = &filters.predecessorid {
        sql.push_str(" AND predecessorid = ?");
        params.push(predecessorid.as_str().into());
    }
    if let Some(now) = now_secs
        && !filters.include_expired
    {
        sql.push_str(" AND ttl > ?");
        params.push(now.into());
    }
}

fn push_id_list(sql: &mut String, params: &mut Vec<SqlValue>, ids: &[String]) {
    if ids.is_empty() {
        sql.push_str(" AND 1 = 0");
        return;
    }
    sql.push_str(&format!(" AND id IN ({})", placeholders(ids.len())));
    params.extend(ids.iter().map(|id| SqlValue::from(id.as_str())));
}

fn push_order_and_page(sql: &mut String, query: &ItemQuery) {
    if let Some(sort) = query.sort {
        sql.push_str(" ORDER BY ");
        sql.push_str(sort.order_by());
    }
    if let Some(limit) = query.effective_limit() {
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = query.effective_offset() {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }
}

/// One row of a multi-row item upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub id: String,
    pub parentid: Option<String>,
    pub predecessorid: Option<String>,
    pub sortindex: Option<i32>,
    pub modified: Option<i64>,
    pub payload: Option<String>,
    pub payload_size: Option<i64>,
    pub ttl: i64,
}

impl ItemRow {
    pub(crate) fn bind(&self, user_id: UserId, collection: CollectionId, params: &mut Vec<SqlValue>) {
        params.extend([
            SqlValue::from(user_id),
            SqlValue::from(collection),
            SqlValue::from(self.id.as_str()),
            SqlValue::Text(self.parentid.clone()),
            SqlValue::Text(self.predecessorid.clone()),
            SqlValue::Int(self.sortindex),
            SqlValue::BigInt(self.modified),
            SqlValue::Text(self.payload.clone()),
            SqlValue::BigInt(self.payload_size),
            SqlValue::from(self.ttl),
        ]);
    }
}

/// Statements for one item table (one shard).
#[derive(Debug, Clone)]
pub struct ItemTable {
    name: String,
    dialect: Dialect,
    pub item_exists: String,
    pub collection_has_items: String,
    pub insert_item: String,
    pub delete_item: String,
    pub delete_collection_items: String,
    pub delete_user_items: String,
    pub collection_stamps: String,
    pub collection_counts: String,
    pub collection_sizes: String,
    pub collection_max_stamp: String,
    pub user_size: String,
}

impl ItemTable {
    pub fn new(dialect: Dialect, shards: u32, shard: u32) -> Self {
        let t = item_table_name(shards, shard);
        let cast = dialect.bigint_cast();
        Self {
            item_exists: format!(
                "SELECT modified FROM {t} WHERE username = ? AND collection = ? AND id = ?"
            ),
            collection_has_items: format!(
                "SELECT id FROM {t} WHERE username = ? AND collection = ? LIMIT 1"
            ),
            insert_item: format!(
                "INSERT INTO {t} ({}) VALUES ({})",
                INSERT_COLUMNS.join(", "),
                placeholders(INSERT_COLUMNS.len())
            ),
            delete_item: format!(
                "DELETE FROM {t} WHERE username = ? AND collection = ? AND id = ?"
            ),
            delete_collection_items: format!(
                "DELETE FROM {t} WHERE username = ? AND collection = ?"
            ),
            delete_user_items: format!("DELETE FROM {t} WHERE username = ?"),
            collection_stamps: format!(
                "SELECT collection, MAX(modified) FROM {t} \
                 WHERE username = ? AND ttl > ? GROUP BY collection"
            ),
            collection_counts: format!(
                "SELECT collection, COUNT(*) FROM {t} \
                 WHERE username = ? AND ttl > ? GROUP BY collection"
            ),
            collection_sizes: format!(
                "SELECT collection, CAST(SUM(payload_size) AS {cast}) FROM {t} \
                 WHERE username = ? AND ttl > ? GROUP BY collection"
            ),
            collection_max_stamp: format!(
                "SELECT MAX(modified) FROM {t} \
                 WHERE username = ? AND collection = ? AND ttl > ?"
            ),
            user_size: format!(
                "SELECT CAST(SUM(payload_size) AS {cast}) FROM {t} \
                 WHERE username = ? AND ttl > ?"
            ),
            name: t,
            dialect,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Projected read of items matching `query`.
    pub fn select_items(
        &self,
        user_id: UserId,
        collection: CollectionId,
        columns: &[WboField],
        query: &ItemQuery,
        now_secs: i64,
    ) -> Statement {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE username = ? AND collection = ?",
            column_list(columns),
            self.name
        );
        let mut params = vec![SqlValue::from(user_id), SqlValue::from(collection)];
        push_filters(&mut sql, &mut params, &query.filters, Some(now_secs));
        push_order_and_page(&mut sql, query);
        Statement { sql, params }
    }

    pub fn select_item(
        &self,
        user_id: UserId,
        collection: CollectionId,
        item_id: &str,
        columns: &[WboField],
        now_secs: i64,
    ) -> Statement {
        Statement {
            sql: format!(
                "SELECT {} FROM {} WHERE username = ? AND collection = ? AND id = ? AND ttl > ?",
                column_list(columns),
                self.name
            ),
            params: vec![
                user_id.into(),
                collection.into(),
                item_id.into(),
                now_secs.into(),
            ],
        }
    }

    /// Update only the given columns of one item.
    pub fn update_item(
        &self,
        user_id: UserId,
        collection: CollectionId,
        item_id: &str,
        values: Vec<(&'static str, SqlValue)>,
    ) -> Statement {
        let sets: Vec<String> = values.iter().map(|(c, _)| format!("{c} = ?")).collect();
        let mut params: Vec<SqlValue> = values.into_iter().map(|(_, v)| v).collect();
        params.extend([user_id.into(), collection.into(), item_id.into()]);
        Statement {
            sql: format!(
                "UPDATE {} SET {} WHERE username = ? AND collection = ? AND id = ?",
                self.name,
                sets.join(", ")
            ),
            params,
        }
    }

    /// One multi-row upsert. Rows must have distinct ids.
    pub fn upsert_items(
        &self,
        user_id: UserId,
        collection: CollectionId,
        rows: &[ItemRow],
    ) -> Statement {
        let row = format!("({})", placeholders(INSERT_COLUMNS.len()));
        let mut params = Vec::with_capacity(rows.len() * INSERT_COLUMNS.len());
        for item in rows {
            item.bind(user_id, collection, &mut params);
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}{}",
            self.name,
            INSERT_COLUMNS.join(", "),
            vec![row.as_str(); rows.len()].join(", "),
            self.dialect
                .upsert_clause(&self.name, ITEM_KEY, &UPSERT_KEEP, &["ttl"])
        );
        Statement { sql, params }
    }

    /// Delete items of a collection matching `query`, optionally restricted
    /// to `item_ids`. Expired items match too.
    ///
    /// With a limit, MySQL deletes natively in sort order but cannot skip
    /// an offset; the other dialects select the victims in a subquery.
    pub fn delete_items(
        &self,
        user_id: UserId,
        collection: CollectionId,
        item_ids: Option<&[String]>,
        query: &ItemQuery,
    ) -> Statement {
        let mut conditions = String::new();
        let mut filter_params = Vec::new();
        if let Some(ids) = item_ids {
            push_id_list(&mut conditions, &mut filter_params, ids);
        }
        push_filters(&mut conditions, &mut filter_params, &query.filters, None);

        let mut params = vec![SqlValue::from(user_id), SqlValue::from(collection)];
        let base = format!(
            "DELETE FROM {} WHERE username = ? AND collection = ?",
            self.name
        );

        if query.effective_limit().is_none() {
            params.extend(filter_params);
            return Statement {
                sql: base + &conditions,
                params,
            };
        }

        if self.dialect.native_delete_limit() {
            if query.effective_offset().is_some() {
                tracing::debug!(table = %self.name, "Offset ignored for limited delete");
            }
            let mut sql = base + &conditions;
            let native = ItemQuery {
                offset: None,
                ..query.clone()
            };
            push_order_and_page(&mut sql, &native);
            params.extend(filter_params);
            return Statement { sql, params };
        }

        let mut subquery = format!(
            "SELECT id FROM {} WHERE username = ? AND collection = ?{conditions}",
            self.name
        );
        push_order_and_page(&mut subquery, query);
        params.extend([SqlValue::from(user_id), SqlValue::from(collection)]);
        params.extend(filter_params);
        Statement {
            sql: format!("{base} AND id IN ({subquery})"),
            params,
        }
    }
}

/// Item tables for every shard.
#[derive(Debug, Clone)]
pub struct ItemTables {
    tables: Vec<ItemTable>,
}

impl ItemTables {
    pub fn new(dialect: Dialect, shards: u32) -> Self {
        let shards = shards.max(1);
        Self {
            tables: (0..shards)
                .map(|shard| ItemTable::new(dialect, shards, shard))
                .collect(),
        }
    }

    /// The table holding `user_id`'s items.
    pub fn for_user(&self, user_id: UserId) -> &ItemTable {
        let shard = user_id.rem_euclid(self.tables.len() as i64) as usize;
        &self.tables[shard]
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
