use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use aigc_common::{Service, ServiceKind};
use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::{Map, Value};

use super::{
    from_record, is_unset, to_record, Entity, EntityStore, FilterOptions, ListOptions, SortOrder,
    StoreError, StoreResult,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS service (
    name TEXT PRIMARY KEY,
    hybrid_policy TEXT NOT NULL DEFAULT 'default',
    remote_provider TEXT NOT NULL DEFAULT '',
    local_provider TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS service_provider (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider_name TEXT NOT NULL,
    service_name TEXT NOT NULL DEFAULT '',
    service_source TEXT NOT NULL DEFAULT 'local',
    "desc" TEXT NOT NULL DEFAULT '',
    method TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT '',
    auth_type TEXT NOT NULL DEFAULT 'none',
    auth_key TEXT NOT NULL DEFAULT '',
    flavor TEXT NOT NULL DEFAULT '',
    extra_headers TEXT NOT NULL DEFAULT '{}',
    extra_json_body TEXT NOT NULL DEFAULT '{}',
    properties TEXT NOT NULL DEFAULT '{}',
    status INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS model (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_name TEXT NOT NULL,
    provider_name TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_service_provider_name ON service_provider(provider_name);
CREATE INDEX IF NOT EXISTS idx_service_provider_service ON service_provider(service_name, service_source);
CREATE UNIQUE INDEX IF NOT EXISTS idx_model_provider_model ON model(provider_name, model_name);
CREATE INDEX IF NOT EXISTS idx_model_name ON model(model_name);
"#;

/// SQLite-backed entity store.
///
/// One connection behind a mutex; the lock is held for a single statement
/// sequence and never across an await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
            StoreError::RecordExist
        }
        _ => StoreError::Database(e.to_string()),
    }
}

impl SqliteStore {
    /// Opens (or creates) the database at `database_url`.
    ///
    /// Accepts an optional `sqlite:` prefix; `:memory:` opens a private in-memory database.
    pub fn open(database_url: &str) -> StoreResult<Self> {
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(db_err)?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
            Connection::open(path).map_err(db_err)?
        };

        tracing::info!("Entity store opened with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::open(":memory:")
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

// ============================================================================
// SQL building
// ============================================================================

fn quote(column: &str) -> String {
    format!("\"{}\"", column)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
    }
}

/// Resolves a caller-supplied key against the entity's columns.
fn column<E: Entity>(key: &str) -> StoreResult<&'static str> {
    E::columns()
        .iter()
        .copied()
        .find(|c| *c == key)
        .ok_or(StoreError::IndexInvalid)
}

fn primary_value<E: Entity>(record: &Map<String, Value>) -> Option<Value> {
    record
        .get(E::primary_key())
        .filter(|v| !is_unset(v))
        .cloned()
}

/// Equality conditions used to address existing rows: the index, or the primary key when the index is empty.
fn lookup<E: Entity>(entity: &E) -> StoreResult<Vec<(&'static str, Value)>> {
    let index = entity.index();
    if !index.is_empty() {
        return Ok(index);
    }
    let record = to_record(entity)?;
    match primary_value::<E>(&record) {
        Some(pk) => Ok(vec![(E::primary_key(), pk)]),
        None => Ok(Vec::new()),
    }
}

fn where_clause<E: Entity>(
    conditions: &[(&'static str, Value)],
    filter: &FilterOptions,
) -> StoreResult<(String, Vec<SqlValue>)> {
    let mut parts = Vec::new();
    let mut params = Vec::new();

    for (col, value) in conditions {
        parts.push(format!("{} = ?", quote(col)));
        params.push(to_sql(value));
    }
    for q in &filter.queries {
        parts.push(format!("{} LIKE ?", quote(column::<E>(&q.key)?)));
        params.push(SqlValue::Text(format!("%{}%", q.query)));
    }
    for q in &filter.in_values {
        let col = column::<E>(&q.key)?;
        if q.values.is_empty() {
            parts.push("1 = 0".to_string());
            continue;
        }
        let placeholders = vec!["?"; q.values.len()].join(", ");
        parts.push(format!("{} IN ({})", quote(col), placeholders));
        params.extend(q.values.iter().cloned().map(SqlValue::Text));
    }
    for key in &filter.is_not_exist {
        let col = quote(column::<E>(key)?);
        parts.push(format!("({} IS NULL OR {} = '')", col, col));
    }

    if parts.is_empty() {
        Ok((String::new(), params))
    } else {
        Ok((format!(" WHERE {}", parts.join(" AND ")), params))
    }
}

fn select_columns<E: Entity>() -> String {
    E::columns()
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_row<E: Entity>(row: &rusqlite::Row<'_>) -> rusqlite::Result<Map<String, Value>> {
    let mut record = Map::new();
    for (i, col) in E::columns().iter().enumerate() {
        record.insert(col.to_string(), from_sql(row.get_ref(i)?));
    }
    Ok(record)
}

/// INSERT statement for `record`, leaving an unset primary key to the database.
fn insert_statement<E: Entity>(verb: &str, record: &Map<String, Value>) -> (String, Vec<SqlValue>) {
    let pk = E::primary_key();
    let mut cols = Vec::new();
    let mut params = Vec::new();
    for col in E::columns() {
        let value = record.get(*col).unwrap_or(&Value::Null);
        if *col == pk && is_unset(value) {
            continue;
        }
        cols.push(quote(col));
        params.push(to_sql(value));
    }
    let sql = format!(
        "{} INTO {} ({}) VALUES ({})",
        verb,
        E::table_name(),
        cols.join(", "),
        vec!["?"; params.len()].join(", ")
    );
    (sql, params)
}

fn insert<E: Entity>(conn: &Connection, verb: &str, entity: &mut E) -> StoreResult<usize> {
    let record = to_record(entity)?;
    let generated = primary_value::<E>(&record).is_none();
    let (sql, params) = insert_statement::<E>(verb, &record);
    let changed = conn
        .execute(&sql, params_from_iter(params.iter()))
        .map_err(db_err)?;
    if changed > 0 && generated {
        entity.assign_row_id(conn.last_insert_rowid());
    }
    Ok(changed)
}

fn stamp_new<E: Entity>(entity: &mut E) {
    let now = Utc::now();
    entity.set_create_time(now);
    entity.set_update_time(now);
}

// ============================================================================
// EntityStore implementation
// ============================================================================

impl EntityStore for SqliteStore {
    fn init(&self) -> StoreResult<()> {
        {
            let conn = self.lock()?;
            conn.execute_batch(SCHEMA).map_err(db_err)?;
        }

        for kind in ServiceKind::ALL {
            let mut service = Service::seed(*kind);
            if self.add_if_absent(&mut service)? {
                tracing::debug!(service = %kind, "Seeded service");
            }
        }
        Ok(())
    }

    fn add<E: Entity>(&self, entity: &mut E) -> StoreResult<()> {
        stamp_new(entity);
        let conn = self.lock()?;
        insert(&conn, "INSERT", entity)?;
        Ok(())
    }

    fn add_if_absent<E: Entity>(&self, entity: &mut E) -> StoreResult<bool> {
        stamp_new(entity);
        let conn = self.lock()?;
        Ok(insert(&conn, "INSERT OR IGNORE", entity)? > 0)
    }

    fn batch_add<E: Entity>(&self, entities: &mut [E]) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        for entity in entities.iter_mut() {
            stamp_new(entity);
            insert(&tx, "INSERT", entity)?;
        }
        tx.commit().map_err(db_err)
    }

    fn put<E: Entity>(&self, entity: &mut E) -> StoreResult<()> {
        let now = Utc::now();
        entity.set_update_time(now);

        let record = to_record(entity)?;
        if primary_value::<E>(&record).is_none() {
            entity.set_create_time(now);
            let conn = self.lock()?;
            insert(&conn, "INSERT", entity)?;
            return Ok(());
        }

        let (insert_sql, params) = insert_statement::<E>("INSERT", &record);
        let pk = E::primary_key();
        let updates = E::columns()
            .iter()
            .filter(|c| **c != pk && **c != "created_at")
            .map(|c| format!("{} = excluded.{}", quote(c), quote(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("{} ON CONFLICT({}) DO UPDATE SET {}", insert_sql, quote(pk), updates);

        let conn = self.lock()?;
        conn.execute(&sql, params_from_iter(params.iter()))
            .map_err(db_err)?;
        Ok(())
    }

    fn delete<E: Entity>(&self, entity: &E) -> StoreResult<()> {
        let conditions = lookup(entity)?;
        if conditions.is_empty() {
            return Err(StoreError::IndexInvalid);
        }
        let (clause, params) = where_clause::<E>(&conditions, &FilterOptions::default())?;
        let sql = format!("DELETE FROM {}{}", E::table_name(), clause);

        let conn = self.lock()?;
        let removed = conn
            .execute(&sql, params_from_iter(params.iter()))
            .map_err(db_err)?;
        tracing::debug!(table = E::table_name(), removed, "Deleted rows");
        Ok(())
    }

    fn get<E: Entity>(&self, entity: &mut E) -> StoreResult<()> {
        let conditions = lookup(entity)?;
        if conditions.is_empty() {
            return Err(StoreError::EntityInvalid);
        }
        let (clause, params) = where_clause::<E>(&conditions, &FilterOptions::default())?;
        let sql = format!(
            "SELECT {} FROM {}{} LIMIT 1",
            select_columns::<E>(),
            E::table_name(),
            clause
        );

        let record = {
            let conn = self.lock()?;
            conn.query_row(&sql, params_from_iter(params.iter()), read_row::<E>)
                .optional()
                .map_err(db_err)?
        };

        match record {
            Some(record) => {
                *entity = from_record(record)?;
                Ok(())
            }
            None => {
                tracing::debug!(table = E::table_name(), "Record not found");
                Err(StoreError::RecordNotExist)
            }
        }
    }

    fn list<E: Entity>(&self, query: &E, options: &ListOptions) -> StoreResult<Vec<E>> {
        let (clause, mut params) = where_clause::<E>(&query.index(), &options.filter)?;
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            select_columns::<E>(),
            E::table_name(),
            clause
        );

        if !options.sort_by.is_empty() {
            let mut order = Vec::new();
            for sort in &options.sort_by {
                let direction = match sort.order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                order.push(format!("{} {}", quote(column::<E>(&sort.key)?), direction));
            }
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }

        if options.page > 0 && options.page_size > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(SqlValue::Integer(options.page_size as i64));
            params.push(SqlValue::Integer(((options.page - 1) * options.page_size) as i64));
        }

        let records = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), read_row::<E>)
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        records.into_iter().map(from_record).collect()
    }

    fn count<E: Entity>(&self, query: &E, options: &FilterOptions) -> StoreResult<u64> {
        let (clause, params) = where_clause::<E>(&query.index(), options)?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", E::table_name(), clause);

        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
            .map_err(db_err)?;
        Ok(count.max(0) as u64)
    }

    fn is_exist<E: Entity>(&self, entity: &E) -> StoreResult<bool> {
        let conditions = lookup(entity)?;
        if conditions.is_empty() {
            return Err(StoreError::EntityInvalid);
        }
        let (clause, params) = where_clause::<E>(&conditions, &FilterOptions::default())?;
        let sql = format!("SELECT 1 FROM {}{} LIMIT 1", E::table_name(), clause);

        let conn = self.lock()?;
        let found = conn
            .query_row(&sql, params_from_iter(params.iter()), |_| Ok(()))
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    fn commit(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.cache_flush().map_err(db_err)
    }
}
