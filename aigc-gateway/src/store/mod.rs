//! Entity store: typed persistence for services, providers and models.
//!
//! Entities describe themselves (table, primary key, columns, lookup index)
//! and travel to and from the backend as JSON objects keyed by column name.
//! `get` on an index that matches nothing is a recoverable miss; callers
//! check [`StoreError::is_not_found`] and usually create the record instead.

mod entity;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Errors raised by an entity store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("data record is not exist")]
    RecordNotExist,

    #[error("entity is invalid")]
    EntityInvalid,

    #[error("entity index is invalid")]
    IndexInvalid,

    #[error("data record is exist")]
    RecordExist,

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Corrupt record in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
}

impl StoreError {
    /// Whether this is the "nothing matched" outcome of a lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::RecordNotExist | StoreError::EntityInvalid)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A persisted record type.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn table_name() -> &'static str;

    fn primary_key() -> &'static str;

    /// Every persisted column, in declaration order.
    fn columns() -> &'static [&'static str];

    /// Non-empty lookup fields, used by get, delete, list and count.
    fn index(&self) -> Vec<(&'static str, Value)>;

    fn set_create_time(&mut self, at: DateTime<Utc>);

    fn set_update_time(&mut self, at: DateTime<Utc>);

    /// Receives the key generated by the backend for auto-increment tables.
    fn assign_row_id(&mut self, _id: i64) {}
}

/// Sort direction for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOption {
    pub key: String,
    pub order: SortOrder,
}

/// `key LIKE %query%`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzyQuery {
    pub key: String,
    pub query: String,
}

/// `key IN (values)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InQuery {
    pub key: String,
    pub values: Vec<String>,
}

/// Filters applied on top of the query entity's index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOptions {
    pub queries: Vec<FuzzyQuery>,
    pub in_values: Vec<InQuery>,
    /// Columns that must be NULL or empty.
    pub is_not_exist: Vec<String>,
}

impl FilterOptions {
    pub fn fuzzy(mut self, key: &str, query: &str) -> Self {
        self.queries.push(FuzzyQuery {
            key: key.to_string(),
            query: query.to_string(),
        });
        self
    }

    pub fn any_of(mut self, key: &str, values: &[&str]) -> Self {
        self.in_values.push(InQuery {
            key: key.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn missing(mut self, key: &str) -> Self {
        self.is_not_exist.push(key.to_string());
        self
    }
}

/// Options for [`EntityStore::list`]. A page of 0 or a page size of 0 lists everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub filter: FilterOptions,
    /// 1-based page index.
    pub page: usize,
    pub page_size: usize,
    pub sort_by: Vec<SortOption>,
}

impl ListOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: FilterOptions) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn paged(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn sorted(mut self, key: &str, order: SortOrder) -> Self {
        self.sort_by.push(SortOption {
            key: key.to_string(),
            order,
        });
        self
    }
}

/// Persistence contract consumed by every component.
///
/// Each call is its own unit of work; no transaction spans calls.
pub trait EntityStore: Send + Sync + 'static {
    /// Creates the schema and seeds fixed rows.
    fn init(&self) -> StoreResult<()>;

    /// Inserts `entity`, stamping both timestamps. Fails with `RecordExist` on a key conflict.
    fn add<E: Entity>(&self, entity: &mut E) -> StoreResult<()>;

    /// Inserts `entity` unless a row with the same unique key exists.
    ///
    /// Returns whether a row was written. The check and the insert are one statement.
    fn add_if_absent<E: Entity>(&self, entity: &mut E) -> StoreResult<bool>;

    fn batch_add<E: Entity>(&self, entities: &mut [E]) -> StoreResult<()>;

    /// Upsert by primary key; inserts when the primary key is unset.
    fn put<E: Entity>(&self, entity: &mut E) -> StoreResult<()>;

    /// Deletes every row matching the entity's index.
    fn delete<E: Entity>(&self, entity: &E) -> StoreResult<()>;

    /// Populates `entity` from the first row matching its index.
    fn get<E: Entity>(&self, entity: &mut E) -> StoreResult<()>;

    fn list<E: Entity>(&self, query: &E, options: &ListOptions) -> StoreResult<Vec<E>>;

    fn count<E: Entity>(&self, query: &E, options: &FilterOptions) -> StoreResult<u64>;

    fn is_exist<E: Entity>(&self, entity: &E) -> StoreResult<bool>;

    /// Flushes pending writes.
    fn commit(&self) -> StoreResult<()>;
}

/// Serializes an entity into its column map.
pub(crate) fn to_record<E: Entity>(entity: &E) -> StoreResult<Map<String, Value>> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(StoreError::EntityInvalid),
        Err(e) => Err(StoreError::Corrupt {
            table: E::table_name(),
            message: e.to_string(),
        }),
    }
}

pub(crate) fn from_record<E: Entity>(record: Map<String, Value>) -> StoreResult<E> {
    serde_json::from_value(Value::Object(record)).map_err(|e| StoreError::Corrupt {
        table: E::table_name(),
        message: e.to_string(),
    })
}

/// Whether a primary-key value means "not assigned yet".
pub(crate) fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_i64() == Some(0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_covers_both_miss_kinds() {
        assert!(StoreError::RecordNotExist.is_not_found());
        assert!(StoreError::EntityInvalid.is_not_found());
        assert!(!StoreError::RecordExist.is_not_found());
        assert!(!StoreError::Database("locked".into()).is_not_found());
    }

    #[test]
    fn test_unset_primary_values() {
        assert!(is_unset(&Value::Null));
        assert!(is_unset(&Value::from(0)));
        assert!(is_unset(&Value::from("")));
        assert!(!is_unset(&Value::from(7)));
        assert!(!is_unset(&Value::from("chat")));
    }

    #[test]
    fn test_filter_builder_accumulates() {
        let filter = FilterOptions::default()
            .fuzzy("model_name", "qwen")
            .any_of("status", &["downloaded", "downloading"])
            .missing("auth_key");
        assert_eq!(filter.queries.len(), 1);
        assert_eq!(filter.in_values[0].values, vec!["downloaded", "downloading"]);
        assert_eq!(filter.is_not_exist, vec!["auth_key"]);
    }
}
