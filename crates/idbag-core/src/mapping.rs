//! Explicit entity and collection mappings.
//!
//! Mappings describe table names, column names, the id generation strategy
//! and the null-element policy of every id-bag attribute. They are plain
//! configuration structs, built in code or loaded from JSON, and validated
//! once at startup.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

const IDENTIFIER: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(regex) = PATTERN.get() {
        return Ok(regex);
    }
    let regex = Regex::new(IDENTIFIER)
        .map_err(|e| Error::config(format!("invalid identifier pattern: {e}")))?;
    Ok(PATTERN.get_or_init(|| regex))
}

fn check_identifier(what: &str, value: &str) -> Result<()> {
    if identifier_pattern()?.is_match(value) {
        Ok(())
    } else {
        Err(Error::config(format!("invalid {what} identifier: {value:?}")))
    }
}

/// How synthetic identifiers (entity ids and row ids) are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IdStrategy {
    /// Seed from the current storage maximum on first use, then count up.
    #[default]
    Increment,
    /// Count up from a fixed start without consulting storage.
    Counter {
        /// First identifier handed out.
        start: i64,
    },
}

/// What to do with a null element that has no backing row yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullInsert {
    /// Write no row. The entry stays in memory only.
    #[default]
    Skip,
    /// Write a row with a NULL element.
    Store,
}

/// What to do when a persisted element is replaced by null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullUpdate {
    /// Delete the backing row. The entry stays in memory without a row until
    /// it is given a non-null element again.
    #[default]
    DeleteRow,
    /// Update the row's element to NULL.
    Store,
}

/// Null-element handling for one collection.
///
/// The defaults (`Skip` / `DeleteRow`) never leave a NULL element in storage.
/// `Store` / `Store` treats null as an ordinary value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NullElementPolicy {
    pub on_insert: NullInsert,
    pub on_update: NullUpdate,
}

impl NullElementPolicy {
    /// Store nulls as ordinary element values.
    #[must_use]
    pub const fn store_nulls() -> Self {
        Self {
            on_insert: NullInsert::Store,
            on_update: NullUpdate::Store,
        }
    }
}

/// Mapping of one id-bag attribute onto its collection table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMapping {
    /// Attribute name on the owning entity.
    pub name: String,
    /// Collection table name.
    pub table: String,
    /// Column holding the owner id.
    pub owner_column: String,
    /// Column holding the synthetic row id.
    #[serde(default = "default_row_id_column")]
    pub row_id_column: String,
    /// Column holding the (nullable) element.
    pub element_column: String,
    #[serde(default)]
    pub id_strategy: IdStrategy,
    #[serde(default)]
    pub null_policy: NullElementPolicy,
}

fn default_row_id_column() -> String {
    "collection_id".to_string()
}

impl CollectionMapping {
    /// Create a mapping with the conventional column layout:
    /// `<owner>_id`, `collection_id` and an element column named after the attribute.
    pub fn new(owner_table: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: format!("{owner_table}_{name}"),
            owner_column: format!("{owner_table}_id"),
            row_id_column: default_row_id_column(),
            element_column: name.clone(),
            name,
            id_strategy: IdStrategy::default(),
            null_policy: NullElementPolicy::default(),
        }
    }

    /// Set the collection table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the owner (join) column name.
    pub fn owner_column(mut self, column: impl Into<String>) -> Self {
        self.owner_column = column.into();
        self
    }

    /// Set the row id column name.
    pub fn row_id_column(mut self, column: impl Into<String>) -> Self {
        self.row_id_column = column.into();
        self
    }

    /// Set the element column name.
    pub fn element_column(mut self, column: impl Into<String>) -> Self {
        self.element_column = column.into();
        self
    }

    /// Set the row id generation strategy.
    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Set the null-element policy.
    pub fn null_policy(mut self, policy: NullElementPolicy) -> Self {
        self.null_policy = policy;
        self
    }

    /// Check names and column layout.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("collection attribute name is empty"));
        }
        check_identifier("table", &self.table)?;
        check_identifier("owner column", &self.owner_column)?;
        check_identifier("row id column", &self.row_id_column)?;
        check_identifier("element column", &self.element_column)?;

        let mut columns = HashSet::new();
        for column in [&self.owner_column, &self.row_id_column, &self.element_column] {
            if !columns.insert(column.to_ascii_lowercase()) {
                return Err(Error::config(format!(
                    "collection '{}' maps column '{}' twice",
                    self.name, column
                )));
            }
        }

        if let IdStrategy::Counter { start } = self.id_strategy {
            tracing::warn!(
                table = %self.table,
                start,
                "Counter row ids ignore stored rows and may collide with them"
            );
        }
        Ok(())
    }
}

/// Mapping of an entity table and its id-bag attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default)]
    pub id_strategy: IdStrategy,
    #[serde(default)]
    pub collections: Vec<CollectionMapping>,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl EntityMapping {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id_column: default_id_column(),
            id_strategy: IdStrategy::default(),
            collections: Vec::new(),
        }
    }

    /// Set the id column name.
    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    /// Set the entity id generation strategy.
    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Add an id-bag attribute.
    pub fn collection(mut self, mapping: CollectionMapping) -> Self {
        self.collections.push(mapping);
        self
    }

    /// Look up an attribute mapping by name.
    pub fn find_collection(&self, name: &str) -> Option<&CollectionMapping> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        check_identifier("table", &self.table)?;
        check_identifier("id column", &self.id_column)?;

        let mut names = HashSet::new();
        let mut tables = HashSet::new();
        for collection in &self.collections {
            collection.validate()?;
            if !names.insert(collection.name.as_str()) {
                return Err(Error::config(format!(
                    "entity '{}' maps collection '{}' twice",
                    self.table, collection.name
                )));
            }
            if !tables.insert(collection.table.to_ascii_lowercase()) {
                return Err(Error::config(format!(
                    "entity '{}' uses table '{}' for more than one collection",
                    self.table, collection.table
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_layout() {
        let mapping = CollectionMapping::new("AnEntity", "aCollection");
        assert_eq!(mapping.table, "AnEntity_aCollection");
        assert_eq!(mapping.owner_column, "AnEntity_id");
        assert_eq!(mapping.row_id_column, "collection_id");
        assert_eq!(mapping.element_column, "aCollection");
        assert_eq!(mapping.id_strategy, IdStrategy::Increment);
        assert_eq!(mapping.null_policy.on_insert, NullInsert::Skip);
        assert_eq!(mapping.null_policy.on_update, NullUpdate::DeleteRow);
        assert!(mapping.validate().is_ok());
    }

    #[test]
    fn rejects_bad_identifiers() {
        let mapping = CollectionMapping::new("AnEntity", "aCollection").table("drop table;");
        let err = mapping.validate().unwrap_err();
        assert!(err.to_string().contains("invalid table identifier"));
    }

    #[test]
    fn rejects_column_reuse() {
        let mapping = CollectionMapping::new("AnEntity", "aCollection").element_column("collection_id");
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_collection_names() {
        let entity = EntityMapping::new("AnEntity")
            .collection(CollectionMapping::new("AnEntity", "tags"))
            .collection(CollectionMapping::new("AnEntity", "tags").table("AnEntity_tags2"));
        let err = entity.validate().unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{
            "table": "AnEntity",
            "collections": [{
                "name": "aCollection",
                "table": "AnEntity_aCollection",
                "owner_column": "AnEntity_id",
                "element_column": "aCollection",
                "null_policy": { "on_insert": "store" }
            }]
        }"#;
        let entity: EntityMapping = serde_json::from_str(json).unwrap();
        assert_eq!(entity.id_column, "id");
        let collection = entity.find_collection("aCollection").unwrap();
        assert_eq!(collection.row_id_column, "collection_id");
        assert_eq!(collection.null_policy.on_insert, NullInsert::Store);
        assert_eq!(collection.null_policy.on_update, NullUpdate::DeleteRow);
        assert!(entity.validate().is_ok());
    }

    #[test]
    fn counter_strategy_round_trips_through_json() {
        let json = r#"{ "kind": "counter", "start": 100 }"#;
        let strategy: IdStrategy = serde_json::from_str(json).unwrap();
        assert_eq!(strategy, IdStrategy::Counter { start: 100 });
    }
}
