//! Validated mapping registry.
//!
//! The registry is built once at startup from explicit [`EntityMapping`]s
//! (in code or from a JSON document) and shared by every session. It owns
//! the identifier generators, so all sessions drawing from one registry
//! never hand out the same row id twice.

use crate::persister::CollectionPersister;
use crate::row_id::{RowIdGenerator, generator_for};
use idbag_core::{CollectionMapping, EntityMapping, Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Runtime view of one mapped entity.
#[derive(Debug, Clone)]
pub struct EntityPersister {
    mapping: Arc<EntityMapping>,
    id_generator: Arc<dyn RowIdGenerator>,
    collections: Vec<CollectionPersister>,
}

impl EntityPersister {
    pub fn mapping(&self) -> &EntityMapping {
        &self.mapping
    }

    pub fn table(&self) -> &str {
        &self.mapping.table
    }

    /// Generator for entity ids.
    pub fn id_generator(&self) -> &Arc<dyn RowIdGenerator> {
        &self.id_generator
    }

    /// Persisters for every mapped collection, in mapping order.
    pub fn collections(&self) -> &[CollectionPersister] {
        &self.collections
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionPersister> {
        self.collections.iter().find(|p| p.mapping().name == name)
    }
}

/// All entity mappings known to a session factory.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    entities: HashMap<String, EntityPersister>,
}

impl MappingRegistry {
    pub fn builder() -> MappingRegistryBuilder {
        MappingRegistryBuilder::default()
    }

    /// Build from mappings with generators derived from each strategy.
    pub fn from_mappings(mappings: impl IntoIterator<Item = EntityMapping>) -> Result<Self> {
        mappings
            .into_iter()
            .fold(Self::builder(), MappingRegistryBuilder::entity)
            .build()
    }

    /// Parse a JSON array of entity mappings.
    pub fn from_json(json: &str) -> Result<Self> {
        let mappings: Vec<EntityMapping> = serde_json::from_str(json)?;
        Self::from_mappings(mappings)
    }

    /// Runtime view of the entity stored in `table`.
    pub fn entity(&self, table: &str) -> Option<&EntityPersister> {
        self.entities.get(table)
    }

    pub(crate) fn require(&self, table: &str) -> Result<&EntityPersister> {
        self.entity(table)
            .ok_or_else(|| Error::config(format!("no mapping registered for entity '{table}'")))
    }

    /// Mapping of collection `name` on entity `table`.
    pub fn collection_mapping(&self, table: &str, name: &str) -> Option<&CollectionMapping> {
        self.entity(table)
            .and_then(|entity| entity.collection(name))
            .map(CollectionPersister::mapping)
    }

    /// Entity table names, sorted.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        tables.sort_unstable();
        tables
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Collects mappings and generator overrides, then validates them together.
#[derive(Debug, Default)]
pub struct MappingRegistryBuilder {
    mappings: Vec<EntityMapping>,
    generators: HashMap<String, Arc<dyn RowIdGenerator>>,
}

impl MappingRegistryBuilder {
    /// Register an entity mapping.
    pub fn entity(mut self, mapping: EntityMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Use `generator` for the ids of `table` (an entity or collection table)
    /// instead of the one built from its configured strategy.
    pub fn generator(mut self, table: impl Into<String>, generator: Arc<dyn RowIdGenerator>) -> Self {
        self.generators.insert(table.into(), generator);
        self
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn build(mut self) -> Result<MappingRegistry> {
        let mut entities = HashMap::with_capacity(self.mappings.len());
        let mut tables: HashSet<String> = HashSet::new();

        for mapping in self.mappings {
            mapping.validate()?;

            if !tables.insert(mapping.table.to_ascii_lowercase()) {
                return Err(Error::config(format!(
                    "table '{}' is mapped more than once",
                    mapping.table
                )));
            }
            for collection in &mapping.collections {
                if !tables.insert(collection.table.to_ascii_lowercase()) {
                    return Err(Error::config(format!(
                        "table '{}' is mapped more than once",
                        collection.table
                    )));
                }
            }

            let id_generator = self
                .generators
                .remove(&mapping.table)
                .unwrap_or_else(|| generator_for(mapping.id_strategy));
            let collections = mapping
                .collections
                .iter()
                .map(|collection| {
                    let generator = self
                        .generators
                        .remove(&collection.table)
                        .unwrap_or_else(|| generator_for(collection.id_strategy));
                    CollectionPersister::new(Arc::new(collection.clone()), generator)
                })
                .collect();

            tracing::debug!(
                table = %mapping.table,
                collections = mapping.collections.len(),
                "Registered entity mapping"
            );
            entities.insert(
                mapping.table.clone(),
                EntityPersister {
                    mapping: Arc::new(mapping),
                    id_generator,
                    collections,
                },
            );
        }

        if let Some(table) = self.generators.keys().next() {
            return Err(Error::config(format!(
                "generator override for unmapped table '{table}'"
            )));
        }

        Ok(MappingRegistry { entities })
    }
}
