//! In-memory catalog for dry runs and tests.
//!
//! This provides a [`CatalogApi`] backed by a `HashMap`, so the whole workload can be exercised
//! without a running service. The catalog is [`Clone`] so tests can hold a handle for direct
//! inspection while the orchestrator owns a boxed copy.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ActionError, ActionResult, CatalogApi, EntityDefinition, EntityInfo};
use crate::auth::Credential;
use crate::dataset::{DatasetWalker, EntityDescriptor, EntityKind};

type Key = (EntityKind, Vec<String>);

/// A request the in-memory catalog received, in arrival order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedRequest {
    /// The [`CatalogApi`] method that was called.
    pub operation: &'static str,
    /// Kind of the targeted entity.
    pub kind: EntityKind,
    /// Ordinal of the targeted entity.
    pub ordinal: u64,
    /// The bearer token the request was issued with.
    pub token: String,
}

#[derive(Debug, Default)]
struct State {
    entities: HashMap<Key, BTreeMap<String, String>>,
    failures: HashMap<(EntityKind, u64), ActionError>,
    requests: Vec<RecordedRequest>,
}

/// A [`CatalogApi`] keeping all entities in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    state: Arc<Mutex<State>>,
    latency: Duration,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every request by `latency`, simulating a remote service.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inserts every entity of the walker's dataset, bypassing the [`CatalogApi`].
    pub fn populate(&self, walker: &DatasetWalker) {
        let mut state = self.state();
        for kind in EntityKind::ALL {
            for entity in walker.entities(kind) {
                let definition = walker.definition(&entity);
                state.entities.insert(key(&entity), definition.properties);
            }
        }
    }

    /// Makes every request for the given entity fail with `error`.
    pub fn inject_failure(&self, kind: EntityKind, ordinal: u64, error: ActionError) {
        self.state().failures.insert((kind, ordinal), error);
    }

    /// Returns `true` if the entity exists.
    pub fn contains(&self, entity: &EntityDescriptor) -> bool {
        self.state().entities.contains_key(&key(entity))
    }

    /// Returns the stored properties of the entity, if present.
    pub fn properties(&self, entity: &EntityDescriptor) -> Option<BTreeMap<String, String>> {
        self.state().entities.get(&key(entity)).cloned()
    }

    /// Number of stored entities of `kind`.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.state()
            .entities
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// All requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the request, simulates latency and returns the injected failure, if any.
    async fn enter(
        &self,
        operation: &'static str,
        credential: &Credential,
        entity: &EntityDescriptor,
    ) -> ActionResult<()> {
        let failure = {
            let mut state = self.state();
            state.requests.push(RecordedRequest {
                operation,
                kind: entity.kind,
                ordinal: entity.ordinal,
                token: credential.token().to_owned(),
            });
            state.failures.get(&(entity.kind, entity.ordinal)).cloned()
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn full_path(entity: &EntityDescriptor) -> Vec<String> {
    let mut path = entity.path.clone();
    path.push(entity.name.clone());
    path
}

fn key(entity: &EntityDescriptor) -> Key {
    (entity.kind, full_path(entity))
}

/// The key of the entity's direct parent: a namespace, or the catalog for root namespaces.
fn parent_key(entity: &EntityDescriptor) -> Option<Key> {
    match entity.path.len() {
        0 => None,
        1 => Some((EntityKind::Catalog, entity.path.clone())),
        _ => Some((EntityKind::Namespace, entity.path.clone())),
    }
}

#[async_trait::async_trait]
impl CatalogApi for InMemoryCatalog {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn create_entity(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
        definition: &EntityDefinition,
    ) -> ActionResult<()> {
        self.enter("create_entity", credential, entity).await?;

        let mut state = self.state();
        if let Some(parent) = parent_key(entity)
            && !state.entities.contains_key(&parent)
        {
            return Err(ActionError::NotFound);
        }
        if state.entities.contains_key(&key(entity)) {
            return Err(ActionError::Conflict);
        }
        state
            .entities
            .insert(key(entity), definition.properties.clone());
        Ok(())
    }

    async fn get_entity(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
    ) -> ActionResult<EntityInfo> {
        self.enter("get_entity", credential, entity).await?;

        let state = self.state();
        let properties = state
            .entities
            .get(&key(entity))
            .ok_or(ActionError::NotFound)?;
        Ok(EntityInfo {
            name: entity.name.clone(),
            properties: properties.clone(),
        })
    }

    async fn list_children(
        &self,
        credential: &Credential,
        parent: &EntityDescriptor,
        kind: EntityKind,
    ) -> ActionResult<Vec<String>> {
        self.enter("list_children", credential, parent).await?;

        let state = self.state();
        let prefix = full_path(parent);
        if !state.entities.contains_key(&key(parent)) {
            return Err(ActionError::NotFound);
        }

        let mut names: Vec<_> = state
            .entities
            .keys()
            .filter(|(k, path)| {
                *k == kind && path.len() == prefix.len() + 1 && path.starts_with(&prefix)
            })
            .filter_map(|(_, path)| path.last().cloned())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn entity_exists(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
    ) -> ActionResult<bool> {
        self.enter("entity_exists", credential, entity).await?;
        Ok(self.state().entities.contains_key(&key(entity)))
    }

    async fn update_properties(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
        updates: &BTreeMap<String, String>,
    ) -> ActionResult<()> {
        self.enter("update_properties", credential, entity).await?;

        let mut state = self.state();
        let properties = state
            .entities
            .get_mut(&key(entity))
            .ok_or(ActionError::NotFound)?;
        properties.extend(updates.clone());
        Ok(())
    }
}
