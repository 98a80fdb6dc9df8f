//! The catalog service under test.
//!
//! [`CatalogApi`] is the seam between the workload and the service. The harness ships an
//! [`HttpCatalog`](http::HttpCatalog) speaking the Iceberg REST protocol and an
//! [`InMemoryCatalog`](in_memory::InMemoryCatalog) used for dry runs and tests.

use std::collections::BTreeMap;
use std::fmt::Debug;

use thiserror::Error;

use crate::auth::Credential;
use crate::dataset::{EntityDescriptor, EntityKind};

pub mod http;
pub mod in_memory;

/// A type-erased [`CatalogApi`] instance.
pub type BoxedCatalog = Box<dyn CatalogApi>;

/// Operations the workload issues against the catalog service.
///
/// Every call carries the credential snapshot the worker read right before issuing it.
#[async_trait::async_trait]
pub trait CatalogApi: Debug + Send + Sync + 'static {
    /// The implementation name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Creates the entity with the given definition.
    ///
    /// Fails with [`ActionError::Conflict`] if it already exists.
    async fn create_entity(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
        definition: &EntityDefinition,
    ) -> ActionResult<()>;

    /// Fetches the entity's description.
    async fn get_entity(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
    ) -> ActionResult<EntityInfo>;

    /// Lists the names of all entities of `kind` directly under `parent`.
    async fn list_children(
        &self,
        credential: &Credential,
        parent: &EntityDescriptor,
        kind: EntityKind,
    ) -> ActionResult<Vec<String>>;

    /// Checks whether the entity exists.
    async fn entity_exists(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
    ) -> ActionResult<bool>;

    /// Commits a property update to a table or view.
    async fn update_properties(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
        updates: &BTreeMap<String, String>,
    ) -> ActionResult<()>;
}

/// What an entity is created with.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EntityDefinition {
    /// Entity properties.
    pub properties: BTreeMap<String, String>,
    /// Schema column names, only used for tables and views.
    pub columns: Vec<String>,
}

/// An entity as described by the catalog service.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EntityInfo {
    /// The entity's name as reported by the service.
    pub name: String,
    /// The entity's current properties.
    pub properties: BTreeMap<String, String>,
}

/// Failure of a single entity action.
///
/// These are tallied per phase and never abort a run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ActionError {
    /// The entity does not exist.
    #[error("entity not found")]
    NotFound,
    /// The entity already exists.
    #[error("entity already exists")]
    Conflict,
    /// The call did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// The service rejected the credential.
    #[error("request was not authorized")]
    Unauthorized,
    /// Any other unexpected HTTP status.
    #[error("unexpected status {0}")]
    Status(u16),
    /// The request could not be sent or the response not read.
    #[error("transport error: {0}")]
    Transport(String),
    /// The entity exists but does not look like the generated one.
    #[error("verification failed: {0}")]
    Mismatch(String),
}

impl ActionError {
    /// A short, stable label used to group failures in reports.
    pub fn label(&self) -> &'static str {
        match self {
            ActionError::NotFound => "not_found",
            ActionError::Conflict => "conflict",
            ActionError::Timeout => "timeout",
            ActionError::Unauthorized => "unauthorized",
            ActionError::Status(_) => "status",
            ActionError::Transport(_) => "transport",
            ActionError::Mismatch(_) => "mismatch",
        }
    }
}

/// Result type for catalog actions.
pub type ActionResult<T> = Result<T, ActionError>;
