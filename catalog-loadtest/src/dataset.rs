//! Lazy traversal of the generated dataset.
//!
//! The [`DatasetWalker`] turns ordinals into [`EntityDescriptor`]s on demand. It supports two
//! modes of traversal:
//!
//! - *Enumeration*: [`DatasetWalker::entities`] yields every entity of a kind once, in strictly
//!   increasing ordinal order. Phases use random access via [`DatasetWalker::descriptor`] so
//!   concurrent workers can claim ordinals independently.
//! - *Tree relationships*: [`DatasetWalker::children`] yields the child namespaces of a
//!   namespace, computed with the implicit N-ary tree mapping of [`Topology`].

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::catalog::EntityDefinition;
use crate::error::Result;
use crate::naming::{self, Namer};
use crate::topology::{ShapeParameters, Topology};

/// The kinds of entities in the catalog hierarchy.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A top-level catalog.
    Catalog,
    /// A namespace, possibly nested in other namespaces.
    Namespace,
    /// A table in a leaf namespace.
    Table,
    /// A view in a leaf namespace.
    View,
}

impl EntityKind {
    /// All kinds, from the top of the hierarchy down.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Catalog,
        EntityKind::Namespace,
        EntityKind::Table,
        EntityKind::View,
    ];

    /// A lowercase, human-readable name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Catalog => "catalog",
            EntityKind::Namespace => "namespace",
            EntityKind::Table => "table",
            EntityKind::View => "view",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one generated entity without any backing storage.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EntityDescriptor {
    /// The kind of entity.
    pub kind: EntityKind,
    /// Position of the entity among all entities of its kind.
    pub ordinal: u64,
    /// Names of all ancestors, starting with the catalog. Empty for catalogs.
    pub path: Vec<String>,
    /// The entity's own name.
    pub name: String,
}

impl EntityDescriptor {
    /// The catalog this entity lives in.
    pub fn catalog(&self) -> &str {
        match self.path.first() {
            Some(catalog) => catalog,
            None => &self.name,
        }
    }

    /// The namespace levels between the catalog and the entity.
    pub fn namespace(&self) -> &[String] {
        self.path.get(1..).unwrap_or_default()
    }

    /// The namespace levels of a namespace entity, including its own name.
    ///
    /// For tables and views this is the same as [`namespace`](Self::namespace).
    pub fn levels(&self) -> Vec<String> {
        let mut levels = self.namespace().to_vec();
        if self.kind == EntityKind::Namespace {
            levels.push(self.name.clone());
        }
        levels
    }
}

impl fmt::Display for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.kind)?;
        for segment in &self.path {
            write!(f, "{segment}.")?;
        }
        f.write_str(&self.name)
    }
}

/// Produces [`EntityDescriptor`]s for the dataset described by a [`ShapeParameters`].
#[derive(Clone, Debug)]
pub struct DatasetWalker {
    shape: ShapeParameters,
    topology: Topology,
    namer: Namer,
}

impl DatasetWalker {
    /// Creates a walker over the dataset of the given shape.
    ///
    /// Fails if the shape is invalid, see [`Topology::new`].
    pub fn new(shape: &ShapeParameters, catalog_prefix: &str) -> Result<Self> {
        Ok(Self {
            shape: shape.clone(),
            topology: Topology::new(shape)?,
            namer: Namer::new(catalog_prefix, shape.mangle_names),
        })
    }

    /// The topology the walker traverses.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Total number of entities of `kind`.
    pub fn count(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::Catalog => self.topology.catalogs(),
            EntityKind::Namespace => self.topology.namespaces(),
            EntityKind::Table => self.topology.tables(),
            EntityKind::View => self.topology.views(),
        }
    }

    /// Returns the descriptor of entity `ordinal` of `kind`, or `None` past the end.
    pub fn descriptor(&self, kind: EntityKind, ordinal: u64) -> Option<EntityDescriptor> {
        if ordinal >= self.count(kind) {
            return None;
        }

        let path = match kind {
            EntityKind::Catalog => Vec::new(),
            EntityKind::Namespace => {
                let mut path = self.namespace_path(ordinal);
                path.pop();
                path
            }
            EntityKind::Table => self.namespace_path(self.topology.table_namespace(ordinal)),
            EntityKind::View => self.namespace_path(self.topology.view_namespace(ordinal)),
        };

        Some(EntityDescriptor {
            kind,
            ordinal,
            path,
            name: self.namer.name(kind, ordinal),
        })
    }

    /// Enumerates all entities of `kind` in increasing ordinal order.
    ///
    /// Every call starts a fresh traversal from ordinal `0`.
    pub fn entities(&self, kind: EntityKind) -> Entities<'_> {
        Entities {
            walker: self,
            kind,
            ordinals: 0..self.count(kind),
        }
    }

    /// Enumerates the child namespaces of `namespace`.
    ///
    /// Leaves and ordinals outside the tree have no children.
    pub fn children(&self, namespace: u64) -> Entities<'_> {
        let ordinals = if namespace < self.topology.namespaces() {
            self.topology.children(namespace)
        } else {
            0..0
        };

        Entities {
            walker: self,
            kind: EntityKind::Namespace,
            ordinals,
        }
    }

    /// Names of the entities of `kind` expected directly under `parent`.
    ///
    /// For a catalog this is the root namespace (only in the first catalog), for a namespace its
    /// child namespaces or, for leaves, its tables or views.
    pub fn expected_children(&self, parent: &EntityDescriptor, kind: EntityKind) -> Vec<String> {
        let ordinals: Range<u64> = match (parent.kind, kind) {
            (EntityKind::Catalog, EntityKind::Namespace) if parent.ordinal == 0 => 0..1,
            (EntityKind::Namespace, EntityKind::Namespace) => {
                self.topology.children(parent.ordinal)
            }
            (EntityKind::Namespace, EntityKind::Table) => self.topology.tables_in(parent.ordinal),
            (EntityKind::Namespace, EntityKind::View) => self.topology.views_in(parent.ordinal),
            _ => 0..0,
        };
        ordinals.map(|o| self.namer.name(kind, o)).collect()
    }

    /// The definition an entity is created with: its properties and, for tables and views, its
    /// schema columns.
    pub fn definition(&self, entity: &EntityDescriptor) -> EntityDefinition {
        let (properties, columns) = match entity.kind {
            EntityKind::Catalog => (0, 0),
            EntityKind::Namespace => (self.shape.namespace_properties, 0),
            EntityKind::Table => (self.shape.table_properties, self.shape.columns_per_table),
            EntityKind::View => (self.shape.view_properties, self.shape.columns_per_view),
        };

        EntityDefinition {
            properties: naming::properties(properties),
            columns: naming::columns(columns),
        }
    }

    /// Catalog name followed by the names of all namespaces from the root to `namespace`.
    fn namespace_path(&self, namespace: u64) -> Vec<String> {
        std::iter::once(self.namer.name(EntityKind::Catalog, 0))
            .chain(
                self.topology
                    .ancestry(namespace)
                    .into_iter()
                    .map(|ordinal| self.namer.name(EntityKind::Namespace, ordinal)),
            )
            .collect()
    }
}

/// A lazy, finite sequence of [`EntityDescriptor`]s. See [`DatasetWalker::entities`].
#[derive(Clone, Debug)]
pub struct Entities<'a> {
    walker: &'a DatasetWalker,
    kind: EntityKind,
    ordinals: Range<u64>,
}

impl Iterator for Entities<'_> {
    type Item = EntityDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let ordinal = self.ordinals.next()?;
        self.walker.descriptor(self.kind, ordinal)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ordinals.size_hint()
    }
}
