//! A load-testing harness for Iceberg REST catalog services.
//!
//! The harness generates a deterministic dataset of catalogs, a tree of namespaces, and tables
//! and views in the leaf namespaces. Every entity is addressed by its kind and a dense ordinal;
//! names, properties and schemas are derived from those, so any worker can compute any entity
//! without coordination.
//!
//! A run is a sequence of [`Phase`]s. Each phase applies one action, such as creating or
//! verifying, to every entity of one kind with a pool of concurrent workers. Workers share a
//! single access token that is refreshed in the background by the [`TokenManager`].
//!
//! [`Phase`]: workload::Phase
//! [`TokenManager`]: auth::TokenManager
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod auth;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod naming;
pub mod observability;
pub mod orchestrator;
pub mod report;
pub mod topology;
pub mod workload;

pub use crate::dataset::{DatasetWalker, EntityDescriptor, EntityKind};
pub use crate::error::{Error, Result};
pub use crate::orchestrator::Orchestrator;
pub use crate::report::RunReport;
pub use crate::topology::{ShapeParameters, Topology};
pub use crate::workload::{ActionKind, Phase};
