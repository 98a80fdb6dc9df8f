//! Entity counts and structural positions of the generated dataset.
//!
//! The namespace tree is a complete N-ary tree stored implicitly by array position: the root is
//! ordinal `0` and child `i` of namespace `k` is ordinal `k * N + i + 1`. Nothing is materialized;
//! every query below is arithmetic over ordinals.
//!
//! Tables and views only live in leaf namespaces. Table `t` belongs to the `t / T`-th leaf, so a
//! cap on the number of tables truncates the last leaves first.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sentinel for "no cap" in [`ShapeParameters::max_tables`] and [`ShapeParameters::max_views`].
pub const UNCAPPED: i64 = -1;

/// Shape of the synthetic dataset.
///
/// Used in: [`Config::dataset`](crate::config::Config::dataset)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShapeParameters {
    /// Number of catalogs. The namespace tree is generated in the first one.
    pub num_catalogs: u64,
    /// Number of children of every non-leaf namespace (`N`).
    pub tree_width: u64,
    /// Number of namespace levels, the root included (`D`).
    pub tree_depth: u64,
    /// Number of tables in every leaf namespace (`T`).
    pub tables_per_leaf: u64,
    /// Number of views in every leaf namespace (`V`).
    pub views_per_leaf: u64,
    /// Upper bound on the total number of tables, or `-1` for no bound.
    pub max_tables: i64,
    /// Upper bound on the total number of views, or `-1` for no bound.
    pub max_views: i64,
    /// Number of properties set on every namespace.
    pub namespace_properties: u64,
    /// Number of properties set on every table.
    pub table_properties: u64,
    /// Number of properties set on every view.
    pub view_properties: u64,
    /// Number of schema columns of every table.
    pub columns_per_table: u64,
    /// Number of schema columns of every view.
    pub columns_per_view: u64,
    /// Replace namespace, table and view names with digests.
    pub mangle_names: bool,
}

impl Default for ShapeParameters {
    fn default() -> Self {
        Self {
            num_catalogs: 1,
            tree_width: 2,
            tree_depth: 4,
            tables_per_leaf: 5,
            views_per_leaf: 3,
            max_tables: UNCAPPED,
            max_views: UNCAPPED,
            namespace_properties: 10,
            table_properties: 10,
            view_properties: 10,
            columns_per_table: 10,
            columns_per_view: 10,
            mangle_names: false,
        }
    }
}

/// Entity counts and tree arithmetic derived from [`ShapeParameters`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Topology {
    width: u64,
    catalogs: u64,
    namespaces: u64,
    leaves: u64,
    tables_per_leaf: u64,
    views_per_leaf: u64,
    tables: u64,
    views: u64,
}

impl Topology {
    /// Validates the shape and computes all entity counts.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if `N < 1`, `D < 1`, there are no catalogs, or a cap is
    ///   negative without being the `-1` sentinel.
    /// - [`Error::TopologyOverflow`] if a count does not fit into 64 bits.
    pub fn new(shape: &ShapeParameters) -> Result<Self> {
        if shape.num_catalogs < 1 {
            return Err(Error::invalid("num_catalogs", "must be at least 1"));
        }
        if shape.tree_width < 1 {
            return Err(Error::invalid("tree_width", "must be at least 1"));
        }
        if shape.tree_depth < 1 {
            return Err(Error::invalid("tree_depth", "must be at least 1"));
        }
        check_cap("max_tables", shape.max_tables)?;
        check_cap("max_views", shape.max_views)?;

        let width = shape.tree_width;
        let depth = shape.tree_depth;

        let leaves = checked_pow(width, depth - 1)?;
        let namespaces = if width == 1 {
            depth
        } else {
            // (N^D - 1) / (N - 1), computed as N^(D-1) + (N^(D-1) - 1) / (N - 1) so that the
            // intermediate N^D cannot overflow when the result itself fits.
            leaves
                .checked_add((leaves - 1) / (width - 1))
                .ok_or_else(|| overflow("namespace count"))?
        };

        let tables = leaves
            .checked_mul(shape.tables_per_leaf)
            .ok_or_else(|| overflow("table count"))?;
        let views = leaves
            .checked_mul(shape.views_per_leaf)
            .ok_or_else(|| overflow("view count"))?;

        Ok(Self {
            width,
            catalogs: shape.num_catalogs,
            namespaces,
            leaves,
            tables_per_leaf: shape.tables_per_leaf,
            views_per_leaf: shape.views_per_leaf,
            tables: apply_cap(tables, shape.max_tables),
            views: apply_cap(views, shape.max_views),
        })
    }

    /// The branching factor `N`.
    pub fn width(&self) -> u64 {
        self.width
    }

    /// Total number of catalogs.
    pub fn catalogs(&self) -> u64 {
        self.catalogs
    }

    /// Total number of namespaces, `(N^D - 1) / (N - 1)` or `D` for `N = 1`.
    pub fn namespaces(&self) -> u64 {
        self.namespaces
    }

    /// Number of leaf namespaces, `N^(D-1)`.
    pub fn leaves(&self) -> u64 {
        self.leaves
    }

    /// Total number of tables after applying the cap.
    pub fn tables(&self) -> u64 {
        self.tables
    }

    /// Total number of views after applying the cap.
    pub fn views(&self) -> u64 {
        self.views
    }

    /// Ordinal of the first leaf namespace. All leaves are contiguous from here to the end.
    pub fn first_leaf(&self) -> u64 {
        self.namespaces - self.leaves
    }

    /// Returns `true` if `namespace` is a valid ordinal without child namespaces.
    pub fn is_leaf(&self, namespace: u64) -> bool {
        namespace >= self.first_leaf() && namespace < self.namespaces
    }

    /// Returns the parent of `namespace`, or `None` for the root.
    pub fn parent(&self, namespace: u64) -> Option<u64> {
        match namespace {
            0 => None,
            k => Some((k - 1) / self.width),
        }
    }

    /// Returns the ordinal of child `index` of `namespace`, if it exists.
    pub fn child(&self, namespace: u64, index: u64) -> Option<u64> {
        if index >= self.width || namespace >= self.first_leaf() {
            return None;
        }
        Some(namespace * self.width + index + 1)
    }

    /// Returns the ordinals of all child namespaces of `namespace`.
    ///
    /// The range is empty for leaves and for ordinals outside the tree.
    pub fn children(&self, namespace: u64) -> Range<u64> {
        if namespace >= self.first_leaf() {
            return 0..0;
        }
        let first = namespace * self.width + 1;
        first..first + self.width
    }

    /// Returns the ordinals from the root down to and including `namespace`.
    pub fn ancestry(&self, namespace: u64) -> Vec<u64> {
        let mut chain = vec![namespace];
        let mut current = namespace;
        while let Some(parent) = self.parent(current) {
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// The leaf namespace that holds table `table`.
    pub fn table_namespace(&self, table: u64) -> u64 {
        self.first_leaf() + table / self.tables_per_leaf.max(1)
    }

    /// The leaf namespace that holds view `view`.
    pub fn view_namespace(&self, view: u64) -> u64 {
        self.first_leaf() + view / self.views_per_leaf.max(1)
    }

    /// Ordinals of the tables held by `namespace`, empty for non-leaves.
    pub fn tables_in(&self, namespace: u64) -> Range<u64> {
        self.leaf_slice(namespace, self.tables_per_leaf, self.tables)
    }

    /// Ordinals of the views held by `namespace`, empty for non-leaves.
    pub fn views_in(&self, namespace: u64) -> Range<u64> {
        self.leaf_slice(namespace, self.views_per_leaf, self.views)
    }

    fn leaf_slice(&self, namespace: u64, per_leaf: u64, total: u64) -> Range<u64> {
        if !self.is_leaf(namespace) {
            return 0..0;
        }
        let index = namespace - self.first_leaf();
        let start = (index * per_leaf).min(total);
        let end = (start + per_leaf).min(total);
        start..end
    }
}

fn check_cap(name: &'static str, cap: i64) -> Result<()> {
    if cap < UNCAPPED {
        return Err(Error::invalid(
            name,
            format!("{cap} is negative; use {UNCAPPED} for no cap"),
        ));
    }
    Ok(())
}

fn apply_cap(count: u64, cap: i64) -> u64 {
    match u64::try_from(cap) {
        Ok(cap) => count.min(cap),
        Err(_) => count,
    }
}

fn checked_pow(base: u64, exp: u64) -> Result<u64> {
    if base == 1 {
        return Ok(1);
    }
    u32::try_from(exp)
        .ok()
        .and_then(|exp| base.checked_pow(exp))
        .ok_or_else(|| overflow(&format!("{base}^{exp}")))
}

fn overflow(what: &str) -> Error {
    Error::TopologyOverflow(format!("{what} does not fit into 64 bits"))
}
