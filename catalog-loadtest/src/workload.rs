//! Phases of a load-test run and the per-entity actions they perform.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Interval, MissedTickBehavior};

use crate::auth::Credential;
use crate::catalog::{ActionError, ActionResult, CatalogApi};
use crate::dataset::{DatasetWalker, EntityDescriptor, EntityKind};
use crate::error::{Error, Result};
use crate::naming;

/// What a phase does with every entity it visits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create the entity. An existing entity counts as success.
    Create,
    /// Fetch the entity and compare its properties with the generated ones.
    Verify,
    /// List the entity's children and compare them with the tree mapping.
    ListChildren,
    /// Check that the entity exists.
    Exists,
    /// Commit a property update, cycling over all entities of the kind.
    Commit,
}

impl ActionKind {
    /// A lowercase name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Verify => "verify",
            ActionKind::ListChildren => "list_children",
            ActionKind::Exists => "exists",
            ActionKind::Commit => "commit",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A builder for creating a [`Phase`].
#[derive(Debug)]
pub struct PhaseBuilder {
    name: String,
    action: ActionKind,
    kind: EntityKind,
    concurrency: usize,
    count: Option<u64>,
    rate: Option<f64>,
}

impl PhaseBuilder {
    /// The number of workers issuing actions in parallel.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// The number of actions to perform.
    ///
    /// Defaults to the number of entities of the phase's kind. Other than commits, a phase never
    /// visits an entity twice, so larger counts are reduced to that number.
    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Paces the phase to approximately `rate` actions per second across all workers.
    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Validates the settings against the dataset and creates the phase.
    pub fn build(self, walker: &DatasetWalker) -> Result<Phase> {
        if self.concurrency == 0 {
            return Err(Error::invalid(
                "workload.concurrency",
                format!("phase `{}` needs at least one worker", self.name),
            ));
        }

        match (self.action, self.kind) {
            (ActionKind::ListChildren, EntityKind::Table | EntityKind::View) => {
                return Err(Error::invalid(
                    "workload.kind",
                    format!("phase `{}`: {}s have no children", self.name, self.kind),
                ));
            }
            (ActionKind::Commit, EntityKind::Catalog) => {
                return Err(Error::invalid(
                    "workload.kind",
                    format!("phase `{}`: catalogs cannot be committed to", self.name),
                ));
            }
            _ => {}
        }

        let available = walker.count(self.kind);
        let target = match (self.action, self.count) {
            (ActionKind::Commit, Some(count)) => count,
            (_, Some(count)) => count.min(available),
            (_, None) => available,
        };
        if self.action == ActionKind::Commit && target > 0 && available == 0 {
            return Err(Error::invalid(
                "workload.count",
                format!("phase `{}`: there are no {}s to commit to", self.name, self.kind),
            ));
        }

        let pacing = match self.rate {
            None => None,
            Some(rate) if rate.is_finite() && rate > 0.0 => {
                let period = Duration::try_from_secs_f64(self.concurrency as f64 / rate)
                    .map_err(|e| Error::invalid("workload.rate", e.to_string()))?;
                Some(period)
            }
            Some(rate) => {
                return Err(Error::invalid(
                    "workload.rate",
                    format!("phase `{}`: rate must be positive, got {rate}", self.name),
                ));
            }
        };

        Ok(Phase {
            name: self.name,
            action: self.action,
            kind: self.kind,
            concurrency: self.concurrency,
            target,
            rate: self.rate,
            pacing,
        })
    }
}

/// One stage of a run: an action applied to a number of entities by a pool of workers.
#[derive(Clone, Debug, PartialEq)]
pub struct Phase {
    name: String,
    action: ActionKind,
    kind: EntityKind,
    concurrency: usize,
    target: u64,
    rate: Option<f64>,
    /// Interval between two actions of the same worker.
    pacing: Option<Duration>,
}

impl Phase {
    /// Constructs a new phase builder.
    pub fn builder(name: impl Into<String>, action: ActionKind, kind: EntityKind) -> PhaseBuilder {
        PhaseBuilder {
            name: name.into(),
            action,
            kind,
            concurrency: 1,
            count: None,
            rate: None,
        }
    }

    /// The read pipeline used when no phases are configured: verify catalogs, then namespaces,
    /// then tables, then views.
    pub fn default_pipeline(walker: &DatasetWalker, concurrency: usize) -> Result<Vec<Phase>> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| {
                Phase::builder(format!("verify {kind}s"), ActionKind::Verify, kind)
                    .concurrency(concurrency)
                    .build(walker)
            })
            .collect()
    }

    /// Name of the phase for identification in logs and reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The action applied to each entity.
    pub fn action(&self) -> ActionKind {
        self.action
    }

    /// The kind of entity the phase visits.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The number of concurrent workers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The number of actions after which the phase is complete.
    pub fn target(&self) -> u64 {
        self.target
    }

    /// The configured rate in actions per second, if paced.
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    /// The entity visited for claim number `sequence`.
    ///
    /// Commits cycle over all entities of the kind; every other action visits entity `sequence`.
    pub(crate) fn entity(&self, walker: &DatasetWalker, sequence: u64) -> Option<EntityDescriptor> {
        let ordinal = match self.action {
            ActionKind::Commit => sequence.checked_rem(walker.count(self.kind))?,
            _ => sequence,
        };
        walker.descriptor(self.kind, ordinal)
    }

    /// Splits the phase's claims into waves that run one after another.
    ///
    /// Creating namespaces needs every parent in place before its children, so that phase runs
    /// one tree level per wave. Every other phase is a single wave.
    pub(crate) fn waves(&self, walker: &DatasetWalker) -> Vec<Range<u64>> {
        if self.target == 0 {
            return Vec::new();
        }
        if (self.action, self.kind) != (ActionKind::Create, EntityKind::Namespace) {
            return vec![0..self.target];
        }

        // The first child of namespace `k` is `k * N + 1`, so that is where the next level
        // starts when `k` opens the current one.
        let width = walker.topology().width();
        let mut waves = Vec::new();
        let mut start = 0;
        while start < self.target {
            let end = start
                .saturating_mul(width)
                .saturating_add(1)
                .min(self.target);
            waves.push(start..end);
            start = end;
        }
        waves
    }

    /// Creates the pacer of one worker.
    pub(crate) fn pacer(&self) -> Pacer {
        Pacer(self.pacing.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        }))
    }

    /// Applies the phase's action to `entity`.
    pub(crate) async fn perform(
        &self,
        catalog: &dyn CatalogApi,
        walker: &DatasetWalker,
        credential: &Credential,
        entity: &EntityDescriptor,
        sequence: u64,
    ) -> ActionResult<()> {
        match self.action {
            ActionKind::Create => {
                let definition = walker.definition(entity);
                match catalog.create_entity(credential, entity, &definition).await {
                    Ok(()) | Err(ActionError::Conflict) => Ok(()),
                    Err(error) => Err(error),
                }
            }
            ActionKind::Verify => {
                let info = catalog.get_entity(credential, entity).await?;
                if info.name != entity.name {
                    return Err(ActionError::Mismatch(format!(
                        "expected name `{}`, found `{}`",
                        entity.name, info.name
                    )));
                }

                for (key, expected) in walker.definition(entity).properties {
                    match info.properties.get(&key) {
                        Some(actual) if *actual == expected => {}
                        Some(actual) => {
                            return Err(ActionError::Mismatch(format!(
                                "property `{key}` is `{actual}`, expected `{expected}`"
                            )));
                        }
                        None => {
                            return Err(ActionError::Mismatch(format!(
                                "property `{key}` is missing"
                            )));
                        }
                    }
                }
                Ok(())
            }
            ActionKind::ListChildren => {
                let kinds: &[EntityKind] = match entity.kind {
                    EntityKind::Namespace if walker.topology().is_leaf(entity.ordinal) => {
                        &[EntityKind::Table, EntityKind::View]
                    }
                    _ => &[EntityKind::Namespace],
                };

                for &kind in kinds {
                    let listed = catalog.list_children(credential, entity, kind).await?;
                    compare_children(kind, walker.expected_children(entity, kind), listed)?;
                }
                Ok(())
            }
            ActionKind::Exists => match catalog.entity_exists(credential, entity).await? {
                true => Ok(()),
                false => Err(ActionError::NotFound),
            },
            ActionKind::Commit => {
                let updates = naming::commit_update(sequence);
                catalog.update_properties(credential, entity, &updates).await
            }
        }
    }
}

/// Requires `listed` to contain exactly the `expected` names, in any order.
fn compare_children(
    kind: EntityKind,
    expected: Vec<String>,
    listed: Vec<String>,
) -> ActionResult<()> {
    let expected: BTreeSet<_> = expected.into_iter().collect();
    let listed: BTreeSet<_> = listed.into_iter().collect();
    if expected == listed {
        return Ok(());
    }

    let missing: Vec<_> = expected.difference(&listed).collect();
    let unexpected: Vec<_> = listed.difference(&expected).collect();
    Err(ActionError::Mismatch(format!(
        "{kind} children differ: missing {missing:?}, unexpected {unexpected:?}"
    )))
}

/// Shared claim counter of one wave of a phase.
///
/// Workers [`claim`](Self::claim) sequence numbers with an atomic increment that is compared
/// against the end of the range, so every number in the range is handed out exactly once.
#[derive(Debug)]
pub struct PhaseProgress {
    end: u64,
    next: AtomicU64,
}

impl PhaseProgress {
    /// Creates the counter handing out the sequence numbers in `range`.
    pub fn new(range: Range<u64>) -> Self {
        Self {
            end: range.end,
            next: AtomicU64::new(range.start),
        }
    }

    /// Claims the next sequence number, or returns `None` once all have been handed out.
    pub fn claim(&self) -> Option<u64> {
        let sequence = self.next.fetch_add(1, Ordering::Relaxed);
        (sequence < self.end).then_some(sequence)
    }
}

/// Fixed-interval pacing of a single worker.
#[derive(Debug)]
pub(crate) struct Pacer(Option<Interval>);

impl Pacer {
    /// Waits until the worker may issue its next action.
    ///
    /// The first call returns immediately.
    pub async fn wait(&mut self) {
        if let Some(interval) = &mut self.0 {
            interval.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::catalog::in_memory::InMemoryCatalog;
    use crate::topology::ShapeParameters;

    fn walker() -> DatasetWalker {
        let shape = ShapeParameters {
            tree_width: 2,
            tree_depth: 2,
            tables_per_leaf: 2,
            views_per_leaf: 1,
            namespace_properties: 2,
            table_properties: 2,
            ..Default::default()
        };
        DatasetWalker::new(&shape, "C").unwrap()
    }

    #[test]
    fn progress_hands_out_each_claim_once() {
        let progress = Arc::new(PhaseProgress::new(200..1200));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let progress = Arc::clone(&progress);
                std::thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(sequence) = progress.claim() {
                        claimed.push(sequence);
                    }
                    claimed
                })
            })
            .collect();

        let mut all: Vec<_> = threads
            .into_iter()
            .flat_map(|thread| thread.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (200..1200).collect::<Vec<_>>());
        assert_eq!(progress.claim(), None);
    }

    #[test]
    fn namespaces_are_created_level_by_level() {
        let shape = ShapeParameters {
            tree_width: 2,
            tree_depth: 4,
            ..Default::default()
        };
        let walker = DatasetWalker::new(&shape, "C").unwrap();
        let create = |count: Option<u64>| {
            let mut builder = Phase::builder("create", ActionKind::Create, EntityKind::Namespace);
            if let Some(count) = count {
                builder = builder.count(count);
            }
            builder.build(&walker).unwrap()
        };

        assert_eq!(create(None).waves(&walker), vec![0..1, 1..3, 3..7, 7..15]);
        assert_eq!(create(Some(5)).waves(&walker), vec![0..1, 1..3, 3..5]);
        assert!(create(Some(0)).waves(&walker).is_empty());

        // Every namespace sits in a later wave than its parent.
        let waves = create(None).waves(&walker);
        let wave_of = |ordinal: u64| waves.iter().position(|w| w.contains(&ordinal)).unwrap();
        for ordinal in 1..15 {
            let parent = walker.topology().parent(ordinal).unwrap();
            assert!(wave_of(parent) < wave_of(ordinal));
        }

        let chain = DatasetWalker::new(
            &ShapeParameters {
                tree_width: 1,
                tree_depth: 3,
                ..Default::default()
            },
            "C",
        )
        .unwrap();
        let phase = Phase::builder("create", ActionKind::Create, EntityKind::Namespace)
            .build(&chain)
            .unwrap();
        assert_eq!(phase.waves(&chain), vec![0..1, 1..2, 2..3]);

        let tables = Phase::builder("create", ActionKind::Create, EntityKind::Table)
            .build(&walker)
            .unwrap();
        assert_eq!(tables.waves(&walker), vec![0..walker.count(EntityKind::Table)]);
    }

    #[test]
    fn build_validates() {
        let walker = walker();

        let phase = Phase::builder("verify", ActionKind::Verify, EntityKind::Table)
            .concurrency(4)
            .count(100)
            .build(&walker)
            .unwrap();
        assert_eq!(phase.target(), 4);

        let commits = Phase::builder("commit", ActionKind::Commit, EntityKind::Table)
            .count(100)
            .rate(50.0)
            .concurrency(5)
            .build(&walker)
            .unwrap();
        assert_eq!(commits.target(), 100);
        assert_eq!(commits.pacing, Some(Duration::from_millis(100)));

        let zero = Phase::builder("x", ActionKind::Verify, EntityKind::Table).concurrency(0);
        assert!(zero.build(&walker).is_err());

        let rate = Phase::builder("x", ActionKind::Commit, EntityKind::Table).rate(0.0);
        assert!(rate.build(&walker).is_err());

        let list = Phase::builder("x", ActionKind::ListChildren, EntityKind::View);
        assert!(list.build(&walker).is_err());
    }

    #[test]
    fn commit_without_tables_is_rejected() {
        let shape = ShapeParameters {
            max_tables: 0,
            ..Default::default()
        };
        let walker = DatasetWalker::new(&shape, "C").unwrap();
        let commit = Phase::builder("x", ActionKind::Commit, EntityKind::Table).count(5);
        assert!(commit.build(&walker).is_err());
    }

    #[test]
    fn commits_cycle_over_tables() {
        let walker = walker();
        let phase = Phase::builder("commit", ActionKind::Commit, EntityKind::Table)
            .count(10)
            .build(&walker)
            .unwrap();

        let ordinals: Vec<_> = (0..10)
            .map(|sequence| phase.entity(&walker, sequence).unwrap().ordinal)
            .collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn default_pipeline() {
        let phases = Phase::default_pipeline(&walker(), 3).unwrap();
        let names: Vec<_> = phases.iter().map(Phase::name).collect();
        assert_eq!(
            names,
            vec![
                "verify catalogs",
                "verify namespaces",
                "verify tables",
                "verify views"
            ]
        );
        assert_eq!(phases[1].target(), 3);
        assert!(phases.iter().all(|p| p.concurrency() == 3));
    }

    #[tokio::test]
    async fn create_tolerates_existing_entities() {
        let walker = walker();
        let catalog = InMemoryCatalog::new();
        catalog.populate(&walker);
        let credential = Credential::fixed("token");

        let phase = Phase::builder("create", ActionKind::Create, EntityKind::Namespace)
            .build(&walker)
            .unwrap();
        let entity = walker.descriptor(EntityKind::Namespace, 1).unwrap();
        phase
            .perform(&catalog, &walker, &credential, &entity, 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_detects_diverging_properties() {
        let walker = walker();
        let catalog = InMemoryCatalog::new();
        catalog.populate(&walker);
        let credential = Credential::fixed("token");

        let phase = Phase::builder("verify", ActionKind::Verify, EntityKind::Table)
            .build(&walker)
            .unwrap();
        let table = walker.descriptor(EntityKind::Table, 2).unwrap();
        phase
            .perform(&catalog, &walker, &credential, &table, 2)
            .await
            .unwrap();

        let updates = BTreeMap::from([("InitialAttribute_1".to_owned(), "changed".to_owned())]);
        catalog
            .update_properties(&credential, &table, &updates)
            .await
            .unwrap();
        let result = phase.perform(&catalog, &walker, &credential, &table, 2).await;
        assert!(matches!(result, Err(ActionError::Mismatch(_))));

        let missing = walker.descriptor(EntityKind::Table, 3).unwrap();
        let empty = InMemoryCatalog::new();
        let result = phase.perform(&empty, &walker, &credential, &missing, 3).await;
        assert_eq!(result, Err(ActionError::NotFound));
    }

    #[tokio::test]
    async fn list_children_follows_the_tree() {
        let walker = walker();
        let catalog = InMemoryCatalog::new();
        catalog.populate(&walker);
        let credential = Credential::fixed("token");

        let phase = Phase::builder("list", ActionKind::ListChildren, EntityKind::Namespace)
            .build(&walker)
            .unwrap();
        for namespace in walker.entities(EntityKind::Namespace) {
            let ordinal = namespace.ordinal;
            phase
                .perform(&catalog, &walker, &credential, &namespace, ordinal)
                .await
                .unwrap();
        }

        let catalogs = Phase::builder("list", ActionKind::ListChildren, EntityKind::Catalog)
            .build(&walker)
            .unwrap();
        let c0 = walker.descriptor(EntityKind::Catalog, 0).unwrap();
        catalogs
            .perform(&catalog, &walker, &credential, &c0, 0)
            .await
            .unwrap();

        // A leaf holding a table that belongs to its sibling.
        let partial = InMemoryCatalog::new();
        partial.populate(&walker);
        let leaf = walker.descriptor(EntityKind::Namespace, 1).unwrap();
        let other = walker.descriptor(EntityKind::Namespace, 2).unwrap();
        let result = phase.perform(&partial, &walker, &credential, &leaf, 1).await;
        assert!(result.is_ok());
        let table = walker.descriptor(EntityKind::Table, 0).unwrap();
        let moved = EntityDescriptor {
            path: other.path.iter().cloned().chain([other.name.clone()]).collect(),
            ..table
        };
        partial
            .create_entity(&credential, &moved, &walker.definition(&moved))
            .await
            .unwrap();
        let result = phase.perform(&partial, &walker, &credential, &other, 2).await;
        assert!(matches!(result, Err(ActionError::Mismatch(_))));
    }

    #[tokio::test]
    async fn exists_and_commit() {
        let walker = walker();
        let catalog = InMemoryCatalog::new();
        let credential = Credential::fixed("token");

        let exists = Phase::builder("exists", ActionKind::Exists, EntityKind::View)
            .build(&walker)
            .unwrap();
        let view = walker.descriptor(EntityKind::View, 0).unwrap();
        let result = exists.perform(&catalog, &walker, &credential, &view, 0).await;
        assert_eq!(result, Err(ActionError::NotFound));

        catalog.populate(&walker);
        exists
            .perform(&catalog, &walker, &credential, &view, 0)
            .await
            .unwrap();

        let commit = Phase::builder("commit", ActionKind::Commit, EntityKind::Table)
            .count(6)
            .build(&walker)
            .unwrap();
        let table = commit.entity(&walker, 5).unwrap();
        commit
            .perform(&catalog, &walker, &credential, &table, 5)
            .await
            .unwrap();
        assert_eq!(catalog.properties(&table).unwrap()["commit_5"], "5");
        assert_eq!(table.ordinal, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_actions() {
        let walker = walker();
        let phase = Phase::builder("commit", ActionKind::Commit, EntityKind::Table)
            .concurrency(2)
            .rate(4.0)
            .build(&walker)
            .unwrap();

        let mut pacer = phase.pacer();
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            pacer.wait().await;
        }
        // Two workers at 4/s: each waits 500ms between actions.
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        let mut unpaced = Phase::builder("verify", ActionKind::Verify, EntityKind::Table)
            .build(&walker)
            .unwrap()
            .pacer();
        let start = tokio::time::Instant::now();
        unpaced.wait().await;
        unpaced.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
