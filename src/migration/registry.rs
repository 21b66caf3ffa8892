use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::errors::{MigrationError, RegistryError};
use crate::models::{Document, INITIAL_VERSION};

/// Receives `(completed, total, detail)` while a migration runs.
pub trait ProgressSink {
    fn report(&self, completed: usize, total: usize, detail: &str);
}

/// Discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _completed: usize, _total: usize, _detail: &str) {}
}

/// One edge of the version graph.
pub trait Migration: Send + Sync {
    fn from_version(&self) -> u32;

    fn to_version(&self) -> u32;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        self.name()
    }

    /// Whether a backup taken before this step can be restored afterwards
    /// without losing data the step introduced.
    fn reversible(&self) -> bool {
        false
    }

    fn can_apply(&self, document: &Document) -> bool {
        document.version == self.from_version()
    }

    /// Produces a new document; the input is consumed.
    fn apply(&self, document: Document, progress: &dyn ProgressSink) -> Result<Document, MigrationError>;

    fn estimate_steps(&self, _document: &Document) -> usize {
        1
    }
}

impl fmt::Debug for dyn Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} -> {})", self.name(), self.from_version(), self.to_version())
    }
}

/// Directed graph of migrations keyed by `(from, to)`.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    edges: BTreeMap<u32, BTreeMap<u32, Arc<dyn Migration>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects a second registration for the same `(from, to)` pair.
    pub fn register<M: Migration + 'static>(&mut self, migration: M) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(migration))
    }

    pub fn register_arc(&mut self, migration: Arc<dyn Migration>) -> Result<(), RegistryError> {
        check_edge(migration.as_ref())?;
        let (from, to) = (migration.from_version(), migration.to_version());
        if self.get(from, to).is_some() {
            return Err(RegistryError::Duplicate { from, to });
        }
        self.edges.entry(from).or_default().insert(to, migration);
        Ok(())
    }

    /// Registers `migration`, returning whatever it replaced.
    pub fn register_replacing<M: Migration + 'static>(
        &mut self,
        migration: M,
    ) -> Result<Option<Arc<dyn Migration>>, RegistryError> {
        check_edge(&migration)?;
        let (from, to) = (migration.from_version(), migration.to_version());
        Ok(self.edges.entry(from).or_default().insert(to, Arc::new(migration)))
    }

    pub fn get(&self, from: u32, to: u32) -> Option<&Arc<dyn Migration>> {
        self.edges.get(&from)?.get(&to)
    }

    pub fn migrations(&self) -> impl Iterator<Item = &Arc<dyn Migration>> {
        self.edges.values().flat_map(BTreeMap::values)
    }

    pub fn len(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_path(&self, from: u32, to: u32) -> bool {
        from == to || self.distances_to(to).contains_key(&from)
    }

    /// Shortest chain from `from` to `to`. Among equally short chains the
    /// smallest next version wins at every step. Empty when unreachable or
    /// when `from == to`.
    pub fn find_path(&self, from: u32, to: u32) -> Vec<Arc<dyn Migration>> {
        if from == to {
            return Vec::new();
        }
        let distances = self.distances_to(to);
        let Some(&total) = distances.get(&from) else {
            return Vec::new();
        };

        let mut path = Vec::with_capacity(total);
        let mut current = from;
        while current != to {
            let remaining = distances[&current];
            // BTreeMap iterates targets in ascending order.
            let next = self.edges.get(&current).and_then(|targets| {
                targets
                    .iter()
                    .find(|(target, _)| distances.get(*target) == Some(&(remaining - 1)))
            });
            match next {
                Some((&target, migration)) => {
                    path.push(Arc::clone(migration));
                    current = target;
                }
                None => return Vec::new(),
            }
        }
        path
    }

    /// Highest version reachable from [`INITIAL_VERSION`].
    pub fn latest_version(&self) -> u32 {
        self.latest_version_from(INITIAL_VERSION)
    }

    pub fn latest_version_from(&self, start: u32) -> u32 {
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(version) = queue.pop_front() {
            for &target in self.edges.get(&version).into_iter().flat_map(BTreeMap::keys) {
                if seen.insert(target) {
                    queue.push_back(target);
                }
            }
        }
        seen.last().copied().unwrap_or(start)
    }

    /// Breadth-first search over reversed edges: hops from each version to `to`.
    fn distances_to(&self, to: u32) -> HashMap<u32, usize> {
        let mut reverse: HashMap<u32, Vec<u32>> = HashMap::new();
        for (&from, targets) in &self.edges {
            for &target in targets.keys() {
                reverse.entry(target).or_default().push(from);
            }
        }

        let mut distances = HashMap::from([(to, 0)]);
        let mut queue = VecDeque::from([to]);
        while let Some(version) = queue.pop_front() {
            let hops = distances[&version];
            for &source in reverse.get(&version).into_iter().flatten() {
                distances.entry(source).or_insert_with(|| {
                    queue.push_back(source);
                    hops + 1
                });
            }
        }
        distances
    }
}

fn check_edge(migration: &dyn Migration) -> Result<(), RegistryError> {
    if migration.from_version() == migration.to_version() {
        return Err(RegistryError::SelfLoop(migration.name().to_string()));
    }
    Ok(())
}
