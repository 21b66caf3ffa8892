use std::sync::Arc;

use super::registry::{Migration, ProgressSink};
use crate::errors::MigrationError;
use crate::models::Document;

type Transform = dyn Fn(Document, &dyn ProgressSink) -> Result<Document, MigrationError> + Send + Sync;
type Predicate = dyn Fn(&Document) -> bool + Send + Sync;
type Estimate = dyn Fn(&Document) -> usize + Send + Sync;

/// A migration backed by a closure. The produced document is always stamped
/// with the step's target version.
#[derive(Clone)]
pub struct MigrationStep {
    name: String,
    description: String,
    from: u32,
    to: u32,
    reversible: bool,
    transform: Arc<Transform>,
    precondition: Option<Arc<Predicate>>,
    estimate: Option<Arc<Estimate>>,
}

impl MigrationStep {
    pub fn new<F>(name: impl Into<String>, from: u32, to: u32, transform: F) -> Self
    where
        F: Fn(Document, &dyn ProgressSink) -> Result<Document, MigrationError> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            from,
            to,
            reversible: false,
            transform: Arc::new(transform),
            precondition: None,
            estimate: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn reversible(mut self, reversible: bool) -> Self {
        self.reversible = reversible;
        self
    }

    /// Extra check on top of the version match.
    pub fn with_precondition<P>(mut self, precondition: P) -> Self
    where
        P: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.precondition = Some(Arc::new(precondition));
        self
    }

    pub fn with_estimate<E>(mut self, estimate: E) -> Self
    where
        E: Fn(&Document) -> usize + Send + Sync + 'static,
    {
        self.estimate = Some(Arc::new(estimate));
        self
    }
}

impl Migration for MigrationStep {
    fn from_version(&self) -> u32 {
        self.from
    }

    fn to_version(&self) -> u32 {
        self.to
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn reversible(&self) -> bool {
        self.reversible
    }

    fn can_apply(&self, document: &Document) -> bool {
        document.version == self.from
            && self
                .precondition
                .as_ref()
                .is_none_or(|precondition| precondition(document))
    }

    fn apply(&self, document: Document, progress: &dyn ProgressSink) -> Result<Document, MigrationError> {
        let mut migrated = (self.transform)(document, progress)?;
        migrated.version = self.to;
        Ok(migrated)
    }

    fn estimate_steps(&self, document: &Document) -> usize {
        self.estimate.as_ref().map_or(1, |estimate| estimate(document).max(1))
    }
}
