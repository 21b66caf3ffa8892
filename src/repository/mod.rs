//! Per-entity CRUD over the single document.
//!
//! Every mutation holds the persistence lock for its whole
//! read-modify-write: load the snapshot, build the next document, run the
//! entity's validation pipeline against it, then save. Concurrent repository
//! calls therefore never interleave.

pub mod identity;
pub mod message;
pub mod project;
pub mod server_profile;

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::errors::RepositoryError;
use crate::models::{Document, Identity, Project, ServerProfile};
use crate::persistence::{PersistenceCore, PersistenceGuard};
use crate::validation::{
    AsyncRule, CAPACITY_EXCEEDED, DUPLICATE_ID, DUPLICATE_NAME, ErrorType, Rule, ValidationError, ValidationResult,
};

pub use identity::IdentityRepository;
pub use message::{Appended, MessageRepository};
pub use project::ProjectRepository;
pub use server_profile::ServerProfileRepository;

/// A pending change: the entity as it will be stored, the document it will
/// be stored in, and the entity's previous state for updates.
pub struct Proposed<E> {
    pub entity: E,
    pub previous: Option<E>,
    pub document: Document,
}

pub type Pipeline<E> = AsyncRule<Arc<Proposed<E>>>;

/// Entities with a unique id and a case-insensitively unique name.
pub trait Named {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
}

impl Named for Identity {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for ServerProfile {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for Project {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone)]
pub(crate) struct Context {
    pub persistence: Arc<PersistenceCore>,
    pub timeout: Duration,
}

/// `sequential[fields, parallel[constraints]]` under a timeout.
pub(crate) fn pipeline<E>(
    label: &str,
    fields: Rule<Arc<Proposed<E>>>,
    constraints: Vec<Rule<Arc<Proposed<E>>>>,
    timeout: Duration,
) -> Pipeline<E>
where
    E: Send + Sync + 'static,
{
    let constraints = constraints
        .into_iter()
        .enumerate()
        .map(|(index, rule)| AsyncRule::from_rule(&format!("{label}.constraint{index}"), rule))
        .collect();
    AsyncRule::sequential(
        label,
        vec![
            AsyncRule::from_rule(&format!("{label}.fields"), fields),
            AsyncRule::parallel(&format!("{label}.constraints"), constraints),
        ],
    )
    .with_timeout(timeout)
}

/// Runs the pipeline and saves the proposed document when it passes.
pub(crate) async fn commit<E>(
    guard: &mut PersistenceGuard<'_>,
    pipeline: &Pipeline<E>,
    entity_label: &'static str,
    display_name: &str,
    proposed: Proposed<E>,
) -> Result<Arc<Document>, RepositoryError>
where
    E: Send + Sync + 'static,
{
    let proposed = Arc::new(proposed);
    let result = pipeline.check(Arc::clone(&proposed)).await;
    if let ValidationResult::Failure(errors) = result {
        debug!(entity = entity_label, errors = errors.len(), "change rejected");
        return Err(classify(entity_label, display_name, errors));
    }
    let document = match Arc::try_unwrap(proposed) {
        Ok(proposed) => proposed.document,
        Err(shared) => shared.document.clone(),
    };
    Ok(guard.save(document)?)
}

/// Maps validation failures onto the repository error taxonomy.
pub(crate) fn classify(
    entity: &'static str,
    name: &str,
    errors: Vec<ValidationError>,
) -> RepositoryError {
    if errors.iter().any(|e| e.has_code(DUPLICATE_NAME)) {
        return RepositoryError::DuplicateName {
            entity,
            name: name.to_string(),
        };
    }
    let constraint = |e: &ValidationError| e.error_type == ErrorType::Relationship || e.has_code(CAPACITY_EXCEEDED);
    if errors.iter().any(constraint) {
        let message = errors
            .iter()
            .filter(|e| constraint(*e))
            .map(|e| e.message.clone())
            .collect::<Vec<_>>()
            .join("; ");
        return RepositoryError::ConstraintViolation(message);
    }
    RepositoryError::Validation { entity, errors }
}

/// Another entity in `items` already uses this id or (ignoring case) name.
pub(crate) fn unique<E: Named>(collection: &str, items: &[E], candidate: &E) -> ValidationResult {
    let folded = candidate.name().to_lowercase();
    let name_taken = items
        .iter()
        .filter(|item| item.id() != candidate.id())
        .any(|item| item.name().to_lowercase() == folded);
    let id_count = items.iter().filter(|item| item.id() == candidate.id()).count();
    let name = ValidationResult::check(!name_taken, || {
        ValidationError::business(format!("{collection} name '{}' is already in use", candidate.name()))
            .on("name")
            .with_code(DUPLICATE_NAME)
    });
    let id = ValidationResult::check(id_count <= 1, || {
        ValidationError::business(format!("{collection} id '{}' is already in use", candidate.id()))
            .on("id")
            .with_code(DUPLICATE_ID)
    });
    name.and(id)
}

pub(crate) fn capacity(collection: &str, count: usize, max: usize) -> ValidationResult {
    ValidationResult::check(count <= max, || {
        ValidationError::business(format!("{collection} is full ({count} of at most {max})"))
            .on(collection)
            .with_code(CAPACITY_EXCEEDED)
    })
}

pub(crate) fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KeyType;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGq3 dev@laptop";

    #[test]
    fn test_classify_prefers_duplicate_name() {
        let errors = vec![
            ValidationError::business("dup").with_code(DUPLICATE_NAME),
            ValidationError::relationship("sshIdentityId", "missing"),
        ];
        assert!(matches!(
            classify("identity", "Dev", errors),
            RepositoryError::DuplicateName { name, .. } if name == "Dev"
        ));
    }

    #[test]
    fn test_classify_constraints_and_fields() {
        let errors = vec![ValidationError::relationship("serverProfileId", "unknown profile")];
        assert!(matches!(
            classify("project", "api", errors),
            RepositoryError::ConstraintViolation(message) if message == "unknown profile"
        ));

        let errors = vec![ValidationError::field("name", "blank")];
        assert!(matches!(classify("project", "", errors), RepositoryError::Validation { .. }));
    }

    #[test]
    fn test_unique_ignores_case_and_self() {
        let existing = Identity::new("Dev", KeyType::Ed25519, KEY);
        let mut renamed = existing.clone();
        renamed.name = "dev".to_string();
        assert!(unique("identity", &[existing.clone()], &renamed).is_success());

        let other = Identity::new("DEV", KeyType::Ed25519, KEY);
        let result = unique("identity", &[existing, other.clone()], &other);
        assert!(result.errors()[0].has_code(DUPLICATE_NAME));
    }

    #[test]
    fn test_contains_folded() {
        assert!(contains_folded("Production API", "api"));
        assert!(!contains_folded("staging", "prod"));
    }
}
