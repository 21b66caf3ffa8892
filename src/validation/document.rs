use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

use super::business;
use super::entity;
use super::{
    CAPACITY_EXCEEDED, DUPLICATE_ID, DUPLICATE_NAME, ErrorType, MIGRATION_DATA_LOSS,
    ValidationError, ValidationResult, Validator,
};
use crate::models::{
    Document, INITIAL_VERSION, MAX_IDENTITIES, MAX_MESSAGES_PER_PROJECT, MAX_PROJECTS,
    MAX_SERVER_PROFILES, MAX_TOTAL_MESSAGES, SYSTEM_MESSAGES_KEY,
};

static DOCUMENT: Lazy<Validator<Document>> = Lazy::new(|| {
    Validator::new()
        .rule(|doc: &Document| {
            ValidationResult::check(doc.version >= INITIAL_VERSION, || {
                ValidationError::field("version", format!("version must be at least {INITIAL_VERSION}"))
            })
        })
        .rule(entities)
        .rule(uniqueness)
        .rule(ceilings)
        .extend(relationships())
        .rule(message_order)
});

static RELATIONSHIPS: Lazy<Validator<Document>> = Lazy::new(relationships);

/// Full check of a stored document: every entity, uniqueness, ceilings and
/// relationships.
pub fn validate_document(doc: &Document) -> ValidationResult {
    DOCUMENT.validate(doc)
}

/// Foreign-key checks only.
pub fn validate_relationships(doc: &Document) -> ValidationResult {
    RELATIONSHIPS.validate(doc)
}

/// Checks one migration step: the result is at the step's target version,
/// no entity was silently dropped and references still resolve.
pub fn validate_migration_step(
    before: &Document,
    after: &Document,
    to_version: u32,
) -> ValidationResult {
    let version = ValidationResult::check(after.version == to_version, || {
        ValidationError::new(
            ErrorType::Custom,
            format!(
                "migration produced version {} but was registered for {}",
                after.version, to_version
            ),
        )
        .on("version")
    });

    let (old, new) = (before.counts(), after.counts());
    let shrunk = [
        ("identities", old.identities, new.identities),
        ("serverProfiles", old.server_profiles, new.server_profiles),
        ("projects", old.projects, new.projects),
        ("messages", old.messages, new.messages),
    ]
    .into_iter()
    .filter(|(_, was, now)| now < was)
    .map(|(field, was, now)| {
        ValidationError::new(
            ErrorType::Custom,
            format!("migration dropped {field}: {was} before, {now} after"),
        )
        .on(field)
        .with_code(MIGRATION_DATA_LOSS)
    })
    .collect();

    version
        .and(ValidationResult::from_errors(shrunk))
        .and(validate_relationships(after))
}

fn entities(doc: &Document) -> ValidationResult {
    let identities = doc.identities.iter().enumerate().map(|(i, identity)| {
        scoped(
            &format!("identities[{i}]"),
            entity::validate_identity(identity),
        )
    });
    let profiles = doc.server_profiles.iter().enumerate().map(|(i, profile)| {
        scoped(
            &format!("serverProfiles[{i}]"),
            entity::validate_server_profile(profile),
        )
    });
    let projects = doc.projects.iter().enumerate().map(|(i, project)| {
        scoped(&format!("projects[{i}]"), entity::validate_project(project))
    });
    let messages = doc.messages.iter().flat_map(|(key, messages)| {
        messages.iter().enumerate().map(move |(i, message)| {
            scoped(&format!("messages.{key}[{i}]"), entity::validate_message(message))
        })
    });

    identities
        .chain(profiles)
        .chain(projects)
        .chain(messages)
        .collect()
}

/// Prefixes a field error's path with the entity's position in the document.
fn scoped(prefix: &str, result: ValidationResult) -> ValidationResult {
    match result {
        ValidationResult::Success => ValidationResult::Success,
        ValidationResult::Failure(errors) => ValidationResult::Failure(
            errors
                .into_iter()
                .map(|mut error| {
                    if error.error_type == ErrorType::Field {
                        error.field = Some(match error.field.take() {
                            Some(field) => format!("{prefix}.{field}"),
                            None => prefix.to_string(),
                        });
                    } else {
                        error.message = format!("{prefix}: {}", error.message);
                    }
                    error
                })
                .collect(),
        ),
    }
}

fn duplicates<'a>(values: impl Iterator<Item = &'a str>, folded: bool) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut dupes = Vec::new();
    for value in values {
        let key = if folded {
            value.to_lowercase()
        } else {
            value.to_string()
        };
        if !seen.insert(key.clone()) && reported.insert(key) {
            dupes.push(value.to_string());
        }
    }
    dupes
}

fn duplicate_errors(collection: &str, ids: Vec<String>, names: Vec<String>) -> Vec<ValidationError> {
    let ids = ids.into_iter().map(|id| {
        ValidationError::business(format!("duplicate id '{id}' in {collection}"))
            .on(format!("{collection}.id"))
            .with_code(DUPLICATE_ID)
    });
    let names = names.into_iter().map(|name| {
        ValidationError::business(format!("duplicate name '{name}' in {collection}"))
            .on(format!("{collection}.name"))
            .with_code(DUPLICATE_NAME)
    });
    ids.chain(names).collect()
}

/// Ids are unique exactly; names are unique ignoring case.
fn uniqueness(doc: &Document) -> ValidationResult {
    let mut errors = duplicate_errors(
        "identities",
        duplicates(doc.identities.iter().map(|i| i.id.as_str()), false),
        duplicates(doc.identities.iter().map(|i| i.name.as_str()), true),
    );
    errors.extend(duplicate_errors(
        "serverProfiles",
        duplicates(doc.server_profiles.iter().map(|p| p.id.as_str()), false),
        duplicates(doc.server_profiles.iter().map(|p| p.name.as_str()), true),
    ));
    errors.extend(duplicate_errors(
        "projects",
        duplicates(doc.projects.iter().map(|p| p.id.as_str()), false),
        duplicates(doc.projects.iter().map(|p| p.name.as_str()), true),
    ));
    for (key, messages) in &doc.messages {
        for id in duplicates(messages.iter().map(|m| m.id.as_str()), false) {
            errors.push(
                ValidationError::business(format!("duplicate message id '{id}' under '{key}'"))
                    .on(format!("messages.{key}.id"))
                    .with_code(DUPLICATE_ID),
            );
        }
    }
    ValidationResult::from_errors(errors)
}

fn capacity_error(field: &str, count: usize, max: usize) -> ValidationError {
    ValidationError::business(format!("{field} holds {count} entries (maximum {max})"))
        .on(field)
        .with_code(CAPACITY_EXCEEDED)
}

fn ceilings(doc: &Document) -> ValidationResult {
    let mut errors = Vec::new();
    for (field, count, max) in [
        ("identities", doc.identities.len(), MAX_IDENTITIES),
        ("serverProfiles", doc.server_profiles.len(), MAX_SERVER_PROFILES),
        ("projects", doc.projects.len(), MAX_PROJECTS),
        ("messages", doc.total_messages(), MAX_TOTAL_MESSAGES),
    ] {
        if count > max {
            errors.push(capacity_error(field, count, max));
        }
    }
    for (key, messages) in &doc.messages {
        if messages.len() > MAX_MESSAGES_PER_PROJECT {
            errors.push(capacity_error(
                &format!("messages.{key}"),
                messages.len(),
                MAX_MESSAGES_PER_PROJECT,
            ));
        }
    }
    ValidationResult::from_errors(errors)
}

fn relationships() -> Validator<Document> {
    Validator::new()
        .rule(|doc: &Document| {
            let identities: HashSet<&str> = doc.identities.iter().map(|i| i.id.as_str()).collect();
            doc.server_profiles
                .iter()
                .filter(|profile| !identities.contains(profile.ssh_identity_id.as_str()))
                .map(|profile| {
                    ValidationResult::fail(ValidationError::relationship(
                        "sshIdentityId",
                        format!(
                            "server profile '{}' references unknown identity '{}'",
                            profile.name, profile.ssh_identity_id
                        ),
                    ))
                })
                .collect()
        })
        .rule(|doc: &Document| {
            let profiles: HashSet<&str> =
                doc.server_profiles.iter().map(|p| p.id.as_str()).collect();
            doc.projects
                .iter()
                .filter(|project| !profiles.contains(project.server_profile_id.as_str()))
                .map(|project| {
                    ValidationResult::fail(ValidationError::relationship(
                        "serverProfileId",
                        format!(
                            "project '{}' references unknown server profile '{}'",
                            project.name, project.server_profile_id
                        ),
                    ))
                })
                .collect()
        })
        .rule(|doc: &Document| {
            let projects: HashSet<&str> = doc.projects.iter().map(|p| p.id.as_str()).collect();
            doc.messages
                .keys()
                .filter(|key| key.as_str() != SYSTEM_MESSAGES_KEY && !projects.contains(key.as_str()))
                .map(|key| {
                    ValidationResult::fail(ValidationError::relationship(
                        "messages",
                        format!("messages stored under unknown project '{key}'"),
                    ))
                })
                .collect()
        })
        .rule(|doc: &Document| {
            doc.messages
                .iter()
                .filter(|(key, _)| key.as_str() != SYSTEM_MESSAGES_KEY)
                .flat_map(|(key, messages)| {
                    messages
                        .iter()
                        .filter(move |m| m.project_id != *key)
                        .map(move |m| {
                            ValidationResult::fail(ValidationError::relationship(
                                "projectId",
                                format!(
                                    "message '{}' stored under '{}' names project '{}'",
                                    m.id, key, m.project_id
                                ),
                            ))
                        })
                })
                .collect()
        })
}

fn message_order(doc: &Document) -> ValidationResult {
    doc.messages
        .iter()
        .map(|(key, messages)| business::message_ordering(key, messages))
        .collect()
}

/// Counts errors per type; used by the CLI summary.
pub fn summarize(result: &ValidationResult) -> HashMap<ErrorType, usize> {
    let mut counts = HashMap::new();
    for error in result.errors() {
        *counts.entry(error.error_type).or_insert(0) += 1;
    }
    counts
}
