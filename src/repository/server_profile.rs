use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{Context, Pipeline, Proposed, capacity, commit, contains_folded, pipeline, unique};
use crate::errors::RepositoryError;
use crate::models::{Document, MAX_SERVER_PROFILES, ServerProfile};
use crate::persistence::{DocumentWatch, PersistenceGuard};
use crate::validation::{Rule, ValidationError, ValidationResult, entity};

const ENTITY: &str = "server profile";

pub struct ServerProfileRepository {
    context: Context,
    pipeline: Pipeline<ServerProfile>,
}

impl ServerProfileRepository {
    pub(crate) fn new(context: Context) -> Self {
        let pipeline = pipeline(
            "server_profile",
            Rule::new(|p: &Arc<Proposed<ServerProfile>>| entity::validate_server_profile(&p.entity)),
            vec![
                Rule::new(|p: &Arc<Proposed<ServerProfile>>| {
                    unique(ENTITY, &p.document.server_profiles, &p.entity)
                }),
                Rule::new(|p: &Arc<Proposed<ServerProfile>>| identity_exists(&p.document, &p.entity)),
                Rule::new(|p: &Arc<Proposed<ServerProfile>>| {
                    capacity("serverProfiles", p.document.server_profiles.len(), MAX_SERVER_PROFILES)
                }),
            ],
            context.timeout,
        );
        Self { context, pipeline }
    }

    pub async fn list(&self) -> Result<Vec<ServerProfile>, RepositoryError> {
        Ok(self.context.persistence.load().await?.server_profiles.clone())
    }

    pub async fn get(&self, id: &str) -> Result<ServerProfile, RepositoryError> {
        let document = self.context.persistence.load().await?;
        document.server_profile(id).cloned().ok_or_else(|| not_found(id))
    }

    /// Profiles that authenticate with `identity_id`.
    pub async fn for_identity(&self, identity_id: &str) -> Result<Vec<ServerProfile>, RepositoryError> {
        let document = self.context.persistence.load().await?;
        Ok(document
            .server_profiles
            .iter()
            .filter(|profile| profile.ssh_identity_id == identity_id)
            .cloned()
            .collect())
    }

    pub async fn add(&self, profile: ServerProfile) -> Result<ServerProfile, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut next = (*guard.load()?).clone();
        next.server_profiles.push(profile.clone());
        let name = profile.name.clone();
        let proposed = Proposed {
            entity: profile.clone(),
            previous: None,
            document: next,
        };
        commit(&mut guard, &self.pipeline, ENTITY, &name, proposed).await?;
        info!(id = %profile.id, host = %profile.host, "server profile added");
        Ok(profile)
    }

    pub async fn update(&self, profile: ServerProfile) -> Result<ServerProfile, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        self.replace(&mut guard, profile).await
    }

    pub async fn mark_connected(&self, id: &str) -> Result<ServerProfile, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut profile = guard.load()?.server_profile(id).cloned().ok_or_else(|| not_found(id))?;
        profile.last_connected = Some(Utc::now());
        self.replace(&mut guard, profile).await
    }

    /// Fails while any project still targets the profile.
    pub async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let current = guard.load()?;
        if current.server_profile(id).is_none() {
            return Err(not_found(id));
        }
        let users: Vec<&str> = current
            .projects
            .iter()
            .filter(|project| project.server_profile_id == id)
            .map(|project| project.name.as_str())
            .collect();
        if !users.is_empty() {
            return Err(RepositoryError::ConstraintViolation(format!(
                "server profile '{id}' is used by projects: {}",
                users.join(", ")
            )));
        }
        let mut next: Document = (*current).clone();
        next.server_profiles.retain(|profile| profile.id != id);
        guard.save(next)?;
        info!(id = %id, "server profile deleted");
        Ok(())
    }

    /// Case-insensitive match on name, host or username.
    pub async fn search(&self, query: &str) -> Result<Vec<ServerProfile>, RepositoryError> {
        let document = self.context.persistence.load().await?;
        Ok(document
            .server_profiles
            .iter()
            .filter(|profile| {
                contains_folded(&profile.name, query)
                    || contains_folded(&profile.host, query)
                    || contains_folded(&profile.username, query)
            })
            .cloned()
            .collect())
    }

    pub fn observe(&self) -> DocumentWatch<Vec<ServerProfile>> {
        self.context
            .persistence
            .observe_with(|document: &Arc<Document>| document.server_profiles.clone())
    }

    async fn replace(
        &self,
        guard: &mut PersistenceGuard<'_>,
        profile: ServerProfile,
    ) -> Result<ServerProfile, RepositoryError> {
        let mut next = (*guard.load()?).clone();
        let slot = next
            .server_profiles
            .iter_mut()
            .find(|existing| existing.id == profile.id)
            .ok_or_else(|| not_found(&profile.id))?;
        let previous = std::mem::replace(slot, profile.clone());
        let name = profile.name.clone();
        let proposed = Proposed {
            entity: profile.clone(),
            previous: Some(previous),
            document: next,
        };
        commit(guard, &self.pipeline, ENTITY, &name, proposed).await?;
        info!(id = %profile.id, "server profile updated");
        Ok(profile)
    }
}

fn identity_exists(document: &Document, profile: &ServerProfile) -> ValidationResult {
    ValidationResult::check(document.identity(&profile.ssh_identity_id).is_some(), || {
        ValidationError::relationship(
            "sshIdentityId",
            format!("identity '{}' does not exist", profile.ssh_identity_id),
        )
    })
}

fn not_found(id: &str) -> RepositoryError {
    RepositoryError::EntityNotFound {
        entity: ENTITY,
        id: id.to_string(),
    }
}
