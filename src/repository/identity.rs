use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{Context, Pipeline, Proposed, capacity, commit, contains_folded, pipeline, unique};
use crate::errors::RepositoryError;
use crate::models::{Document, Identity, MAX_IDENTITIES};
use crate::persistence::{DocumentWatch, PersistenceGuard};
use crate::validation::{Rule, entity};

const ENTITY: &str = "identity";

pub struct IdentityRepository {
    context: Context,
    pipeline: Pipeline<Identity>,
}

impl IdentityRepository {
    pub(crate) fn new(context: Context) -> Self {
        let pipeline = pipeline(
            ENTITY,
            Rule::new(|p: &Arc<Proposed<Identity>>| entity::validate_identity(&p.entity)),
            vec![
                Rule::new(|p: &Arc<Proposed<Identity>>| unique(ENTITY, &p.document.identities, &p.entity)),
                Rule::new(|p: &Arc<Proposed<Identity>>| {
                    capacity("identities", p.document.identities.len(), MAX_IDENTITIES)
                }),
            ],
            context.timeout,
        );
        Self { context, pipeline }
    }

    pub async fn list(&self) -> Result<Vec<Identity>, RepositoryError> {
        Ok(self.context.persistence.load().await?.identities.clone())
    }

    pub async fn get(&self, id: &str) -> Result<Identity, RepositoryError> {
        let document = self.context.persistence.load().await?;
        document.identity(id).cloned().ok_or_else(|| not_found(id))
    }

    pub async fn add(&self, identity: Identity) -> Result<Identity, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut next = (*guard.load()?).clone();
        next.identities.push(identity.clone());
        let name = identity.name.clone();
        let proposed = Proposed {
            entity: identity.clone(),
            previous: None,
            document: next,
        };
        commit(&mut guard, &self.pipeline, ENTITY, &name, proposed).await?;
        info!(id = %identity.id, "identity added");
        Ok(identity)
    }

    pub async fn update(&self, identity: Identity) -> Result<Identity, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        self.replace(&mut guard, identity).await
    }

    /// Fails while any server profile still uses the identity.
    pub async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let current = guard.load()?;
        if current.identity(id).is_none() {
            return Err(not_found(id));
        }
        let users: Vec<&str> = current
            .server_profiles
            .iter()
            .filter(|profile| profile.ssh_identity_id == id)
            .map(|profile| profile.name.as_str())
            .collect();
        if !users.is_empty() {
            return Err(RepositoryError::ConstraintViolation(format!(
                "identity '{id}' is used by server profiles: {}",
                users.join(", ")
            )));
        }
        let mut next: Document = (*current).clone();
        next.identities.retain(|identity| identity.id != id);
        guard.save(next)?;
        info!(id = %id, "identity deleted");
        Ok(())
    }

    /// Records that the identity was just used to authenticate.
    pub async fn touch(&self, id: &str) -> Result<Identity, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut identity = guard.load()?.identity(id).cloned().ok_or_else(|| not_found(id))?;
        identity.last_used = Some(Utc::now());
        self.replace(&mut guard, identity).await
    }

    /// Case-insensitive match on the name.
    pub async fn search(&self, query: &str) -> Result<Vec<Identity>, RepositoryError> {
        let document = self.context.persistence.load().await?;
        Ok(document
            .identities
            .iter()
            .filter(|identity| contains_folded(&identity.name, query))
            .cloned()
            .collect())
    }

    pub fn observe(&self) -> DocumentWatch<Vec<Identity>> {
        self.context
            .persistence
            .observe_with(|document: &Arc<Document>| document.identities.clone())
    }

    async fn replace(
        &self,
        guard: &mut PersistenceGuard<'_>,
        identity: Identity,
    ) -> Result<Identity, RepositoryError> {
        let mut next = (*guard.load()?).clone();
        let slot = next
            .identities
            .iter_mut()
            .find(|existing| existing.id == identity.id)
            .ok_or_else(|| not_found(&identity.id))?;
        let previous = std::mem::replace(slot, identity.clone());
        let name = identity.name.clone();
        let proposed = Proposed {
            entity: identity.clone(),
            previous: Some(previous),
            document: next,
        };
        commit(guard, &self.pipeline, ENTITY, &name, proposed).await?;
        info!(id = %identity.id, "identity updated");
        Ok(identity)
    }
}

fn not_found(id: &str) -> RepositoryError {
    RepositoryError::EntityNotFound {
        entity: ENTITY,
        id: id.to_string(),
    }
}
