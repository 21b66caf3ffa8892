use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{Context, Pipeline, Proposed, capacity, commit, contains_folded, pipeline, unique};
use crate::errors::RepositoryError;
use crate::models::{Document, MAX_PROJECTS, Project, ProjectStatus};
use crate::persistence::{DocumentWatch, PersistenceGuard};
use crate::validation::{Rule, ValidationError, ValidationResult, business, entity};

const ENTITY: &str = "project";

pub struct ProjectRepository {
    context: Context,
    pipeline: Pipeline<Project>,
}

impl ProjectRepository {
    pub(crate) fn new(context: Context) -> Self {
        let pipeline = pipeline(
            ENTITY,
            Rule::new(|p: &Arc<Proposed<Project>>| {
                let fields = entity::validate_project(&p.entity);
                match &p.previous {
                    Some(previous) => fields.and(business::project_transition(previous, &p.entity)),
                    None => fields,
                }
            }),
            vec![
                Rule::new(|p: &Arc<Proposed<Project>>| unique(ENTITY, &p.document.projects, &p.entity)),
                Rule::new(|p: &Arc<Proposed<Project>>| profile_exists(&p.document, &p.entity)),
                Rule::new(|p: &Arc<Proposed<Project>>| {
                    capacity("projects", p.document.projects.len(), MAX_PROJECTS)
                }),
            ],
            context.timeout,
        );
        Self { context, pipeline }
    }

    pub async fn list(&self) -> Result<Vec<Project>, RepositoryError> {
        Ok(self.context.persistence.load().await?.projects.clone())
    }

    pub async fn get(&self, id: &str) -> Result<Project, RepositoryError> {
        let document = self.context.persistence.load().await?;
        document.project(id).cloned().ok_or_else(|| not_found(id))
    }

    pub async fn with_status(&self, status: ProjectStatus) -> Result<Vec<Project>, RepositoryError> {
        let document = self.context.persistence.load().await?;
        Ok(document
            .projects
            .iter()
            .filter(|project| project.status == status)
            .cloned()
            .collect())
    }

    pub async fn add(&self, project: Project) -> Result<Project, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut next = (*guard.load()?).clone();
        next.projects.push(project.clone());
        let name = project.name.clone();
        let proposed = Proposed {
            entity: project.clone(),
            previous: None,
            document: next,
        };
        commit(&mut guard, &self.pipeline, ENTITY, &name, proposed).await?;
        info!(id = %project.id, profile = %project.server_profile_id, "project added");
        Ok(project)
    }

    /// Replaces the stored project. A status change must follow the
    /// project transition table.
    pub async fn update(&self, project: Project) -> Result<Project, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        self.replace(&mut guard, project).await
    }

    /// Moves the project to `status`, stamping or clearing `archived_at`.
    pub async fn set_status(&self, id: &str, status: ProjectStatus) -> Result<Project, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut project = guard.load()?.project(id).cloned().ok_or_else(|| not_found(id))?;
        project.status = status;
        project.archived_at = match status {
            ProjectStatus::Archived => Some(Utc::now()),
            ProjectStatus::Active | ProjectStatus::Paused => None,
        };
        self.replace(&mut guard, project).await
    }

    /// Removes the project together with its message list.
    pub async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let current = guard.load()?;
        if current.project(id).is_none() {
            return Err(not_found(id));
        }
        let mut next: Document = (*current).clone();
        next.projects.retain(|project| project.id != id);
        let dropped = next.messages.remove(id).map(|list| list.len()).unwrap_or_default();
        guard.save(next)?;
        info!(id = %id, messages = dropped, "project deleted");
        Ok(())
    }

    /// Case-insensitive match on name or remote path.
    pub async fn search(&self, query: &str) -> Result<Vec<Project>, RepositoryError> {
        let document = self.context.persistence.load().await?;
        Ok(document
            .projects
            .iter()
            .filter(|project| contains_folded(&project.name, query) || contains_folded(&project.remote_path, query))
            .cloned()
            .collect())
    }

    pub fn observe(&self) -> DocumentWatch<Vec<Project>> {
        self.context
            .persistence
            .observe_with(|document: &Arc<Document>| document.projects.clone())
    }

    async fn replace(&self, guard: &mut PersistenceGuard<'_>, project: Project) -> Result<Project, RepositoryError> {
        let mut next = (*guard.load()?).clone();
        let slot = next
            .projects
            .iter_mut()
            .find(|existing| existing.id == project.id)
            .ok_or_else(|| not_found(&project.id))?;
        let previous = std::mem::replace(slot, project.clone());
        let name = project.name.clone();
        let proposed = Proposed {
            entity: project.clone(),
            previous: Some(previous),
            document: next,
        };
        commit(guard, &self.pipeline, ENTITY, &name, proposed).await?;
        info!(id = %project.id, status = ?project.status, "project updated");
        Ok(project)
    }
}

fn profile_exists(document: &Document, project: &Project) -> ValidationResult {
    ValidationResult::check(document.server_profile(&project.server_profile_id).is_some(), || {
        ValidationError::relationship(
            "serverProfileId",
            format!("server profile '{}' does not exist", project.server_profile_id),
        )
    })
}

fn not_found(id: &str) -> RepositoryError {
    RepositoryError::EntityNotFound {
        entity: ENTITY,
        id: id.to_string(),
    }
}
