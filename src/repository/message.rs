use std::sync::Arc;
use tracing::{debug, info};

use super::{Context, Pipeline, Proposed, capacity, commit, contains_folded, pipeline};
use crate::errors::RepositoryError;
use crate::models::{
    Document, MAX_MESSAGES_PER_PROJECT, MAX_TOTAL_MESSAGES, Message, MessageStatus, SYSTEM_MESSAGES_KEY,
};
use crate::persistence::{DocumentWatch, PersistenceGuard};
use crate::validation::{DUPLICATE_ID, Rule, ValidationError, ValidationResult, business, entity};

const ENTITY: &str = "message";

/// What [`MessageRepository::append`] did with a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub message: Message,
    /// Messages dropped from the front of the list to stay within the cap.
    pub evicted: usize,
    /// False when the message was older than everything kept and was
    /// evicted by its own append.
    pub retained: bool,
}

/// Messages live in per-project lists keyed by project id, plus one list
/// under [`SYSTEM_MESSAGES_KEY`] that belongs to no project.
pub struct MessageRepository {
    context: Context,
    pipeline: Pipeline<Message>,
}

impl MessageRepository {
    pub(crate) fn new(context: Context) -> Self {
        let pipeline = pipeline(
            ENTITY,
            Rule::new(|p: &Arc<Proposed<Message>>| {
                let fields = entity::validate_message(&p.entity);
                match &p.previous {
                    Some(previous) => fields.and(business::message_transition(previous, &p.entity)),
                    None => fields,
                }
            }),
            vec![
                Rule::new(|p: &Arc<Proposed<Message>>| owner_exists(&p.document, &p.entity)),
                Rule::new(|p: &Arc<Proposed<Message>>| unique_id(&p.document, &p.entity)),
                Rule::new(|p: &Arc<Proposed<Message>>| {
                    capacity("messages", p.document.total_messages(), MAX_TOTAL_MESSAGES)
                }),
            ],
            context.timeout,
        );
        Self { context, pipeline }
    }

    /// Messages for `project_id` in timestamp order. An unknown project is
    /// an error; a known one without messages yields an empty list.
    pub async fn list(&self, project_id: &str) -> Result<Vec<Message>, RepositoryError> {
        let document = self.context.persistence.load().await?;
        if project_id != SYSTEM_MESSAGES_KEY && document.project(project_id).is_none() {
            return Err(RepositoryError::EntityNotFound {
                entity: "project",
                id: project_id.to_string(),
            });
        }
        Ok(document.messages.get(project_id).cloned().unwrap_or_default())
    }

    pub async fn get(&self, id: &str) -> Result<Message, RepositoryError> {
        let document = self.context.persistence.load().await?;
        find(&document, id).cloned().ok_or_else(|| not_found(id))
    }

    /// Inserts `message` in timestamp order under its project. When the
    /// project already holds the maximum, the oldest messages are evicted.
    /// The project's last activity moves forward to the message time.
    pub async fn append(&self, message: Message) -> Result<Appended, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut next = (*guard.load()?).clone();
        let key = message.project_id.clone();

        let list = next.messages.entry(key.clone()).or_default();
        let position = list.partition_point(|existing| existing.timestamp <= message.timestamp);
        list.insert(position, message.clone());
        let evicted = list.len().saturating_sub(MAX_MESSAGES_PER_PROJECT);
        let retained = position >= evicted;
        if evicted > 0 {
            list.drain(..evicted);
            debug!(project = %key, evicted, retained, "evicted oldest messages");
        }

        if let Some(project) = next.projects.iter_mut().find(|project| project.id == key)
            && message.timestamp >= project.created_at
            && project.last_activity.is_none_or(|last| last < message.timestamp)
        {
            project.last_activity = Some(message.timestamp);
        }

        let proposed = Proposed {
            entity: message.clone(),
            previous: None,
            document: next,
        };
        commit(&mut guard, &self.pipeline, ENTITY, &message.id, proposed).await?;
        debug!(id = %message.id, project = %key, "message appended");
        Ok(Appended {
            message,
            evicted,
            retained,
        })
    }

    /// Moves the message to `status` along the message transition table.
    pub async fn update_status(&self, id: &str, status: MessageStatus) -> Result<Message, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut message = find(&*guard.load()?, id).cloned().ok_or_else(|| not_found(id))?;
        message.status = status;
        self.replace(&mut guard, message).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut next = (*guard.load()?).clone();
        let mut removed = false;
        for list in next.messages.values_mut() {
            let before = list.len();
            list.retain(|message| message.id != id);
            removed |= list.len() != before;
        }
        if !removed {
            return Err(not_found(id));
        }
        next.messages.retain(|_, list| !list.is_empty());
        guard.save(next)?;
        info!(id = %id, "message deleted");
        Ok(())
    }

    /// Drops every message under `project_id` and returns how many there were.
    pub async fn clear(&self, project_id: &str) -> Result<usize, RepositoryError> {
        let mut guard = self.context.persistence.lock().await;
        let mut next = (*guard.load()?).clone();
        let Some(list) = next.messages.remove(project_id) else {
            return Ok(0);
        };
        guard.save(next)?;
        info!(project = %project_id, messages = list.len(), "messages cleared");
        Ok(list.len())
    }

    /// Case-insensitive match on content, optionally within one project.
    pub async fn search(&self, query: &str, project_id: Option<&str>) -> Result<Vec<Message>, RepositoryError> {
        let document = self.context.persistence.load().await?;
        Ok(document
            .messages
            .iter()
            .filter(|(key, _)| project_id.is_none_or(|wanted| wanted == key.as_str()))
            .flat_map(|(_, list)| list.iter())
            .filter(|message| contains_folded(&message.content, query))
            .cloned()
            .collect())
    }

    pub fn observe(&self, project_id: &str) -> DocumentWatch<Vec<Message>> {
        let key = project_id.to_string();
        self.context
            .persistence
            .observe_with(move |document: &Arc<Document>| document.messages.get(&key).cloned().unwrap_or_default())
    }

    async fn replace(&self, guard: &mut PersistenceGuard<'_>, message: Message) -> Result<Message, RepositoryError> {
        let mut next = (*guard.load()?).clone();
        let slot = next
            .messages
            .get_mut(&message.project_id)
            .and_then(|list| list.iter_mut().find(|existing| existing.id == message.id))
            .ok_or_else(|| not_found(&message.id))?;
        let previous = std::mem::replace(slot, message.clone());
        let proposed = Proposed {
            entity: message.clone(),
            previous: Some(previous),
            document: next,
        };
        commit(guard, &self.pipeline, ENTITY, &message.id, proposed).await?;
        info!(id = %message.id, status = ?message.status, "message updated");
        Ok(message)
    }
}

fn find<'a>(document: &'a Document, id: &str) -> Option<&'a Message> {
    document
        .messages
        .values()
        .flat_map(|list| list.iter())
        .find(|message| message.id == id)
}

fn owner_exists(document: &Document, message: &Message) -> ValidationResult {
    let key = message.project_id.as_str();
    ValidationResult::check(key == SYSTEM_MESSAGES_KEY || document.project(key).is_some(), || {
        ValidationError::relationship("projectId", format!("project '{key}' does not exist"))
    })
}

fn unique_id(document: &Document, message: &Message) -> ValidationResult {
    let count = document
        .messages
        .values()
        .flat_map(|list| list.iter())
        .filter(|existing| existing.id == message.id)
        .count();
    ValidationResult::check(count <= 1, || {
        ValidationError::business(format!("message id '{}' is already in use", message.id))
            .on("id")
            .with_code(DUPLICATE_ID)
    })
}

fn not_found(id: &str) -> RepositoryError {
    RepositoryError::EntityNotFound {
        entity: ENTITY,
        id: id.to_string(),
    }
}
