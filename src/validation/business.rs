use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use super::{INVALID_STATE_TRANSITION, ValidationError, ValidationResult};
use crate::models::{Identity, Message, MessageStatus, Project, ProjectStatus, ServerProfile};

/// Lookup table of legal `current -> next` state changes.
#[derive(Debug, Clone)]
pub struct TransitionTable<S> {
    allowed: HashMap<S, HashSet<S>>,
}

impl<S> TransitionTable<S>
where
    S: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            allowed: HashMap::new(),
        }
    }

    pub fn allow(mut self, from: S, to: &[S]) -> Self {
        self.allowed.entry(from).or_default().extend(to.iter().copied());
        self
    }

    pub fn allows(&self, from: S, to: S) -> bool {
        self.allowed
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    pub fn next_states(&self, from: S) -> Vec<S> {
        self.allowed
            .get(&from)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Staying in the same state is always legal.
    pub fn check(&self, field: &str, from: S, to: S) -> ValidationResult {
        ValidationResult::check(from == to || self.allows(from, to), || {
            ValidationError::business(format!("{field} cannot change from {from:?} to {to:?}"))
                .on(field)
                .with_code(INVALID_STATE_TRANSITION)
        })
    }
}

impl<S> Default for TransitionTable<S>
where
    S: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

pub static PROJECT_TRANSITIONS: Lazy<TransitionTable<ProjectStatus>> = Lazy::new(|| {
    TransitionTable::new()
        .allow(
            ProjectStatus::Active,
            &[ProjectStatus::Paused, ProjectStatus::Archived],
        )
        .allow(
            ProjectStatus::Paused,
            &[ProjectStatus::Active, ProjectStatus::Archived],
        )
        .allow(ProjectStatus::Archived, &[ProjectStatus::Active])
});

pub static MESSAGE_TRANSITIONS: Lazy<TransitionTable<MessageStatus>> = Lazy::new(|| {
    TransitionTable::new()
        .allow(
            MessageStatus::Pending,
            &[MessageStatus::Sent, MessageStatus::Failed],
        )
        .allow(
            MessageStatus::Sent,
            &[MessageStatus::Delivered, MessageStatus::Failed],
        )
        .allow(MessageStatus::Failed, &[MessageStatus::Pending])
});

pub fn project_transition(before: &Project, after: &Project) -> ValidationResult {
    PROJECT_TRANSITIONS.check("status", before.status, after.status)
}

pub fn message_transition(before: &Message, after: &Message) -> ValidationResult {
    MESSAGE_TRANSITIONS.check("status", before.status, after.status)
}

/// An archived project carries its archive time; a live one does not.
pub fn project_state_coherence(project: &Project) -> ValidationResult {
    let archived = project.status == ProjectStatus::Archived;
    let stamp = ValidationResult::check(archived == project.archived_at.is_some(), || {
        let message = if archived {
            "archived project must record archivedAt"
        } else {
            "only archived projects may record archivedAt"
        };
        ValidationError::business(message).on("archivedAt")
    });
    let activity = ValidationResult::check(
        project
            .last_activity
            .is_none_or(|last| last >= project.created_at),
        || ValidationError::business("lastActivity precedes createdAt").on("lastActivity"),
    );
    let archive_order = ValidationResult::check(
        project
            .archived_at
            .is_none_or(|at| at >= project.created_at),
        || ValidationError::business("archivedAt precedes createdAt").on("archivedAt"),
    );
    stamp.and(activity).and(archive_order)
}

pub fn identity_timestamps(identity: &Identity) -> ValidationResult {
    ValidationResult::check(
        identity
            .last_used
            .is_none_or(|used| used >= identity.created_at),
        || ValidationError::business("lastUsed precedes createdAt").on("lastUsed"),
    )
}

pub fn server_profile_timestamps(profile: &ServerProfile) -> ValidationResult {
    ValidationResult::check(
        profile
            .last_connected
            .is_none_or(|connected| connected >= profile.created_at),
        || ValidationError::business("lastConnected precedes createdAt").on("lastConnected"),
    )
}

/// Messages under one key must be in non-decreasing timestamp order.
pub fn message_ordering(key: &str, messages: &[Message]) -> ValidationResult {
    let out_of_order = messages
        .windows(2)
        .position(|pair| pair[1].timestamp < pair[0].timestamp);
    ValidationResult::check(out_of_order.is_none(), || {
        let index = out_of_order.map(|i| i + 1).unwrap_or_default();
        ValidationError::business(format!(
            "messages for '{key}' are out of timestamp order at position {index}"
        ))
        .on(format!("messages.{key}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;
    use chrono::Duration;

    #[test]
    fn test_transition_table_rejects_unlisted_moves() {
        assert!(PROJECT_TRANSITIONS.allows(ProjectStatus::Active, ProjectStatus::Archived));
        assert!(!PROJECT_TRANSITIONS.allows(ProjectStatus::Archived, ProjectStatus::Paused));

        let result = MESSAGE_TRANSITIONS.check("status", MessageStatus::Delivered, MessageStatus::Pending);
        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, crate::validation::ErrorType::Business);
        assert!(errors[0].has_code(INVALID_STATE_TRANSITION));
    }

    #[test]
    fn test_same_state_is_allowed() {
        assert!(
            MESSAGE_TRANSITIONS
                .check("status", MessageStatus::Delivered, MessageStatus::Delivered)
                .is_success()
        );
    }

    #[test]
    fn test_archived_project_needs_timestamp() {
        let mut project = Project::new("api", "p1", "/srv/api");
        project.status = ProjectStatus::Archived;
        assert!(!project_state_coherence(&project).is_success());

        project.archived_at = Some(project.created_at + Duration::seconds(1));
        assert!(project_state_coherence(&project).is_success());
    }

    #[test]
    fn test_message_ordering_detects_regression() {
        let first = Message::new("p1", MessageRole::User, "one");
        let mut second = Message::new("p1", MessageRole::User, "two");
        second.timestamp = first.timestamp - Duration::seconds(5);
        assert!(!message_ordering("p1", &[first.clone(), second.clone()]).is_success());
        assert!(message_ordering("p1", &[second, first]).is_success());
    }
}
