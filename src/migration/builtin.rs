//! Migrations shipped with this build.

use tracing::debug;

use super::registry::MigrationRegistry;
use super::step::MigrationStep;
use crate::errors::RegistryError;
use crate::models::{Document, INITIAL_VERSION};

/// Registry holding every built-in migration up to
/// [`CURRENT_VERSION`](crate::models::CURRENT_VERSION).
pub fn registry() -> Result<MigrationRegistry, RegistryError> {
    let mut registry = MigrationRegistry::new();
    registry.register(backfill_project_activity())?;
    debug!(latest = registry.latest_version(), migrations = registry.len(), "built-in migrations registered");
    Ok(registry)
}

/// Version 1 to 2: messages are kept in timestamp order and every project
/// records the time of its newest message as `lastActivity`.
pub fn backfill_project_activity() -> MigrationStep {
    MigrationStep::new("backfill_project_activity", INITIAL_VERSION, 2, |mut doc: Document, progress| {
        let total = doc.messages.len() + doc.projects.len();
        let mut completed = 0;

        for (key, messages) in doc.messages.iter_mut() {
            messages.sort_by_key(|message| message.timestamp);
            completed += 1;
            progress.report(completed, total, &format!("ordered messages for {key}"));
        }

        for project in doc.projects.iter_mut() {
            let newest = doc
                .messages
                .get(&project.id)
                .and_then(|messages| messages.last())
                .map(|message| message.timestamp)
                .filter(|timestamp| *timestamp >= project.created_at);
            if let Some(newest) = newest {
                project.last_activity = Some(project.last_activity.map_or(newest, |current| current.max(newest)));
            }
            completed += 1;
            progress.report(completed, total, &format!("backfilled activity for {}", project.name));
        }
        Ok(doc)
    })
    .describe("Order messages by timestamp and backfill project activity")
    .reversible(true)
    .with_estimate(|doc| doc.messages.len() + doc.projects.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::registry::{Migration, NoProgress, ProgressSink};
    use crate::models::{CURRENT_VERSION, Message, MessageRole, Project};
    use chrono::Duration;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<(usize, usize)>>);

    impl ProgressSink for Recorder {
        fn report(&self, completed: usize, total: usize, _detail: &str) {
            self.0.lock().unwrap().push((completed, total));
        }
    }

    #[test]
    fn test_registry_reaches_current_version() {
        let registry = registry().unwrap();
        assert_eq!(registry.latest_version(), CURRENT_VERSION);
        assert_eq!(registry.find_path(INITIAL_VERSION, CURRENT_VERSION).len(), 1);
    }

    #[test]
    fn test_backfill_orders_messages_and_sets_activity() {
        let mut doc = Document::new();
        let project = Project::new("api", "p1", "/srv/api");
        let mut early = Message::new(project.id.clone(), MessageRole::User, "first");
        let mut late = Message::new(project.id.clone(), MessageRole::User, "second");
        early.timestamp = project.created_at + Duration::seconds(1);
        late.timestamp = project.created_at + Duration::seconds(5);
        doc.messages.insert(project.id.clone(), vec![late.clone(), early.clone()]);
        doc.projects.push(project);

        let recorder = Recorder(Mutex::new(Vec::new()));
        let migrated = backfill_project_activity().apply(doc, &recorder).unwrap();

        let key = migrated.projects[0].id.clone();
        assert_eq!(migrated.version, 2);
        assert_eq!(migrated.messages[&key][0].content, "first");
        assert_eq!(migrated.projects[0].last_activity, Some(late.timestamp));
        assert_eq!(recorder.0.lock().unwrap().last(), Some(&(2, 2)));
    }

    #[test]
    fn test_backfill_on_empty_document() {
        let migrated = backfill_project_activity().apply(Document::new(), &NoProgress).unwrap();
        assert_eq!(migrated.version, 2);
        assert!(migrated.projects.is_empty());
    }
}
