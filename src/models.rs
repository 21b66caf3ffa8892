use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Schema version of a freshly created document.
pub const INITIAL_VERSION: u32 = 1;
/// Schema version this build writes after running the built-in migrations.
pub const CURRENT_VERSION: u32 = 2;

/// Message key that holds application-level messages not tied to a project.
pub const SYSTEM_MESSAGES_KEY: &str = "system";

pub const MAX_IDENTITIES: usize = 50;
pub const MAX_SERVER_PROFILES: usize = 100;
pub const MAX_PROJECTS: usize = 200;
pub const MAX_MESSAGES_PER_PROJECT: usize = 1000;
pub const MAX_TOTAL_MESSAGES: usize = 10_000;

fn default_version() -> u32 {
    INITIAL_VERSION
}

fn default_port() -> u16 {
    22
}

/// The root aggregate. Every collection is replaced wholesale on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub server_profiles: Vec<ServerProfile>,
    #[serde(default)]
    pub projects: Vec<Project>,
    /// Project id (or [`SYSTEM_MESSAGES_KEY`]) to messages in timestamp order.
    #[serde(default)]
    pub messages: BTreeMap<String, Vec<Message>>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    #[serde(default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
}

impl Document {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: INITIAL_VERSION,
            identities: Vec::new(),
            server_profiles: Vec::new(),
            projects: Vec::new(),
            messages: BTreeMap::new(),
            metadata: DocumentMetadata {
                created_at: now,
                app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                extra: BTreeMap::new(),
            },
            last_modified: now,
        }
    }

    pub fn identity(&self, id: &str) -> Option<&Identity> {
        self.identities.iter().find(|identity| identity.id == id)
    }

    pub fn server_profile(&self, id: &str) -> Option<&ServerProfile> {
        self.server_profiles.iter().find(|profile| profile.id == id)
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|project| project.id == id)
    }

    pub fn total_messages(&self) -> usize {
        self.messages.values().map(Vec::len).sum()
    }

    pub fn counts(&self) -> EntityCounts {
        EntityCounts {
            identities: self.identities.len(),
            server_profiles: self.server_profiles.len(),
            projects: self.projects.len(),
            messages: self.total_messages(),
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityCounts {
    pub identities: usize,
    pub server_profiles: usize,
    pub projects: usize,
    pub messages: usize,
}

impl fmt::Display for EntityCounts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} identities, {} server profiles, {} projects, {} messages",
            self.identities, self.server_profiles, self.projects, self.messages
        )
    }
}

/// Free-form document metadata. Keys written by newer schema versions are kept
/// in `extra` so an older build round-trips them untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            app_version: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ed25519,
    Ecdsa,
    Rsa,
}

impl KeyType {
    /// Algorithm prefixes accepted in an OpenSSH public key line.
    pub fn public_key_prefixes(&self) -> &'static [&'static str] {
        match self {
            KeyType::Ed25519 => &["ssh-ed25519"],
            KeyType::Ecdsa => &[
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "ecdsa-sha2-nistp521",
            ],
            KeyType::Rsa => &["ssh-rsa", "rsa-sha2-256", "rsa-sha2-512"],
        }
    }
}

/// An SSH identity. Only the public half and an opaque reference to the
/// private key live in the document; key material belongs to the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub key_type: KeyType,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(name: impl Into<String>, key_type: KeyType, public_key: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            name: name.into(),
            key_type,
            public_key: public_key.into(),
            private_key_ref: None,
            created_at: Utc::now(),
            last_used: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub ssh_identity_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

impl ServerProfile {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        ssh_identity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_entity_id(),
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            ssh_identity_id: ssh_identity_id.into(),
            created_at: Utc::now(),
            last_connected: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Paused,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub server_profile_id: String,
    pub remote_path: String,
    #[serde(default)]
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        server_profile_id: impl Into<String>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            id: new_entity_id(),
            name: name.into(),
            server_profile_id: server_profile_id.into(),
            remote_path: remote_path.into(),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
            last_activity: None,
            archived_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    #[default]
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    pub fn new(project_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            project_id: project_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            status: MessageStatus::default(),
        }
    }
}

pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_is_initial_version() {
        let doc = Document::new();
        assert_eq!(doc.version, INITIAL_VERSION);
        assert_eq!(doc.counts(), EntityCounts::default());
    }

    #[test]
    fn test_deserialize_fills_defaults_and_ignores_unknown_fields() {
        let json = r#"{
            "version": 1,
            "serverProfiles": [{
                "id": "p1",
                "name": "prod",
                "host": "example.com",
                "username": "deploy",
                "sshIdentityId": "i1",
                "createdAt": "2024-01-01T00:00:00Z",
                "futureField": true
            }],
            "someLaterCollection": []
        }"#;

        let doc: Document = serde_json::from_str(json).unwrap();
        assert_eq!(doc.server_profiles[0].port, 22);
        assert!(doc.identities.is_empty());
        assert!(doc.messages.is_empty());
    }

    #[test]
    fn test_metadata_keeps_unknown_keys() {
        let json = r#"{"version": 2, "metadata": {"createdAt": "2024-01-01T00:00:00Z", "theme": "dark"}}"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert_eq!(
            doc.metadata.extra.get("theme"),
            Some(&serde_json::Value::String("dark".to_string()))
        );

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["metadata"]["theme"], "dark");
    }

    #[test]
    fn test_camel_case_field_names() {
        let profile = ServerProfile::new("prod", "example.com", "deploy", "i1");
        let value = serde_json::to_value(&profile).unwrap();
        assert!(value.get("sshIdentityId").is_some());
        assert!(value.get("ssh_identity_id").is_none());
    }
}
