use once_cell::sync::Lazy;

use super::business;
use super::rules::{self, MAX_MESSAGE_LEN, MAX_PUBLIC_KEY_LEN};
use super::{ValidationError, ValidationResult, Validator};
use crate::models::{Identity, Message, Project, ServerProfile};

static IDENTITY: Lazy<Validator<Identity>> = Lazy::new(|| {
    Validator::new()
        .rule(|i: &Identity| rules::entity_id("id", &i.id))
        .rule(|i: &Identity| rules::display_name("name", &i.name))
        .rule(|i: &Identity| rules::length("publicKey", &i.public_key, 1, MAX_PUBLIC_KEY_LEN))
        .rule(public_key_matches_type)
        .rule_if(
            |i: &Identity| i.private_key_ref.is_some(),
            |i: &Identity| {
                rules::not_blank("privateKeyRef", i.private_key_ref.as_deref().unwrap_or_default())
            },
        )
        .rule(business::identity_timestamps)
});

static SERVER_PROFILE: Lazy<Validator<ServerProfile>> = Lazy::new(|| {
    Validator::new()
        .rule(|p: &ServerProfile| rules::entity_id("id", &p.id))
        .rule(|p: &ServerProfile| rules::display_name("name", &p.name))
        .rule(|p: &ServerProfile| rules::hostname("host", &p.host))
        .rule(|p: &ServerProfile| rules::range("port", p.port, 1, u16::MAX))
        .rule(|p: &ServerProfile| rules::username("username", &p.username))
        .rule(|p: &ServerProfile| rules::entity_id("sshIdentityId", &p.ssh_identity_id))
        .rule(business::server_profile_timestamps)
});

static PROJECT: Lazy<Validator<Project>> = Lazy::new(|| {
    Validator::new()
        .rule(|p: &Project| rules::entity_id("id", &p.id))
        .rule(|p: &Project| rules::display_name("name", &p.name))
        .rule(|p: &Project| rules::entity_id("serverProfileId", &p.server_profile_id))
        .rule(|p: &Project| rules::remote_path("remotePath", &p.remote_path))
        .rule(business::project_state_coherence)
});

static MESSAGE: Lazy<Validator<Message>> = Lazy::new(|| {
    Validator::new()
        .rule(|m: &Message| rules::entity_id("id", &m.id))
        .rule(|m: &Message| rules::not_blank("content", &m.content))
        .rule(|m: &Message| rules::length("content", &m.content, 0, MAX_MESSAGE_LEN))
        .rule(|m: &Message| rules::not_blank("projectId", &m.project_id))
});

pub fn identity() -> &'static Validator<Identity> {
    &IDENTITY
}

pub fn server_profile() -> &'static Validator<ServerProfile> {
    &SERVER_PROFILE
}

pub fn project() -> &'static Validator<Project> {
    &PROJECT
}

pub fn message() -> &'static Validator<Message> {
    &MESSAGE
}

pub fn validate_identity(value: &Identity) -> ValidationResult {
    IDENTITY.validate(value)
}

pub fn validate_server_profile(value: &ServerProfile) -> ValidationResult {
    SERVER_PROFILE.validate(value)
}

pub fn validate_project(value: &Project) -> ValidationResult {
    PROJECT.validate(value)
}

pub fn validate_message(value: &Message) -> ValidationResult {
    MESSAGE.validate(value)
}

fn public_key_matches_type(identity: &Identity) -> ValidationResult {
    let algorithm = identity.public_key.split_whitespace().next().unwrap_or_default();
    let prefixes = identity.key_type.public_key_prefixes();
    ValidationResult::check(prefixes.contains(&algorithm), || {
        ValidationError::field(
            "publicKey",
            format!(
                "public key must be an OpenSSH line starting with one of: {}",
                prefixes.join(", ")
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeyType, MessageRole};

    const ED25519_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGq3 dev@laptop";

    #[test]
    fn test_valid_identity() {
        let identity = Identity::new("Dev", KeyType::Ed25519, ED25519_KEY);
        assert!(validate_identity(&identity).is_success());
    }

    #[test]
    fn test_identity_key_type_mismatch() {
        let identity = Identity::new("Dev", KeyType::Rsa, ED25519_KEY);
        let result = validate_identity(&identity);
        assert_eq!(result.errors()[0].field.as_deref(), Some("publicKey"));
    }

    #[test]
    fn test_blank_private_key_ref_is_checked_only_when_present() {
        let mut identity = Identity::new("Dev", KeyType::Ed25519, ED25519_KEY);
        assert!(validate_identity(&identity).is_success());
        identity.private_key_ref = Some("  ".to_string());
        assert!(!validate_identity(&identity).is_success());
    }

    #[test]
    fn test_server_profile_collects_all_field_errors() {
        let mut profile = ServerProfile::new("", "bad host", "9user", "i1");
        profile.port = 0;
        let fields: Vec<_> = validate_server_profile(&profile)
            .into_errors()
            .into_iter()
            .filter_map(|e| e.field)
            .collect();
        assert!(fields.contains(&"name".to_string()));
        assert!(fields.contains(&"host".to_string()));
        assert!(fields.contains(&"port".to_string()));
        assert!(fields.contains(&"username".to_string()));
    }

    #[test]
    fn test_message_requires_content() {
        let message = Message::new("p1", MessageRole::User, "   ");
        assert!(!validate_message(&message).is_success());
    }

    #[test]
    fn test_project_requires_absolute_path() {
        let project = Project::new("api", "p1", "srv/api");
        assert!(!validate_project(&project).is_success());
    }
}
