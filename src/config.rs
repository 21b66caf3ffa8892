use crate::paths::StorePaths;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::migration::history::DEFAULT_HISTORY_LIMIT;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub document_key: String,
    pub history_key: String,
    pub history_limit: usize,
    pub max_backups: usize,
    pub validation_timeout_ms: u64,
    pub backup_before_migration: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            document_key: "app_document".to_string(),
            history_key: "migration_history".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_backups: 10,
            validation_timeout_ms: 2000,
            backup_before_migration: true,
        }
    }
}

impl StoreConfig {
    pub fn load(paths: &StorePaths) -> Result<Self> {
        if !paths.config_path.exists() {
            return Ok(StoreConfig::default());
        }
        let data = fs::read_to_string(&paths.config_path)?;
        let config: StoreConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Invalid config {}: {e}", paths.config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, paths: &StorePaths) -> Result<()> {
        self.validate()?;
        if let Some(parent) = paths.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&paths.config_path, data)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let perms = Permissions::from_mode(0o600);
            fs::set_permissions(&paths.config_path, perms)?;
        }
        Ok(())
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_key("document_key", &self.document_key)?;
        validate_key("history_key", &self.history_key)?;
        if self.document_key == self.history_key {
            return Err(anyhow!("document_key and history_key must differ"));
        }
        if self.history_limit == 0 {
            return Err(anyhow!("history_limit must be at least 1"));
        }
        if self.max_backups == 0 {
            return Err(anyhow!("max_backups must be at least 1"));
        }
        if self.validation_timeout_ms == 0 {
            return Err(anyhow!("validation_timeout_ms must be at least 1"));
        }
        Ok(())
    }
}

fn validate_key(field: &str, key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(anyhow!("{field} cannot be blank"));
    }
    if key.contains("..") || key.contains('/') || key.contains('\\') {
        return Err(anyhow!("{field} cannot contain path separators"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(anyhow!("{field} contains invalid characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_absent() {
        let temp = tempdir().unwrap();
        let paths = StorePaths::from_base(temp.path().to_path_buf());
        let config = StoreConfig::load(&paths).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.validation_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let temp = tempdir().unwrap();
        let paths = StorePaths::from_base(temp.path().to_path_buf());
        fs::write(&paths.config_path, r#"{"max_backups": 3}"#).unwrap();
        let config = StoreConfig::load(&paths).unwrap();
        assert_eq!(config.max_backups, 3);
        assert_eq!(config.document_key, "app_document");

        let mut changed = config.clone();
        changed.backup_before_migration = false;
        changed.save(&paths).unwrap();
        assert_eq!(StoreConfig::load(&paths).unwrap(), changed);
    }

    #[test]
    fn test_rejects_path_like_keys_and_zero_limits() {
        let mut config = StoreConfig::default();
        config.document_key = "../escape".to_string();
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.history_limit = 0;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.history_key = config.document_key.clone();
        assert!(config.validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_config_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempdir().unwrap();
        let paths = StorePaths::from_base(temp.path().to_path_buf());
        StoreConfig::default().save(&paths).unwrap();
        let mode = fs::metadata(&paths.config_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
