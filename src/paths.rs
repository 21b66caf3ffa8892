use anyhow::{Result, anyhow};
use directories::BaseDirs;
use std::path::{Path, PathBuf};

/// On-disk layout of one store.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub config_path: PathBuf,
}

impl StorePaths {
    /// Resolves `store` against the working directory, or falls back to
    /// `~/.docvault`.
    pub fn new(store: Option<&Path>) -> Result<Self> {
        let base_dir = match store {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => std::env::current_dir()?.join(path),
            None => {
                let base_dirs =
                    BaseDirs::new().ok_or_else(|| anyhow!("Unable to resolve home directory"))?;
                base_dirs.home_dir().join(".docvault")
            }
        };
        if base_dir.is_file() {
            return Err(anyhow!(
                "Store path {} is a file, expected a directory",
                base_dir.display()
            ));
        }
        Ok(Self::from_base(base_dir))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        Self {
            data_dir: base_dir.join("data"),
            backup_dir: base_dir.join("backups"),
            config_path: base_dir.join("config.json"),
            base_dir,
        }
    }

    pub fn ensure_base_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let perms = Permissions::from_mode(0o700);
            std::fs::set_permissions(&self.base_dir, perms)?;
        }
        Ok(())
    }
}
