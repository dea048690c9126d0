use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::recovery::RecoveryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AbstoreConfig {
    pub database: Option<String>,
    pub create: Option<bool>,
    pub recovery: Option<RecoveryPolicy>,
}

impl AbstoreConfig {
    /// Database path from the config, or the default
    pub fn database_path(&self) -> PathBuf {
        self.database
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("abstore.toml")
}

pub fn default_database_path() -> PathBuf {
    PathBuf::from("abook.sqlite")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<AbstoreConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: AbstoreConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &AbstoreConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("abstore.toml"))).unwrap().is_none());
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abstore.toml");
        let config = AbstoreConfig {
            database: Some("books/abook.sqlite".to_string()),
            create: Some(true),
            recovery: Some(RecoveryPolicy::Recreate),
        };

        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.database_path(), PathBuf::from("books/abook.sqlite"));
        assert_eq!(loaded.create, Some(true));
        assert_eq!(loaded.recovery, Some(RecoveryPolicy::Recreate));
    }

    #[test]
    fn test_recovery_key_is_lowercase() {
        let config: AbstoreConfig = toml::from_str("recovery = \"abort\"").unwrap();
        assert_eq!(config.recovery, Some(RecoveryPolicy::Abort));
        assert_eq!(config.database_path(), default_database_path());
    }
}
