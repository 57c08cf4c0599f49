pub mod handlers;

use crate::orchestrator::types::BacktestParameters;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("invalid preset name '{0}' (use 1-64 letters, digits, '-' or '_')")]
    InvalidName(String),
    #[error("preset not found: {0}")]
    NotFound(String),
    #[error("invalid preset: {0}")]
    Yaml(String),
    #[error("preset storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// A named parameter set as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BacktestParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresetInfo {
    pub name: String,
    pub description: Option<String>,
}

/// YAML presets under one directory, one `<name>.yaml` per preset.
#[derive(Debug, Clone)]
pub struct PresetStore {
    dir: PathBuf,
}

impl PresetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> Result<PathBuf, PresetError> {
        if !is_valid_name(name) {
            return Err(PresetError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{}.yaml", name)))
    }

    pub async fn list(&self) -> Result<Vec<PresetInfo>, PresetError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut presets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_name(name) {
                continue;
            }

            let description = match self.get(name).await {
                Ok(preset) => preset.description,
                Err(e) => {
                    tracing::warn!("Skipping preset {}: {}", name, e);
                    continue;
                }
            };
            presets.push(PresetInfo {
                name: name.to_string(),
                description,
            });
        }

        presets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(presets)
    }

    pub async fn get(&self, name: &str) -> Result<Preset, PresetError> {
        Self::parse(&self.get_raw(name).await?)
    }

    pub async fn get_raw(&self, name: &str) -> Result<String, PresetError> {
        let path = self.path(name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PresetError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate and store a preset document, keeping the caller's formatting.
    pub async fn save(&self, name: &str, yaml: &str) -> Result<Preset, PresetError> {
        let path = self.path(name)?;
        let preset = Self::parse(yaml)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, yaml).await?;
        tracing::info!("Saved preset {} to {}", name, path.display());
        Ok(preset)
    }

    fn parse(yaml: &str) -> Result<Preset, PresetError> {
        let preset: Preset =
            serde_yaml::from_str(yaml).map_err(|e| PresetError::Yaml(e.to_string()))?;
        preset.parameters.validate().map_err(PresetError::Yaml)?;
        Ok(preset)
    }
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const TIGHT: &str = "description: Tight stops for NQ\nparameters:\n  tp_ticks: 12\n  sl_ticks: 8\n  trailing_stop: true\n  trailing_stop_ticks: 4\n";

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("nq_tight-1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("../etc/passwd"));
        assert!(!is_valid_name("a.b"));
        assert!(!is_valid_name(&"x".repeat(65)));
    }

    #[tokio::test]
    async fn test_save_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::new(dir.path().join("strategies"));

        let saved = store.save("nq_tight", TIGHT).await.unwrap();
        assert_eq!(saved.parameters.tp_ticks, 12);
        // Omitted fields take the defaults
        assert_eq!(saved.parameters.tick_size, dec!(0.25));

        let loaded = store.get("nq_tight").await.unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.get_raw("nq_tight").await.unwrap(), TIGHT);

        let list = store.list().await.unwrap();
        assert_eq!(
            list,
            vec![PresetInfo {
                name: "nq_tight".to_string(),
                description: Some("Tight stops for NQ".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_invalid_documents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::new(dir.path());

        assert!(matches!(
            store.save("bad", "parameters:\n  sl_ticks: 0\n").await,
            Err(PresetError::Yaml(_))
        ));
        assert!(matches!(
            store.save("bad", "parameters: not-a-map\n").await,
            Err(PresetError::Yaml(_))
        ));
        assert!(matches!(
            store.save("../up", TIGHT).await,
            Err(PresetError::InvalidName(_))
        ));
        assert!(matches!(
            store.get("missing").await,
            Err(PresetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::new(dir.path().join("none"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
