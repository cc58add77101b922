//! The backend's extra model paths config (`extra_models_config.yaml`).
//!
//! Points the backend at the model folders under the installation base path
//! and, when the user migrated from an existing install, at that install's
//! model folders too. Custom nodes bundled with the launcher are registered
//! in their own section before every server start.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Model folder names relative to `<base_path>/models/`.
pub const MODEL_FOLDERS: &[&str] = &[
    "checkpoints",
    "clip",
    "clip_vision",
    "configs",
    "controlnet",
    "diffusers",
    "diffusion_models",
    "embeddings",
    "gligen",
    "hypernetworks",
    "loras",
    "photomaker",
    "style_models",
    "text_encoders",
    "unet",
    "upscale_models",
    "vae",
    "vae_approx",
];

/// Directories created under a new installation's base path.
pub const BASE_SUBDIRECTORIES: &[&str] = &["user", "input", "output", "models", "custom_nodes"];

/// One named section of the config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPathSection {
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_nodes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_model_base: Option<String>,
    /// Folder name → path relative to `base_path`.
    #[serde(flatten)]
    pub folders: BTreeMap<String, String>,
}

impl ModelPathSection {
    fn with_model_folders(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_string_lossy().to_string(),
            is_default: None,
            custom_nodes: None,
            download_model_base: None,
            folders: MODEL_FOLDERS
                .iter()
                .map(|f| (f.to_string(), format!("models/{}/", f)))
                .collect(),
        }
    }
}

/// Custom nodes shipped inside the launcher's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionsSection {
    pub custom_nodes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraModelsConfig {
    pub desktop: ModelPathSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<ModelPathSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop_extensions: Option<ExtensionsSection>,
}

impl ExtraModelsConfig {
    /// Config for a new installation, optionally reusing a previous install's models.
    pub fn for_installation(base_path: &Path, migration_source: Option<&Path>) -> Self {
        let mut desktop = ModelPathSection::with_model_folders(base_path);
        desktop.is_default = Some(true);
        desktop.custom_nodes = Some("custom_nodes/".to_string());
        desktop.download_model_base = Some("models".to_string());

        Self {
            desktop,
            migration: migration_source.map(ModelPathSection::with_model_folders),
            desktop_extensions: None,
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        serde_yaml::from_str(&content).with_context(|| format!("Invalid model paths config {:?}", path))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).with_context(|| format!("Failed to write {:?}", path))?;
        log::info!("[server-config] Wrote {:?}", path);
        Ok(())
    }
}

/// Point the config at the bundled `custom_nodes_dir`, keeping everything else.
///
/// A missing config is recreated for `base_path` first.
pub fn register_bundled_custom_nodes(
    config_path: &Path,
    base_path: &Path,
    custom_nodes_dir: &Path,
) -> Result<()> {
    let mut config = if config_path.exists() {
        ExtraModelsConfig::read(config_path)?
    } else {
        log::warn!("[server-config] {:?} is missing; recreating it", config_path);
        ExtraModelsConfig::for_installation(base_path, None)
    };

    let extensions = ExtensionsSection {
        custom_nodes: custom_nodes_dir.to_string_lossy().to_string(),
    };
    if config.desktop_extensions.as_ref() == Some(&extensions) {
        return Ok(());
    }
    config.desktop_extensions = Some(extensions);
    config.write(config_path)
}

/// Create the standard directory layout under `base_path`.
pub fn create_base_layout(base_path: &Path) -> std::io::Result<()> {
    for dir in BASE_SUBDIRECTORIES {
        std::fs::create_dir_all(base_path.join(dir))?;
    }
    for folder in MODEL_FOLDERS {
        std::fs::create_dir_all(base_path.join("models").join(folder))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_without_migration() {
        let config = ExtraModelsConfig::for_installation(Path::new("/base"), None);
        assert_eq!(config.desktop.base_path, "/base");
        assert_eq!(config.desktop.is_default, Some(true));
        assert_eq!(
            config.desktop.folders.get("checkpoints").map(String::as_str),
            Some("models/checkpoints/")
        );
        assert!(config.migration.is_none());
        assert!(config.desktop_extensions.is_none());

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.starts_with("desktop:"));
        assert!(!yaml.contains("migration"));
    }

    #[test]
    fn test_config_roundtrip_with_migration() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cfg").join("extra_models_config.yaml");

        let config =
            ExtraModelsConfig::for_installation(Path::new("/base"), Some(Path::new("/old/install")));
        config.write(&path).unwrap();

        let loaded = ExtraModelsConfig::read(&path).unwrap();
        assert_eq!(loaded, config);
        let migration = loaded.migration.unwrap();
        assert_eq!(migration.base_path, "/old/install");
        assert_eq!(migration.is_default, None);
        assert_eq!(migration.folders.len(), MODEL_FOLDERS.len());
    }

    #[test]
    fn test_register_bundled_custom_nodes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("extra_models_config.yaml");
        let config =
            ExtraModelsConfig::for_installation(Path::new("/base"), Some(Path::new("/old/install")));
        config.write(&path).unwrap();

        let nodes = Path::new("/app/backend/custom_nodes");
        register_bundled_custom_nodes(&path, Path::new("/base"), nodes).unwrap();
        register_bundled_custom_nodes(&path, Path::new("/base"), nodes).unwrap();

        let loaded = ExtraModelsConfig::read(&path).unwrap();
        assert_eq!(loaded.desktop, config.desktop);
        assert_eq!(loaded.migration, config.migration);
        assert_eq!(
            loaded.desktop_extensions,
            Some(ExtensionsSection {
                custom_nodes: "/app/backend/custom_nodes".to_string()
            })
        );
        let yaml = std::fs::read_to_string(&path).unwrap();
        assert_eq!(yaml.matches("desktop_extensions:").count(), 1);
    }

    #[test]
    fn test_register_bundled_custom_nodes_recreates_missing_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cfg").join("extra_models_config.yaml");

        register_bundled_custom_nodes(&path, Path::new("/base"), Path::new("/app/nodes")).unwrap();

        let loaded = ExtraModelsConfig::read(&path).unwrap();
        assert_eq!(loaded.desktop.base_path, "/base");
        assert_eq!(loaded.desktop.is_default, Some(true));
        assert_eq!(
            loaded.desktop_extensions.map(|e| e.custom_nodes),
            Some("/app/nodes".to_string())
        );
    }

    #[test]
    fn test_create_base_layout() {
        let temp = TempDir::new().unwrap();
        create_base_layout(temp.path()).unwrap();
        for dir in BASE_SUBDIRECTORIES {
            assert!(temp.path().join(dir).is_dir());
        }
        assert!(temp.path().join("models").join("loras").is_dir());
    }
}
