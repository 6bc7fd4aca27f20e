// ============================================================================
// File: qemu-runner/src/qemu/config.rs
// ----------------------------------------------------------------------------
// Per-image machine configuration, loaded from <image_dir>/<image>.qemu.json
// ============================================================================

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Suffix of the per-image descriptor
pub const CONFIG_SUFFIX: &str = ".qemu.json";

/// How read errors on the machine descriptor are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigReadPolicy {
    /// A missing descriptor means "all defaults"; any other read error is fatal
    #[default]
    DefaultsWhenMissing,
    /// The descriptor must exist and be readable
    RequireFile,
}

/// Descriptor as written on disk; every field optional
#[derive(Debug, Default, Deserialize)]
struct MachineConfigFile {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    base_image: Option<String>,
    #[serde(default)]
    base_image_format: Option<String>,
    #[serde(default)]
    seed_image: Option<String>,
}

/// Resolved per-image settings; immutable once loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineConfig {
    /// SSH user inside the guest
    pub username: String,
    /// Read-only base image backing the ephemeral disk
    pub base_image: PathBuf,
    /// Format of the base image (`qcow2` or `raw`)
    pub base_image_format: String,
    /// Seed/config drive attached when launching QEMU directly
    pub seed_image: PathBuf,
}

impl MachineConfig {
    /// Path of the descriptor for `image`
    pub fn config_path(image_dir: &Path, image: &str) -> PathBuf {
        image_dir.join(format!("{image}{CONFIG_SUFFIX}"))
    }

    /// Load and resolve the descriptor for `image`
    pub async fn load(
        image_dir: &Path,
        image: &str,
        policy: ConfigReadPolicy,
    ) -> EngineResult<Self> {
        let path = Self::config_path(image_dir, image);
        validate_image_name(image).map_err(|details| EngineError::Config {
            path: path.clone(),
            details,
        })?;

        let raw = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound
                && policy == ConfigReadPolicy::DefaultsWhenMissing =>
            {
                info!("No machine config at {}, using defaults", path.display());
                None
            }
            Err(e) => {
                return Err(EngineError::Config {
                    path,
                    details: format!("Failed to read machine config: {e}"),
                });
            }
        };

        let file = match raw {
            Some(bytes) => {
                serde_json::from_slice::<MachineConfigFile>(&bytes).map_err(|e| {
                    EngineError::Config {
                        path: path.clone(),
                        details: format!("Invalid machine config JSON: {e}"),
                    }
                })?
            }
            None => MachineConfigFile::default(),
        };

        let config = Self::resolve(file, image_dir, image);
        debug!("Resolved machine config for {}: {:?}", image, config);
        Ok(config)
    }

    fn resolve(file: MachineConfigFile, image_dir: &Path, image: &str) -> Self {
        let username = non_empty(file.username).unwrap_or_else(|| "root".to_string());

        let base_image = non_empty(file.base_image)
            .map(|p| image_dir.join(p))
            .unwrap_or_else(|| image_dir.join(format!("{image}.img")));

        let base_image_format = non_empty(file.base_image_format).unwrap_or_else(|| {
            if base_image.to_string_lossy().ends_with(".qcow2") {
                "qcow2".to_string()
            } else {
                "raw".to_string()
            }
        });

        let seed_image = non_empty(file.seed_image)
            .map(|p| image_dir.join(p))
            .unwrap_or_else(|| image_dir.join(format!("{image}.seed.img")));

        Self {
            username,
            base_image,
            base_image_format,
            seed_image,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Image names are plain file stems inside the image directory
fn validate_image_name(image: &str) -> Result<(), String> {
    if image.is_empty() {
        return Err("No image configured for this pipeline".to_string());
    }
    if image.contains('/') || image.contains('\\') || image == "." || image == ".." {
        return Err(format!("Invalid image name '{image}'"));
    }
    Ok(())
}
