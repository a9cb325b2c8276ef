//! Server configuration.
//!
//! Loaded from a TOML file; every section is optional. A missing `[llm]`
//! section selects the offline keyword classifier.

use std::path::Path;

use anyhow::Context;
use mnemos_llm::LlmConfig;
use mnemos_memory::{EmbeddingConfig, MemoryConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Classifier backend for memory detection
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins; empty allows any
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// On Unix the file must be a regular file that is not world-writable,
    /// and a file holding an API key must not be world-readable.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        validate_config_file_permissions(path)?;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;
        config
            .memory
            .validate()
            .with_context(|| format!("Invalid [memory] settings in '{}'", path.display()))?;

        let llm_key = config.llm.as_ref().is_some_and(|l| l.api_key.is_some());
        if llm_key || config.embedding.api_key.is_some() {
            warn!(
                "API key found in config file '{}'. Prefer MNEMOS_LLM_API_KEY, \
                 MNEMOS_EMBEDDING_API_KEY or OPENAI_API_KEY.",
                path.display()
            );
        }

        Ok(config)
    }
}

#[cfg(unix)]
fn validate_config_file_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

    if !metadata.is_file() {
        anyhow::bail!(
            "Config path '{}' is not a regular file. Symlinks and directories are not allowed.",
            path.display()
        );
    }

    let permission_bits = metadata.permissions().mode() & 0o777;
    if permission_bits & 0o002 != 0 {
        anyhow::bail!(
            "Config file '{}' is world-writable (mode {:04o}). Fix with: chmod o-w {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    let content = std::fs::read_to_string(path).unwrap_or_default();
    let has_api_key = content.contains("api_key");
    if has_api_key && permission_bits & 0o004 != 0 {
        anyhow::bail!(
            "Config file '{}' contains an API key but is world-readable (mode {:04o}). Fix with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    Ok(())
}
