use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::ServerConfig, validation::ServerConfigValidator};

/// Load and validate configuration from a file using the config crate.
/// Supports YAML, JSON and TOML, chosen by extension.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    let config = load_config_sync(config_path)?;
    ServerConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Load configuration synchronously, without validation.
///
/// `SWITCHYARD_`-prefixed environment variables override file values, e.g.
/// `SWITCHYARD_LISTEN_ADDR=0.0.0.0:80`.
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(Environment::with_prefix("SWITCHYARD").try_parsing(true))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

/// Load configuration without validation (used by the `validate` command,
/// which reports every problem itself)
pub async fn load_config_unchecked(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}
