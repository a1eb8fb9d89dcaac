//! Configuration loading.
//!
//! Sources, later wins:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, or `config.toml` in the platform config dir)
//! 3. `NODEIMAGE_*` environment variables

pub mod schema;

pub use schema::{Config, DatabaseConfig, HttpConfig, SecurityConfig};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "NODEIMAGE";

/// `config.toml` under the per-user config directory, if one can be determined.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "nodeimage", "nodeimage-auth")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load, apply environment overrides and validate.
///
/// An explicit path must exist. The default path is optional; when it is
/// missing, built-in defaults are used.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => read_file(&path)?,
            _ => {
                tracing::debug!("no config file found, using defaults");
                Config::default()
            }
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Whether the effective environment is `production`, judged before logging
/// exists. Reads the same sources as [`load`] but skips validation, and
/// treats an unreadable file as absent.
pub fn environment_is_production<F>(path: Option<&Path>, lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = path
        .map(Path::to_path_buf)
        .or_else(default_config_path)
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|raw| toml::from_str::<Config>(&raw).ok())
        .unwrap_or_default();
    // ENVIRONMENT is applied first, so a later bad value does not hide it.
    let _ = apply_env_overrides(&mut config, lookup);
    config.is_production()
}

fn read_file(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    tracing::info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))
}

/// Apply `NODEIMAGE_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| {
        let key = format!("{ENV_PREFIX}_{suffix}");
        lookup(&key)
            .filter(|v| !v.trim().is_empty())
            .map(|v| (key, v))
    };

    if let Some((_, v)) = var("ENVIRONMENT") {
        config.environment = v.trim().to_string();
    }
    if let Some((_, v)) = var("HTTP_HOST") {
        config.http.host = v.trim().to_string();
    }
    if let Some((k, v)) = var("HTTP_PORT") {
        config.http.port = parse_env(&k, &v)?;
    }
    if let Some((_, v)) = var("HTTP_ALLOWED_ORIGINS") {
        config.http.allowed_origins = v
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some((_, v)) = var("DATABASE_PATH") {
        config.database.path = PathBuf::from(v.trim());
    }
    if let Some((_, v)) = var("ACCESS_SECRET") {
        config.security.access_secret = v;
    }
    if let Some((_, v)) = var("SIGNATURE_SECRET") {
        config.security.signature_secret = v;
    }
    if let Some((k, v)) = var("ACCESS_TTL_SECS") {
        config.security.access_ttl_secs = parse_env(&k, &v)?;
    }
    if let Some((k, v)) = var("REFRESH_TTL_SECS") {
        config.security.refresh_ttl_secs = parse_env(&k, &v)?;
    }
    if let Some((k, v)) = var("MAX_SESSIONS") {
        config.security.max_sessions = parse_env(&k, &v)?;
    }
    Ok(())
}
