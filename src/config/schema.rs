use crate::security::password::PasswordParams;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Secrets shorter than this still load, with a warning.
pub const RECOMMENDED_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `production` switches logging to plain `info`; anything else is treated
    /// as a development environment. Read from the file or
    /// `NODEIMAGE_ENVIRONMENT` before logging starts.
    pub environment: String,
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub password: PasswordParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".into(),
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            security: SecurityConfig::default(),
            password: PasswordParams::default(),
        }
    }
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let sec = &self.security;
        if sec.access_secret.is_empty() {
            anyhow::bail!("security.access_secret must be set");
        }
        if sec.signature_secret.is_empty() {
            anyhow::bail!("security.signature_secret must be set");
        }
        if sec.max_sessions == 0 {
            anyhow::bail!("security.max_sessions must be at least 1");
        }
        if sec.access_ttl_secs == 0 || sec.refresh_ttl_secs == 0 {
            anyhow::bail!("token lifetimes must be non-zero");
        }
        self.password
            .validate()
            .map_err(|e| anyhow::anyhow!("password: {e}"))?;
        if self.http.max_body_bytes == 0 {
            anyhow::bail!("http.max_body_bytes must be non-zero");
        }

        for (name, secret) in [
            ("access_secret", &sec.access_secret),
            ("signature_secret", &sec.signature_secret),
        ] {
            if secret.len() < RECOMMENDED_SECRET_BYTES {
                tracing::warn!(
                    secret = name,
                    min_bytes = RECOMMENDED_SECRET_BYTES,
                    "signing secret is shorter than recommended"
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            allowed_origins: Vec::new(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("nodeimage.db"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub access_secret: String,
    pub signature_secret: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub max_sessions: usize,
    pub refresh_token_bytes: usize,
    pub signature_max_age_secs: u64,
    pub signature_max_future_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            access_secret: String::new(),
            signature_secret: String::new(),
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 30 * 24 * 60 * 60,
            max_sessions: 10,
            refresh_token_bytes: 64,
            signature_max_age_secs: 300,
            signature_max_future_secs: 120,
        }
    }
}

impl SecurityConfig {
    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }

    pub fn signature_max_age(&self) -> Duration {
        Duration::from_secs(self.signature_max_age_secs)
    }

    pub fn signature_max_future(&self) -> Duration {
        Duration::from_secs(self.signature_max_future_secs)
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("access_secret", &redact(&self.access_secret))
            .field("signature_secret", &redact(&self.signature_secret))
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("max_sessions", &self.max_sessions)
            .field("refresh_token_bytes", &self.refresh_token_bytes)
            .field("signature_max_age_secs", &self.signature_max_age_secs)
            .field("signature_max_future_secs", &self.signature_max_future_secs)
            .finish()
    }
}
