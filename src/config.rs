//! Configuration management for the hosting relay

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Development-only signing secret, used when `JWT_SECRET` is unset
const DEV_JWT_SECRET: &str = "hosting-relay-dev-secret";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub staging: StagingConfig,
    pub verification: VerificationConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Request-level concurrency limit
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Root of the `upload/` and `intake/` trees
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    pub workers: usize,
    pub queue_depth: usize,
    pub finalize_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl VerificationConfig {
    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("jwt_issuer", &self.jwt_issuer)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                max_concurrent_requests: 5,
            },
            staging: StagingConfig {
                dir: PathBuf::from("./staging"),
            },
            verification: VerificationConfig {
                workers: 2,
                queue_depth: 20,
                finalize_timeout_secs: 20,
                shutdown_grace_secs: 10,
            },
            auth: AuthConfig {
                jwt_secret: DEV_JWT_SECRET.to_string(),
                jwt_issuer: None,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!("JWT_SECRET not set, using development secret");
                defaults.auth.jwt_secret
            }
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
                max_concurrent_requests: parse_var(
                    "MAX_CONCURRENT_REQUESTS",
                    defaults.server.max_concurrent_requests,
                )?,
            },
            staging: StagingConfig {
                dir: env::var("STAGING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.staging.dir),
            },
            verification: VerificationConfig {
                workers: parse_var("VERIFY_WORKERS", defaults.verification.workers)?,
                queue_depth: parse_var("VERIFY_QUEUE_DEPTH", defaults.verification.queue_depth)?,
                finalize_timeout_secs: parse_var(
                    "FINALIZE_TIMEOUT_SECS",
                    defaults.verification.finalize_timeout_secs,
                )?,
                shutdown_grace_secs: parse_var(
                    "SHUTDOWN_GRACE_SECS",
                    defaults.verification.shutdown_grace_secs,
                )?,
            },
            auth: AuthConfig {
                jwt_secret,
                jwt_issuer: env::var("JWT_ISSUER").ok().filter(|s| !s.is_empty()),
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}
