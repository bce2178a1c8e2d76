use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

/// Placeholder JWT secrets that must not be used outside development.
pub const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub allow_direct_conversations: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = lookup("EMBER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("EMBER_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("EMBER_PORT must be a port number")?;
        let db_path = lookup("EMBER_DB_PATH").unwrap_or_else(|| "ember.db".into()).into();
        let jwt_secret = lookup("EMBER_JWT_SECRET").unwrap_or_else(|| "dev-secret-change-me".into());
        let allow_direct_conversations = match lookup("EMBER_ALLOW_DIRECT_CONVERSATIONS") {
            None => false,
            Some(raw) => parse_flag(&raw)
                .with_context(|| format!("EMBER_ALLOW_DIRECT_CONVERSATIONS: unrecognised value '{}'", raw))?,
        };

        Ok(Self {
            host,
            port,
            db_path,
            jwt_secret,
            allow_direct_conversations,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn uses_placeholder_secret(&self) -> bool {
        self.jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
