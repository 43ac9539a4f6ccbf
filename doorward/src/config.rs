//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `DOORWARD_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `DOORWARD_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `DOORWARD_WWW__COOKIE_NAME=gate` sets the `www.cookie_name` field.
//!
//! ## Configuration Structure
//!
//! ```yaml
//! host: "127.0.0.1"
//! port: 8080
//! www:
//!   cookie_name: "doorward"
//!   csrf_cookie_name: "doorward-csrf"
//!   internal_prefix: "/webauth-"
//! users:
//!   db: "users.json"
//! backends:
//!   - url: "/app"
//!     target: "http://127.0.0.1:3001"
//! proxy:
//!   timeout: "30s"
//! ```
//!
//! Backends are matched against the request path in declared order; the first
//! entry whose `url` is a literal prefix of the path wins.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "DOORWARD_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// Loaded from YAML and environment variables; all fields have defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Cookie names, internal route prefix and form limits
    pub www: WwwConfig,
    /// User database location
    pub users: UsersConfig,
    /// Ordered backend list; first prefix match wins
    pub backends: Vec<Backend>,
    /// Outbound proxy behavior
    pub proxy: ProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            www: WwwConfig::default(),
            users: UsersConfig::default(),
            backends: Vec::new(),
            proxy: ProxyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WwwConfig {
    /// Name of the session cookie
    pub cookie_name: String,
    /// Name of the anti-forgery token cookie
    pub csrf_cookie_name: String,
    /// Path prefix reserved for the internal web app (login, logout, user admin)
    pub internal_prefix: String,
    /// Maximum accepted form submission size in bytes
    pub max_post_bytes: usize,
}

impl Default for WwwConfig {
    fn default() -> Self {
        Self {
            cookie_name: "doorward".to_string(),
            csrf_cookie_name: "doorward-csrf".to_string(),
            internal_prefix: "/webauth-".to_string(),
            max_post_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UsersConfig {
    /// Path to the JSON user database. The process refuses to start when the
    /// file cannot be read or parsed.
    pub db: PathBuf,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("users.json"),
        }
    }
}

/// One downstream HTTP service reachable via a path prefix.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Backend {
    /// Path prefix matched literally against the request path
    pub url: String,
    /// Destination base URL (scheme, host, port)
    pub target: Url,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Upper bound on a single proxied request, connection establishment included
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("DOORWARD_").split("__"))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if !self.www.internal_prefix.starts_with('/') {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: www.internal_prefix must start with '/', got {:?}",
                    self.www.internal_prefix
                ),
            });
        }

        if self.www.cookie_name.is_empty() || self.www.csrf_cookie_name.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: cookie names must not be empty".to_string(),
            });
        }

        if self.www.cookie_name == self.www.csrf_cookie_name {
            return Err(Error::Internal {
                operation: "Config validation: session and CSRF cookies must use distinct names".to_string(),
            });
        }

        for backend in &self.backends {
            if !backend.url.starts_with('/') {
                return Err(Error::Internal {
                    operation: format!("Config validation: backend prefix must start with '/', got {:?}", backend.url),
                });
            }
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
