//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The login password is loaded from the AGENT_PASSWORD env var or
//! `login.password_file`, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use session_auth::{AuthEndpoints, LOGIN_PATH, LoginRequest, REFRESH_PATH, REGISTER_PATH};
use session_core::CoordinatorConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub session: SessionConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub login: Option<LoginConfig>,
}

/// Remote API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub client_id: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_register_path")]
    pub register_path: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
}

/// Token lifecycle settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub store_path: PathBuf,
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    /// Acknowledge session expiry prompts immediately (headless use)
    #[serde(default = "default_auto_acknowledge")]
    pub auto_acknowledge: bool,
}

/// Local HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credentials used when no stored session exists
#[derive(Debug, Deserialize)]
pub struct LoginConfig {
    pub email: String,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file containing the password (alternative to AGENT_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    30
}

fn default_login_path() -> String {
    LOGIN_PATH.to_string()
}

fn default_register_path() -> String {
    REGISTER_PATH.to_string()
}

fn default_refresh_path() -> String {
    REFRESH_PATH.to_string()
}

fn default_token_lifetime() -> u64 {
    session_auth::TOKEN_LIFETIME.as_secs()
}

fn default_refresh_margin() -> u64 {
    session_auth::REFRESH_MARGIN.as_secs()
}

fn default_ack_timeout() -> u64 {
    120
}

fn default_auto_acknowledge() -> bool {
    true
}

fn default_max_connections() -> usize {
    256
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order:
    /// 1. AGENT_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.api.base_url.starts_with("http://")
            && !config.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.api.base_url
            )));
        }

        if config.api.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.session.refresh_margin_secs >= config.session.token_lifetime_secs {
            return Err(common::Error::Config(format!(
                "refresh_margin_secs ({}) must be less than token_lifetime_secs ({})",
                config.session.refresh_margin_secs, config.session.token_lifetime_secs
            )));
        }

        if config.agent.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if let Some(login) = config.login.as_mut() {
            if let Ok(password) = std::env::var("AGENT_PASSWORD") {
                login.password = Some(Secret::new(password));
            } else if let Some(ref password_file) = login.password_file {
                let password = std::fs::read_to_string(password_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read password_file {}: {e}",
                        password_file.display()
                    ))
                })?;
                let password = password.trim_end_matches(['\r', '\n']).to_owned();
                login.password = Some(Secret::new(password));
            }
            login.password = login.password.take().filter(|p| !p.is_blank());
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-agent.toml")
    }

    pub fn endpoints(&self) -> AuthEndpoints {
        AuthEndpoints {
            login: self.api.login_path.clone(),
            register: self.api.register_path.clone(),
            refresh: self.api.refresh_path.clone(),
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            client_id: self.api.client_id.clone(),
            token_lifetime: Duration::from_secs(self.session.token_lifetime_secs),
            refresh_margin: Duration::from_secs(self.session.refresh_margin_secs),
            ack_timeout: Duration::from_secs(self.session.ack_timeout_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    /// Credentials for unattended sign-in, if a password was configured.
    pub fn login_request(&self) -> Option<LoginRequest> {
        let login = self.login.as_ref()?;
        let password = login.password.clone()?;
        Some(LoginRequest {
            email: login.email.clone(),
            password,
        })
    }
}
