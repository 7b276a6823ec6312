use serde::Deserialize;
use std::path::Path;

/// Global configuration for the config provider
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Entry point and certificate settings for the data plane
    #[serde(default)]
    pub traefik: TraefikConfig,

    /// Settings wired into the auth gateway middleware
    #[serde(default)]
    pub badger: BadgerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the data plane polls (default: 3001)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Hostname the auth gateway uses to reach the internal API
    #[serde(default = "default_internal_hostname")]
    pub internal_hostname: String,

    /// Port the auth gateway uses to reach the internal API
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Name of the user session cookie
    #[serde(default = "default_session_cookie_name")]
    pub session_cookie_name: String,

    /// Path to the SQLite database holding orgs, sites, resources and targets
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl ServerConfig {
    /// Base URL of the internal API consulted by the auth gateway
    pub fn internal_api_base_url(&self) -> String {
        format!(
            "http://{}:{}/api/v1",
            self.internal_hostname, self.internal_port
        )
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            internal_hostname: default_internal_hostname(),
            internal_port: default_internal_port(),
            session_cookie_name: default_session_cookie_name(),
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TraefikConfig {
    /// Certificate resolver referenced by every TLS router
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,

    /// Plain HTTP entry point name
    #[serde(default = "default_http_entrypoint")]
    pub http_entrypoint: String,

    /// HTTPS entry point name
    #[serde(default = "default_https_entrypoint")]
    pub https_entrypoint: String,

    /// Pin certificates to the parent wildcard domain (default: false)
    #[serde(default)]
    pub prefer_wildcard_cert: bool,
}

impl Default for TraefikConfig {
    fn default() -> Self {
        Self {
            cert_resolver: default_cert_resolver(),
            http_entrypoint: default_http_entrypoint(),
            https_entrypoint: default_https_entrypoint(),
            prefer_wildcard_cert: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BadgerConfig {
    /// Name of the resource session cookie
    #[serde(default = "default_resource_session_cookie_name")]
    pub resource_session_cookie_name: String,

    /// Query parameter used to hand a session through a redirect
    #[serde(default = "default_session_query_parameter")]
    pub session_query_parameter: String,
}

impl Default for BadgerConfig {
    fn default() -> Self {
        Self {
            resource_session_cookie_name: default_resource_session_cookie_name(),
            session_query_parameter: default_session_query_parameter(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3001
}

fn default_internal_hostname() -> String {
    "localhost".to_string()
}

fn default_internal_port() -> u16 {
    3001
}

fn default_session_cookie_name() -> String {
    "p_session".to_string()
}

fn default_database_path() -> String {
    "./config/db/db.sqlite".to_string()
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

fn default_http_entrypoint() -> String {
    "web".to_string()
}

fn default_https_entrypoint() -> String {
    "websecure".to_string()
}

fn default_resource_session_cookie_name() -> String {
    "p_resource_session".to_string()
}

fn default_session_query_parameter() -> String {
    "__pang_sess".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let required = [
            ("server.internal_hostname", &self.server.internal_hostname),
            ("server.session_cookie_name", &self.server.session_cookie_name),
            ("traefik.cert_resolver", &self.traefik.cert_resolver),
            ("traefik.http_entrypoint", &self.traefik.http_entrypoint),
            ("traefik.https_entrypoint", &self.traefik.https_entrypoint),
            (
                "badger.resource_session_cookie_name",
                &self.badger.resource_session_cookie_name,
            ),
            (
                "badger.session_query_parameter",
                &self.badger.session_query_parameter,
            ),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                errors.push(format!("'{}' must not be empty", key));
            }
        }

        if self.server.internal_port == 0 {
            errors.push("'server.internal_port' must be non-zero".to_string());
        }

        if !self.traefik.http_entrypoint.is_empty()
            && self.traefik.http_entrypoint == self.traefik.https_entrypoint
        {
            errors.push(format!(
                "http and https entry points must differ (both are '{}')",
                self.traefik.http_entrypoint
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
