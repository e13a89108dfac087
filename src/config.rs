use anyhow::{Context, Result};
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;


pub const DEFAULT_CONFIG_PATH: &str = "devproxy.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub static_files: StaticFilesConfig,
    pub logging: LoggingConfig,
    /// Ordered: the first rule whose prefix matches wins.
    pub proxy: Vec<ProxyRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Fail instead of trying the next port when `port` is taken.
    pub strict_port: bool,
    pub cors: bool,
    /// Seconds to wait for an upstream response head.
    pub proxy_timeout: u64,
    /// Seconds to wait for an upstream TCP/TLS connection.
    pub connect_timeout: u64,
    pub tcp_nodelay: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allow_origin: String,
    pub allow_methods: Vec<String>,
    pub expose_headers: Option<Vec<String>>,
    pub max_age: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StaticFilesConfig {
    pub root: Option<String>,
    pub index_files: Vec<String>,
    /// Serve the root index file for unknown extension-less paths.
    pub spa_fallback: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// File path, `-` for stdout, unset to disable access logging.
    pub access_log: Option<String>,
    pub access_log_format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProxyRule {
    pub path_prefix: String,
    pub target: String,
    #[serde(default)]
    pub change_origin: bool,
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// Replacement for the matched prefix in the forwarded path.
    #[serde(default)]
    pub rewrite: Option<String>,
    #[serde(default)]
    pub xfwd: bool,
    /// Overrides `server.proxy_timeout` for this rule, in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_secure() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cors: CorsConfig::default(),
            static_files: StaticFilesConfig::default(),
            logging: LoggingConfig::default(),
            proxy: vec![ProxyRule {
                path_prefix: "/api".to_string(),
                target: "http://localhost:8000".to_string(),
                change_origin: true,
                secure: false,
                rewrite: None,
                xfwd: false,
                timeout: None,
            }],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            strict_port: true,
            cors: true,
            proxy_timeout: 30,
            connect_timeout: 5,
            tcp_nodelay: true,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: ["GET", "HEAD", "PUT", "PATCH", "POST", "DELETE"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            expose_headers: None,
            max_age: None,
        }
    }
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            root: None,
            index_files: vec!["index.html".to_string()],
            spa_fallback: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            access_log: None,
            access_log_format: "combined".to_string(),
        }
    }
}

impl ProxyRule {
    pub fn new(path_prefix: &str, target: &str) -> Self {
        Self {
            path_prefix: path_prefix.to_string(),
            target: target.to_string(),
            change_origin: false,
            secure: true,
            rewrite: None,
            xfwd: false,
            timeout: None,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_with_host_port(host: &str, port: u16) -> Self {
        let mut config = Config::default();
        config.server.host = host.to_string();
        config.server.port = port;
        config
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .host
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid listen host: {}", self.server.host))?;

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("port must be between 1 and 65535"));
        }

        if self.server.proxy_timeout == 0 || self.server.connect_timeout == 0 {
            return Err(anyhow::anyhow!("proxy timeouts must be greater than 0"));
        }

        match self.logging.access_log_format.as_str() {
            "combined" | "common" | "json" => {}
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown access_log_format '{}', expected combined, common or json",
                    other
                ))
            }
        }

        let mut prefixes = HashSet::new();
        for rule in &self.proxy {
            rule.validate()?;
            if !prefixes.insert(rule.path_prefix.as_str()) {
                return Err(anyhow::anyhow!(
                    "Duplicate proxy rule for prefix '{}'",
                    rule.path_prefix
                ));
            }
        }

        Ok(())
    }

    pub fn listen_address(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .with_context(|| format!("Invalid listen host: {}", self.server.host))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.server.proxy_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout)
    }
}

impl ProxyRule {
    pub fn validate(&self) -> Result<()> {
        if !self.path_prefix.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Proxy prefix '{}' must start with '/'",
                self.path_prefix
            ));
        }

        let uri: Uri = self
            .target
            .parse()
            .with_context(|| format!("Invalid proxy target: {}", self.target))?;

        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Proxy target '{}' must use http or https",
                    self.target
                ))
            }
        }

        if uri.host().map_or(true, str::is_empty) {
            return Err(anyhow::anyhow!("Proxy target '{}' has no host", self.target));
        }

        if uri.path_and_query().map_or(false, |pq| pq.as_str() != "/") {
            return Err(anyhow::anyhow!(
                "Proxy target '{}' must not carry a path or query",
                self.target
            ));
        }

        if let Some(rewrite) = &self.rewrite {
            if !rewrite.is_empty() && !rewrite.starts_with('/') {
                return Err(anyhow::anyhow!(
                    "Proxy rewrite '{}' must be empty or start with '/'",
                    rewrite
                ));
            }
        }

        if self.timeout == Some(0) {
            return Err(anyhow::anyhow!(
                "Proxy timeout for '{}' must be greater than 0",
                self.path_prefix
            ));
        }

        Ok(())
    }
}
