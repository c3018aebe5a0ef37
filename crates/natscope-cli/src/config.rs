//! Configuration system for the natscope CLI.

use natscope_discovery::{ClientConfig, HostPort, ServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// natscope configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server primary address
    #[serde(default = "default_primary")]
    pub primary: EndpointConfig,
    /// Server secondary address
    #[serde(default = "default_secondary")]
    pub secondary: EndpointConfig,
    /// Client configuration
    #[serde(default)]
    pub client: ClientSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Host name or IPv4 address
    pub host: String,
    /// UDP port
    pub port: u16,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// STUN server host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// STUN server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local address to bind
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// Measure round-trip time
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_primary() -> EndpointConfig {
    EndpointConfig {
        host: "127.0.0.1".to_string(),
        port: default_port(),
    }
}

fn default_secondary() -> EndpointConfig {
    EndpointConfig {
        host: "127.0.0.2".to_string(),
        port: default_port() + 1,
    }
}

fn default_port() -> u16 {
    natscope_discovery::message::DEFAULT_PORT
}

fn default_local_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            secondary: default_secondary(),
            client: ClientSection::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: None,
            port: default_port(),
            local_addr: default_local_addr(),
            timestamps: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("natscope/natscope.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_or_create(Self::default_path())
    }

    /// Load config from `path`, writing the defaults there if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Parse the client local address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not dotted-decimal IPv4.
    pub fn parse_local_addr(&self) -> anyhow::Result<Ipv4Addr> {
        self.client.local_addr.parse().map_err(|_| {
            anyhow::anyhow!("Invalid local address: {}", self.client.local_addr)
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_host(&self.primary.host, "Primary address")?;
        validate_host(&self.secondary.host, "Secondary address")?;

        if self.primary.port != 0 && self.primary.port == self.secondary.port {
            anyhow::bail!(
                "Primary and secondary ports must differ (both {})",
                self.primary.port
            );
        }

        if let Some(server) = &self.client.server {
            validate_host(server, "Client server")?;
        }
        if self.client.port == 0 {
            anyhow::bail!("Client server port must not be 0");
        }
        self.parse_local_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Server settings for the library
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            primary: HostPort::new(self.primary.host.clone(), self.primary.port),
            secondary: HostPort::new(self.secondary.host.clone(), self.secondary.port),
        }
    }

    /// Client settings for the library
    ///
    /// # Errors
    ///
    /// Returns an error if the local address is invalid.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        Ok(ClientConfig {
            server: self.client.server.clone(),
            port: self.client.port,
            local_addr: self.parse_local_addr()?,
            timestamps: self.client.timestamps,
        })
    }
}

/// Validate a host name
fn validate_host(host: &str, name: &str) -> anyhow::Result<()> {
    if host.is_empty() {
        anyhow::bail!("{} is empty", name);
    }

    if host.contains(':') || host.contains('/') || host.contains('\\') {
        anyhow::bail!("{} '{}' contains invalid characters", name, host);
    }

    Ok(())
}

/// Parse a `host:port` argument
///
/// # Errors
///
/// Returns an error if the port is missing or invalid or the host is empty.
pub fn parse_host_port(addr: &str, name: &str) -> anyhow::Result<EndpointConfig> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "{} '{}' missing port (expected format: host:port)",
            name,
            addr
        );
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;

    validate_host(host, name)?;

    Ok(EndpointConfig {
        host: host.to_string(),
        port,
    })
}
