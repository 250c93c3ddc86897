//! Server configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_server_port() -> u16 {
    4900
}

fn default_socks_port() -> u16 {
    1080
}

/// Server configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the framed listener binds (client connections).
    #[serde(default = "default_bind")]
    pub server_bind: String,
    /// Port the framed listener binds.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Address the SOCKS5 listener binds (external users).
    #[serde(default = "default_bind")]
    pub socks_bind: String,
    /// Port the SOCKS5 listener binds.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Shared secret every SOCKS5 user must present.
    pub socks_password: String,
}

impl ServerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| Error::config(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server_bind.is_empty() {
            return Err(Error::config("server_bind cannot be empty"));
        }
        if self.socks_bind.is_empty() {
            return Err(Error::config("socks_bind cannot be empty"));
        }
        if self.socks_password.is_empty() {
            return Err(Error::config("socks_password must be set"));
        }
        Ok(())
    }

    /// A commented template for `--generate`.
    pub fn template() -> String {
        concat!(
            "# zrp server configuration\n",
            "\n",
            "# Listener for proxy clients\n",
            "server_bind = \"0.0.0.0\"\n",
            "server_port = 4900\n",
            "\n",
            "# Listener for external SOCKS5 users\n",
            "socks_bind = \"0.0.0.0\"\n",
            "socks_port = 1080\n",
            "\n",
            "# Shared secret SOCKS5 users authenticate with\n",
            "socks_password = \"change-me\"\n",
        )
        .to_owned()
    }
}
