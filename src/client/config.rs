//! Client configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Client configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host of the proxy server's framed listener.
    pub server_host: String,
    /// Port of the proxy server's framed listener.
    pub server_port: u16,
    /// Key this client registers under. Generated at startup when absent;
    /// the server only accepts keys carrying the `ZC-` prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl ClientConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server_host.is_empty() {
            return Err(Error::config("server_host cannot be empty"));
        }
        if self.server_port == 0 {
            return Err(Error::config("server_port must be set"));
        }
        if let Some(key) = &self.client_key {
            // The key travels inside flow-setup uris, which are capped at
            // 255 bytes overall.
            if key.is_empty() || key.len() > 64 {
                return Err(Error::config("client_key must be 1-64 bytes"));
            }
        }
        Ok(())
    }

    /// A template for `--generate`.
    pub fn template() -> String {
        concat!(
            "{\n",
            "    \"server_host\": \"proxy.example.com\",\n",
            "    \"server_port\": 4900\n",
            "}\n",
        )
        .to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"server_host": "example.com", "server_port": 4900}"#)
                .unwrap();
        assert_eq!(config.server_host, "example.com");
        assert_eq!(config.server_port, 4900);
        assert!(config.client_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"server_host": "", "server_port": 4900}"#).unwrap();
        assert!(config.validate().is_err());

        let config: ClientConfig =
            serde_json::from_str(r#"{"server_host": "example.com", "server_port": 0}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_template_parses() {
        let config: ClientConfig = serde_json::from_str(&ClientConfig::template()).unwrap();
        assert!(config.validate().is_ok());
    }
}
