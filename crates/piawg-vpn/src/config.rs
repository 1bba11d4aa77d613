//! Application Settings
//!
//! Values that shape region lookup and negotiation. They are passed
//! explicitly to the code that needs them; nothing reads them globally.
//!
//! Settings can be loaded from a TOML file and are then overridden by
//! command-line flags:
//!
//! ```toml
//! server_list_url = "https://serverlist.piaservers.net/vpninfo/servers/v4"
//! case_sensitive = false
//! ca_cert_path = "/etc/piawg/pia.pem"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Provider region feed
pub const DEFAULT_SERVER_LIST_URL: &str = "https://serverlist.piaservers.net/vpninfo/servers/v4";

/// Root CA bundle shipped alongside the binary
pub const DEFAULT_CA_CERT_PATH: &str = "assets/pia.pem";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Region feed URL
    pub server_list_url: String,
    /// Case-sensitive region search
    pub case_sensitive: bool,
    /// Root CA for token and key endpoints
    pub ca_cert_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_list_url: DEFAULT_SERVER_LIST_URL.to_string(),
            case_sensitive: true,
            ca_cert_path: PathBuf::from(DEFAULT_CA_CERT_PATH),
        }
    }
}

impl Settings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string; missing keys keep their defaults
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}
