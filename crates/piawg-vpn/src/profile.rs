//! Negotiated Interface and Profile Rendering
//!
//! The result of a successful negotiation, and its rendering as a
//! wg-quick style profile:
//!
//! ```text
//! [Interface]
//! Address = <client ip>
//! PrivateKey = <client private key>
//! DNS = <dns1>,<dns2>
//!
//! [Peer]
//! PublicKey = <server key>
//! AllowedIPs = 0.0.0.0/0
//! Endpoint = <server ip>:<server port>
//! ```

use crate::keys::PrivateKey;
use crate::region::Region;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Key registration reply from a region gateway
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AddKeyResponse {
    pub status: String,
    pub server_key: String,
    pub server_port: u16,
    pub server_ip: String,
    pub server_vip: String,
    pub peer_ip: String,
    pub peer_pubkey: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Tunnel parameters produced by one negotiation
#[derive(Debug, Clone)]
pub struct NegotiatedInterface {
    status: String,
    server_public_key: String,
    server_port: u16,
    server_endpoint: String,
    server_virtual_ip: String,
    client_ip: String,
    client_public_key: String,
    client_private_key: PrivateKey,
    dns_servers: Vec<String>,
    region: Region,
    created_at: DateTime<Utc>,
}

impl NegotiatedInterface {
    pub(crate) fn from_gateway(
        reply: AddKeyResponse,
        client_private_key: PrivateKey,
        region: Region,
    ) -> Self {
        Self {
            status: reply.status,
            server_public_key: reply.server_key,
            server_port: reply.server_port,
            server_endpoint: reply.server_ip,
            server_virtual_ip: reply.server_vip,
            client_ip: reply.peer_ip,
            client_public_key: reply.peer_pubkey,
            client_private_key,
            dns_servers: reply.dns_servers,
            region,
            created_at: Utc::now(),
        }
    }

    /// Same interface without DNS servers
    pub fn without_dns(mut self) -> Self {
        self.dns_servers.clear();
        self
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn server_public_key(&self) -> &str {
        &self.server_public_key
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn server_endpoint(&self) -> &str {
        &self.server_endpoint
    }

    pub fn server_virtual_ip(&self) -> &str {
        &self.server_virtual_ip
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn client_public_key(&self) -> &str {
        &self.client_public_key
    }

    pub fn client_private_key(&self) -> &PrivateKey {
        &self.client_private_key
    }

    pub fn dns_servers(&self) -> &[String] {
        &self.dns_servers
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Render the connection profile
    pub fn render_profile(&self) -> String {
        let mut out = String::new();

        // Writing to a String cannot fail
        let _ = writeln!(
            out,
            "# {} ({}) negotiated {}",
            self.region.name,
            self.region.id,
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "Address = {}", self.client_ip);
        let _ = writeln!(out, "PrivateKey = {}", self.client_private_key.to_base64());
        if !self.dns_servers.is_empty() {
            let _ = writeln!(out, "DNS = {}", self.dns_servers.join(","));
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", self.server_public_key);
        let _ = writeln!(out, "AllowedIPs = 0.0.0.0/0");
        let _ = writeln!(out, "Endpoint = {}:{}", self.server_endpoint, self.server_port);

        out
    }

    /// Write the profile to `writer` in one piece
    pub fn write_profile<W: Write>(&self, writer: &mut W) -> Result<(), ProfileError> {
        writer
            .write_all(self.render_profile().as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|source| ProfileError::Io {
                target: "output".to_string(),
                source,
            })
    }

    /// Write the profile to a file, replacing any existing content
    pub fn save_profile(&self, path: &Path) -> Result<(), ProfileError> {
        std::fs::write(path, self.render_profile()).map_err(|source| ProfileError::Io {
            target: path.display().to_string(),
            source,
        })?;
        info!("Wrote WireGuard profile to {}", path.display());
        Ok(())
    }
}

/// Profile output errors
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Failed to write profile to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}
