//! Tunnel Negotiation
//!
//! Turns provider credentials and a region id into tunnel parameters.
//!
//! # Sequence
//!
//! ```text
//! KeyGenerated ─▶ RegionResolved ─▶ TokenObtained ─▶ KeyRegistered ─▶ Done
//!       │               │                 │                 │
//!       └───────────────┴────────┬────────┴─────────────────┘
//!                                ▼
//!                             Failed
//! ```
//!
//! 1. Generate an X25519 key pair locally
//! 2. Look the region up in the already fetched directory
//! 3. `GET https://{meta ip}/authv3/generateToken` with Basic auth
//! 4. `GET https://{wg ip}:1337/addKey?pubkey=..&pt=..`
//! 5. Merge the gateway reply with the local private key
//!
//! Both calls use pinned TLS: the bundled provider CA, verified against the
//! server's common name rather than the IP being dialed. A failed step
//! ends the negotiation; nothing is retried.

use crate::keys::{KeyError, KeyPair, PublicKey};
use crate::profile::{AddKeyResponse, NegotiatedInterface};
use crate::region::{Region, RegionDirectory, RegionError};
use piawg_network::{GetRequest, HttpTransport, StatusCode, TlsPin};
use serde::Deserialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Port of the gateway key registration API
pub const KEY_API_PORT: u16 = 1337;

/// Provider account credentials
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Negotiation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing done yet
    Started,
    /// Local key pair exists
    KeyGenerated,
    /// Target region found and usable
    RegionResolved,
    /// Bearer token issued
    TokenObtained,
    /// Public key accepted by the gateway
    KeyRegistered,
    /// Interface assembled
    Done,
    /// A step failed
    Failed,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "status", alias = "Status")]
    status: String,
    #[serde(rename = "token", alias = "Token")]
    token: String,
}

/// Leading fields of a gateway reply, readable even on error
#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// Negotiates WireGuard tunnels against one region directory
pub struct Negotiator<T> {
    transport: T,
    directory: RegionDirectory,
}

impl<T: HttpTransport> Negotiator<T> {
    /// Create a negotiator over an already fetched directory
    pub fn new(transport: T, directory: RegionDirectory) -> Self {
        Self {
            transport,
            directory,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the full negotiation for `region_id`
    pub async fn negotiate(
        &self,
        credentials: &Credentials,
        region_id: &str,
    ) -> Result<NegotiatedInterface, NegotiateError> {
        info!("Negotiating tunnel for region {}", region_id);

        let mut state = NegotiationState::Started;
        let result = self.run(credentials, region_id, &mut state).await;

        match &result {
            Ok(iface) => info!(
                "Tunnel negotiated for {} (endpoint {}:{})",
                region_id,
                iface.server_endpoint(),
                iface.server_port()
            ),
            Err(e) => {
                warn!("Negotiation for {} failed after {:?}: {}", region_id, state, e);
                advance(&mut state, NegotiationState::Failed, region_id);
            }
        }

        result
    }

    async fn run(
        &self,
        credentials: &Credentials,
        region_id: &str,
        state: &mut NegotiationState,
    ) -> Result<NegotiatedInterface, NegotiateError> {
        let keys = KeyPair::generate()?;
        advance(state, NegotiationState::KeyGenerated, region_id);

        let region = self.directory.resolve(region_id)?;
        advance(state, NegotiationState::RegionResolved, region_id);

        let token = self.generate_token(credentials, &region).await?;
        advance(state, NegotiationState::TokenObtained, region_id);

        let reply = self.add_key(&keys.public, &token, &region).await?;
        advance(state, NegotiationState::KeyRegistered, region_id);

        let iface = NegotiatedInterface::from_gateway(reply, keys.private, region);
        advance(state, NegotiationState::Done, region_id);

        Ok(iface)
    }

    /// Exchange credentials for a bearer token at the region's meta server
    pub async fn generate_token(
        &self,
        credentials: &Credentials,
        region: &Region,
    ) -> Result<String, NegotiateError> {
        let meta = region
            .meta()
            .ok_or_else(|| RegionError::UnknownRegion(region.id.clone()))?;

        let url = format!("https://{}/authv3/generateToken", meta.address);
        let request = GetRequest::new(&url)
            .map_err(|e| NegotiateError::TokenFetchFailure(e.to_string()))?
            .basic_auth(&credentials.username, &credentials.password)
            .pinned(TlsPin::new(&region.id, &meta.common_name));

        let response = self
            .transport
            .get(request)
            .await
            .map_err(|e| NegotiateError::TokenFetchFailure(e.to_string()))?;

        if response.status == StatusCode::FORBIDDEN {
            return Err(NegotiateError::InvalidCredentials);
        }
        if !response.is_success() {
            return Err(NegotiateError::TokenFetchFailure(format!(
                "invalid auth token response: {}",
                response.status
            )));
        }

        let body: TokenResponse = serde_json::from_slice(&response.body).map_err(|e| {
            NegotiateError::TokenFetchFailure(format!("json parse of auth token failed: {}", e))
        })?;
        if body.status != "OK" {
            return Err(NegotiateError::TokenFetchFailure(format!(
                "invalid auth token response: {}",
                body.status
            )));
        }

        Ok(body.token)
    }

    /// Register `public_key` with the region's WireGuard gateway
    async fn add_key(
        &self,
        public_key: &PublicKey,
        token: &str,
        region: &Region,
    ) -> Result<AddKeyResponse, NegotiateError> {
        let gateway = region
            .gateway()
            .ok_or_else(|| RegionError::UnknownRegion(region.id.clone()))?;

        let url = format!("https://{}:{}/addKey", gateway.address, KEY_API_PORT);
        let request = GetRequest::new(&url)
            .map_err(|e| NegotiateError::KeyRegistrationFailure(e.to_string()))?
            .query("pubkey", &public_key.to_base64())
            .query("pt", token)
            .pinned(TlsPin::new(&region.id, &gateway.common_name));

        let response = self
            .transport
            .get(request)
            .await
            .map_err(|e| NegotiateError::KeyRegistrationFailure(e.to_string()))?;

        if !response.is_success() {
            return Err(NegotiateError::KeyRegistrationFailure(format!(
                "addKey returned {}",
                response.status
            )));
        }

        let envelope: StatusEnvelope = serde_json::from_slice(&response.body).map_err(|e| {
            NegotiateError::KeyRegistrationFailure(format!("json parse of addKey reply failed: {}", e))
        })?;
        if envelope.status != "OK" {
            return Err(NegotiateError::KeyRegistrationFailure(format!(
                "addKey status {}: {}",
                envelope.status,
                envelope.message.unwrap_or_default()
            )));
        }

        let reply: AddKeyResponse = serde_json::from_slice(&response.body).map_err(|e| {
            NegotiateError::KeyRegistrationFailure(format!("json parse of addKey reply failed: {}", e))
        })?;

        // The server key ends up verbatim in the profile
        PublicKey::from_base64(&reply.server_key).map_err(|e| {
            NegotiateError::KeyRegistrationFailure(format!("unusable server key: {}", e))
        })?;

        Ok(reply)
    }
}

fn advance(state: &mut NegotiationState, next: NegotiationState, region_id: &str) {
    debug!("Negotiation {}: {:?} -> {:?}", region_id, state, next);
    *state = next;
}

/// Negotiation errors
#[derive(Debug, thiserror::Error)]
pub enum NegotiateError {
    #[error("WireGuard key generation failed: {0}")]
    KeyGenFailure(#[from] KeyError),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error("Invalid PIA credentials")]
    InvalidCredentials,

    #[error("Token fetch failed: {0}")]
    TokenFetchFailure(String),

    #[error("Key registration failed: {0}")]
    KeyRegistrationFailure(String),
}

impl NegotiateError {
    /// Caused by what the user typed rather than by the network
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            NegotiateError::InvalidCredentials
                | NegotiateError::Region(RegionError::UnknownRegion(_))
        )
    }
}
