//! piawg VPN - WireGuard Profile Negotiation for PIA
//!
//! Lists the provider's regions, measures latency to them, and negotiates
//! WireGuard tunnel parameters that end up in a wg-quick profile.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   feed    ┌──────────────────┐
//! │ serverlist   │──────────▶│ RegionDirectory  │
//! └──────────────┘           └────────┬─────────┘
//!                                     │
//!               ┌─────────────────────┼─────────────────────┐
//!               ▼                     ▼                     ▼
//!     ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//!     │ filter / sort    │  │ ProbeRunner      │  │ Negotiator       │
//!     │                  │  │ (system ping)    │  │ token → addKey   │
//!     └──────────────────┘  └──────────────────┘  └────────┬─────────┘
//!                                                          ▼
//!                                                 ┌──────────────────┐
//!                                                 │ wg-quick profile │
//!                                                 └──────────────────┘
//! ```
//!
//! # Security
//!
//! - A fresh X25519 key pair per negotiation; the private key never
//!   leaves the process except in the written profile
//! - Token and key endpoints are verified against the provider CA and
//!   the server's common name

mod config;
mod keys;
mod negotiator;
mod probe;
mod profile;
mod region;
mod runner;

pub use config::{DEFAULT_CA_CERT_PATH, DEFAULT_SERVER_LIST_URL, Settings, SettingsError};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use negotiator::{Credentials, KEY_API_PORT, NegotiateError, NegotiationState, Negotiator};
pub use probe::{
    LatencyProber, PROBE_TIMEOUT, PingDialect, PingFailed, Pinger, ProbeError, SystemPinger,
    UnixPing, WindowsPing, detect_dialect,
};
pub use profile::{NegotiatedInterface, ProfileError};
pub use region::{
    LATENCY_FAILED, LATENCY_UNPROBED, Region, RegionDirectory, RegionError, RegionServers,
    ServerEndpoint, SortKey, SortOrder, fetch_directory, filter_regions, resolve, sort_regions,
};
pub use runner::ProbeRunner;
