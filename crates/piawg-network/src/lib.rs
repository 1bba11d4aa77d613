//! piawg Network Layer
//!
//! HTTPS transport for talking to the VPN provider.
//!
//! Architecture:
//! 1. Region feed → public web PKI trust
//! 2. Token and key endpoints → pinned trust: bundled root CA, expected
//!    server name taken from the region instead of the IP being dialed
//! 3. One TLS connector per region, cached for the life of the process

mod client;
mod tls;

pub use client::{
    ClientStats, GetRequest, HttpClient, HttpClientConfig, HttpError, HttpTransport, Response,
};
pub use hyper::StatusCode;
pub use tls::{TlsPin, load_ca_bundle, load_ca_bundle_pem};
