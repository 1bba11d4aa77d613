//! HTTPS Client with Pinned Trust
//!
//! Uses hyper with tokio and rustls for HTTP/1.1 GET requests.
//! Features:
//! - Public trust (webpki roots) for the region feed
//! - Pinned trust against a bundled CA with an overridden server name
//! - Per-region TLS connector cache, kept for the process lifetime
//! - HTTP Basic authentication and query parameter encoding

use crate::tls::{self, TlsPin};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST, HeaderMap, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::{Position, Url};

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout (connect, handshake, body)
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("piawg/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 10 * 1024 * 1024, // 10 MB, the region feed is ~1 MB
        }
    }
}

/// A GET request under construction
#[derive(Clone)]
pub struct GetRequest {
    url: Url,
    basic_auth: Option<(String, String)>,
    pin: Option<TlsPin>,
}

impl GetRequest {
    /// Start a request for an absolute http(s) URL
    pub fn new(url: &str) -> Result<Self, HttpError> {
        let url = Url::parse(url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(HttpError::InvalidUrl(format!("Unsupported scheme: {}", other)));
            }
        }
        if url.host_str().is_none() {
            return Err(HttpError::InvalidUrl("No host in URL".to_string()));
        }

        Ok(Self {
            url,
            basic_auth: None,
            pin: None,
        })
    }

    /// Attach HTTP Basic credentials
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    /// Append a form-encoded query parameter
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    /// Verify the server against the pinned CA and the given identity
    pub fn pinned(mut self, pin: TlsPin) -> Self {
        self.pin = Some(pin);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn pin(&self) -> Option<&TlsPin> {
        self.pin.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.basic_auth.as_ref().map(|(user, _)| user.as_str())
    }

    /// Decoded value of the first query parameter named `key`
    pub fn query_value(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    fn authorization(&self) -> Option<String> {
        self.basic_auth
            .as_ref()
            .map(|(user, pass)| format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass))))
    }

    /// Path and query, as sent on the request line
    fn origin_form(&self) -> &str {
        &self.url[Position::BeforePath..]
    }

    fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

impl fmt::Debug for GetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetRequest")
            .field("url", &self.url.as_str())
            .field("username", &self.username())
            .field("pin", &self.pin)
            .finish()
    }
}

/// HTTP response wrapper
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// Total request time
    pub total_time: Duration,
}

impl Response {
    /// Build a response from a status and body
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            total_time: Duration::ZERO,
        }
    }

    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

/// Anything that can perform a GET request
///
/// The negotiation and feed code is generic over this so it can run
/// against recorded responses in tests.
pub trait HttpTransport: Send + Sync {
    fn get(&self, request: GetRequest) -> impl Future<Output = Result<Response, HttpError>> + Send;
}

/// Client statistics
#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests_made: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

/// HTTPS client with public and pinned trust
pub struct HttpClient {
    /// Configuration
    config: HttpClientConfig,
    /// Connector for public (webpki) trust
    public_tls: TlsConnector,
    /// Bundled root CA for pinned requests
    pinned_roots: Option<Arc<RootCertStore>>,
    /// Pinned connectors, keyed by region id
    pinned_connectors: Mutex<HashMap<String, TlsConnector>>,
    /// Statistics
    stats: ClientStats,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(config: HttpClientConfig) -> Self {
        info!("HTTP client initialized (timeout: {:?})", config.timeout);

        Self {
            config,
            public_tls: tls::connector(Arc::new(tls::public_roots())),
            pinned_roots: None,
            pinned_connectors: Mutex::new(HashMap::new()),
            stats: ClientStats::default(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Set the root CA used for pinned requests
    pub fn with_pinned_roots(mut self, roots: RootCertStore) -> Self {
        self.pinned_roots = Some(Arc::new(roots));
        self
    }

    /// Number of pinned connectors built so far
    pub fn cached_connectors(&self) -> usize {
        self.pinned_connectors.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Get client statistics (requests made, bytes downloaded)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.requests_made.load(Ordering::Relaxed),
            self.stats.bytes_downloaded.load(Ordering::Relaxed),
        )
    }

    async fn execute(&self, request: &GetRequest) -> Result<Response, HttpError> {
        let start = Instant::now();
        self.stats.requests_made.fetch_add(1, Ordering::Relaxed);

        let url = request.url();
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl("No port in URL".to_string()))?;
        let is_https = url.scheme() == "https";

        // 1. Resolve trust before any network activity
        let tls = if is_https {
            Some(self.tls_for(request, host)?)
        } else if request.pin().is_some() {
            return Err(HttpError::InvalidUrl(
                "Pinned requests require https".to_string(),
            ));
        } else {
            None
        };

        // 2. Build request
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(request.origin_form())
            .header(HOST, request.host_header())
            .header(USER_AGENT, &self.config.user_agent);
        if let Some(auth) = request.authorization() {
            builder = builder.header(AUTHORIZATION, auth);
        }
        let http_request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        // 3. Connect
        let connect_host = host.trim_start_matches('[').trim_end_matches(']');
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((connect_host, port)),
        )
        .await
        .map_err(|_| HttpError::Timeout)?
        .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        // 4. Send, wrapping in TLS for https
        let response = match tls {
            Some((connector, server_name)) => {
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| HttpError::TlsError(e.to_string()))?;
                self.send(tls_stream, http_request).await?
            }
            None => self.send(stream, http_request).await?,
        };

        // 5. Read response
        let status = response.status();
        let headers = response.headers().clone();
        let collected = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::BodyError(e.to_string()))?;
        let body = collected.to_bytes().to_vec();

        self.stats
            .bytes_downloaded
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        let total_time = start.elapsed();
        debug!(
            "HTTP GET {}{} -> {} ({} bytes, {:?})",
            request.host_header(),
            url.path(),
            status,
            body.len(),
            total_time
        );

        Ok(Response {
            status,
            headers,
            body,
            total_time,
        })
    }

    async fn send<S>(
        &self,
        io: S,
        request: Request<Full<Bytes>>,
    ) -> Result<hyper::Response<Incoming>, HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = hyper_util::rt::TokioIo::new(io);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!("Connection error: {}", e);
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))
    }

    fn tls_for(
        &self,
        request: &GetRequest,
        host: &str,
    ) -> Result<(TlsConnector, ServerName<'static>), HttpError> {
        match request.pin() {
            None => Ok((self.public_tls.clone(), tls::server_name(host)?)),
            Some(pin) => {
                let connector = self.pinned_connector(&pin.cache_key)?;
                Ok((connector, tls::server_name(&pin.server_name)?))
            }
        }
    }

    fn pinned_connector(&self, cache_key: &str) -> Result<TlsConnector, HttpError> {
        let roots = self
            .pinned_roots
            .as_ref()
            .ok_or_else(|| HttpError::TlsError("No pinned root certificates loaded".to_string()))?;

        let mut cache = self
            .pinned_connectors
            .lock()
            .map_err(|_| HttpError::TlsError("Connector cache poisoned".to_string()))?;

        if let Some(connector) = cache.get(cache_key) {
            return Ok(connector.clone());
        }

        debug!("Building pinned TLS connector for {}", cache_key);
        let connector = tls::connector(roots.clone());
        cache.insert(cache_key.to_string(), connector.clone());
        Ok(connector)
    }
}

impl HttpTransport for HttpClient {
    async fn get(&self, request: GetRequest) -> Result<Response, HttpError> {
        match tokio::time::timeout(self.config.timeout, self.execute(&request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Request to {} timed out", request.host_header());
                Err(HttpError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accept one connection, capture the request head, reply with `response`
    async fn serve_once(response: &'static str) -> (SocketAddr, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&chunk[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&head).into_owned()
        });

        (addr, handle)
    }

    /// Serve a `london401` certificate issued by a throwaway root CA;
    /// returns the address and a store holding that root
    async fn serve_pinned() -> (SocketAddr, RootCertStore) {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "piawg test root");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = rcgen::CertificateParams::new(vec!["london401".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![leaf.der().clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
            )
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(mut stream) = acceptor.accept(socket).await else {
                        return;
                    };
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        let roots = tls::load_ca_bundle_pem(ca_cert.pem().as_bytes()).unwrap();
        (addr, roots)
    }

    #[test]
    fn test_request_builder() {
        let request = GetRequest::new("https://10.0.0.1:1337/addKey")
            .unwrap()
            .query("pubkey", "ab+c/d=")
            .query("pt", "tok 1");

        assert_eq!(request.origin_form(), "/addKey?pubkey=ab%2Bc%2Fd%3D&pt=tok+1");
        assert_eq!(request.query_value("pubkey").as_deref(), Some("ab+c/d="));
        assert_eq!(request.query_value("pt").as_deref(), Some("tok 1"));
        assert_eq!(request.host_header(), "10.0.0.1:1337");
    }

    #[test]
    fn test_default_port_omitted_from_host() {
        let request = GetRequest::new("https://10.0.0.1/authv3/generateToken").unwrap();
        assert_eq!(request.host_header(), "10.0.0.1");
        assert_eq!(request.origin_form(), "/authv3/generateToken");
    }

    #[test]
    fn test_basic_auth_header() {
        let request = GetRequest::new("https://example.com/")
            .unwrap()
            .basic_auth("user", "pass");
        assert_eq!(request.authorization().as_deref(), Some("Basic dXNlcjpwYXNz"));
        assert_eq!(request.username(), Some("user"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let request = GetRequest::new("https://example.com/")
            .unwrap()
            .basic_auth("user", "hunter2");
        assert!(!format!("{:?}", request).contains("hunter2"));
    }

    #[test]
    fn test_invalid_urls() {
        assert!(matches!(GetRequest::new("not a url"), Err(HttpError::InvalidUrl(_))));
        assert!(matches!(
            GetRequest::new("ftp://example.com/file"),
            Err(HttpError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_get() {
        let (addr, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;

        let client = HttpClient::with_defaults();
        let request = GetRequest::new(&format!("http://{}/authv3/generateToken", addr))
            .unwrap()
            .basic_auth("user", "pass")
            .query("a", "b c");
        let response = client.get(request).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.text().unwrap(), "hello");
        assert_eq!(response.content_type(), Some("text/plain"));

        let head = server.await.unwrap().to_lowercase();
        assert!(head.starts_with("get /authv3/generatetoken?a=b+c http/1.1"));
        assert!(head.contains("authorization: basic dxnlcjpwyxnz"));
        assert_eq!(client.stats(), (1, 5));
    }

    #[tokio::test]
    async fn test_error_status_is_not_transport_error() {
        let (addr, _server) = serve_once(
            "HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let client = HttpClient::with_defaults();
        let response = client
            .get(GetRequest::new(&format!("http://{}/", addr)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::with_defaults();
        let result = client
            .get(GetRequest::new(&format!("http://{}/", addr)).unwrap())
            .await;
        assert!(matches!(result, Err(HttpError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_millis(200),
            ..HttpClientConfig::default()
        });
        let result = client
            .get(GetRequest::new(&format!("http://{}/", addr)).unwrap())
            .await;
        assert!(matches!(result, Err(HttpError::Timeout)));
    }

    #[tokio::test]
    async fn test_pinned_request_without_roots() {
        let client = HttpClient::with_defaults();
        let request = GetRequest::new("https://127.0.0.1:1/authv3/generateToken")
            .unwrap()
            .pinned(TlsPin::new("uk_london", "london401"));

        let result = client.get(request).await;
        assert!(matches!(result, Err(HttpError::TlsError(_))));
        assert_eq!(client.cached_connectors(), 0);
    }

    #[tokio::test]
    async fn test_pinned_request_requires_https() {
        let client = HttpClient::with_defaults();
        let request = GetRequest::new("http://127.0.0.1:1/")
            .unwrap()
            .pinned(TlsPin::new("uk_london", "london401"));

        let result = client.get(request).await;
        assert!(matches!(result, Err(HttpError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_pinned_request_verifies_common_name() {
        let (addr, roots) = serve_pinned().await;
        let client = HttpClient::with_defaults().with_pinned_roots(roots);
        let url = format!("https://{}/authv3/generateToken", addr);

        for _ in 0..2 {
            let request = GetRequest::new(&url)
                .unwrap()
                .pinned(TlsPin::new("uk_london", "london401"));
            let response = client.get(request).await.unwrap();
            assert!(response.is_success());
            assert_eq!(response.text().unwrap(), "ok");
        }
        assert_eq!(client.cached_connectors(), 1);

        let request = GetRequest::new(&url)
            .unwrap()
            .pinned(TlsPin::new("france", "paris401"));
        let result = client.get(request).await;
        assert!(matches!(result, Err(HttpError::TlsError(_))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_unpinned_request_rejects_private_ca() {
        let (addr, roots) = serve_pinned().await;
        let client = HttpClient::with_defaults().with_pinned_roots(roots);

        let request = GetRequest::new(&format!("https://{}/", addr)).unwrap();
        let result = client.get(request).await;
        assert!(matches!(result, Err(HttpError::TlsError(_))), "{:?}", result);
        assert_eq!(client.cached_connectors(), 0);
    }
}
