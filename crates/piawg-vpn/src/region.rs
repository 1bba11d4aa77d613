//! VPN Region Directory
//!
//! Region records as published in the provider's server feed, plus the
//! pure operations the CLI applies to them: lookup, search and sort.
//!
//! # Latency sentinels
//!
//! | Value | Meaning |
//! |-------|---------|
//! | `0` | not probed |
//! | `1..` | measured average RTT in ms (sub-ms rounds up to 1) |
//! | `10000` | probe failed |
//!
//! Sorting by ping uses the raw number, so failed regions sort after every
//! measured region in ascending order.

use piawg_network::{GetRequest, HttpTransport};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info, trace};

/// Latency of a region that has not been probed
pub const LATENCY_UNPROBED: u16 = 0;

/// Latency recorded when a probe fails
pub const LATENCY_FAILED: u16 = 10000;

/// One reachable server of a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// IP address to connect to
    #[serde(rename = "ip", alias = "Ip")]
    pub address: String,
    /// Common name on the server certificate
    #[serde(rename = "cn", alias = "Cn")]
    pub common_name: String,
}

impl ServerEndpoint {
    pub fn new(address: impl Into<String>, common_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            common_name: common_name.into(),
        }
    }
}

/// Server groups of a region; only the two used for negotiation are kept
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionServers {
    /// WireGuard gateways (key registration)
    #[serde(default, alias = "Wg")]
    pub wg: Vec<ServerEndpoint>,
    /// Meta servers (token issuance)
    #[serde(default, alias = "Meta")]
    pub meta: Vec<ServerEndpoint>,
}

/// A provider point of presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Unique region id (e.g. `uk_london`)
    #[serde(alias = "Id")]
    pub id: String,
    /// Display name
    #[serde(alias = "Name")]
    pub name: String,
    /// Control-plane host name, also the probe target
    #[serde(rename = "dns", alias = "Dns", default)]
    pub control_host: String,
    /// ISO country code
    #[serde(default, alias = "Country")]
    pub country: Option<String>,
    /// Region supports port forwarding
    #[serde(default)]
    pub port_forward: bool,
    /// Region is geo-located (virtual location)
    #[serde(default)]
    pub geo: bool,
    /// Region is marked offline by the provider
    #[serde(default)]
    pub offline: bool,
    /// Endpoint groups
    #[serde(default, alias = "Servers")]
    pub servers: RegionServers,
    /// Probed latency, see module docs for the sentinel values
    #[serde(skip)]
    pub latency_ms: u16,
}

impl Region {
    /// Create a region with no endpoints
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            control_host: String::new(),
            country: None,
            port_forward: false,
            geo: false,
            offline: false,
            servers: RegionServers::default(),
            latency_ms: LATENCY_UNPROBED,
        }
    }

    /// First gateway with an address
    pub fn gateway(&self) -> Option<&ServerEndpoint> {
        self.servers.wg.first().filter(|s| !s.address.is_empty())
    }

    /// First meta server with an address
    pub fn meta(&self) -> Option<&ServerEndpoint> {
        self.servers.meta.first().filter(|s| !s.address.is_empty())
    }

    /// Can a tunnel be negotiated against this region?
    pub fn is_usable(&self) -> bool {
        self.gateway().is_some() && self.meta().is_some()
    }

    /// Has a probe (successful or not) been recorded?
    pub fn is_probed(&self) -> bool {
        self.latency_ms != LATENCY_UNPROBED
    }

    /// Latency column text; blank until probed
    pub fn latency_label(&self) -> String {
        if self.is_probed() {
            self.latency_ms.to_string()
        } else {
            String::new()
        }
    }
}

/// Immutable snapshot of the provider's regions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionDirectory {
    #[serde(default, alias = "Regions")]
    regions: Vec<Region>,
}

impl RegionDirectory {
    /// Wrap an already decoded region list
    pub fn from_regions(regions: Vec<Region>) -> Self {
        Self { regions }
    }

    /// Parse a raw feed body
    ///
    /// The feed appends a signature blob after the JSON document, so only
    /// the text up to and including the last `}` is decoded.
    pub fn from_feed(payload: &str) -> Result<Self, RegionError> {
        let end = payload
            .rfind('}')
            .ok_or_else(|| RegionError::ParseError("No JSON object in region feed".to_string()))?;
        let json = &payload[..=end];
        trace!("Region feed JSON ends at byte {}", end);

        let directory: Self = serde_json::from_str(json)
            .map_err(|e| RegionError::ParseError(format!("Region data parse failed: {}", e)))?;

        debug!("Parsed {} regions from feed", directory.regions.len());
        Ok(directory)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn into_regions(self) -> Vec<Region> {
        self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Find a usable region by id
    pub fn resolve(&self, id: &str) -> Result<Region, RegionError> {
        resolve(&self.regions, id)
    }
}

/// Fetch and parse the region feed
pub async fn fetch_directory<T: HttpTransport>(
    transport: &T,
    url: &str,
) -> Result<RegionDirectory, RegionError> {
    info!("Fetching region list from {}", url);

    let request = GetRequest::new(url).map_err(|e| RegionError::Fetch(e.to_string()))?;
    let response = transport
        .get(request)
        .await
        .map_err(|e| RegionError::Fetch(e.to_string()))?;

    if !response.is_success() {
        return Err(RegionError::Fetch(format!(
            "Region list request returned {}",
            response.status
        )));
    }

    let body = String::from_utf8_lossy(&response.body);
    RegionDirectory::from_feed(&body)
}

/// Find the first region whose id matches exactly
///
/// A region without a usable gateway and meta endpoint cannot be
/// negotiated against and is reported as unknown.
pub fn resolve(regions: &[Region], id: &str) -> Result<Region, RegionError> {
    regions
        .iter()
        .find(|r| r.id == id && r.is_usable())
        .cloned()
        .ok_or_else(|| RegionError::UnknownRegion(id.to_string()))
}

/// Keep regions whose name or id contains `term`
pub fn filter_regions(regions: &[Region], term: &str, case_sensitive: bool) -> Vec<Region> {
    let needle = if case_sensitive {
        term.to_string()
    } else {
        term.to_lowercase()
    };

    regions
        .iter()
        .filter(|r| {
            let matched = if case_sensitive {
                r.name.contains(&needle) || r.id.contains(&needle)
            } else {
                r.name.to_lowercase().contains(&needle) || r.id.to_lowercase().contains(&needle)
            };
            trace!("Region {} filter match: {}", r.id, matched);
            matched
        })
        .cloned()
        .collect()
}

/// Sort key for region listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Ping,
    Name,
    Id,
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SortKey::Ping => "ping",
            SortKey::Name => "name",
            SortKey::Id => "id",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SortKey {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ping" => Ok(SortKey::Ping),
            "name" => Ok(SortKey::Name),
            "id" => Ok(SortKey::Id),
            _ => Err(RegionError::InvalidSortKey(s.to_string())),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "asc"),
            SortOrder::Desc => write!(f, "desc"),
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(RegionError::InvalidSortOrder(s.to_string())),
        }
    }
}

/// Stable sort; equal keys keep their relative order in both directions
pub fn sort_regions(regions: &mut [Region], key: SortKey, order: SortOrder) {
    debug!("Sorting {} regions by {} {}", regions.len(), key, order);

    let compare = |a: &Region, b: &Region| -> Ordering {
        match key {
            SortKey::Ping => a.latency_ms.cmp(&b.latency_ms),
            SortKey::Name => a.name.cmp(&b.name),
            SortKey::Id => a.id.cmp(&b.id),
        }
    };

    match order {
        SortOrder::Asc => regions.sort_by(compare),
        SortOrder::Desc => regions.sort_by(|a, b| compare(b, a)),
    }
}

/// Region errors
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("Unknown region id: {0}")]
    UnknownRegion(String),

    #[error("Region list fetch failed: {0}")]
    Fetch(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid sort key: {0} (expected ping, name or id)")]
    InvalidSortKey(String),

    #[error("Invalid sort order: {0} (expected asc or desc)")]
    InvalidSortOrder(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use piawg_network::{HttpError, Response, StatusCode};

    const FEED: &str = r#"{"groups":{"wg":[{"name":"wg","ports":[1337]}]},"regions":[
        {"id":"uk_london","name":"UK London","country":"GB","dns":"uk-london.privacy.network",
         "port_forward":false,"geo":false,"offline":false,
         "servers":{"meta":[{"ip":"10.0.0.1","cn":"london401"}],
                    "wg":[{"ip":"10.0.0.2","cn":"london402"}]}},
        {"id":"fr_paris","name":"France","dns":"france.privacy.network",
         "servers":{"meta":[{"ip":"10.0.1.1","cn":"paris401"}],"wg":[]}}
    ]}"#;

    fn named(id: &str, name: &str, latency_ms: u16) -> Region {
        Region {
            latency_ms,
            ..Region::new(id, name)
        }
    }

    fn usable(id: &str) -> Region {
        let mut region = Region::new(id, id.to_uppercase());
        region.servers.meta.push(ServerEndpoint::new("10.0.0.1", format!("{}-meta", id)));
        region.servers.wg.push(ServerEndpoint::new("10.0.0.2", format!("{}-wg", id)));
        region
    }

    fn names(regions: &[Region]) -> Vec<&str> {
        regions.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_parse_feed() {
        let directory = RegionDirectory::from_feed(FEED).unwrap();
        assert_eq!(directory.len(), 2);

        let london = &directory.regions()[0];
        assert_eq!(london.id, "uk_london");
        assert_eq!(london.control_host, "uk-london.privacy.network");
        assert_eq!(london.country.as_deref(), Some("GB"));
        assert_eq!(london.meta().unwrap().common_name, "london401");
        assert_eq!(london.gateway().unwrap().address, "10.0.0.2");
        assert_eq!(london.latency_ms, LATENCY_UNPROBED);
    }

    #[test]
    fn test_feed_signature_is_trimmed() {
        let clean = r#"{"Regions":[{"Id":"a","Name":"Alpha","Dns":"a.example",
            "Servers":{"Wg":[{"Ip":"1.1.1.1","Cn":"a1"}],"Meta":[{"Ip":"2.2.2.2","Cn":"a2"}]}}]}"#;
        let signed = format!("{}\n\nQmFzZTY0U2lnbmF0dXJl+/=\n{{not json", clean);

        let from_clean = RegionDirectory::from_feed(clean).unwrap();
        let from_signed = RegionDirectory::from_feed(&signed).unwrap();

        assert_eq!(from_clean.regions(), from_signed.regions());
        assert_eq!(from_signed.regions()[0].gateway().unwrap().common_name, "a1");
    }

    #[test]
    fn test_feed_without_json() {
        assert!(matches!(
            RegionDirectory::from_feed("signature only"),
            Err(RegionError::ParseError(_))
        ));
        assert!(matches!(
            RegionDirectory::from_feed("{\"regions\": [}"),
            Err(RegionError::ParseError(_))
        ));
    }

    #[test]
    fn test_resolve() {
        let regions = vec![usable("a"), usable("b"), usable("c")];

        assert_eq!(resolve(&regions, "b").unwrap().id, "b");
        assert!(matches!(
            resolve(&regions, "z"),
            Err(RegionError::UnknownRegion(id)) if id == "z"
        ));
        assert!(resolve(&regions, "B").is_err());
    }

    #[test]
    fn test_resolve_rejects_unusable_region() {
        let directory = RegionDirectory::from_feed(FEED).unwrap();

        assert!(directory.resolve("uk_london").is_ok());
        assert!(matches!(
            directory.resolve("fr_paris"),
            Err(RegionError::UnknownRegion(_))
        ));
    }

    #[test]
    fn test_filter_case_insensitive() {
        let regions = vec![
            named("uk", "London", 0),
            named("fr", "Paris", 0),
            named("ee", "Tallinn", 0),
        ];

        assert_eq!(names(&filter_regions(&regions, "Lon", false)), vec!["London"]);
        assert!(filter_regions(&regions, "lon", true).is_empty());
        assert_eq!(names(&filter_regions(&regions, "Lon", true)), vec!["London"]);
    }

    #[test]
    fn test_filter_matches_id() {
        let regions = vec![named("uk_london", "UK", 0), named("fr", "France", 0)];
        assert_eq!(names(&filter_regions(&regions, "london", true)), vec!["UK"]);
        assert_eq!(filter_regions(&regions, "", true).len(), 2);
    }

    #[test]
    fn test_sort_by_name_reverses() {
        let mut asc = vec![
            named("a", "f", 0),
            named("b", "b", 1),
            named("c", "e", 2),
            named("d", "c", 3),
            named("e", "d", 4),
            named("f", "a", 5),
        ];
        let mut desc = asc.clone();

        sort_regions(&mut asc, SortKey::Name, SortOrder::Asc);
        sort_regions(&mut desc, SortKey::Name, SortOrder::Desc);

        assert_eq!(names(&asc), vec!["a", "b", "c", "d", "e", "f"]);
        let mut reversed = names(&desc);
        reversed.reverse();
        assert_eq!(names(&asc), reversed);
    }

    #[test]
    fn test_sort_by_id_and_ping() {
        let mut regions = vec![
            named("c", "x", 30),
            named("a", "y", LATENCY_FAILED),
            named("b", "z", 1),
        ];

        sort_regions(&mut regions, SortKey::Id, SortOrder::Desc);
        let ids: Vec<_> = regions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        sort_regions(&mut regions, SortKey::Ping, SortOrder::Asc);
        let pings: Vec<_> = regions.iter().map(|r| r.latency_ms).collect();
        assert_eq!(pings, vec![1, 30, LATENCY_FAILED]);
    }

    #[test]
    fn test_sort_is_stable() {
        let original = vec![
            named("first", "same", 7),
            named("x", "other", 1),
            named("second", "same", 7),
            named("third", "same", 7),
        ];

        for order in [SortOrder::Asc, SortOrder::Desc] {
            for key in [SortKey::Name, SortKey::Ping] {
                let mut regions = original.clone();
                sort_regions(&mut regions, key, order);
                let same: Vec<_> = regions
                    .iter()
                    .filter(|r| r.name == "same")
                    .map(|r| r.id.as_str())
                    .collect();
                assert_eq!(same, vec!["first", "second", "third"], "{} {}", key, order);
            }
        }
    }

    #[test]
    fn test_sort_option_parse() {
        assert_eq!("NAME".parse::<SortKey>().unwrap(), SortKey::Name);
        assert_eq!("desc".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("latency".parse::<SortKey>().is_err());
        assert!("up".parse::<SortOrder>().is_err());
    }

    #[test]
    fn test_latency_label() {
        assert_eq!(named("a", "a", LATENCY_UNPROBED).latency_label(), "");
        assert_eq!(named("a", "a", 42).latency_label(), "42");
        assert_eq!(named("a", "a", LATENCY_FAILED).latency_label(), "10000");
    }

    struct FeedTransport {
        status: StatusCode,
        body: &'static str,
    }

    impl HttpTransport for FeedTransport {
        async fn get(&self, request: GetRequest) -> Result<Response, HttpError> {
            assert!(request.pin().is_none());
            Ok(Response::new(self.status, self.body))
        }
    }

    #[tokio::test]
    async fn test_fetch_directory() {
        let transport = FeedTransport {
            status: StatusCode::OK,
            body: FEED,
        };
        let directory = fetch_directory(&transport, "https://feed.example/v4").await.unwrap();
        assert_eq!(directory.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_directory_error_status() {
        let transport = FeedTransport {
            status: StatusCode::BAD_GATEWAY,
            body: "",
        };
        let result = fetch_directory(&transport, "https://feed.example/v4").await;
        assert!(matches!(result, Err(RegionError::Fetch(_))));
    }
}
