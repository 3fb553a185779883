use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use nspmux_transport::TransportRequest;

/// Query parameters from the transport request and the CONNECT packet.
pub type Query = HashMap<String, String>;

/// Header names whose values never appear in debug output.
const REDACTED_HEADERS: &[&str] = &["authorization", "cookie"];

/// Connection metadata captured once, when a socket is created.
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Request headers, keys lowercased.
    pub headers: HashMap<String, String>,
    /// Wall-clock creation time.
    pub time: SystemTime,
    /// Creation time in milliseconds since the Unix epoch.
    pub issued: u64,
    /// Remote address as reported by the transport.
    pub address: String,
    /// Whether the transport is encrypted.
    pub secure: bool,
    /// Request URL including its query string.
    pub url: String,
    /// Request query merged with the CONNECT query; CONNECT values win.
    pub query: Query,
}

impl Handshake {
    pub fn new(request: &TransportRequest, connect_query: &Query) -> Self {
        let time = SystemTime::now();
        let issued = time
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        let mut query = request_query(&request.url);
        query.extend(
            connect_query
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        Self {
            headers: request
                .headers
                .iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), value.clone()))
                .collect(),
            time,
            issued,
            address: request.address.clone(),
            secure: request.secure,
            url: request.url.clone(),
            query,
        }
    }

    /// Look up a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Look up a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: BTreeMap<&str, String> = self
            .headers
            .iter()
            .map(|(key, value)| {
                let shown = if REDACTED_HEADERS.contains(&key.as_str()) {
                    format!("<redacted:{} bytes>", value.len())
                } else {
                    value.clone()
                };
                (key.as_str(), shown)
            })
            .collect();
        f.debug_struct("Handshake")
            .field("headers", &headers)
            .field("issued", &self.issued)
            .field("address", &self.address)
            .field("secure", &self.secure)
            .field("url", &self.url)
            .field("query", &self.query)
            .finish()
    }
}

/// Split a namespace string from a CONNECT packet into name and query.
pub(crate) fn parse_connect_nsp(raw: &str) -> (String, Query) {
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw, Query::new()),
    };
    (nspmux_codec::normalize_nsp(path).to_string(), query)
}

fn request_query(url: &str) -> Query {
    url.split_once('?')
        .map(|(_, query)| parse_query(query))
        .unwrap_or_default()
}

fn parse_query(query: &str) -> Query {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransportRequest {
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), "tests".to_string());
        headers.insert("Authorization".to_string(), "Bearer secret".to_string());
        TransportRequest {
            url: "/?token=outer&lang=en".to_string(),
            headers,
            address: "10.0.0.1".to_string(),
            secure: true,
        }
    }

    #[test]
    fn connect_query_overrides_request_query() {
        let mut connect = Query::new();
        connect.insert("token".to_string(), "inner".to_string());

        let handshake = Handshake::new(&request(), &connect);
        assert_eq!(handshake.query_param("token"), Some("inner"));
        assert_eq!(handshake.query_param("lang"), Some("en"));
        assert_eq!(handshake.header("user-agent"), Some("tests"));
        assert!(handshake.secure);
        assert!(handshake.issued > 0);
    }

    #[test]
    fn debug_redacts_credentials() {
        let handshake = Handshake::new(&request(), &Query::new());
        let rendered = format!("{handshake:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted:13 bytes>"));
        assert!(rendered.contains("tests"));
    }

    #[test]
    fn connect_nsp_parsing() {
        let (name, query) = parse_connect_nsp("/chat?token=a%20b&x=1");
        assert_eq!(name, "/chat");
        assert_eq!(query.get("token").map(String::as_str), Some("a b"));
        assert_eq!(query.get("x").map(String::as_str), Some("1"));

        let (name, query) = parse_connect_nsp("");
        assert_eq!(name, "/");
        assert!(query.is_empty());

        let (name, _) = parse_connect_nsp("?x=1");
        assert_eq!(name, "/");
    }
}
