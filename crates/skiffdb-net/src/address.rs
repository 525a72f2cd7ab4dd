use std::fmt;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use url::Url;

use skiffdb_core::error::{Error, NetworkError, Result};

/// A replication endpoint: scheme, host, port and DB path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

impl Address {
    pub fn new(
        scheme: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        let mut path = path.into();
        if path.is_empty() {
            path.push('/');
        }
        Address {
            scheme: scheme.into(),
            hostname: hostname.into(),
            port,
            path,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| Error::Network {
            code: NetworkError::InvalidUrl,
            message: format!("bad URL '{url}': {e}"),
        })?;
        let scheme = parsed.scheme().to_ascii_lowercase();
        if !matches!(scheme.as_str(), "ws" | "wss" | "http" | "https") {
            return Err(Error::Network {
                code: NetworkError::InvalidUrl,
                message: format!("unsupported scheme '{scheme}'"),
            });
        }
        let hostname = parsed
            .host_str()
            .ok_or_else(|| Error::Network {
                code: NetworkError::InvalidUrl,
                message: format!("URL '{url}' has no host"),
            })?
            .to_string();
        let port = parsed
            .port()
            .unwrap_or_else(|| default_port(&scheme));
        Ok(Address::new(scheme, hostname, port, parsed.path()))
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "wss" | "https")
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.scheme.as_str(), "ws" | "wss")
    }

    pub fn url(&self) -> String {
        self.to_string()
    }

    /// Stable form used when hashing checkpoint identities: scheme
    /// normalized, default ports elided, trailing slash trimmed.
    pub fn stable_url(&self) -> String {
        let path = self.path.trim_end_matches('/');
        if self.port == default_port(&self.scheme) {
            format!("{}://{}{}", self.scheme, self.hostname, path)
        } else {
            format!("{}://{}:{}{}", self.scheme, self.hostname, self.port, path)
        }
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "wss" | "https" => 443,
        _ => 80,
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme, self.hostname, self.port, self.path
        )
    }
}

/// Proxy flavors the upgrade logic understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Https,
}

/// A proxy server plus optional credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub proxy_type: ProxyType,
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySpec {
    pub fn new(proxy_type: ProxyType, hostname: impl Into<String>, port: u16) -> Self {
        ProxySpec {
            proxy_type,
            hostname: hostname.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn from_address(proxy_type: ProxyType, address: &Address) -> Self {
        Self::new(proxy_type, address.hostname.clone(), address.port)
    }

    /// The address to open the TCP connection to.
    pub fn address(&self) -> Address {
        let scheme = match self.proxy_type {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
        };
        Address::new(scheme, self.hostname.clone(), self.port, "/")
    }
}

/// Percent-encodes one path segment (e.g. a database or document name).
pub fn encode_path_segment(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ws_urls_with_defaults() {
        let a = Address::from_url("wss://db.example.com/mydb").unwrap();
        assert_eq!(a.scheme, "wss");
        assert_eq!(a.hostname, "db.example.com");
        assert_eq!(a.port, 443);
        assert_eq!(a.path, "/mydb");
        assert!(a.is_secure());
        assert!(a.is_websocket());

        let b = Address::from_url("ws://h:4984/db").unwrap();
        assert_eq!(b.port, 4984);
        assert!(!b.is_secure());
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(Address::from_url("ftp://x/y").is_err());
        assert!(Address::from_url("not a url").is_err());
    }

    #[test]
    fn stable_url_elides_default_port() {
        let a = Address::from_url("wss://h/db/").unwrap();
        assert_eq!(a.stable_url(), "wss://h/db");
        let b = Address::from_url("ws://h:4984/db").unwrap();
        assert_eq!(b.stable_url(), "ws://h:4984/db");
    }

    #[test]
    fn proxy_address() {
        let p = ProxySpec::new(ProxyType::Http, "p", 3128);
        let a = p.address();
        assert_eq!(a.scheme, "http");
        assert_eq!(a.port, 3128);
    }

    #[test]
    fn path_segment_encoding() {
        assert_eq!(encode_path_segment("a/b c"), "a%2Fb%20c");
    }
}
