//! Trusted proxy header classification.
//!
//! Decides whether a request reached the upstream proxy over TLS. Only the
//! headers listed in `proxy.secure_scheme_headers` are consulted, and only when
//! the connecting peer is listed in `proxy.forwarded_allow_ips`. Everything else
//! falls back to the scheme of the socket the worker is serving.

use std::fmt;
use std::net::IpAddr;

use http::header::{HeaderMap, HeaderName};

use crate::config::ProxyConfig;

/// Wildcard entry in `forwarded_allow_ips`
pub const TRUST_ALL_PEERS: &str = "*";

/// Scheme a request is classified under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyConfigError {
    #[error("Invalid secure scheme header name '{0}'")]
    HeaderName(String),
    #[error("Secure scheme header '{0}' has an empty expected value")]
    EmptyValue(String),
    #[error("Secure scheme header '{0}' is listed more than once")]
    DuplicateHeader(String),
    #[error("Invalid forwarded_allow_ips entry '{0}'")]
    AllowIp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemeError {
    #[error("Contradictory scheme headers")]
    Contradictory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AllowedPeers {
    Any,
    List(Vec<IpAddr>),
}

impl AllowedPeers {
    fn contains(&self, peer: IpAddr) -> bool {
        match self {
            AllowedPeers::Any => true,
            AllowedPeers::List(ips) => ips.iter().any(|ip| *ip == normalize(peer)),
        }
    }
}

/// IPv4 peers reach dual-stack listeners as mapped IPv6 addresses
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Parsed trust list for forwarded-protocol headers.
#[derive(Debug, Clone)]
pub struct ProxyTrust {
    headers: Vec<(HeaderName, String)>,
    peers: AllowedPeers,
}

impl ProxyTrust {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyConfigError> {
        let mut headers = Vec::with_capacity(config.secure_scheme_headers.len());
        for (name, value) in &config.secure_scheme_headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ProxyConfigError::HeaderName(name.clone()))?;
            // Names are case-insensitive, so two spellings are one header
            if headers.iter().any(|(seen, _)| *seen == header) {
                return Err(ProxyConfigError::DuplicateHeader(name.clone()));
            }
            let value = value.trim();
            if value.is_empty() {
                return Err(ProxyConfigError::EmptyValue(name.clone()));
            }
            headers.push((header, value.to_string()));
        }

        let peers = if config
            .forwarded_allow_ips
            .iter()
            .any(|entry| entry.trim() == TRUST_ALL_PEERS)
        {
            AllowedPeers::Any
        } else {
            let ips = config
                .forwarded_allow_ips
                .iter()
                .map(|entry| {
                    entry
                        .trim()
                        .parse::<IpAddr>()
                        .map(normalize)
                        .map_err(|_| ProxyConfigError::AllowIp(entry.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            AllowedPeers::List(ips)
        };

        Ok(Self { headers, peers })
    }

    /// Classify a request.
    ///
    /// `base` is the scheme of the socket itself. An unknown peer is never trusted.
    pub fn classify(
        &self,
        base: Scheme,
        peer: Option<IpAddr>,
        headers: &HeaderMap,
    ) -> Result<Scheme, SchemeError> {
        let trusted = peer.is_some_and(|ip| self.peers.contains(ip));
        if !trusted {
            return Ok(base);
        }

        let mut forwarded: Option<Scheme> = None;
        for (name, expected) in &self.headers {
            for value in headers.get_all(name) {
                let value = value
                    .to_str()
                    .map(|v| v.trim_matches(|c| c == ' ' || c == '\t'))
                    .unwrap_or_default();
                let scheme = if value == expected {
                    Scheme::Https
                } else {
                    Scheme::Http
                };
                match forwarded {
                    Some(seen) if seen != scheme => return Err(SchemeError::Contradictory),
                    _ => forwarded = Some(scheme),
                }
            }
        }

        Ok(forwarded.unwrap_or(base))
    }
}
