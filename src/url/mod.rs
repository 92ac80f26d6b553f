
use std::fmt;
use std::net::SocketAddr;

use crate::error::*;

/// Default port for `stun:` URLs, RFC 5389 section 9.
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// The kind of server a URL names.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum SchemeType {
    /// The URL represents a STUN server.
    Stun,

    /// The URL represents a TURN server. Parsed for diagnostics but
    /// rejected: this agent does not relay.
    Turn,

    Unknown,
}

impl Default for SchemeType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl From<&str> for SchemeType {
    fn from(raw: &str) -> Self {
        match raw {
            "stun" => Self::Stun,
            "turn" | "turns" | "stuns" => Self::Turn,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SchemeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SchemeType::Stun => "stun",
            SchemeType::Turn => "turn",
            SchemeType::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A STUN server address (RFC 7064 subset: `stun:host[:port]`, bare
/// `host[:port]` also accepted).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    pub scheme: SchemeType,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains("::") {
            write!(f, "{}:[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}:{}:{}", self.scheme, self.host, self.port)
        }
    }
}

impl Url {
    /// Parses a server address. Query parts and TURN schemes are rejected.
    pub fn parse_url(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::ErrInvalidUrl);
        }

        let (scheme, rest) = match raw.split_once(':') {
            Some((s, r)) if SchemeType::from(s) != SchemeType::Unknown => {
                (SchemeType::from(s), r)
            }
            _ => (SchemeType::Stun, raw),
        };

        if scheme != SchemeType::Stun {
            return Err(Error::ErrSchemeType);
        }
        if rest.contains('?') {
            return Err(Error::ErrInvalidUrl);
        }

        // RFC 3986 does the heavy lifting for bracketed IPv6 and ports.
        let parsed = url::Url::parse(&format!("stun://{rest}"))?;
        let host = parsed
            .host_str()
            .ok_or(Error::ErrHost)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        if host.is_empty() {
            return Err(Error::ErrHost);
        }
        let port = parsed.port().unwrap_or(DEFAULT_STUN_PORT);

        Ok(Self {
            scheme: SchemeType::Stun,
            host,
            port,
        })
    }

    /// Resolves the host to a socket address, preferring the given family.
    pub async fn resolve(&self, want_ipv4: bool) -> Result<SocketAddr> {
        let mut fallback = None;
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        for addr in addrs {
            if addr.is_ipv4() == want_ipv4 {
                return Ok(addr);
            }
            fallback.get_or_insert(addr);
        }
        fallback.ok_or(Error::ErrHost)
    }
}
