//! URL decomposition and host resolution.
//!
//! # Design
//! `Resolver` turns a URL into an `Endpoint` with an already-resolved address,
//! so connections never block on DNS. Lookups go through a `HostLookup` and
//! are cached per resolver for its whole lifetime; entries are never evicted.
//! The cache sits behind a mutex so one resolver can be shared by several
//! engines through an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use parking_lot::Mutex;
use tracing::debug;
use url::{Host, Url};

use crate::error::EngineError;

/// Transport security of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(self) -> bool {
        self == Scheme::Https
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        })
    }
}

/// A fully resolved request destination. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    /// Lowercased host name or IP literal, without IPv6 brackets.
    pub host: String,
    pub address: IpAddr,
    pub port: u16,
    /// Path plus `?query`, as written on the request line.
    pub target: String,
}

impl Endpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Value of the `Host` header: the port is appended unless it is the
    /// scheme's default.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// A blocking name lookup.
pub trait HostLookup: Send + Sync {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolves names with the operating system's resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Ok((host, 0).to_socket_addrs()?.map(|a| a.ip()).collect())
    }
}

/// URL resolver with a host to address cache.
pub struct Resolver {
    lookup: Box<dyn HostLookup>,
    cache: Mutex<HashMap<String, IpAddr>>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Self::with_lookup(SystemLookup)
    }

    pub fn with_lookup(lookup: impl HostLookup + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Decompose `url` and resolve its host.
    pub fn resolve(&self, url: &str) -> Result<Endpoint, EngineError> {
        let invalid = |reason: &str| EngineError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
        let scheme = Scheme::parse(parsed.scheme())
            .ok_or_else(|| invalid("only http and https are supported"))?;

        let (host, address) = match parsed.host() {
            Some(Host::Domain(name)) => {
                let name = name.to_ascii_lowercase();
                let address = self.lookup_host(&name)?;
                (name, address)
            }
            Some(Host::Ipv4(ip)) => (ip.to_string(), IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => (ip.to_string(), IpAddr::V6(ip)),
            None => return Err(invalid("missing host")),
        };

        let port = parsed.port().unwrap_or_else(|| scheme.default_port());
        let target = match parsed.query() {
            Some(query) => format!("{}?{query}", parsed.path()),
            None => parsed.path().to_string(),
        };

        Ok(Endpoint {
            scheme,
            host,
            address,
            port,
            target,
        })
    }

    /// Resolve a host name, consulting the cache first. IPv4 results are
    /// preferred over IPv6.
    pub fn lookup_host(&self, host: &str) -> Result<IpAddr, EngineError> {
        if let Some(ip) = self.cached(host) {
            return Ok(ip);
        }

        let unresolvable = || EngineError::UnresolvableHost {
            host: host.to_string(),
        };
        let addresses = self.lookup.lookup(host).map_err(|e| {
            debug!(host, error = %e, "host lookup failed");
            unresolvable()
        })?;
        let ip = addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
            .ok_or_else(unresolvable)?;

        debug!(host, %ip, "resolved host");
        self.cache.lock().insert(host.to_string(), ip);
        Ok(ip)
    }

    pub fn cached(&self, host: &str) -> Option<IpAddr> {
        self.cache.lock().get(host).copied()
    }
}
