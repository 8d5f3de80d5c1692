use std::{fmt, str::FromStr};

use thiserror::Error;
use url::Url;

/// Errors related to destination parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DestinationError {
    #[error("Invalid destination '{0}': {1}")]
    Invalid(String, String),
}

/// Result type for destination operations
pub type DestinationResult<T> = Result<T, DestinationError>;

const INTERNAL_PREFIX: &str = "internal:";
const SERVICE_PREFIX: &str = "service:";

/// A parsed destination candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `http://` or `https://` URL
    Absolute(Target),
    /// Bare `host:port`, as carried by `CONNECT` requests
    Authority { host: String, port: u16 },
    /// `internal:<rule>` or `service:<rule>`, routed inside the process
    Internal(String),
}

/// Network identity of an absolute destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    path_and_query: String,
}

impl Target {
    /// Path plus query in origin-form, always starting with `/`.
    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    /// Host usable for DNS and SNI (IPv6 brackets removed).
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// `host:port` as sent in a `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }
}

impl Destination {
    pub fn parse(value: &str) -> DestinationResult<Self> {
        if let Some(name) = value
            .strip_prefix(INTERNAL_PREFIX)
            .or_else(|| value.strip_prefix(SERVICE_PREFIX))
        {
            let name = name.trim_start_matches("//");
            if name.is_empty() {
                return Err(DestinationError::Invalid(
                    value.to_string(),
                    "missing rule name".to_string(),
                ));
            }
            return Ok(Destination::Internal(name.to_string()));
        }

        if value.starts_with("http://") || value.starts_with("https://") {
            let url = Url::parse(value)
                .map_err(|e| DestinationError::Invalid(value.to_string(), e.to_string()))?;
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| {
                    DestinationError::Invalid(value.to_string(), "missing host".to_string())
                })?
                .to_string();
            let port = url.port_or_known_default().ok_or_else(|| {
                DestinationError::Invalid(value.to_string(), "missing port".to_string())
            })?;
            let mut path_and_query = url.path().to_string();
            if let Some(query) = url.query() {
                path_and_query.push('?');
                path_and_query.push_str(query);
            }
            return Ok(Destination::Absolute(Target {
                host,
                port,
                secure: url.scheme() == "https",
                path_and_query,
            }));
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains('/') => {
                let port = port.parse().map_err(|_| {
                    DestinationError::Invalid(value.to_string(), "invalid port".to_string())
                })?;
                Ok(Destination::Authority {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(DestinationError::Invalid(
                value.to_string(),
                "expected http(s) URL, host:port or internal:<name>".to_string(),
            )),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Destination::Internal(_))
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Destination::parse(s)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Absolute(t) => {
                write!(f, "{}://{}{}", t.scheme(), t.authority(), t.path_and_query)
            }
            Destination::Authority { host, port } => write!(f, "{host}:{port}"),
            Destination::Internal(name) => write!(f, "{INTERNAL_PREFIX}{name}"),
        }
    }
}

/// Append the request's path and query to a base target URL. A base that
/// already carries a path other than `/` is used verbatim.
pub fn combine_with_request(base: &str, path_and_query: &str) -> String {
    let base_path = base
        .split_once("://")
        .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("");
    if base_path.is_empty() || base_path == "/" {
        format!("{}{}", base.trim_end_matches('/'), path_and_query)
    } else {
        base.to_string()
    }
}
