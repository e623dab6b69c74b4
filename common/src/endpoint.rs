//! Stream endpoints and the typed `/mjpeg` request.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

/// A multicast RTP source: group address plus UDP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamEndpoint {
    address: Ipv4Addr,
    port: u16,
}

impl StreamEndpoint {
    /// Build an endpoint, rejecting the unspecified address and port 0.
    pub fn new(address: Ipv4Addr, port: u16) -> Result<Self, RequestError> {
        if address.is_unspecified() {
            return Err(RequestError::Invalid {
                name: "ip",
                value: address.to_string(),
            });
        }
        if port == 0 {
            return Err(RequestError::Invalid {
                name: "port",
                value: "0".into(),
            });
        }
        Ok(Self { address, port })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Key used by the payload-type cache, e.g. `239.1.1.1:5000`.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Rejected query parameters. Always the client's fault (HTTP 400).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("missing required parameter `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{name}`: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// A validated `GET /mjpeg` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub endpoint: StreamEndpoint,
    /// Skip the cache and sniff the group again.
    pub force_detect: bool,
}

impl StreamRequest {
    /// Validate raw query parameters (`ip`, `port`, optional `force_detect`).
    /// `ip` must be an IPv4 multicast group.
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self, RequestError> {
        let ip = params
            .get("ip")
            .filter(|v| !v.is_empty())
            .ok_or(RequestError::Missing("ip"))?;
        let port = params
            .get("port")
            .filter(|v| !v.is_empty())
            .ok_or(RequestError::Missing("port"))?;

        let address: Ipv4Addr = ip.parse().map_err(|_| RequestError::Invalid {
            name: "ip",
            value: ip.clone(),
        })?;
        let port: u16 = port.parse().map_err(|_| RequestError::Invalid {
            name: "port",
            value: port.clone(),
        })?;
        // Only groups can be joined.
        if !address.is_multicast() {
            return Err(RequestError::Invalid {
                name: "ip",
                value: ip.clone(),
            });
        }

        let force_detect = params
            .get("force_detect")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Ok(Self {
            endpoint: StreamEndpoint::new(address, port)?,
            force_detect,
        })
    }
}
