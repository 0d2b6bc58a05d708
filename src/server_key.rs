//! Canonical server identifier: `host:port:protocol`.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport a server is reachable over. `S` is TLS/SSL, `T` is plaintext TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "s")]
    Ssl,
    #[serde(rename = "t")]
    Tcp,
}

impl Protocol {
    pub fn as_char(&self) -> char {
        match self {
            Protocol::Ssl => 's',
            Protocol::Tcp => 't',
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" | "S" => Ok(Protocol::Ssl),
            "t" | "T" => Ok(Protocol::Tcp),
            other => Err(Error::BadServerKey(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// `host:port:protocol`, e.g. `electrum.example.com:50002:s`.
///
/// Serializes with [`Display`]/[`FromStr`] rather than a derived struct so it
/// round-trips through the same colon-joined form used as a `HashMap` key and
/// on the wire for `recent-servers`/`server_blacklist` persistence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl ServerKey {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        ServerKey {
            host: host.into(),
            port,
            protocol,
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.protocol)
    }
}

impl FromStr for ServerKey {
    type Err = Error;

    /// Splits from the right: the host is whatever is left after stripping
    /// the last two colon-delimited fields (port, protocol), so an IPv6
    /// literal without brackets would be misparsed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let protocol = parts
            .next()
            .ok_or_else(|| Error::BadServerKey(s.to_string()))?;
        let port = parts
            .next()
            .ok_or_else(|| Error::BadServerKey(s.to_string()))?;
        let host = parts
            .next()
            .ok_or_else(|| Error::BadServerKey(s.to_string()))?;
        if parts.next().is_some() || host.is_empty() {
            return Err(Error::BadServerKey(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::BadServerKey(s.to_string()))?;
        let protocol: Protocol = protocol.parse()?;
        Ok(ServerKey {
            host: host.to_string(),
            port,
            protocol,
        })
    }
}

impl Serialize for ServerKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ServerKey::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let key = ServerKey::new("electrum.example.com", 50002, Protocol::Ssl);
        let s = key.to_string();
        assert_eq!(s, "electrum.example.com:50002:s");
        let back: ServerKey = s.parse().unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn rejects_garbage() {
        assert!("no-colons-here".parse::<ServerKey>().is_err());
        assert!("host:notaport:s".parse::<ServerKey>().is_err());
        assert!("host:50002:x".parse::<ServerKey>().is_err());
    }

    #[test]
    fn protocol_accepts_upper_and_lower() {
        assert_eq!("s".parse::<Protocol>().unwrap(), Protocol::Ssl);
        assert_eq!("T".parse::<Protocol>().unwrap(), Protocol::Tcp);
    }

    #[test]
    fn json_round_trip() {
        let key = ServerKey::new("1.2.3.4", 50001, Protocol::Tcp);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"1.2.3.4:50001:t\"");
        let back: ServerKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
