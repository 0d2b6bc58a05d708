//! Proxy configuration, colon-serialized the same way as a [`crate::server_key::ServerKey`].

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Socks4,
    Socks5,
    Http,
}

impl ProxyMode {
    fn default_port(&self) -> u16 {
        match self {
            ProxyMode::Http => 8080,
            ProxyMode::Socks4 | ProxyMode::Socks5 => 1080,
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyMode::Socks4 => "socks4",
            ProxyMode::Socks5 => "socks5",
            ProxyMode::Http => "http",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socks4" => Ok(ProxyMode::Socks4),
            "socks5" => Ok(ProxyMode::Socks5),
            "http" => Ok(ProxyMode::Http),
            other => Err(Error::BadProxyConfig(other.to_string())),
        }
    }
}

/// A configured outbound proxy. Threaded explicitly through the connection
/// factory rather than installed as a process-global socket monkeypatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.mode, self.host, self.port)?;
        if let Some(user) = &self.user {
            write!(f, ":{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
        }
        Ok(())
    }
}

impl FromStr for ProxyConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("none") {
            return Err(Error::BadProxyConfig(
                "\"none\" deserializes to Option::None, not ProxyConfig".to_string(),
            ));
        }
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 {
            return Err(Error::BadProxyConfig(s.to_string()));
        }
        let mode: ProxyMode = parts[0].parse()?;
        let host = parts[1].to_string();
        let port = match parts.get(2) {
            Some(p) => p.parse().map_err(|_| Error::BadProxyConfig(s.to_string()))?,
            None => mode.default_port(),
        };
        let user = parts.get(3).map(|s| s.to_string());
        let password = parts.get(4).map(|s| s.to_string());
        Ok(ProxyConfig {
            mode,
            host,
            port,
            user,
            password,
        })
    }
}

/// Parses the persisted `proxy` config key, where the literal string `"none"`
/// (any case) means "no proxy configured".
pub fn deserialize_proxy(s: &str) -> Result<Option<ProxyConfig>, Error> {
    if s.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        Ok(Some(s.parse()?))
    }
}

pub fn serialize_proxy(proxy: Option<&ProxyConfig>) -> String {
    match proxy {
        Some(p) => p.to_string(),
        None => "none".to_string(),
    }
}

impl Serialize for ProxyConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProxyConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
