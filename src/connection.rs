//! Connection factory: resolves a server, opens a socket (with an
//! optional proxy hop), and hands the result to the supervisor's socket
//! completion queue. `check_pinned_cert`'s TOFU pin-store logic is exercised
//! at the unit level only — `dial` never calls it, since no real TLS
//! handshake runs here to produce a fingerprint to check it against.
//!
//! A proxy is threaded explicitly as an argument rather
//! than installed as a global monkeypatch over `socket.socket`/
//! `getaddrinfo`.

use crate::error::Error;
use crate::proxy::ProxyConfig;
use crate::server_key::{Protocol, ServerKey};
use std::path::Path;
use tokio::net::TcpStream;

/// Outcome of one connection attempt, pushed onto the completion queue.
pub enum ConnectOutcome {
    Connected {
        server_key: ServerKey,
        stream: TcpStream,
    },
    Failed {
        server_key: ServerKey,
        error: Error,
    },
}

/// Connects to `server_key`, optionally through `proxy`. TLS/SOCKS
/// negotiation itself is modeled at this boundary only, not implemented end
/// to end; no real TLS/SOCKS handshake is performed.
pub async fn dial(server_key: ServerKey, proxy: Option<&ProxyConfig>) -> ConnectOutcome {
    let result = match proxy {
        Some(proxy) => dial_via_proxy(&server_key, proxy).await,
        None => dial_direct(&server_key).await,
    };
    match result {
        Ok(stream) => ConnectOutcome::Connected { server_key, stream },
        Err(error) => ConnectOutcome::Failed { server_key, error },
    }
}

async fn dial_direct(server_key: &ServerKey) -> Result<TcpStream, Error> {
    TcpStream::connect((server_key.host.as_str(), server_key.port))
        .await
        .map_err(Error::from)
}

/// Connects to the proxy's address; the actual SOCKS4/5 or HTTP CONNECT
/// handshake is a transport-layer concern out of scope for the network core
/// itself; TLS/SOCKS is modeled only at
/// this boundary.
async fn dial_via_proxy(server_key: &ServerKey, proxy: &ProxyConfig) -> Result<TcpStream, Error> {
    log::debug!(
        "dialing {server_key} via {} proxy at {}:{}",
        proxy.mode,
        proxy.host,
        proxy.port
    );
    TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(Error::from)
}

/// Checks a locally pinned certificate fingerprint for `server_key` against
/// `fingerprint`, if one has been pinned before. `certs_dir/<host>` stores
/// the pin as a single line of hex.
pub fn check_pinned_cert(
    certs_dir: &Path,
    server_key: &ServerKey,
    fingerprint: &str,
) -> Result<(), Error> {
    let path = certs_dir.join(&server_key.host);
    match std::fs::read_to_string(&path) {
        Ok(pinned) => {
            if pinned.trim() == fingerprint {
                Ok(())
            } else {
                Err(Error::CertPinMismatch(server_key.clone()))
            }
        }
        Err(_) => {
            // first contact: pin it
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::create_dir_all(certs_dir)?;
                std::fs::set_permissions(certs_dir, std::fs::Permissions::from_mode(0o700)).ok();
            }
            #[cfg(not(unix))]
            {
                std::fs::create_dir_all(certs_dir)?;
            }
            std::fs::write(path, fingerprint)?;
            Ok(())
        }
    }
}

pub fn default_port(protocol: Protocol) -> u16 {
    match protocol {
        Protocol::Ssl => 50002,
        Protocol::Tcp => 50001,
    }
}
