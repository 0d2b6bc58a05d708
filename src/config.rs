//! Persisted configuration: `config.json`, the `recent-servers`
//! MRU list, and the server blacklist — everything that must survive a
//! restart, written atomically (`write to .tmp`, `rename` over).

use crate::error::Error;
use crate::proxy::{deserialize_proxy, serialize_proxy, ProxyConfig};
use crate::server_key::ServerKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Most recently used servers list is capped at this many entries, same as
/// most-recently-used, capped and deduplicated.
pub const RECENT_SERVERS_CAP: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedConfig {
    server: Option<ServerKey>,
    proxy: String,
    auto_connect: bool,
    oneserver: bool,
    blockchain_index: u64,
    server_blacklist: HashSet<ServerKey>,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        PersistedConfig {
            server: None,
            proxy: "none".to_string(),
            auto_connect: true,
            oneserver: false,
            blockchain_index: 0,
            server_blacklist: HashSet::new(),
        }
    }
}

/// In-memory view of `config.json`, plus the path it's persisted under.
pub struct Config {
    path: PathBuf,
    inner: PersistedConfig,
}

impl Config {
    /// Loads `config.json` from `data_dir`, falling back to defaults if
    /// absent or unreadable.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("config.json");
        let inner = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Config { path, inner }
    }

    fn save(&self) -> Result<(), Error> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(&self.inner)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn server(&self) -> Option<&ServerKey> {
        self.inner.server.as_ref()
    }

    pub fn set_server(&mut self, server: Option<ServerKey>) -> Result<(), Error> {
        self.inner.server = server;
        self.save()
    }

    pub fn proxy(&self) -> Result<Option<ProxyConfig>, Error> {
        deserialize_proxy(&self.inner.proxy)
    }

    pub fn set_proxy(&mut self, proxy: Option<&ProxyConfig>) -> Result<(), Error> {
        self.inner.proxy = serialize_proxy(proxy);
        self.save()
    }

    pub fn auto_connect(&self) -> bool {
        self.inner.auto_connect
    }

    pub fn set_auto_connect(&mut self, value: bool) -> Result<(), Error> {
        self.inner.auto_connect = value;
        self.save()
    }

    pub fn oneserver(&self) -> bool {
        self.inner.oneserver
    }

    pub fn set_oneserver(&mut self, value: bool) -> Result<(), Error> {
        self.inner.oneserver = value;
        self.save()
    }

    pub fn blockchain_index(&self) -> u64 {
        self.inner.blockchain_index
    }

    pub fn set_blockchain_index(&mut self, index: u64) -> Result<(), Error> {
        self.inner.blockchain_index = index;
        self.save()
    }

    pub fn is_blacklisted(&self, server: &ServerKey) -> bool {
        self.inner.server_blacklist.contains(server)
    }

    pub fn blacklist(&mut self, server: ServerKey) -> Result<(), Error> {
        self.inner.server_blacklist.insert(server);
        self.save()
    }

    pub fn remove_from_blacklist(&mut self, server: &ServerKey) -> Result<(), Error> {
        self.inner.server_blacklist.remove(server);
        self.save()
    }
}

/// The `recent-servers` file: a JSON array of `ServerKey` strings, most
/// recently used first, capped at [`RECENT_SERVERS_CAP`].
pub struct RecentServers {
    path: PathBuf,
    entries: Vec<ServerKey>,
}

impl RecentServers {
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("recent-servers");
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        RecentServers { path, entries }
    }

    pub fn entries(&self) -> &[ServerKey] {
        &self.entries
    }

    /// Moves `server` to the front, trimming the tail past the cap.
    pub fn touch(&mut self, server: ServerKey) -> Result<(), Error> {
        self.entries.retain(|s| s != &server);
        self.entries.insert(0, server);
        self.entries.truncate(RECENT_SERVERS_CAP);
        self.save()
    }

    fn save(&self) -> Result<(), Error> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        let data = serde_json::to_vec(&self.entries)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server_key::Protocol;

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load(dir.path());
        let server = ServerKey::new("electrum.example.com", 50002, Protocol::Ssl);
        config.set_server(Some(server.clone())).unwrap();
        config.set_auto_connect(false).unwrap();

        let reloaded = Config::load(dir.path());
        assert_eq!(reloaded.server(), Some(&server));
        assert!(!reloaded.auto_connect());
    }

    #[test]
    fn recent_servers_caps_and_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut recent = RecentServers::load(dir.path());
        for i in 0..25u16 {
            let key = ServerKey::new(format!("host{i}"), 50001, Protocol::Tcp);
            recent.touch(key).unwrap();
        }
        assert_eq!(recent.entries().len(), RECENT_SERVERS_CAP);
        let most_recent = ServerKey::new("host24", 50001, Protocol::Tcp);
        assert_eq!(recent.entries()[0], most_recent);

        recent.touch(most_recent.clone()).unwrap();
        assert_eq!(recent.entries()[0], most_recent);
        assert_eq!(recent.entries().len(), RECENT_SERVERS_CAP);
    }

    #[test]
    fn blacklist_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load(dir.path());
        let server = ServerKey::new("bad.example.com", 50002, Protocol::Ssl);
        assert!(!config.is_blacklisted(&server));
        config.blacklist(server.clone()).unwrap();
        assert!(config.is_blacklisted(&server));
        config.remove_from_blacklist(&server).unwrap();
        assert!(!config.is_blacklisted(&server));
    }
}
