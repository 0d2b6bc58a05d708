//! Parsing and filtering of the server registry (`server.peers.subscribe`
//! results and the built-in default server list).

use crate::server_key::{Protocol, ServerKey};
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};

/// Per-host advertisement: which ports/protocols a host serves, its pruning
/// limit string (`"-"` for a full node) and the version it claims to speak.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEntry {
    pub ports: HashMap<Protocol, u16>,
    pub pruning: String,
    pub version: Option<String>,
}

/// `host -> HostEntry`, as returned by `server.peers.subscribe` and read back
/// from the built-in default server list.
#[derive(Debug, Clone, Default)]
pub struct HostMap(pub HashMap<String, HostEntry>);

impl HostMap {
    pub fn new() -> Self {
        HostMap(HashMap::new())
    }

    /// Parses one `server.peers.subscribe` entry: `[ip, host, features]`
    /// where `features` is a list of tags like `s`, `s50002`, `t`, `v1.4`,
    /// `pruned`, each identified by a leading letter followed by digits (or,
    /// for the version tag, a dotted version string).
    pub fn parse_entry(&mut self, host: String, features: &[String]) {
        let mut entry = HostEntry::default();
        for tag in features {
            let mut chars = tag.chars();
            let Some(kind) = chars.next() else { continue };
            let rest: String = chars.collect();
            match kind {
                's' | 'S' => {
                    let port = if rest.is_empty() {
                        50002
                    } else {
                        rest.parse().unwrap_or(50002)
                    };
                    entry.ports.insert(Protocol::Ssl, port);
                }
                't' | 'T' => {
                    let port = if rest.is_empty() {
                        50001
                    } else {
                        rest.parse().unwrap_or(50001)
                    };
                    entry.ports.insert(Protocol::Tcp, port);
                }
                'v' | 'V' => {
                    entry.version = Some(rest);
                }
                'p' | 'P' => {
                    entry.pruning = if rest.is_empty() {
                        "-".to_string()
                    } else {
                        rest
                    };
                }
                _ => {}
            }
        }
        self.0.insert(host, entry);
    }

    /// Keeps only hosts advertising at least `min_version` (lexicographic on
    /// the dotted components, compared element-wise as integers). A host
    /// whose version string doesn't parse cleanly component-by-component is
    /// excluded outright, not partially matched.
    pub fn filter_version(&self, min_version: &str) -> HostMap {
        let Some(min) = parse_version(min_version) else {
            return HostMap::new();
        };
        let filtered = self
            .0
            .iter()
            .filter(|(_, entry)| {
                entry
                    .version
                    .as_deref()
                    .and_then(parse_version)
                    .map(|v| v >= min)
                    .unwrap_or(false)
            })
            .map(|(h, e)| (h.clone(), e.clone()))
            .collect();
        HostMap(filtered)
    }

    /// Keeps only hosts advertising the given protocol.
    pub fn filter_protocol(&self, protocol: Protocol) -> HostMap {
        let filtered = self
            .0
            .iter()
            .filter(|(_, entry)| entry.ports.contains_key(&protocol))
            .map(|(h, e)| (h.clone(), e.clone()))
            .collect();
        HostMap(filtered)
    }

    /// Picks a uniformly random host, or `None` if the map is empty.
    pub fn pick_random(&self) -> Option<(&String, &HostEntry)> {
        self.0.iter().choose(&mut rand::thread_rng())
    }

    /// The fully-addressed server keys this map offers for `protocol`.
    pub fn serve_keys(&self, protocol: Protocol) -> Vec<ServerKey> {
        self.0
            .iter()
            .filter_map(|(host, entry)| {
                entry
                    .ports
                    .get(&protocol)
                    .map(|&port| ServerKey::new(host.clone(), port, protocol))
            })
            .collect()
    }

    /// Picks a uniformly random server key for `protocol`, skipping anything
    /// in `exclude` (servers already connected to, or recently failed).
    pub fn pick_random_excluding(&self, protocol: Protocol, exclude: &HashSet<ServerKey>) -> Option<ServerKey> {
        self.serve_keys(protocol)
            .into_iter()
            .filter(|key| !exclude.contains(key))
            .choose(&mut rand::thread_rng())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Parses a `server.peers.subscribe` result: one `(address, host, tags)`
/// triple per server. Entries whose tags carry no protocol port (no `s`/`t`
/// tag of any kind) are dropped — a host with nothing reachable on it is not
/// a usable server.
pub fn parse_servers(raw: &[(String, String, Vec<String>)]) -> HostMap {
    let mut map = HostMap::new();
    for (_address, host, tags) in raw {
        map.parse_entry(host.clone(), tags);
        if map.0.get(host).is_some_and(|entry| entry.ports.is_empty()) {
            map.0.remove(host);
        }
    }
    map
}

/// All-or-nothing dotted-version parse, mirroring the original's
/// `normalize_version` raising (and the caller excluding the whole entry) on
/// any non-numeric component rather than silently dropping just that piece.
fn parse_version(v: &str) -> Option<Vec<u32>> {
    v.split('.').map(|p| p.parse().ok()).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_tags() {
        let mut map = HostMap::new();
        map.parse_entry(
            "electrum.example.com".to_string(),
            &[
                "v1.4".to_string(),
                "s50002".to_string(),
                "t".to_string(),
                "p".to_string(),
            ],
        );
        let entry = map.0.get("electrum.example.com").unwrap();
        assert_eq!(entry.version.as_deref(), Some("1.4"));
        assert_eq!(entry.ports.get(&Protocol::Ssl), Some(&50002));
        assert_eq!(entry.ports.get(&Protocol::Tcp), Some(&50001));
        assert_eq!(entry.pruning, "-");
    }

    #[test]
    fn filters_by_version() {
        let mut map = HostMap::new();
        map.parse_entry("old".to_string(), &["v1.0".to_string(), "s".to_string()]);
        map.parse_entry("new".to_string(), &["v1.4".to_string(), "s".to_string()]);
        let filtered = map.filter_version("1.2");
        assert!(filtered.0.contains_key("new"));
        assert!(!filtered.0.contains_key("old"));
    }

    #[test]
    fn filter_version_excludes_entry_with_unparseable_component() {
        let mut map = HostMap::new();
        map.parse_entry("beta".to_string(), &["v2.0-beta".to_string(), "s".to_string()]);
        map.parse_entry("new".to_string(), &["v1.4".to_string(), "s".to_string()]);
        let filtered = map.filter_version("1.4");
        assert!(filtered.0.contains_key("new"));
        assert!(!filtered.0.contains_key("beta"));
    }

    #[test]
    fn filter_version_with_unparseable_min_version_matches_nothing() {
        let mut map = HostMap::new();
        map.parse_entry("new".to_string(), &["v1.4".to_string(), "s".to_string()]);
        let filtered = map.filter_version("not-a-version");
        assert!(filtered.is_empty());
    }

    #[test]
    fn filters_by_protocol() {
        let mut map = HostMap::new();
        map.parse_entry("ssl-only".to_string(), &["s".to_string()]);
        map.parse_entry("tcp-only".to_string(), &["t".to_string()]);
        let filtered = map.filter_protocol(Protocol::Ssl);
        assert!(filtered.0.contains_key("ssl-only"));
        assert!(!filtered.0.contains_key("tcp-only"));
    }

    #[test]
    fn pick_random_on_empty_is_none() {
        let map = HostMap::new();
        assert!(map.pick_random().is_none());
    }

    #[test]
    fn parse_servers_drops_entries_with_no_protocol_tags() {
        let raw = vec![
            ("1.2.3.4".to_string(), "has-ssl".to_string(), vec!["s50002".to_string()]),
            ("1.2.3.5".to_string(), "no-protocol".to_string(), vec!["v1.4".to_string()]),
        ];
        let map = parse_servers(&raw);
        assert!(map.0.contains_key("has-ssl"));
        assert!(!map.0.contains_key("no-protocol"));
    }

    #[test]
    fn serve_keys_builds_addressed_server_keys() {
        let raw = vec![(
            "1.2.3.4".to_string(),
            "electrum.example.com".to_string(),
            vec!["s50002".to_string(), "t50001".to_string()],
        )];
        let map = parse_servers(&raw);
        let keys = map.serve_keys(Protocol::Ssl);
        assert_eq!(keys, vec![ServerKey::new("electrum.example.com", 50002, Protocol::Ssl)]);
    }

    #[test]
    fn pick_random_excluding_skips_excluded_keys() {
        let raw = vec![(
            "1.2.3.4".to_string(),
            "only-host".to_string(),
            vec!["s50002".to_string()],
        )];
        let map = parse_servers(&raw);
        let mut exclude = HashSet::new();
        exclude.insert(ServerKey::new("only-host", 50002, Protocol::Ssl));
        assert!(map.pick_random_excluding(Protocol::Ssl, &exclude).is_none());
    }
}
