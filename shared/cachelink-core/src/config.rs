//! Pool configuration schema and YAML loader.
//!
//! Mirrors the config-layer input described in spec.md §6: a parsed list of
//! pool records, each carrying a name, listen address, distribution/hash
//! selection, caps, and an array of `host:port:weight name?` server
//! records. Twemproxy-style proxies are traditionally configured from a
//! YAML file rather than environment variables, so this supersedes the
//! teacher's env-based `ServiceConfig` with a `serde_yaml` file load.

use crate::error::{CachelinkError, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Selectable hash function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    OneAtATime,
    Md5,
    Crc16,
    Crc32,
    Crc32a,
    Fnv1_64,
    Fnv1a64,
    Fnv1_32,
    Fnv1a32,
    Hsieh,
    Murmur,
    Jenkins,
}

/// Selectable distribution algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    Ketama,
    Modula,
    Random,
}

/// A parsed `host:port:weight name?` backend server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    /// Optional display name; defaults to `host:port:weight`.
    pub name: Option<String>,
}

impl ServerRecord {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("{}:{}:{}", self.host, self.port, self.weight),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(2, ' ');
        let addr_part = parts.next().unwrap_or_default();
        let name = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let mut addr_fields = addr_part.rsplitn(3, ':');
        let weight_str = addr_fields.next().ok_or_else(|| {
            CachelinkError::ConfigInvalid(format!("malformed server record: {raw:?}"))
        })?;
        let port_str = addr_fields.next().ok_or_else(|| {
            CachelinkError::ConfigInvalid(format!("malformed server record: {raw:?}"))
        })?;
        let host = addr_fields.next().ok_or_else(|| {
            CachelinkError::ConfigInvalid(format!("malformed server record: {raw:?}"))
        })?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| CachelinkError::ConfigInvalid(format!("bad port in {raw:?}")))?;
        let weight: u32 = weight_str
            .parse()
            .map_err(|_| CachelinkError::ConfigInvalid(format!("bad weight in {raw:?}")))?;

        Ok(Self {
            host: host.to_string(),
            port,
            weight,
            name,
        })
    }
}

/// A two-byte hash-tag delimiter pair, e.g. `"{}"` extracts the substring
/// between the first `{` and the first `}` after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashTag {
    pub start: u8,
    pub end: u8,
}

impl HashTag {
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        if raw.is_empty() {
            return Ok(None);
        }
        let bytes = raw.as_bytes();
        if bytes.len() != 2 || bytes[0] == bytes[1] {
            return Err(CachelinkError::ConfigInvalid(format!(
                "hash_tag must be exactly two distinct bytes, got {raw:?}"
            )));
        }
        Ok(Some(Self {
            start: bytes[0],
            end: bytes[1],
        }))
    }

    /// Restricts `key` to the substring between the delimiters if both
    /// occur, in order; otherwise returns `key` unchanged.
    pub fn apply<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        let Some(start_idx) = key.iter().position(|&b| b == self.start) else {
            return key;
        };
        let after_start = &key[start_idx + 1..];
        let Some(end_rel) = after_start.iter().position(|&b| b == self.end) else {
            return key;
        };
        &after_start[..end_rel]
    }
}

/// Raw, serde-facing pool record as it appears in the YAML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPoolRecord {
    pub name: String,
    pub listen: String,
    pub distribution: DistributionKind,
    pub hash: HashKind,
    #[serde(default)]
    pub hash_tag: String,
    pub timeout_ms: u64,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub client_connections: u32,
    #[serde(default = "default_server_connections")]
    pub server_connections: u32,
    pub server_retry_timeout_ms: u64,
    pub server_failure_limit: u32,
    #[serde(default)]
    pub auto_eject_hosts: bool,
    #[serde(default)]
    pub preconnect: bool,
    #[serde(default)]
    pub redis: bool,
    #[serde(default)]
    pub redis_auth: Option<String>,
    #[serde(default)]
    pub redis_db: u32,
    pub servers: Vec<String>,
}

fn default_backlog() -> u32 {
    512
}

fn default_server_connections() -> u32 {
    1
}

/// A fully parsed and validated pool record, ready to build a `ServerPool`
/// from.
#[derive(Debug, Clone)]
pub struct PoolRecord {
    pub name: String,
    pub listen: SocketAddr,
    pub distribution: DistributionKind,
    pub hash: HashKind,
    pub hash_tag: Option<HashTag>,
    pub timeout_ms: u64,
    pub backlog: u32,
    pub client_connections: u32,
    pub server_connections: u32,
    pub server_retry_timeout_ms: u64,
    pub server_failure_limit: u32,
    pub auto_eject_hosts: bool,
    pub preconnect: bool,
    pub redis: bool,
    pub redis_auth: Option<String>,
    pub redis_db: u32,
    pub servers: Vec<ServerRecord>,
}

impl PoolRecord {
    fn from_raw(raw: RawPoolRecord) -> Result<Self> {
        let listen: SocketAddr = raw.listen.parse().map_err(|_| {
            CachelinkError::ConfigInvalid(format!(
                "pool {:?}: invalid listen address {:?}",
                raw.name, raw.listen
            ))
        })?;
        let hash_tag = HashTag::parse(&raw.hash_tag)?;

        if raw.servers.is_empty() {
            return Err(CachelinkError::ConfigInvalid(format!(
                "pool {:?} has no servers",
                raw.name
            )));
        }
        let servers = raw
            .servers
            .iter()
            .map(|s| ServerRecord::parse(s))
            .collect::<Result<Vec<_>>>()?;

        if raw.distribution != DistributionKind::Ketama {
            if let Some(bad) = servers.iter().find(|s| s.weight == 0) {
                return Err(CachelinkError::ConfigInvalid(format!(
                    "pool {:?}: server {:?} has weight 0, only valid under ketama",
                    raw.name,
                    bad.display_name()
                )));
            }
        }

        Ok(Self {
            name: raw.name,
            listen,
            distribution: raw.distribution,
            hash: raw.hash,
            hash_tag,
            timeout_ms: raw.timeout_ms,
            backlog: raw.backlog,
            client_connections: raw.client_connections,
            server_connections: raw.server_connections,
            server_retry_timeout_ms: raw.server_retry_timeout_ms,
            server_failure_limit: raw.server_failure_limit,
            auto_eject_hosts: raw.auto_eject_hosts,
            preconnect: raw.preconnect,
            redis: raw.redis,
            redis_auth: raw.redis_auth,
            redis_db: raw.redis_db,
            servers,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfigFile {
    pools: Vec<RawPoolRecord>,
}

/// The top-level parsed config file: every pool the proxy should run.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub pools: Vec<PoolRecord>,
}

impl ConfigFile {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            CachelinkError::ConfigInvalid(format!("reading {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let raw: RawConfigFile = serde_yaml::from_str(yaml)
            .map_err(|e| CachelinkError::ConfigInvalid(format!("invalid config yaml: {e}")))?;

        let mut seen = std::collections::HashSet::new();
        let mut pools = Vec::with_capacity(raw.pools.len());
        for raw_pool in raw.pools {
            if !seen.insert(raw_pool.name.clone()) {
                return Err(CachelinkError::ConfigInvalid(format!(
                    "duplicate pool name {:?}",
                    raw_pool.name
                )));
            }
            pools.push(PoolRecord::from_raw(raw_pool)?);
        }
        Ok(Self { pools })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
pools:
  - name: app_cache
    listen: "0.0.0.0:22121"
    distribution: ketama
    hash: fnv1a_64
    hash_tag: "{}"
    timeout_ms: 400
    server_retry_timeout_ms: 30000
    server_failure_limit: 2
    auto_eject_hosts: true
    servers:
      - "10.0.0.1:11211:1 cache1"
      - "10.0.0.2:11211:1 cache2"
"#;

    #[test]
    fn parses_sample_config() {
        let cfg = ConfigFile::parse(SAMPLE).unwrap();
        assert_eq!(cfg.pools.len(), 1);
        let pool = &cfg.pools[0];
        assert_eq!(pool.name, "app_cache");
        assert_eq!(pool.servers.len(), 2);
        assert_eq!(pool.servers[0].display_name(), "cache1");
        assert_eq!(pool.hash_tag, Some(HashTag { start: b'{', end: b'}' }));
    }

    #[test]
    fn rejects_duplicate_pool_names() {
        let yaml = format!("pools:\n  - {}\n  - {}", "", "");
        assert!(ConfigFile::parse(&yaml).is_err());
    }

    #[test]
    fn rejects_zero_weight_under_modula() {
        let yaml = r#"
pools:
  - name: p
    listen: "0.0.0.0:22121"
    distribution: modula
    hash: crc32
    timeout_ms: 400
    server_retry_timeout_ms: 30000
    server_failure_limit: 2
    servers:
      - "10.0.0.1:11211:0"
"#;
        let err = ConfigFile::parse(yaml).unwrap_err();
        assert!(matches!(err, CachelinkError::ConfigInvalid(_)));
    }

    #[test]
    fn parses_server_record_with_name() {
        let rec = ServerRecord::parse("10.0.0.1:11211:5 cache1").unwrap();
        assert_eq!(rec.host, "10.0.0.1");
        assert_eq!(rec.port, 11211);
        assert_eq!(rec.weight, 5);
        assert_eq!(rec.name.as_deref(), Some("cache1"));
    }

    #[test]
    fn hash_tag_extracts_between_delimiters() {
        let tag = HashTag::parse("{}").unwrap().unwrap();
        assert_eq!(tag.apply(b"{user42}.profile"), b"user42");
        assert_eq!(tag.apply(b"orphan"), b"orphan");
    }
}
