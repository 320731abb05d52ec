use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WardenError};

const DEFAULT_ETCD_VERSION: &str = "3.2.10";
const DEFAULT_FAILURE_LIMIT_SECS: u64 = 10;
const DEFAULT_SNAPSHOT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_DATA_DIR: &str = "/var/lib/etcd";

/// Immutable agent configuration, built once at startup from the
/// environment and threaded through all components.
///
/// The member identity accessors (`name`, `peer_url`, `client_url`) are
/// pure functions of the two list variables `ETCD_INITIAL_CLUSTER` and
/// `ETCD_ENDPOINTS`; nothing here is mutated at runtime.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub member_count: usize,
    pub member_index: usize,
    pub cluster_name: String,
    pub snapshots_uri: String,
    pub etcd_version: String,
    pub service_name: String,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub member_failure_limit: Duration,
    pub cluster_failure_limit: Duration,
    pub snapshot_timeout: Duration,
    pub tls: Option<TlsMaterial>,
    pub test_mode: bool,
    peer_names: Vec<String>,
    peer_urls: Vec<String>,
    client_urls: Vec<String>,
    initial_cluster: String,
}

/// TLS material handed to etcdctl. All three paths are required together;
/// a partial set is rejected at startup.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Tests use this
    /// with a map instead of the process environment.
    pub fn from_vars<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let member_count = parse_usize(&get, "ETCDADM_MEMBER_COUNT")?;
        let member_index = parse_usize(&get, "ETCDADM_MEMBER_INDEX")?;
        if member_count == 0 {
            return Err(WardenError::InvalidConfig {
                var: "ETCDADM_MEMBER_COUNT",
                reason: "member count must be non-zero".to_string(),
            });
        }
        if member_index >= member_count {
            return Err(WardenError::InvalidConfig {
                var: "ETCDADM_MEMBER_INDEX",
                reason: format!("index {} out of range 0..{}", member_index, member_count),
            });
        }

        let snapshots_uri = required(&get, "ETCDADM_CLUSTER_SNAPSHOTS_S3_URI")?;
        let cluster_name = required(&get, "KUBERNETES_CLUSTER")?;

        let initial_cluster = required(&get, "ETCD_INITIAL_CLUSTER")?;
        let (peer_names, peer_urls) = parse_initial_cluster(&initial_cluster, member_count)?;

        let endpoints = required(&get, "ETCD_ENDPOINTS")?;
        let client_urls: Vec<String> = endpoints.split(',').map(|s| s.trim().to_string()).collect();
        if client_urls.len() != member_count {
            return Err(WardenError::InvalidConfig {
                var: "ETCD_ENDPOINTS",
                reason: format!(
                    "expected {} client URLs, found {}",
                    member_count,
                    client_urls.len()
                ),
            });
        }

        let etcd_version =
            get("ETCD_VERSION").unwrap_or_else(|| DEFAULT_ETCD_VERSION.to_string());
        let service_name = get("ETCDADM_MEMBER_SYSTEMD_SERVICE_NAME")
            .unwrap_or_else(|| format!("etcd-member-{}", member_index));

        let member_name = peer_names[member_index].clone();
        let state_dir = get("ETCDADM_STATE_FILES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/var/run/etcd-warden/{}-state", member_name)));
        let data_dir = get("ETCD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let member_failure_limit = parse_secs(
            &get,
            "ETCD_MEMBER_FAILURE_PERIOD_LIMIT",
            DEFAULT_FAILURE_LIMIT_SECS,
        )?;
        let cluster_failure_limit = parse_secs(
            &get,
            "ETCD_CLUSTER_FAILURE_PERIOD_LIMIT",
            DEFAULT_FAILURE_LIMIT_SECS,
        )?;
        let snapshot_timeout = parse_secs(
            &get,
            "ETCDADM_SNAPSHOT_TIMEOUT",
            DEFAULT_SNAPSHOT_TIMEOUT_SECS,
        )?;

        let tls = parse_tls(&get)?;
        let test_mode = get("ETCDADM_TEST_MODE").map(|v| !v.is_empty()).unwrap_or(false);

        Ok(Self {
            member_count,
            member_index,
            cluster_name,
            snapshots_uri,
            etcd_version,
            service_name,
            state_dir,
            data_dir,
            member_failure_limit,
            cluster_failure_limit,
            snapshot_timeout,
            tls,
            test_mode,
            peer_names,
            peer_urls,
            client_urls,
            initial_cluster,
        })
    }

    /// Majority quorum for the configured cluster size.
    pub fn quorum(&self) -> usize {
        self.member_count / 2 + 1
    }

    /// Member name for index `i`.
    pub fn name(&self, i: usize) -> &str {
        &self.peer_names[i]
    }

    /// This member's name.
    pub fn member_name(&self) -> &str {
        self.name(self.member_index)
    }

    /// Advertised peer URL for index `i`.
    pub fn peer_url(&self, i: usize) -> &str {
        &self.peer_urls[i]
    }

    /// Advertised client URL for index `i`.
    pub fn client_url(&self, i: usize) -> &str {
        &self.client_urls[i]
    }

    /// Index of the next member, wrapping around. Unstarted detection and
    /// member replacement always ask this peer, never ourselves.
    pub fn next_index(&self) -> usize {
        (self.member_index + 1) % self.member_count
    }

    /// The verbatim `name=peer-url` list, as `snapshot restore` expects it.
    pub fn initial_cluster_spec(&self) -> &str {
        &self.initial_cluster
    }

    /// Temporary output directory used by snapshot restore before the
    /// atomic move into the real data directory.
    pub fn restored_data_dir(&self) -> PathBuf {
        PathBuf::from(format!("{}-restored", self.data_dir.display()))
    }
}

fn required<F>(get: &F, var: &'static str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(WardenError::MissingEnv(var)),
    }
}

fn parse_usize<F>(get: &F, var: &'static str) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    required(get, var)?
        .parse()
        .map_err(|e| WardenError::InvalidConfig {
            var,
            reason: format!("not an integer: {}", e),
        })
}

fn parse_secs<F>(get: &F, var: &'static str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(v) if !v.is_empty() => v
            .parse()
            .map(Duration::from_secs)
            .map_err(|e| WardenError::InvalidConfig {
                var,
                reason: format!("not a number of seconds: {}", e),
            }),
        _ => Ok(Duration::from_secs(default)),
    }
}

fn parse_initial_cluster(
    list: &str,
    member_count: usize,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut names = Vec::new();
    let mut urls = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        let (name, url) = entry.split_once('=').ok_or_else(|| WardenError::InvalidConfig {
            var: "ETCD_INITIAL_CLUSTER",
            reason: format!("entry {:?} is not name=peer-url", entry),
        })?;
        names.push(name.to_string());
        urls.push(url.to_string());
    }
    if names.len() != member_count {
        return Err(WardenError::InvalidConfig {
            var: "ETCD_INITIAL_CLUSTER",
            reason: format!("expected {} members, found {}", member_count, names.len()),
        });
    }
    Ok((names, urls))
}

fn parse_tls<F>(get: &F) -> Result<Option<TlsMaterial>>
where
    F: Fn(&str) -> Option<String>,
{
    let ca_cert = get("ETCDCTL_CACERT").filter(|v| !v.is_empty());
    let cert = get("ETCDCTL_CERT").filter(|v| !v.is_empty());
    let key = get("ETCDCTL_KEY").filter(|v| !v.is_empty());

    match (ca_cert, cert, key) {
        (Some(ca), Some(cert), Some(key)) => Ok(Some(TlsMaterial {
            ca_cert: PathBuf::from(ca),
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
        })),
        (None, None, None) => Ok(None),
        _ => Err(WardenError::InvalidConfig {
            var: "ETCDCTL_CACERT",
            reason: "ETCDCTL_CACERT, ETCDCTL_CERT and ETCDCTL_KEY must be set together"
                .to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert("ETCDADM_MEMBER_COUNT", "3".to_string());
        vars.insert("ETCDADM_MEMBER_INDEX", "0".to_string());
        vars.insert(
            "ETCDADM_CLUSTER_SNAPSHOTS_S3_URI",
            "s3://backups/etcd".to_string(),
        );
        vars.insert("KUBERNETES_CLUSTER", "test-cluster".to_string());
        vars.insert(
            "ETCD_INITIAL_CLUSTER",
            "etcd0=https://10.0.0.1:2380,etcd1=https://10.0.0.2:2380,etcd2=https://10.0.0.3:2380"
                .to_string(),
        );
        vars.insert(
            "ETCD_ENDPOINTS",
            "https://10.0.0.1:2379,https://10.0.0.2:2379,https://10.0.0.3:2379".to_string(),
        );
        vars
    }

    fn config_from(vars: HashMap<&'static str, String>) -> Result<AgentConfig> {
        AgentConfig::from_vars(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_full_config_parses() {
        let config = config_from(base_vars()).unwrap();
        assert_eq!(config.member_count, 3);
        assert_eq!(config.member_index, 0);
        assert_eq!(config.member_name(), "etcd0");
        assert_eq!(config.peer_url(1), "https://10.0.0.2:2380");
        assert_eq!(config.client_url(2), "https://10.0.0.3:2379");
        assert_eq!(config.etcd_version, "3.2.10");
        assert_eq!(config.service_name, "etcd-member-0");
        assert_eq!(config.member_failure_limit, Duration::from_secs(10));
        assert!(config.tls.is_none());
        assert!(!config.test_mode);
    }

    #[test]
    fn test_missing_required_var() {
        let mut vars = base_vars();
        vars.remove("ETCD_ENDPOINTS");
        let err = config_from(vars).unwrap_err();
        assert!(matches!(err, WardenError::MissingEnv("ETCD_ENDPOINTS")));
    }

    #[test]
    fn test_quorum_majority() {
        for (count, expected) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4), (8, 5), (9, 5)] {
            let mut vars = base_vars();
            vars.insert("ETCDADM_MEMBER_COUNT", count.to_string());
            let names: Vec<String> = (0..count).map(|i| format!("etcd{}=http://10.0.0.{}:2380", i, i + 1)).collect();
            let endpoints: Vec<String> = (0..count).map(|i| format!("http://10.0.0.{}:2379", i + 1)).collect();
            vars.insert("ETCD_INITIAL_CLUSTER", names.join(","));
            vars.insert("ETCD_ENDPOINTS", endpoints.join(","));
            let config = config_from(vars).unwrap();
            assert_eq!(config.quorum(), expected, "quorum for {} members", count);
        }
    }

    #[test]
    fn test_next_index_wraps() {
        let mut vars = base_vars();
        vars.insert("ETCDADM_MEMBER_INDEX", "2".to_string());
        let config = config_from(vars).unwrap();
        assert_eq!(config.next_index(), 0);

        let config = config_from(base_vars()).unwrap();
        assert_eq!(config.next_index(), 1);
    }

    #[test]
    fn test_index_out_of_range() {
        let mut vars = base_vars();
        vars.insert("ETCDADM_MEMBER_INDEX", "3".to_string());
        assert!(matches!(
            config_from(vars),
            Err(WardenError::InvalidConfig { var: "ETCDADM_MEMBER_INDEX", .. })
        ));
    }

    #[test]
    fn test_member_list_length_mismatch() {
        let mut vars = base_vars();
        vars.insert(
            "ETCD_INITIAL_CLUSTER",
            "etcd0=https://10.0.0.1:2380,etcd1=https://10.0.0.2:2380".to_string(),
        );
        assert!(matches!(
            config_from(vars),
            Err(WardenError::InvalidConfig { var: "ETCD_INITIAL_CLUSTER", .. })
        ));
    }

    #[test]
    fn test_malformed_initial_cluster_entry() {
        let mut vars = base_vars();
        vars.insert(
            "ETCD_INITIAL_CLUSTER",
            "etcd0=https://10.0.0.1:2380,not-a-pair,etcd2=https://10.0.0.3:2380".to_string(),
        );
        assert!(config_from(vars).is_err());
    }

    #[test]
    fn test_tls_all_or_none() {
        let mut vars = base_vars();
        vars.insert("ETCDCTL_CACERT", "/etc/ssl/ca.pem".to_string());
        assert!(config_from(vars.clone()).is_err());

        vars.insert("ETCDCTL_CERT", "/etc/ssl/cert.pem".to_string());
        assert!(config_from(vars.clone()).is_err());

        vars.insert("ETCDCTL_KEY", "/etc/ssl/key.pem".to_string());
        let config = config_from(vars).unwrap();
        let tls = config.tls.unwrap();
        assert_eq!(tls.ca_cert, PathBuf::from("/etc/ssl/ca.pem"));
        assert_eq!(tls.key, PathBuf::from("/etc/ssl/key.pem"));
    }

    #[test]
    fn test_defaults_and_overrides() {
        let mut vars = base_vars();
        vars.insert("ETCD_MEMBER_FAILURE_PERIOD_LIMIT", "30".to_string());
        vars.insert("ETCDADM_STATE_FILES_DIR", "/tmp/warden-state".to_string());
        vars.insert("ETCDADM_TEST_MODE", "1".to_string());
        let config = config_from(vars).unwrap();
        assert_eq!(config.member_failure_limit, Duration::from_secs(30));
        assert_eq!(config.cluster_failure_limit, Duration::from_secs(10));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/warden-state"));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/etcd"));
        assert!(config.test_mode);
    }

    #[test]
    fn test_restored_data_dir_suffix() {
        let mut vars = base_vars();
        vars.insert("ETCD_DATA_DIR", "/var/lib/etcd".to_string());
        let config = config_from(vars).unwrap();
        assert_eq!(
            config.restored_data_dir(),
            PathBuf::from("/var/lib/etcd-restored")
        );
    }
}
