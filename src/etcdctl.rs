use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::config::{AgentConfig, TlsMaterial};
use crate::error::{Result, WardenError};

const ETCD_IMAGE: &str = "quay.io/coreos/etcd";
const ETCD_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of `member list`.
///
/// An entry with an empty name is **unstarted**: the cluster holds a slot
/// for the peer URL but the process has never contacted the cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct Member {
    #[serde(rename = "ID", default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
}

impl Member {
    pub fn is_unstarted(&self) -> bool {
        self.name.is_empty()
    }

    pub fn advertises(&self, peer_url: &str) -> bool {
        self.peer_urls.iter().any(|u| u == peer_url)
    }
}

#[derive(Debug, Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<Member>,
}

/// One entry of `endpoint status -w json`.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointStatus {
    #[serde(rename = "Endpoint", default)]
    pub endpoint: String,
    #[serde(rename = "Status")]
    pub status: StatusBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusBody {
    pub header: StatusHeader,
    pub leader: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusHeader {
    pub member_id: u64,
}

impl EndpointStatus {
    /// The queried member leads iff the reported leader ID is its own.
    pub fn is_leader(&self) -> bool {
        self.status.leader == self.status.header.member_id
    }
}

/// Whether an `endpoint health` response reports the endpoint healthy.
///
/// Structured health output only arrived in later etcd releases, so the
/// textual marker is matched for compatibility with the pinned version.
pub fn output_reports_healthy(output: &str) -> bool {
    output.contains("is healthy")
}

/// Typed wrapper over the etcdctl operations the agent needs.
///
/// Every call names its endpoint explicitly; the adapter keeps no ambient
/// endpoint state and strips `ETCDCTL_ENDPOINT` from the child environment
/// because it would override the explicit `--endpoints` argument. The
/// tooling runs from the pinned-version etcd image through the container
/// runtime, with host networking and the needed host paths mounted
/// one-to-one so path arguments mean the same thing on both sides.
#[derive(Debug, Clone)]
pub struct EtcdCtl {
    image: String,
    tls: Option<TlsMaterial>,
    snapshot_timeout: Duration,
}

impl EtcdCtl {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            image: format!("{}:v{}", ETCD_IMAGE, config.etcd_version),
            tls: config.tls.clone(),
            snapshot_timeout: config.snapshot_timeout,
        }
    }

    pub async fn member_list(&self, endpoint: &str) -> Result<Vec<Member>> {
        let output = self
            .run(
                "member list",
                vec![
                    "member".to_string(),
                    "list".to_string(),
                    format!("--endpoints={}", endpoint),
                    "-w".to_string(),
                    "json".to_string(),
                ],
                &[],
                ETCD_CALL_TIMEOUT,
            )
            .await?;
        self.check("member list", &output)?;
        let response: MemberListResponse = serde_json::from_slice(&output.stdout)?;
        Ok(response.members)
    }

    pub async fn member_add(&self, endpoint: &str, name: &str, peer_url: &str) -> Result<()> {
        let output = self
            .run(
                "member add",
                vec![
                    "member".to_string(),
                    "add".to_string(),
                    name.to_string(),
                    format!("--peer-urls={}", peer_url),
                    format!("--endpoints={}", endpoint),
                ],
                &[],
                ETCD_CALL_TIMEOUT,
            )
            .await?;
        self.check("member add", &output)
    }

    pub async fn member_remove(&self, endpoint: &str, id: u64) -> Result<()> {
        let output = self
            .run(
                "member remove",
                vec![
                    "member".to_string(),
                    "remove".to_string(),
                    format!("{:x}", id),
                    format!("--endpoints={}", endpoint),
                ],
                &[],
                ETCD_CALL_TIMEOUT,
            )
            .await?;
        self.check("member remove", &output)
    }

    /// Health of a single endpoint. A call that cannot reach the endpoint
    /// within the call timeout counts as unhealthy rather than an error;
    /// the member behind a hung endpoint is down for our purposes.
    pub async fn endpoint_health(&self, endpoint: &str) -> Result<bool> {
        let result = self
            .run(
                "endpoint health",
                vec![
                    "endpoint".to_string(),
                    "health".to_string(),
                    format!("--endpoints={}", endpoint),
                ],
                &[],
                ETCD_CALL_TIMEOUT,
            )
            .await;
        match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(output_reports_healthy(&text))
            }
            Err(WardenError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn endpoint_status(&self, endpoint: &str) -> Result<EndpointStatus> {
        let output = self
            .run(
                "endpoint status",
                vec![
                    "endpoint".to_string(),
                    "status".to_string(),
                    format!("--endpoints={}", endpoint),
                    "-w".to_string(),
                    "json".to_string(),
                ],
                &[],
                ETCD_CALL_TIMEOUT,
            )
            .await?;
        self.check("endpoint status", &output)?;
        let mut statuses: Vec<EndpointStatus> = serde_json::from_slice(&output.stdout)?;
        statuses.pop().ok_or_else(|| WardenError::EtcdCall {
            op: "endpoint status",
            detail: "empty status response".to_string(),
        })
    }

    pub async fn snapshot_save(&self, endpoint: &str, path: &Path) -> Result<()> {
        let mount = parent_dir(path);
        let output = self
            .run(
                "snapshot save",
                vec![
                    "snapshot".to_string(),
                    "save".to_string(),
                    path.display().to_string(),
                    format!("--endpoints={}", endpoint),
                ],
                &[mount],
                self.snapshot_timeout,
            )
            .await?;
        self.check("snapshot save", &output)
    }

    /// Verify a staged snapshot is readable. Used after `snapshot save`
    /// before the payload leaves the node.
    pub async fn snapshot_status(&self, path: &Path) -> Result<()> {
        let mount = parent_dir(path);
        let output = self
            .run(
                "snapshot status",
                vec![
                    "snapshot".to_string(),
                    "status".to_string(),
                    path.display().to_string(),
                    "-w".to_string(),
                    "json".to_string(),
                ],
                &[mount],
                ETCD_CALL_TIMEOUT,
            )
            .await?;
        self.check("snapshot status", &output)
    }

    pub async fn snapshot_restore(
        &self,
        path: &Path,
        out_dir: &Path,
        name: &str,
        peer_url: &str,
        initial_cluster: &str,
    ) -> Result<()> {
        let mounts = [parent_dir(path), parent_dir(out_dir)];
        let output = self
            .run(
                "snapshot restore",
                vec![
                    "snapshot".to_string(),
                    "restore".to_string(),
                    path.display().to_string(),
                    format!("--name={}", name),
                    format!("--initial-cluster={}", initial_cluster),
                    format!("--initial-advertise-peer-urls={}", peer_url),
                    format!("--data-dir={}", out_dir.display()),
                ],
                &mounts,
                self.snapshot_timeout,
            )
            .await?;
        self.check("snapshot restore", &output)
    }

    async fn run(
        &self,
        op: &'static str,
        etcdctl_args: Vec<String>,
        mounts: &[PathBuf],
        timeout: Duration,
    ) -> Result<std::process::Output> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--net=host".to_string(),
            "-e".to_string(),
            "ETCDCTL_API=3".to_string(),
        ];
        for mount in mounts {
            args.push(format!("-v={0}:{0}", mount.display()));
        }
        if let Some(tls) = &self.tls {
            for path in [&tls.ca_cert, &tls.cert, &tls.key] {
                args.push(format!("-v={0}:{0}:ro", path.display()));
            }
        }
        args.push(self.image.clone());
        args.push("etcdctl".to_string());
        args.extend(etcdctl_args);
        if let Some(tls) = &self.tls {
            args.push(format!("--cacert={}", tls.ca_cert.display()));
            args.push(format!("--cert={}", tls.cert.display()));
            args.push(format!("--key={}", tls.key.display()));
        }

        tracing::debug!(op, "Running etcdctl");

        let mut cmd = Command::new("docker");
        cmd.args(&args)
            .env_remove("ETCDCTL_ENDPOINT")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| WardenError::Timeout {
                op,
                seconds: timeout.as_secs(),
            })??;
        Ok(output)
    }

    fn check(&self, op: &'static str, output: &std::process::Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("exit code {:?}", output.status.code())
        } else {
            stderr
        };
        Err(WardenError::EtcdCall { op, detail })
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMBER_LIST_JSON: &str = r#"{
        "header": {"cluster_id": 1, "member_id": 2, "raft_term": 3},
        "members": [
            {"ID": 10501334649042878790, "name": "etcd0",
             "peerURLs": ["https://10.0.0.1:2380"],
             "clientURLs": ["https://10.0.0.1:2379"]},
            {"ID": 16236840575225682911, "name": "etcd1",
             "peerURLs": ["https://10.0.0.2:2380"],
             "clientURLs": ["https://10.0.0.2:2379"]},
            {"ID": 5156242862596395965,
             "peerURLs": ["https://10.0.0.3:2380"]}
        ]
    }"#;

    #[test]
    fn test_member_list_parsing() {
        let response: MemberListResponse = serde_json::from_str(MEMBER_LIST_JSON).unwrap();
        assert_eq!(response.members.len(), 3);
        assert_eq!(response.members[0].name, "etcd0");
        assert_eq!(response.members[0].id, 10501334649042878790);
        assert!(response.members[0].advertises("https://10.0.0.1:2380"));
        assert!(!response.members[0].advertises("https://10.0.0.2:2380"));
    }

    #[test]
    fn test_unstarted_member_has_no_name() {
        let response: MemberListResponse = serde_json::from_str(MEMBER_LIST_JSON).unwrap();
        assert!(!response.members[0].is_unstarted());
        assert!(!response.members[1].is_unstarted());
        assert!(response.members[2].is_unstarted());
        assert!(response.members[2].advertises("https://10.0.0.3:2380"));
        assert!(response.members[2].client_urls.is_empty());
    }

    #[test]
    fn test_endpoint_status_leader_check() {
        let json = r#"[{"Endpoint": "https://10.0.0.1:2379",
            "Status": {"header": {"cluster_id": 7, "member_id": 42, "revision": 9, "raft_term": 2},
                       "version": "3.2.10", "dbSize": 24576, "leader": 42,
                       "raftIndex": 11, "raftTerm": 2}}]"#;
        let statuses: Vec<EndpointStatus> = serde_json::from_str(json).unwrap();
        assert!(statuses[0].is_leader());

        let json = r#"[{"Endpoint": "https://10.0.0.2:2379",
            "Status": {"header": {"member_id": 42}, "leader": 7}}]"#;
        let statuses: Vec<EndpointStatus> = serde_json::from_str(json).unwrap();
        assert!(!statuses[0].is_leader());
    }

    #[test]
    fn test_healthy_marker() {
        assert!(output_reports_healthy(
            "https://10.0.0.1:2379 is healthy: successfully committed proposal: took = 1.8ms"
        ));
        assert!(!output_reports_healthy(
            "https://10.0.0.1:2379 is unhealthy: failed to connect: context deadline exceeded"
        ));
        assert!(!output_reports_healthy(""));
    }
}
