use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::AgentConfig;
use crate::error::{Result, WardenError};

const SENTINEL_FILE: &str = "running-node-count";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_ATTEMPTS: u32 = 3;

/// Availability-zone metadata query, trimmed of the zone letter to yield
/// the region. Used when `AWS_DEFAULT_REGION` is not set.
const REGION_CMD: &str =
    "curl -s http://169.254.169.254/latest/meta-data/placement/availability-zone | sed 's/.$//'";

/// Counts the peer nodes currently alive at the infrastructure layer.
///
/// In production this asks the cloud API; the cohort is identified by the
/// configured cluster name under two tag schemas, and the per-schema counts
/// are summed. In test mode the count is read from a sentinel file in the
/// state directory instead.
#[derive(Debug, Clone)]
pub struct NodeProbe {
    cluster_name: String,
    test_mode: bool,
    state_dir: PathBuf,
}

impl NodeProbe {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            cluster_name: config.cluster_name.clone(),
            test_mode: config.test_mode,
            state_dir: config.state_dir.clone(),
        }
    }

    pub async fn running_nodes(&self) -> Result<usize> {
        if self.test_mode {
            return Ok(self.read_sentinel());
        }

        let region = env_or_cmd("AWS_DEFAULT_REGION", "sh", &["-c", REGION_CMD]).await?;

        // An instance tagged under both schemas is counted twice.
        let tagged = self
            .count_instances(
                &region,
                &[
                    format!("Name=tag:KubernetesCluster,Values={}", self.cluster_name),
                    "Name=tag:Role,Values=etcd".to_string(),
                ],
            )
            .await?;
        let owned = self
            .count_instances(
                &region,
                &[
                    format!(
                        "Name=tag:kubernetes.io/cluster/{},Values=owned",
                        self.cluster_name
                    ),
                    "Name=tag:kube-aws:role,Values=etcd".to_string(),
                ],
            )
            .await?;
        Ok(tagged + owned)
    }

    /// A missing or unparsable sentinel logs an error and yields 0 so the
    /// caller proceeds as if no peer nodes were up.
    fn read_sentinel(&self) -> usize {
        let path = self.state_dir.join(SENTINEL_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse() {
                Ok(count) => count,
                Err(_) => {
                    tracing::error!(path = %path.display(), "Unparsable running-node sentinel");
                    0
                }
            },
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Missing running-node sentinel");
                0
            }
        }
    }

    async fn count_instances(&self, region: &str, filters: &[String]) -> Result<usize> {
        let mut args = vec![
            "ec2".to_string(),
            "describe-instances".to_string(),
            "--region".to_string(),
            region.to_string(),
            "--query".to_string(),
            "Reservations[].Instances[].InstanceId".to_string(),
            "--output".to_string(),
            "text".to_string(),
            "--filters".to_string(),
            "Name=instance-state-name,Values=running".to_string(),
        ];
        args.extend(filters.iter().cloned());

        let mut cmd = Command::new("aws");
        cmd.args(&args).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| WardenError::Timeout {
                op: "describe-instances",
                seconds: PROBE_TIMEOUT.as_secs(),
            })??;

        if !output.status.success() {
            return Err(WardenError::Probe(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.split_whitespace().count())
    }
}

/// Resolve a value from the environment, falling back to a command that
/// queries infrastructure metadata. The command is attempted at most three
/// times; this is the only in-process retry in the agent.
pub async fn env_or_cmd(var: &str, program: &str, args: &[&str]) -> Result<String> {
    if let Ok(value) = env::var(var) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    for attempt in 1..=METADATA_ATTEMPTS {
        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !value.is_empty() {
                    return Ok(value);
                }
            }
            Ok(Ok(_)) | Ok(Err(_)) => {}
            Err(_) => {}
        }
        tracing::warn!(var, attempt, "Metadata resolution attempt failed");
    }

    Err(WardenError::Probe(format!(
        "could not resolve {} from environment or metadata",
        var
    )))
}
