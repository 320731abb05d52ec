use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    InvalidConfig { var: &'static str, reason: String },

    #[error("Precondition failed: {0} is missing or not writable")]
    Precondition(PathBuf),

    #[error("etcdctl {op} failed: {detail}")]
    EtcdCall { op: &'static str, detail: String },

    #[error("Snapshot store {op} failed: {detail}")]
    SnapshotStore { op: &'static str, detail: String },

    #[error("Supervisor call failed: {0}")]
    Supervisor(String),

    #[error("Node probe failed: {0}")]
    Probe(String),

    #[error("{op} timed out after {seconds}s")]
    Timeout { op: &'static str, seconds: u64 },

    #[error("Member {0} not found in cluster member list")]
    MemberNotFound(String),

    #[error("Unexpected command: {0}")]
    UnexpectedCommand(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad JSON from etcdctl: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;
