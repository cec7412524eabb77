use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Numeric cluster node identifier.
pub type NodeId = u32;

/// Default staging root on every executor host.
pub const DEFAULT_STAGING_ROOT: &str = "/tmp/xproc";

/// Default chunk size used when streaming file payloads.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Runtime settings shared by every mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory under which received files are materialized
    pub staging_root: PathBuf,
    /// Give the executor a private mount namespace over the staging root
    pub private_mount: bool,
    /// Filesystem mounted over the staging root in private mode
    pub mount_backing: MountBacking,
    /// Append log output here instead of stderr
    pub log_file: Option<PathBuf>,
    /// Library search directories consulted by the dependency resolver
    pub lib_path: Vec<PathBuf>,
    /// Filesystem root prefixed to every absolute lookup
    pub root: PathBuf,
    /// Seconds a disconnected registry record is kept before it is swept
    pub stale_after_secs: u64,
    /// Payload chunk size in bytes
    pub chunk_size: usize,
    /// Verbosity: <0 errors only, 0 info, 1 debug, 2+ trace
    pub debug_level: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from(DEFAULT_STAGING_ROOT),
            private_mount: true,
            mount_backing: MountBacking::Tmpfs,
            log_file: None,
            lib_path: vec![PathBuf::from("/lib"), PathBuf::from("/usr/lib")],
            root: PathBuf::from("/"),
            stale_after_secs: 300,
            chunk_size: DEFAULT_CHUNK_SIZE,
            debug_level: 0,
        }
    }
}

impl Settings {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// What gets mounted over the staging root when it is made private.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountBacking {
    /// Fresh tmpfs; staged files vanish with the namespace
    Tmpfs,
    /// Self bind mount; staged files persist on the host directory
    Bind,
}

impl MountBacking {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountBacking::Tmpfs => "tmpfs",
            MountBacking::Bind => "bind",
        }
    }
}

impl std::str::FromStr for MountBacking {
    type Err = XprocError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tmpfs" => Ok(MountBacking::Tmpfs),
            "bind" => Ok(MountBacking::Bind),
            other => Err(XprocError::Config(format!(
                "unknown mount backing '{}' (expected tmpfs or bind)",
                other
            ))),
        }
    }
}

#[derive(Error, Debug)]
pub enum XprocError {
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("{name} not found under {roots}")]
    PathNotFound { name: String, roots: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, XprocError>;

impl From<nix::errno::Errno> for XprocError {
    fn from(err: nix::errno::Errno) -> Self {
        XprocError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for XprocError {
    fn from(err: serde_json::Error) -> Self {
        XprocError::Parse(err.to_string())
    }
}

/// Keep the error kind and prefix the message with what was being attempted.
pub(crate) fn io_context(context: impl std::fmt::Display, err: std::io::Error) -> XprocError {
    XprocError::Io(std::io::Error::new(err.kind(), format!("{}: {}", context, err)))
}

pub(crate) fn to_transport_error(prefix: &str, err: impl std::fmt::Display) -> XprocError {
    XprocError::Transport(format!("{}: {}", prefix, err))
}
