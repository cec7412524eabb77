use crate::config::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Filesystem entry kind carried by a staging command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Directory { mode: u32 },
    Symlink { target: PathBuf },
    Regular { mode: u32, size: u64 },
}

/// One filesystem entry to materialize on the executor.
///
/// `fullpath` is the absolute source path on the controller and doubles as
/// the destination below the staging root. For regular files the payload of
/// exactly `size` bytes follows on the data channel, in command order.
#[derive(Debug, Serialize, Deserialize)]
pub struct Acmd {
    pub name: String,
    pub fullpath: PathBuf,
    /// Entry is expected to exist on the executor already; nothing is copied
    pub local: bool,
    pub kind: EntryKind,
    /// Open handle on the controller side; never serialized
    #[serde(skip)]
    pub file: Option<File>,
}

impl Acmd {
    /// Bytes this command contributes to the data channel.
    pub fn payload_len(&self) -> u64 {
        match self.kind {
            EntryKind::Regular { size, .. } if !self.local => size,
            _ => 0,
        }
    }

    pub fn is_regular(&self) -> bool {
        matches!(self.kind, EntryKind::Regular { .. })
    }
}

/// Start request for one job, sent down the relay tree.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartArg {
    /// Correlation id for log lines across hosts
    pub run_id: String,
    /// Expanded target node list, duplicates removed, in first-seen order
    pub nodes: Vec<NodeId>,
    /// Relay endpoints addressed directly, in `fam:addr` form
    pub peers: Vec<String>,
    pub local_bin: bool,
    /// Absolute path of the program on the controller
    pub program: PathBuf,
    /// argv, including argv[0] as the user typed it
    pub args: Vec<String>,
    /// `KEY=VALUE` entries; the child sees exactly these
    pub env: Vec<String>,
    /// Tunnel listener family and address on the controller
    pub lfam: String,
    pub lserver: String,
    pub uid: u32,
    pub gid: u32,
    pub cmds: Vec<Acmd>,
    pub total_file_bytes: u64,
}

impl StartArg {
    /// Path the executor runs: the staged copy, or the program itself for local binaries.
    pub fn exec_path(&self, staging_root: &Path) -> PathBuf {
        if self.local_bin {
            self.program.clone()
        } else {
            crate::stage::apply::staged_path(staging_root, &self.program)
        }
    }
}

/// Registration request from a member relay to its parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveArg {
    /// Identity to reclaim; `None` asks for a fresh one
    pub id: Option<NodeId>,
    /// Where the member accepts direct dispatch
    pub addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveRes {
    pub id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDebugLevel {
    pub level: i32,
}

/// Per-node outcome of a dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Res {
    pub node: NodeId,
    pub ok: bool,
    pub msg: String,
    pub pid: Option<u32>,
    /// Stdio tunnels opened back to the controller
    pub tunnels: u32,
}

impl Res {
    pub fn started(node: NodeId, pid: u32) -> Self {
        Self {
            node,
            ok: true,
            msg: format!("started pid {}", pid),
            pid: Some(pid),
            tunnels: 1,
        }
    }

    pub fn failure(node: NodeId, msg: impl Into<String>) -> Self {
        Self {
            node,
            ok: false,
            msg: msg.into(),
            pid: None,
            tunnels: 0,
        }
    }

    /// Fold a subtree's results into one: ok only if every part is ok.
    pub fn aggregate(node: NodeId, parts: &[Res]) -> Self {
        let ok = parts.iter().all(|r| r.ok);
        let tunnels = parts.iter().map(|r| r.tunnels).sum();
        let failed: Vec<String> = parts
            .iter()
            .filter(|r| !r.ok)
            .map(|r| format!("node {}: {}", r.node, r.msg))
            .collect();
        let msg = if failed.is_empty() {
            format!("{} started", parts.len())
        } else {
            failed.join("; ")
        };
        Self {
            node,
            ok,
            msg,
            pid: None,
            tunnels,
        }
    }
}
