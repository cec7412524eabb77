//! Child launch with all three stdio streams bound to one tunnel socket, and
//! per-child reaping.

use crate::config::types::{Result, XprocError};
use crate::wire::net::Stream;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;

/// Everything needed to start the payload.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    /// Full argv; argv[0] is passed through unchanged
    pub argv: Vec<String>,
    /// `KEY=VALUE` pairs; nothing else is inherited
    pub env: Vec<String>,
    pub cwd: PathBuf,
    /// Applied only when running as root
    pub owner: Option<(u32, u32)>,
}

fn split_env(entries: &[String]) -> Vec<(&str, &str)> {
    entries
        .iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Some((key, value)),
            _ => {
                log::warn!("ignoring malformed environment entry {:?}", entry);
                None
            }
        })
        .collect()
}

fn stdio_from(tunnel: &Stream) -> Result<Stdio> {
    let fd: OwnedFd = tunnel.try_clone()?.into();
    Ok(Stdio::from(fd))
}

/// Start `spec` with stdin, stdout and stderr all on `tunnel`.
pub fn spawn_tunneled(spec: &LaunchSpec, tunnel: &Stream) -> Result<Child> {
    if spec.argv.is_empty() {
        return Err(XprocError::Process("empty argument vector".to_string()));
    }

    let mut command = Command::new(&spec.program);
    command
        .arg0(&spec.argv[0])
        .args(&spec.argv[1..])
        .env_clear()
        .envs(split_env(&spec.env))
        .current_dir(&spec.cwd)
        .stdin(stdio_from(tunnel)?)
        .stdout(stdio_from(tunnel)?)
        .stderr(stdio_from(tunnel)?);

    if let Some((uid, gid)) = spec.owner {
        if nix::unistd::geteuid().is_root() {
            command.gid(gid).uid(uid);
        } else {
            log::debug!("not root; keeping current credentials instead of {}:{}", uid, gid);
        }
    }

    let child = command.spawn().map_err(|e| {
        XprocError::Process(format!("failed to start {}: {}", spec.program.display(), e))
    })?;
    log::info!(
        "started {} as pid {}",
        spec.program.display(),
        child.id()
    );
    Ok(child)
}

/// Exit record for one reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapRecord {
    pub pid: u32,
    pub status: ExitStatus,
}

impl ReapRecord {
    /// Shell-style exit code: the exit status, or 128 + signal.
    pub fn exit_code(&self) -> i32 {
        match (self.status.code(), self.status.signal()) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => 1,
        }
    }
}

/// Waits on each watched child from its own thread; only pids handed to
/// [`Reaper::watch`] are ever reaped.
pub struct Reaper {
    tx: Sender<ReapRecord>,
    rx: Receiver<ReapRecord>,
    outstanding: usize,
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

impl Reaper {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            outstanding: 0,
        }
    }

    pub fn watch(&mut self, mut child: Child, label: &str) {
        let pid = child.id();
        let tx = self.tx.clone();
        let label = label.to_string();
        self.outstanding += 1;
        thread::spawn(move || match child.wait() {
            Ok(status) => {
                log::debug!("{} (pid {}) exited: {}", label, pid, status);
                let _ = tx.send(ReapRecord { pid, status });
            }
            Err(e) => {
                log::warn!("wait for {} (pid {}) failed: {}", label, pid, e);
                let _ = tx.send(ReapRecord {
                    pid,
                    status: ExitStatus::from_raw(1 << 8),
                });
            }
        });
    }

    /// Block until the next watched child exits.
    pub fn wait_next(&mut self) -> Option<ReapRecord> {
        if self.outstanding == 0 {
            return None;
        }
        let record = self.rx.recv().ok()?;
        self.outstanding -= 1;
        Some(record)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Reap `child` on a detached thread, logging how it ended.
pub fn reap_detached(child: Child, label: &str) {
    let mut reaper = Reaper::new();
    reaper.watch(child, label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    #[test]
    fn child_stdio_lands_on_the_tunnel() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let tunnel = Stream::Unix(theirs);
        let spec = LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            argv: vec![
                "sh".into(),
                "-c".into(),
                "echo out:$GREETING; echo err 1>&2".into(),
            ],
            env: vec!["GREETING=hello".into(), "bogus".into()],
            cwd: std::env::temp_dir(),
            owner: None,
        };
        let child = spawn_tunneled(&spec, &tunnel).unwrap();
        drop(tunnel);

        let mut reaper = Reaper::new();
        reaper.watch(child, "sh");
        let record = reaper.wait_next().unwrap();
        assert_eq!(record.exit_code(), 0);
        assert!(reaper.wait_next().is_none());

        let mut output = String::new();
        let mut ours = ours;
        ours.read_to_string(&mut output).unwrap();
        assert!(output.contains("out:hello"));
        assert!(output.contains("err"));
    }

    #[test]
    fn signals_map_to_128_plus_signo() {
        let record = ReapRecord {
            pid: 1,
            status: ExitStatus::from_raw(9),
        };
        assert_eq!(record.exit_code(), 137);
        let record = ReapRecord {
            pid: 1,
            status: ExitStatus::from_raw(3 << 8),
        };
        assert_eq!(record.exit_code(), 3);
    }

    #[test]
    fn missing_program_is_a_process_error() {
        let (_ours, theirs) = UnixStream::pair().unwrap();
        let spec = LaunchSpec {
            program: PathBuf::from("/no/such/binary"),
            argv: vec!["x".into()],
            env: vec![],
            cwd: std::env::temp_dir(),
            owner: None,
        };
        assert!(matches!(
            spawn_tunneled(&spec, &Stream::Unix(theirs)),
            Err(XprocError::Process(_))
        ));
    }
}
