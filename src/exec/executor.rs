//! Executor: receives one job on its control stream, stages the files,
//! starts the payload with its stdio tunneled to the controller, reports
//! the pid and then waits for the payload to exit.
//!
//! Staging order is fixed and enforced by type state:
//! `Fresh -> RootReady -> Isolated -> Applied`, and only `Applied` can
//! start the payload.

use crate::config::types::{io_context, Result, Settings, XprocError};
use crate::exec::spawn::{spawn_tunneled, LaunchSpec, Reaper};
use crate::kernel::namespace::{provider_for, IsolationProvider};
use crate::stage::apply::{ApplyReport, Stager};
use crate::wire::channel::Worker;
use crate::wire::net::Endpoint;
use crate::wire::types::{Acmd, Res, StartArg};
use std::fs;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Child;

/// Type-state marker: nothing on disk yet
pub struct Fresh;

/// Type-state marker: staging root exists
pub struct RootReady;

/// Type-state marker: staging root isolated (or knowingly shared)
pub struct Isolated;

/// Type-state marker: every command applied
pub struct Applied;

pub struct Staging<S> {
    root: PathBuf,
    run_id: String,
    _state: PhantomData<S>,
}

impl<S> Staging<S> {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn advance<T>(self) -> Staging<T> {
        Staging {
            root: self.root,
            run_id: self.run_id,
            _state: PhantomData,
        }
    }
}

impl Staging<Fresh> {
    pub fn new(root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            run_id: run_id.into(),
            _state: PhantomData,
        }
    }

    pub fn create_root(self) -> Result<Staging<RootReady>> {
        fs::create_dir_all(&self.root)
            .map_err(|e| io_context(format!("create staging root {}", self.root.display()), e))?;
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o755))
            .map_err(|e| io_context(format!("chmod {}", self.root.display()), e))?;
        Ok(self.advance())
    }
}

impl Staging<RootReady> {
    pub fn isolate(self, provider: &dyn IsolationProvider) -> Result<Staging<Isolated>> {
        provider.isolate(&self.root)?;
        log::debug!("[{}] staging isolation: {}", self.run_id, provider.name());
        Ok(self.advance())
    }
}

impl Staging<Isolated> {
    pub fn apply<R: Read>(self, cmds: &[Acmd], data: &mut R) -> Result<(Staging<Applied>, ApplyReport)> {
        let report = Stager::new(&self.root).apply_all(cmds, data)?;
        Ok((self.advance(), report))
    }
}

/// A job that never started, and how many tunnels it left behind.
///
/// The controller counts tunnel closes against the tunnels every result
/// reports, so a tunnel connected before a failed spawn is still reported.
#[derive(Debug)]
pub struct Refusal {
    pub error: XprocError,
    pub tunnels: u32,
}

impl From<XprocError> for Refusal {
    fn from(error: XprocError) -> Self {
        Self { error, tunnels: 0 }
    }
}

impl Staging<Applied> {
    /// Connect the tunnel and start the payload. A spawn failure is written
    /// down the tunnel before it closes.
    pub fn launch(self, arg: &StartArg) -> std::result::Result<Child, Refusal> {
        let mut tunnel = Endpoint::parse(&arg.lfam, &arg.lserver)?.connect()?;
        let spec = LaunchSpec {
            program: arg.exec_path(&self.root),
            argv: arg.args.clone(),
            env: arg.env.clone(),
            cwd: self.root.clone(),
            owner: Some((arg.uid, arg.gid)),
        };
        log::debug!("[{}] launching {:?}", self.run_id, spec.argv);
        spawn_tunneled(&spec, &tunnel).map_err(|error| {
            if let Err(e) = writeln!(tunnel, "xproc: {}", error) {
                log::debug!("[{}] tunnel write failed: {}", self.run_id, e);
            }
            Refusal { error, tunnels: 1 }
        })
    }
}

fn stage_and_launch<R: Read>(
    settings: &Settings,
    provider: &dyn IsolationProvider,
    arg: &StartArg,
    data: &mut R,
) -> std::result::Result<Child, Refusal> {
    let (applied, report) = Staging::new(&settings.staging_root, arg.run_id.clone())
        .create_root()?
        .isolate(provider)?
        .apply(&arg.cmds, data)?;
    if report.bytes != arg.total_file_bytes {
        log::warn!(
            "[{}] staged {} bytes, controller announced {}",
            arg.run_id,
            report.bytes,
            arg.total_file_bytes
        );
    }
    applied.launch(arg)
}

/// Serve one job on `channel`. Returns the exit code for this process:
/// the payload's, or 1 if it never started.
pub fn run_executor<R: Read, W: Write>(settings: &Settings, channel: &mut Worker<R, W>) -> Result<i32> {
    let arg = channel.recv_arg()?;
    log::info!(
        "[{}] job {:?}: {} entries, {} bytes",
        arg.run_id,
        arg.args,
        arg.cmds.len(),
        arg.total_file_bytes
    );

    let provider = provider_for(settings);
    match stage_and_launch(settings, provider.as_ref(), &arg, channel) {
        Ok(child) => {
            let pid = child.id();
            let mut reaper = Reaper::new();
            reaper.watch(child, &arg.args[0]);
            channel.send_resp(&Res::started(0, pid))?;
            match reaper.wait_next() {
                Some(record) => {
                    log::info!("[{}] pid {} finished: {}", arg.run_id, record.pid, record.status);
                    Ok(record.exit_code())
                }
                None => Ok(1),
            }
        }
        Err(Refusal { error, tunnels }) => {
            log::error!("[{}] {}", arg.run_id, error);
            if let Err(drain_err) = channel.drain() {
                log::debug!("[{}] discarding rest of payload: {}", arg.run_id, drain_err);
            }
            let mut res = Res::failure(0, error.to_string());
            res.tunnels = tunnels;
            channel.send_resp(&res)?;
            Ok(1)
        }
    }
}
