//! Top-level invocation: resolve the program, collect its file closure,
//! dispatch it to the target nodes and relay their output.
//!
//! The controller owns a tunnel listener. Every program it starts connects
//! back to that listener with all three stdio streams, and whatever arrives
//! is copied to the controller's output. A run is over once every expected
//! result has arrived and every tunnel that was opened has been closed.

use crate::cluster::fanout::{self, Chunk, Fanout};
use crate::cluster::noderange::{expand, NodeRange};
use crate::config::types::{io_context, NodeId, Result, Settings, XprocError};
use crate::resolve::ldd::{reroot, Resolver};
use crate::stage::apply::staged_path;
use crate::stage::collector::FileCollector;
use crate::wire::channel::Client;
use crate::wire::net::{Endpoint, Listener, Stream};
use crate::wire::types::{EntryKind, Res, StartArg};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::env;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

pub type SharedOutput = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root relay
    pub server: Endpoint,
    /// Where started programs connect their stdio
    pub tunnel: Endpoint,
    /// Member relays addressed directly; each answers once for its subtree
    pub peers: Vec<Endpoint>,
    pub nodes: Vec<NodeRange>,
    /// Program name followed by its arguments
    pub command: Vec<String>,
    /// Extra paths shipped along with the program
    pub takeout: Vec<PathBuf>,
    /// The program already exists on every target; ship nothing
    pub local_bin: bool,
    /// Extra `KEY=VALUE` entries for the program environment
    pub extra_env: Vec<String>,
    pub settings: Settings,
}

#[derive(Debug)]
pub struct RunSummary {
    pub results: Vec<Res>,
    pub tunnels_closed: u32,
    pub closure: Vec<PathBuf>,
    pub total_file_bytes: u64,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }

    /// Process exit status for this run.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

/// Find the program to run.
///
/// Absolute paths are re-rooted, names containing a slash are taken relative
/// to the working directory and bare names are searched on `$PATH`.
pub fn locate_program(name: &str, root: &Path) -> Result<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() {
        return Ok(reroot(root, path));
    }
    if name.contains('/') {
        return Ok(env::current_dir()?.join(path));
    }
    let search = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&search) {
        let candidate = reroot(root, &dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(XprocError::PathNotFound {
        name: name.to_string(),
        roots: search.to_string_lossy().into_owned(),
    })
}

/// `LD_LIBRARY_PATH` pointing at the staged copies of every library directory.
fn library_path(libraries: &[PathBuf], settings: &Settings) -> String {
    let mut seen = HashSet::new();
    let staged = libraries
        .iter()
        .filter_map(|lib| lib.parent())
        .map(Path::to_path_buf)
        .chain(settings.lib_path.iter().cloned())
        .chain(std::iter::once(PathBuf::from("/lib64")))
        .map(|dir| staged_path(&settings.staging_root, &dir))
        .filter(|dir| seen.insert(dir.clone()))
        .map(|dir| dir.display().to_string())
        .collect::<Vec<_>>();
    format!("LD_LIBRARY_PATH={}", staged.join(":"))
}

struct Payload {
    path: PathBuf,
    file: File,
    size: u64,
}

/// Stream `size` bytes of each payload to every subscriber, zero-padding a
/// file that shrank since it was collected.
fn stream_payloads(payloads: Vec<Payload>, fanout: &mut Fanout, chunk_size: usize) -> u64 {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent = 0u64;
    for payload in payloads {
        let mut remaining = payload.size;
        let mut source = payload.file.take(payload.size);
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = match source.read(&mut buf[..want]) {
                Ok(0) => {
                    warn!(
                        "{} is {} bytes shorter than when collected; padding",
                        payload.path.display(),
                        remaining
                    );
                    buf[..want].fill(0);
                    want
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("read {} failed: {}; padding", payload.path.display(), e);
                    buf[..want].fill(0);
                    want
                }
            };
            fanout.push(&buf[..n]);
            remaining -= n as u64;
            sent += n as u64;
        }
    }
    sent
}

fn copy_tunnel(mut stream: Stream, output: &SharedOutput) -> io::Result<u64> {
    let mut buf = vec![0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let mut out = output
            .lock()
            .map_err(|_| io::Error::new(ErrorKind::Other, "output lock poisoned"))?;
        out.write_all(&buf[..n])?;
        out.flush()?;
        total += n as u64;
    }
    Ok(total)
}

fn serve_tunnels(listener: Listener, output: SharedOutput, closed: Sender<u64>) {
    loop {
        match listener.accept() {
            Ok(stream) => {
                let output = output.clone();
                let closed = closed.clone();
                thread::spawn(move || {
                    let copied = copy_tunnel(stream, &output).unwrap_or_else(|e| {
                        warn!("tunnel failed: {}", e);
                        0
                    });
                    let _ = closed.send(copied);
                });
            }
            Err(e) => {
                debug!("tunnel listener stopped: {}", e);
                return;
            }
        }
    }
}

/// One place the start request goes, and the nodes it answers for.
struct Destination {
    endpoint: Endpoint,
    answers_for: Vec<NodeId>,
}

fn exchange(
    dest: &Destination,
    arg: &StartArg,
    chunks: &Receiver<Chunk>,
    results: &Sender<Res>,
    answered: &mut HashSet<NodeId>,
    count: &mut usize,
) -> Result<()> {
    let mut client = Client::over(dest.endpoint.connect()?)?;
    client.send_arg(arg)?;
    fanout::forward(chunks, &mut client)?;
    while *count < dest.answers_for.len() {
        let res = client.recv_resp()?;
        answered.insert(res.node);
        *count += 1;
        let _ = results.send(res);
    }
    Ok(())
}

fn dispatch(dest: Destination, arg: Arc<StartArg>, chunks: Receiver<Chunk>, results: Sender<Res>) {
    let mut answered = HashSet::new();
    let mut count = 0usize;
    if let Err(e) = exchange(&dest, &arg, &chunks, &results, &mut answered, &mut count) {
        error!("{}: {}", dest.endpoint, e);
        drop(chunks);
        let missing = dest
            .answers_for
            .iter()
            .filter(|id| !answered.contains(id))
            .take(dest.answers_for.len() - count);
        for id in missing {
            let _ = results.send(Res::failure(*id, format!("{}: {}", dest.endpoint, e)));
        }
    }
}

pub struct Controller {
    config: ControllerConfig,
    output: SharedOutput,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            output: Arc::new(Mutex::new(Box::new(io::stdout()))),
        }
    }

    /// Send tunnel output somewhere other than stdout.
    pub fn with_output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Arc::new(Mutex::new(Box::new(output)));
        self
    }

    fn destinations(&self, nodes: &[NodeId]) -> Vec<Destination> {
        let mut out = Vec::new();
        if !nodes.is_empty() {
            out.push(Destination {
                endpoint: self.config.server.clone(),
                answers_for: nodes.to_vec(),
            });
        }
        out.extend(self.config.peers.iter().map(|peer| Destination {
            endpoint: peer.clone(),
            answers_for: vec![0],
        }));
        out
    }

    pub fn run(&self) -> Result<RunSummary> {
        let config = &self.config;
        let settings = &config.settings;
        let Some(name) = config.command.first() else {
            return Err(XprocError::Config("no command given".to_string()));
        };
        let nodes = expand(&config.nodes)?;
        let destinations = self.destinations(&nodes);
        if destinations.is_empty() {
            return Err(XprocError::Config("no target nodes or peers".to_string()));
        }

        let program = locate_program(name, &settings.root)?;
        let mut collector = FileCollector::new();
        let mut closure = Vec::new();
        if config.local_bin {
            collector.note_local(&program)?;
        } else {
            let resolution = Resolver::new(&settings.root, settings.lib_path.clone()).resolve(&program)?;
            for problem in &resolution.problems {
                warn!("{}", problem);
            }
            collector.collect_all(&resolution.paths)?;
            closure = resolution.paths;
        }
        collector.collect_all(&config.takeout)?;
        let (mut cmds, total_file_bytes) = collector.into_parts();

        let mut payloads = Vec::new();
        for cmd in cmds.iter_mut().filter(|c| !c.local) {
            if let (Some(file), EntryKind::Regular { size, .. }) = (cmd.file.take(), &cmd.kind) {
                payloads.push(Payload {
                    path: cmd.fullpath.clone(),
                    file,
                    size: *size,
                });
            }
        }

        let mut env = Vec::new();
        if !config.local_bin {
            env.push(library_path(closure.get(1..).unwrap_or_default(), settings));
        }
        env.extend(config.extra_env.iter().cloned());

        let listener = config.tunnel.bind()?;
        let tunnel = listener.local_endpoint()?;
        if let Endpoint::Tcp(addr) = &tunnel {
            if addr.parse::<SocketAddr>().map(|a| a.ip().is_unspecified()).unwrap_or(false) {
                warn!("tunnel address {} is unspecified; remote programs may not reach it", addr);
            }
        }
        let (closed_tx, closed_rx) = unbounded();
        let output = self.output.clone();
        thread::spawn(move || serve_tunnels(listener, output, closed_tx));

        let arg = Arc::new(StartArg {
            run_id: uuid::Uuid::new_v4().to_string(),
            nodes: nodes.clone(),
            peers: config.peers.iter().map(ToString::to_string).collect(),
            local_bin: config.local_bin,
            program: program.clone(),
            args: config.command.clone(),
            env,
            lfam: tunnel.family().to_string(),
            lserver: tunnel.address(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            cmds,
            total_file_bytes,
        });
        info!(
            "[{}] {} on {} nodes and {} peers: {} entries, {} bytes",
            arg.run_id,
            program.display(),
            nodes.len(),
            config.peers.len(),
            arg.cmds.len(),
            total_file_bytes
        );

        let expected: usize = destinations.iter().map(|d| d.answers_for.len()).sum();
        let (res_tx, res_rx) = unbounded();
        let mut fanout = Fanout::new();
        for dest in destinations {
            let chunks = fanout.subscribe();
            let arg = arg.clone();
            let res_tx = res_tx.clone();
            thread::spawn(move || dispatch(dest, arg, chunks, res_tx));
        }
        drop(res_tx);

        let sent = stream_payloads(payloads, &mut fanout, settings.chunk_size);
        fanout.close();
        debug!("[{}] streamed {} payload bytes", arg.run_id, sent);

        let mut results = Vec::with_capacity(expected);
        for res in res_rx.iter().take(expected) {
            if res.ok {
                info!("node {}: {}", res.node, res.msg);
            } else {
                error!("node {}: {}", res.node, res.msg);
            }
            results.push(res);
        }
        if results.len() < expected {
            warn!("only {} of {} results arrived", results.len(), expected);
        }

        let opened: u32 = results.iter().map(|r| r.tunnels).sum();
        let mut tunnels_closed = 0u32;
        while tunnels_closed < opened {
            match closed_rx.recv() {
                Ok(bytes) => {
                    tunnels_closed += 1;
                    debug!("tunnel closed after {} bytes ({}/{})", bytes, tunnels_closed, opened);
                }
                Err(_) => break,
            }
        }
        if let Ok(mut out) = self.output.lock() {
            out.flush().map_err(|e| io_context("flush output", e))?;
        }

        Ok(RunSummary {
            results,
            tunnels_closed,
            closure,
            total_file_bytes,
        })
    }
}
