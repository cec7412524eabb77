//! Relay nodes of the distribution tree.
//!
//! A root relay only forwards: a start request names target nodes and the
//! root hands it to each registered member, answering with one result per
//! node. A member relay registers with its parent, then serves every start
//! request by running one local executor and forwarding to all of its own
//! registered children, answering with a single aggregated result.
//!
//! Threads:
//! - one accept loop per listener
//! - one thread per inbound connection; for a registered child this thread
//!   is its session and runs that child's dispatches one at a time
//! - one dispatch thread per target of a start request
//!
//! Dispatches wait on their targets without a deadline.

use crate::cluster::fanout::{self, Chunk, Fanout};
use crate::cluster::registry::{Registry, SessionJob};
use crate::config::node_table::NodeTable;
use crate::config::types::{NodeId, Result, Settings, XprocError};
use crate::exec::spawn::reap_detached;
use crate::observability::logging::{current_debug_level, set_debug_level};
use crate::wire::channel::{Client, Worker};
use crate::wire::frame::{self, Frame, Tag};
use crate::wire::net::{Endpoint, Listener, Stream};
use crate::wire::types::{Res, SetDebugLevel, SlaveArg, SlaveRes, StartArg};
use crossbeam_channel::{bounded, unbounded, Receiver};
use log::{debug, error, info, warn};
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Root,
    Member {
        parent: Endpoint,
        /// Identity to ask for; otherwise looked up in the node table
        presented_id: Option<NodeId>,
    },
}

/// How a relay starts its local executor.
#[derive(Debug, Clone)]
pub struct ExecutorCommand {
    pub program: PathBuf,
    /// Options placed before the executor mode selector
    pub args: Vec<String>,
}

impl ExecutorCommand {
    pub fn for_settings(program: PathBuf, settings: &Settings) -> Self {
        let mut args = vec![
            "--private".to_string(),
            settings.private_mount.to_string(),
            "--mount-backing".to_string(),
            settings.mount_backing.as_str().to_string(),
            "--staging-root".to_string(),
            settings.staging_root.display().to_string(),
        ];
        if let Some(log_file) = &settings.log_file {
            args.push("--log-file".to_string());
            args.push(log_file.display().to_string());
        }
        Self { program, args }
    }

    /// This very binary, re-executed in executor mode.
    pub fn current(settings: &Settings) -> Result<Self> {
        Ok(Self::for_settings(std::env::current_exe()?, settings))
    }

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .arg("--debug")
            .arg(current_debug_level().to_string())
            .args(&self.args)
            .arg("R")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                XprocError::Process(format!(
                    "failed to start executor {}: {}",
                    self.program.display(),
                    e
                ))
            })
    }
}

pub struct RelayConfig {
    pub role: Role,
    pub listen: Vec<Endpoint>,
    pub executor: ExecutorCommand,
    pub stale_after: Duration,
    pub table: NodeTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Root,
    Member,
}

struct Shared {
    kind: Kind,
    registry: Registry,
    executor: ExecutorCommand,
    table: NodeTable,
    /// Our own id once registered; 0 for the root
    node_id: AtomicU32,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Local,
    Child(NodeId),
}

pub struct Relay {
    shared: Arc<Shared>,
    listeners: Vec<Listener>,
    role: Role,
}

impl Relay {
    pub fn bind(config: RelayConfig) -> Result<Self> {
        if config.listen.is_empty() {
            return Err(XprocError::Config("relay needs at least one listen address".to_string()));
        }
        let listeners = config
            .listen
            .iter()
            .map(Endpoint::bind)
            .collect::<Result<Vec<_>>>()?;
        let kind = match config.role {
            Role::Root => Kind::Root,
            Role::Member { .. } => Kind::Member,
        };
        let shared = Arc::new(Shared {
            kind,
            registry: Registry::spawn(config.stale_after),
            executor: config.executor,
            table: config.table,
            node_id: AtomicU32::new(0),
        });
        Ok(Self {
            shared,
            listeners,
            role: config.role,
        })
    }

    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        self.listeners.iter().map(Listener::local_endpoint).collect()
    }

    pub fn registry(&self) -> Registry {
        self.shared.registry.clone()
    }

    /// Serve forever. A member returns an error once its parent is gone.
    pub fn run(self) -> Result<()> {
        let advertise = self.endpoints()?.into_iter().next();
        let accept_threads: Vec<JoinHandle<()>> = self
            .listeners
            .into_iter()
            .map(|listener| {
                let shared = self.shared.clone();
                thread::spawn(move || accept_loop(shared, listener))
            })
            .collect();

        match self.role {
            Role::Root => {
                info!("root relay ready");
                for handle in accept_threads {
                    let _ = handle.join();
                }
                Ok(())
            }
            Role::Member {
                parent,
                presented_id,
            } => {
                let advertise = advertise
                    .ok_or_else(|| XprocError::Config("member relay has no listener".to_string()))?;
                serve_parent(&self.shared, &parent, presented_id, advertise)
            }
        }
    }
}

fn accept_loop(shared: Arc<Shared>, listener: Listener) {
    loop {
        match listener.accept() {
            Ok(stream) => {
                let shared = shared.clone();
                thread::spawn(move || {
                    if let Err(e) = serve_connection(&shared, stream) {
                        warn!("connection ended with error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("{}", e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn serve_connection(shared: &Arc<Shared>, stream: Stream) -> Result<()> {
    let mut reader = stream.try_clone()?;
    let mut writer = stream;
    match frame::read_frame(&mut reader)? {
        None => Ok(()),
        Some(Frame::Register(arg)) => serve_member(shared, arg, reader, writer),
        Some(Frame::Start(arg)) => {
            let mut worker = Worker::after_arg(reader, writer);
            serve_start(shared, Arc::new(*arg), &mut worker)?;
            while let Some(arg) = worker.next_arg()? {
                serve_start(shared, Arc::new(arg), &mut worker)?;
            }
            Ok(())
        }
        Some(Frame::DebugLevel(SetDebugLevel { level })) => {
            set_debug_level(level);
            frame::send_ack(&mut writer)
        }
        Some(other) => Err(XprocError::Transport(format!(
            "unexpected {} frame on a new connection",
            other.name()
        ))),
    }
}

/// Registration handshake, then this thread becomes the child's session.
fn serve_member(shared: &Arc<Shared>, arg: SlaveArg, reader: Stream, mut writer: Stream) -> Result<()> {
    let (jobs_tx, jobs_rx) = unbounded::<SessionJob>();
    let (id, generation) = shared.registry.register(arg.id, arg.addr.clone(), jobs_tx)?;
    frame::send(&mut writer, Tag::Registered, &SlaveRes { id })?;
    match shared.table.address_of(id) {
        Some(ip) => info!("node {} registered from {} (table address {})", id, arg.addr, ip),
        None => info!("node {} registered from {}", id, arg.addr),
    }

    let mut client = Client::new(reader, writer);
    run_session(id, &mut client, &jobs_rx);
    shared.registry.mark_lost(id, generation);
    Ok(())
}

fn run_job<R: Read, W: Write>(client: &mut Client<R, W>, job: &SessionJob) -> Result<Res> {
    client.send_arg(&job.arg)?;
    fanout::forward(&job.data, client)?;
    client.recv_resp()
}

fn run_session<R: Read, W: Write>(id: NodeId, client: &mut Client<R, W>, jobs: &Receiver<SessionJob>) {
    for job in jobs.iter() {
        match run_job(client, &job) {
            Ok(mut res) => {
                res.node = id;
                let _ = job.reply.send(res);
            }
            Err(e) => {
                warn!("node {} lost during dispatch: {}", id, e);
                let _ = job.reply.send(Res::failure(id, e.to_string()));
                return;
            }
        }
    }
}

/// Member side: register with the parent, then serve its start requests.
fn serve_parent(
    shared: &Arc<Shared>,
    parent: &Endpoint,
    presented: Option<NodeId>,
    advertise: Endpoint,
) -> Result<()> {
    let stream = parent.connect()?;
    let local_ip = stream.local_ip();
    let presented = presented.or_else(|| match local_ip {
        Some(IpAddr::V4(ip)) => shared.table.node_of(ip),
        _ => None,
    });
    let advertise = match local_ip {
        Some(ip) => advertise.with_host_if_unspecified(ip),
        None => advertise,
    };

    let mut client = Client::over(stream)?;
    let SlaveRes { id } = client.register(&SlaveArg {
        id: presented,
        addr: advertise.to_string(),
    })?;
    shared.node_id.store(id, Ordering::SeqCst);
    info!("registered with {} as node {}, serving at {}", parent, id, advertise);

    let (reader, writer) = client.into_parts();
    let mut worker = Worker::new(reader, writer);
    while let Some(arg) = worker.next_arg()? {
        serve_start(shared, Arc::new(arg), &mut worker)?;
    }
    Err(XprocError::Transport(format!("parent {} closed the connection", parent)))
}

fn serve_start<R: Read, W: Write>(
    shared: &Arc<Shared>,
    arg: Arc<StartArg>,
    worker: &mut Worker<R, W>,
) -> Result<()> {
    let self_id = shared.node_id.load(Ordering::SeqCst);
    let targets: Vec<Target> = match shared.kind {
        Kind::Root => arg.nodes.iter().map(|n| Target::Child(*n)).collect(),
        Kind::Member => std::iter::once(Target::Local)
            .chain(shared.registry.connected().into_iter().map(Target::Child))
            .collect(),
    };
    info!(
        "[{}] dispatching {:?} to {} targets",
        arg.run_id,
        arg.args,
        targets.len()
    );

    let (res_tx, res_rx) = unbounded::<Res>();
    let mut fanout = Fanout::new();
    for target in targets {
        let chunks = fanout.subscribe();
        let shared = shared.clone();
        let arg = arg.clone();
        let res_tx = res_tx.clone();
        thread::spawn(move || {
            let res = dispatch(&shared, target, arg, chunks);
            let _ = res_tx.send(res);
        });
    }
    drop(res_tx);

    let mut relayed = 0u64;
    let inbound = loop {
        match worker.next_chunk() {
            Ok(Some(chunk)) => {
                relayed += chunk.len() as u64;
                fanout.push(&chunk);
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    fanout.close();
    if let Err(e) = inbound {
        error!("[{}] inbound payload broke after {} bytes: {}", arg.run_id, relayed, e);
        return Err(e);
    }
    debug!("[{}] relayed {} payload bytes", arg.run_id, relayed);

    match shared.kind {
        Kind::Root => {
            for res in res_rx.iter() {
                worker.send_resp(&res)?;
            }
        }
        Kind::Member => {
            let parts: Vec<Res> = res_rx.iter().collect();
            let res = Res::aggregate(self_id, &parts);
            if !res.ok {
                warn!("[{}] {}", arg.run_id, res.msg);
            }
            worker.send_resp(&res)?;
        }
    }
    Ok(())
}

fn dispatch(shared: &Shared, target: Target, arg: Arc<StartArg>, chunks: Receiver<Chunk>) -> Res {
    match target {
        Target::Local => run_local(shared, &arg, chunks),
        Target::Child(id) => {
            let Some(session) = shared.registry.lookup(id) else {
                return Res::failure(id, "not registered");
            };
            let (reply_tx, reply_rx) = bounded(1);
            let job = SessionJob {
                arg,
                data: chunks,
                reply: reply_tx,
            };
            if session.send(job).is_err() {
                return Res::failure(id, "session has closed");
            }
            reply_rx
                .recv()
                .unwrap_or_else(|_| Res::failure(id, "dropped the dispatch"))
        }
    }
}

fn run_local(shared: &Shared, arg: &StartArg, chunks: Receiver<Chunk>) -> Res {
    let self_id = shared.node_id.load(Ordering::SeqCst);
    let mut child = match shared.executor.spawn() {
        Ok(child) => child,
        Err(e) => return Res::failure(self_id, e.to_string()),
    };
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        reap_detached(child, "executor");
        return Res::failure(self_id, "executor pipes unavailable");
    };

    let mut client = Client::new(stdout, stdin);
    let sent = client
        .send_arg(arg)
        .and_then(|_| fanout::forward(&chunks, &mut client));
    drop(chunks);
    let res = client.recv_resp();
    drop(client);
    reap_detached(child, "executor");

    match (res, sent) {
        (Ok(mut res), _) => {
            res.node = self_id;
            res
        }
        (Err(e), Ok(_)) | (_, Err(e)) => Res::failure(self_id, format!("local executor: {}", e)),
    }
}

/// Ask the relay at `target` to change its debug level.
pub fn set_remote_debug_level(target: &Endpoint, level: i32) -> Result<()> {
    let mut stream = target.connect()?;
    frame::send(&mut stream, Tag::DebugLevel, &SetDebugLevel { level })?;
    match frame::read_frame(&mut stream)? {
        Some(Frame::Ack) => Ok(()),
        Some(other) => Err(XprocError::Transport(format!(
            "expected ack, got {} frame",
            other.name()
        ))),
        None => Err(XprocError::Transport(format!("{} closed without ack", target))),
    }
}
