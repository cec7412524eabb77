use crate::cluster::controller::{Controller, ControllerConfig};
use crate::cluster::noderange::parse_node_list;
use crate::cluster::relay::{set_remote_debug_level, ExecutorCommand, Relay, RelayConfig, Role};
use crate::config::node_table::NodeTable;
use crate::config::types::{MountBacking, NodeId, Settings, DEFAULT_CHUNK_SIZE, DEFAULT_STAGING_ROOT};
use crate::exec::run_executor;
use crate::observability::logging::init_logging;
use crate::wire::channel::Worker;
use crate::wire::net::Endpoint;
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Run one program across many cluster nodes", long_about = None)]
struct Cli {
    /// Program already exists on every node; ship no files
    #[arg(long, global = true)]
    localbin: bool,
    /// Stage into a private mount namespace
    #[arg(short = 'p', long, global = true, default_value_t = true, action = ArgAction::Set)]
    private: bool,
    /// Verbosity: <0 errors only, 0 info, 1 debug, 2+ trace
    #[arg(long, global = true, default_value_t = 0, allow_negative_numbers = true)]
    debug: i32,
    /// Extra files or directories to ship, comma separated
    #[arg(short = 'f', long = "take", global = true, value_delimiter = ',')]
    take: Vec<PathBuf>,
    /// Filesystem root for program and library lookups
    #[arg(short = 'r', long, global = true, default_value = "/")]
    root: PathBuf,
    /// Library search path, colon separated
    #[arg(short = 'L', long = "libs", global = true, value_delimiter = ':')]
    libs: Vec<PathBuf>,
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// Node table (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value = DEFAULT_STAGING_ROOT)]
    staging_root: PathBuf,
    /// Filesystem mounted over a private staging root: tmpfs or bind
    #[arg(long, global = true, default_value = "tmpfs")]
    mount_backing: MountBacking,
    /// Relay listen addresses (unix:/path or host:port)
    #[arg(long, global = true)]
    listen: Vec<String>,
    /// Identity a member relay asks for when registering
    #[arg(long, global = true)]
    id: Option<NodeId>,
    /// Member relays to address directly, comma separated
    #[arg(long, global = true, value_delimiter = ',')]
    peers: Vec<String>,
    /// Extra KEY=VALUE for the program environment
    #[arg(long, global = true)]
    env: Vec<String>,
    /// Seconds before a disconnected member's identity is released
    #[arg(long, global = true, default_value_t = 300)]
    stale_after: u64,
    #[arg(long, global = true, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Set the debug level of a running relay
    #[command(name = "d")]
    Debug {
        fam: String,
        addr: String,
        #[arg(allow_negative_numbers = true)]
        level: i32,
    },
    /// Run as the tree root, listening on a unix socket
    #[command(name = "m")]
    Master { path: PathBuf },
    /// Run as a member relay under the parent at <fam> <addr>
    #[command(name = "s")]
    Slave { fam: String, addr: String },
    /// Run a program on <nodes>, tunneling its output to <fam> <addr>
    #[command(name = "e")]
    Exec {
        server: String,
        fam: String,
        addr: String,
        nodes: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Executor: read one job from stdin
    #[command(name = "R", hide = true)]
    Run,
}

impl Cli {
    fn settings(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            staging_root: self.staging_root.clone(),
            private_mount: self.private,
            mount_backing: self.mount_backing,
            log_file: self.log_file.clone(),
            lib_path: if self.libs.is_empty() {
                defaults.lib_path
            } else {
                self.libs.clone()
            },
            root: self.root.clone(),
            stale_after_secs: self.stale_after,
            chunk_size: self.chunk_size,
            debug_level: self.debug,
        }
    }

    fn listen_or(&self, fallback: &str) -> Result<Vec<Endpoint>> {
        if self.listen.is_empty() {
            return Ok(vec![fallback.parse()?]);
        }
        self.listen
            .iter()
            .map(|s| s.parse::<Endpoint>().map_err(Into::into))
            .collect()
    }
}

extern "C" fn signal_handler(sig: i32) {
    // Only async-signal-safe calls here: raw write(2) and _exit(2).
    let msg = b"xproc: signal received, exiting\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

fn serve_relay(cli: &Cli, settings: &Settings, role: Role, listen: Vec<Endpoint>) -> Result<()> {
    let table = NodeTable::load(cli.config.as_deref())?;
    let relay = Relay::bind(RelayConfig {
        role,
        listen,
        executor: ExecutorCommand::current(settings)?,
        stale_after: settings.stale_after(),
        table,
    })?;
    for endpoint in relay.endpoints()? {
        log::info!("listening on {}", endpoint);
    }
    relay.run()?;
    Ok(())
}

pub fn run() -> Result<()> {
    setup_signal_handlers();

    let cli = Cli::parse();
    let settings = cli.settings();
    init_logging(settings.debug_level, settings.log_file.as_deref())?;

    match &cli.mode {
        Mode::Debug { fam, addr, level } => {
            let target = Endpoint::parse(fam, addr)?;
            set_remote_debug_level(&target, *level)
                .with_context(|| format!("set debug level on {}", target))?;
            Ok(())
        }
        Mode::Master { path } => {
            let mut listen = vec![Endpoint::Unix(path.clone())];
            listen.extend(cli.listen_or("0.0.0.0:6666")?);
            serve_relay(&cli, &settings, Role::Root, listen)
        }
        Mode::Slave { fam, addr } => {
            let role = Role::Member {
                parent: Endpoint::parse(fam, addr)?,
                presented_id: cli.id,
            };
            let listen = cli.listen_or("0.0.0.0:0")?;
            serve_relay(&cli, &settings, role, listen)
        }
        Mode::Exec {
            server,
            fam,
            addr,
            nodes,
            command,
        } => {
            let config = ControllerConfig {
                server: server.parse()?,
                tunnel: Endpoint::parse(fam, addr)?,
                peers: cli
                    .peers
                    .iter()
                    .map(|p| p.parse::<Endpoint>())
                    .collect::<std::result::Result<_, _>>()?,
                nodes: parse_node_list(nodes)?,
                command: command.clone(),
                takeout: cli.take.clone(),
                local_bin: cli.localbin,
                extra_env: cli.env.clone(),
                settings,
            };
            let summary = Controller::new(config).run()?;
            std::process::exit(summary.exit_code());
        }
        Mode::Run => {
            let code = {
                let stdin = io::stdin();
                let stdout = io::stdout();
                let mut worker = Worker::new(stdin.lock(), stdout.lock());
                run_executor(&settings, &mut worker)?
            };
            std::process::exit(code);
        }
    }
}
