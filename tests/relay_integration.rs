//! End-to-end runs through root and member relays on unix sockets.
//!
//! Executors are real child processes of the built binary, staging without
//! a private mount so the tests need no privileges.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use xproc::cluster::controller::{Controller, ControllerConfig};
use xproc::cluster::noderange::parse_node_list;
use xproc::cluster::registry::Registry;
use xproc::cluster::relay::{ExecutorCommand, Relay, RelayConfig, Role};
use xproc::config::node_table::NodeTable;
use xproc::stage::staged_path;
use xproc::wire::net::Endpoint;
use xproc::Settings;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn executor(staging_root: PathBuf) -> ExecutorCommand {
    let settings = Settings {
        staging_root,
        private_mount: false,
        ..Settings::default()
    };
    ExecutorCommand::for_settings(PathBuf::from(env!("CARGO_BIN_EXE_xproc")), &settings)
}

fn start_relay(dir: &Path, name: &str, role: Role) -> (Endpoint, Registry) {
    let relay = Relay::bind(RelayConfig {
        role,
        listen: vec![Endpoint::Unix(dir.join(format!("{}.sock", name)))],
        executor: executor(dir.join(format!("stage-{}", name))),
        stale_after: Duration::from_secs(60),
        table: NodeTable::default(),
    })
    .unwrap();
    let endpoint = relay.endpoints().unwrap().remove(0);
    let registry = relay.registry();
    thread::spawn(move || relay.run());
    (endpoint, registry)
}

fn start_member(dir: &Path, name: &str, parent: &Endpoint) -> (Endpoint, Registry) {
    start_relay(
        dir,
        name,
        Role::Member {
            parent: parent.clone(),
            presented_id: None,
        },
    )
}

fn wait_for_members(registry: &Registry, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while registry.connected().len() < count {
        assert!(Instant::now() < deadline, "members never registered");
        thread::sleep(Duration::from_millis(20));
    }
}

fn controller(dir: &Path, server: &Endpoint, nodes: &str, command: &[&str]) -> ControllerConfig {
    ControllerConfig {
        server: server.clone(),
        tunnel: Endpoint::Unix(dir.join("tunnel.sock")),
        peers: vec![],
        nodes: parse_node_list(nodes).unwrap(),
        command: command.iter().map(|s| s.to_string()).collect(),
        takeout: vec![],
        local_bin: true,
        extra_env: vec![],
        settings: Settings::default(),
    }
}

#[test]
fn program_runs_on_every_member_and_output_comes_back() {
    let dir = tempfile::tempdir().unwrap();
    let (root, registry) = start_relay(dir.path(), "root", Role::Root);
    start_member(dir.path(), "a", &root);
    start_member(dir.path(), "b", &root);
    wait_for_members(&registry, 2);

    let mut config = controller(
        dir.path(),
        &root,
        "1-2",
        &["/bin/sh", "-c", "echo hello from $WHO"],
    );
    config.extra_env = vec!["WHO=tree".to_string()];
    let output = Captured::default();
    let summary = Controller::new(config).with_output(output.clone()).run().unwrap();

    assert!(summary.success(), "{:?}", summary.results);
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.tunnels_closed, 2);
    assert_eq!(output.text().matches("hello from tree").count(), 2);
}

#[test]
fn shipped_files_are_staged_before_the_program_starts() {
    let dir = tempfile::tempdir().unwrap();
    let (root, registry) = start_relay(dir.path(), "root", Role::Root);
    start_member(dir.path(), "a", &root);
    wait_for_members(&registry, 1);

    let data_dir = dir.path().join("data");
    fs::create_dir_all(data_dir.join("nested")).unwrap();
    fs::write(data_dir.join("nested/payload.txt"), "cargo\n").unwrap();
    let staged_rel = data_dir
        .join("nested/payload.txt")
        .strip_prefix("/")
        .unwrap()
        .display()
        .to_string();

    let script = format!("read line < {}; echo got $line", staged_rel);
    let mut config = controller(dir.path(), &root, "1", &["/bin/sh", "-c", &script]);
    config.takeout = vec![data_dir.clone()];
    let output = Captured::default();
    let summary = Controller::new(config).with_output(output.clone()).run().unwrap();

    assert!(summary.success(), "{:?}", summary.results);
    assert_eq!(summary.total_file_bytes, 6);
    assert!(output.text().contains("got cargo"), "{}", output.text());
    let staged = dir.path().join("stage-a").join(&staged_rel);
    assert_eq!(fs::read_to_string(staged).unwrap(), "cargo\n");
}

#[test]
fn unregistered_nodes_fail_without_stopping_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let (root, registry) = start_relay(dir.path(), "root", Role::Root);
    start_member(dir.path(), "a", &root);
    wait_for_members(&registry, 1);

    let config = controller(dir.path(), &root, "1,9", &["/bin/sh", "-c", "echo up"]);
    let output = Captured::default();
    let summary = Controller::new(config).with_output(output.clone()).run().unwrap();

    assert!(!summary.success());
    assert_eq!(summary.exit_code(), 1);
    let failed: Vec<_> = summary.results.iter().filter(|r| !r.ok).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].node, 9);
    assert_eq!(summary.tunnels_closed, 1);
    assert!(output.text().contains("up"));
}

#[test]
fn member_serves_its_whole_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let (root, root_registry) = start_relay(dir.path(), "root", Role::Root);
    let (mid, mid_registry) = start_member(dir.path(), "mid", &root);
    wait_for_members(&root_registry, 1);
    start_member(dir.path(), "leaf", &mid);
    wait_for_members(&mid_registry, 1);
    let mid_id = root_registry.connected()[0];

    let config = controller(
        dir.path(),
        &root,
        &mid_id.to_string(),
        &["/bin/sh", "-c", "echo branch"],
    );
    let output = Captured::default();
    let summary = Controller::new(config).with_output(output.clone()).run().unwrap();

    assert!(summary.success(), "{:?}", summary.results);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].tunnels, 2);
    assert_eq!(output.text().matches("branch").count(), 2);
}

#[test]
fn peers_are_addressed_directly() {
    let dir = tempfile::tempdir().unwrap();
    let (root, registry) = start_relay(dir.path(), "root", Role::Root);
    let (member, _) = start_member(dir.path(), "a", &root);
    wait_for_members(&registry, 1);

    let mut config = controller(dir.path(), &root, "", &["/bin/sh", "-c", "echo direct"]);
    config.peers = vec![member];
    let output = Captured::default();
    let summary = Controller::new(config).with_output(output.clone()).run().unwrap();

    assert!(summary.success(), "{:?}", summary.results);
    assert_eq!(summary.results.len(), 1);
    assert!(output.text().contains("direct"));
}

#[test]
fn missing_program_is_fatal_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let (root, registry) = start_relay(dir.path(), "root", Role::Root);
    start_member(dir.path(), "a", &root);
    wait_for_members(&registry, 1);

    let mut config = controller(dir.path(), &root, "1", &["/bin/sh", "-c", "echo x"]);
    config.local_bin = false;
    config.command = vec!["/definitely/not/here".to_string()];
    assert!(Controller::new(config).run().is_err());
}

#[test]
fn resolved_closure_is_staged_on_every_node_and_run_from_there() {
    let dir = tempfile::tempdir().unwrap();
    let (root, registry) = start_relay(dir.path(), "root", Role::Root);
    start_member(dir.path(), "a", &root);
    start_member(dir.path(), "b", &root);
    wait_for_members(&registry, 2);

    let mut config = controller(
        dir.path(),
        &root,
        "1-2",
        &["/bin/sh", "-c", "echo staged with $LD_LIBRARY_PATH"],
    );
    config.local_bin = false;
    config.settings.staging_root = dir.path().join("stage-a");
    let output = Captured::default();
    let summary = Controller::new(config).with_output(output.clone()).run().unwrap();

    assert!(summary.success(), "{:?}", summary.results);
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.tunnels_closed, 2);
    assert_eq!(summary.closure[0], PathBuf::from("/bin/sh"));
    for member in ["stage-a", "stage-b"] {
        let stage = dir.path().join(member);
        for path in &summary.closure {
            assert!(
                fs::symlink_metadata(staged_path(&stage, path)).is_ok(),
                "{} missing under {}",
                path.display(),
                member
            );
        }
    }
    let text = output.text();
    assert_eq!(text.matches("staged with").count(), 2, "{}", text);
    let stage_a = dir.path().join("stage-a").display().to_string();
    assert!(text.contains(&stage_a), "{}", text);
}

#[test]
fn programs_that_cannot_start_still_close_their_tunnels() {
    let dir = tempfile::tempdir().unwrap();
    let (root, registry) = start_relay(dir.path(), "root", Role::Root);
    start_member(dir.path(), "a", &root);
    start_member(dir.path(), "b", &root);
    wait_for_members(&registry, 2);

    let bogus = dir.path().join("not-a-program");
    fs::write(&bogus, b"\x01\x02 neither ELF nor script").unwrap();
    fs::set_permissions(&bogus, fs::Permissions::from_mode(0o755)).unwrap();
    let bogus = bogus.display().to_string();
    let config = controller(dir.path(), &root, "1-2", &[&bogus]);
    let output = Captured::default();
    let summary = Controller::new(config).with_output(output.clone()).run().unwrap();

    assert_eq!(summary.exit_code(), 1);
    assert!(summary.results.iter().all(|r| !r.ok && r.tunnels == 1));
    assert_eq!(summary.tunnels_closed, 2);
    assert_eq!(output.text().matches("xproc: failed to start").count(), 2);
}
