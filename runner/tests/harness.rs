use cfs_runner::{
    command::CommandSpec,
    completion::RunReport,
    config::{Backend, HarnessConfig, LaunchMode},
    context::RunContext,
    executors::{Executors, Job, SingleJob},
    nodes::NodeList,
    workloads::{self, RunArgs},
};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

fn nodes() -> NodeList {
    "n0,n1,n2".parse().unwrap()
}

fn shell(script: &str) -> CommandSpec {
    CommandSpec::new("sh").arg("-c").arg(script)
}

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_cfs-runner"))
}

#[test]
fn three_nodes_rotate_partners() {
    let nodes = nodes();

    let partners: Vec<&str> = nodes
        .iter()
        .map(|node| nodes.partner_of(node).unwrap())
        .collect();

    assert_eq!(partners, vec!["n2", "n0", "n1"]);
}

#[test]
fn mpi_launch_covers_every_node() {
    let root = tempfile::tempdir().unwrap();
    let mut config = HarnessConfig::default();
    config.launcher.backend = Backend::Mpi;
    // stands in for mpirun and prints the argument vector it was given
    config.launcher.mpirun = PathBuf::from("echo");
    config.launcher.hostfile = root.path().join("hosts");
    let ctx = RunContext::new(config, "n0");

    let args = RunArgs {
        name: "flock".to_owned(),
        nodes: nodes(),
        program: PathBuf::from("/opt/cfs/bin/flock_unit"),
        args: vec![OsString::from("-i"), OsString::from("100")],
        cwd: None,
        log: Some(root.path().join("flock.log")),
    };

    let report = workloads::run(&ctx, &mut Executors::load(&ctx.config), &args).unwrap();

    assert!(report.success());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].label, "mpirun");

    assert_eq!(
        fs::read_to_string(root.path().join("hosts")).unwrap(),
        "n0\nn1\nn2\n"
    );

    let argv = fs::read_to_string(root.path().join("flock.log")).unwrap();
    assert!(argv.contains("-np 3"));
    assert!(argv.contains("--map-by node"));
    assert!(argv.trim_end().ends_with("/opt/cfs/bin/flock_unit -i 100"));
}

fn local_run(scripts: &[&str]) -> RunReport {
    let ctx = RunContext::new(HarnessConfig::default(), "n0");
    let job = Job::Local(
        scripts
            .iter()
            .zip(nodes().iter())
            .map(|(script, node)| SingleJob {
                label: node.clone(),
                exec: shell(script),
            })
            .collect(),
    );

    Executors::local()
        .execute(
            &ctx,
            "fan-out",
            &job,
            LaunchMode::Wait,
            &ctx.config.wait.options(),
        )
        .unwrap()
}

#[test]
fn wait_collects_every_worker() {
    let report = local_run(&["sleep 0.3", "sleep 0.1", "sleep 0.2"]);

    assert!(report.success());
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(
        report
            .outcomes
            .iter()
            .map(|outcome| outcome.label.as_str())
            .collect::<Vec<_>>(),
        vec!["n0", "n1", "n2"]
    );
    assert!(report.outcomes[0].elapsed_ms >= 300);
}

#[test]
fn one_failed_worker_fails_the_run() {
    let report = local_run(&["exit 0", "exit 4", "exit 0"]);

    assert!(!report.success());
    assert_eq!(report.outcomes.len(), 3);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].label, "n1");
    assert_eq!(failures[0].code, Some(4));
}

#[test]
fn nowait_leaves_workers_running() {
    let root = tempfile::tempdir().unwrap();
    let ctx = RunContext::new(HarnessConfig::default(), "n0");
    let marker = root.path().join("done");
    let job = Job::Local(
        nodes()
            .iter()
            .map(|node| SingleJob {
                label: node.clone(),
                exec: shell(&format!("sleep 0.2; echo {node} >> {}", marker.display())),
            })
            .collect(),
    );

    let report = Executors::local()
        .execute(&ctx, "detached", &job, LaunchMode::NoWait, &ctx.config.wait.options())
        .unwrap();

    assert!(report.outcomes.is_empty());
    assert_eq!(report.detached.len(), 3);
    assert!(report.success());

    let start = std::time::Instant::now();
    while fs::read_to_string(&marker).map_or(0, |done| done.lines().count()) < 3 {
        assert!(start.elapsed().as_secs() < 10);
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}

fn run_cli(root: &Path, script: &str) -> std::process::Output {
    cli()
        .arg("--backend")
        .arg("local")
        .arg("--logfile")
        .arg(root.join("run.log"))
        .arg("--report")
        .arg(root.join("report.yaml"))
        .arg("run")
        .args(["-n", "n0,n1"])
        .arg("--log")
        .arg(root.join("workers.log"))
        .args(["--", "sh", "-c", script])
        .output()
        .unwrap()
}

#[test]
fn cli_exit_codes() {
    let root = tempfile::tempdir().unwrap();

    let output = run_cli(root.path(), "echo done");
    assert_eq!(output.status.code(), Some(0));

    let report: RunReport =
        serde_yaml::from_str(&fs::read_to_string(root.path().join("report.yaml")).unwrap())
            .unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.success());

    let output = run_cli(root.path(), "exit 3");
    assert_eq!(output.status.code(), Some(1));

    // missing node list is a usage error
    let output = cli().args(["run", "true"]).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

fn tarball(root: &Path) -> PathBuf {
    let src = root.join("src");
    fs::create_dir_all(src.join("linux")).unwrap();
    fs::write(src.join("linux/Makefile"), vec![b'#'; 16 * 1024]).unwrap();

    let tarfile = root.join("linux.tar");
    assert!(CommandSpec::new("tar")
        .arg("-cf")
        .arg(&tarfile)
        .arg("-C")
        .arg(&src)
        .arg("linux")
        .status()
        .unwrap()
        .success());

    tarfile
}

#[test]
fn cli_cross_delete_on_local_backend() {
    let root = tempfile::tempdir().unwrap();
    let tarfile = tarball(root.path());
    let mount = root.path().join("m");

    let output = cli()
        .args(["--backend", "local", "--hostname", "n0", "--logfile"])
        .arg(root.path().join("run.log"))
        .arg("--report")
        .arg(root.path().join("report.yaml"))
        .args(["cross-delete", "-n", "n0,n1", "-d"])
        .arg(&mount)
        .arg("-t")
        .arg(&tarfile)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let report: RunReport =
        serde_yaml::from_str(&fs::read_to_string(root.path().join("report.yaml")).unwrap())
            .unwrap();
    assert_eq!(
        report
            .outcomes
            .iter()
            .map(|outcome| outcome.label.as_str())
            .collect::<Vec<_>>(),
        vec!["n0", "n1", "n0", "n1"]
    );

    // every created tree was removed by the partner, staging files are gone
    assert_eq!(fs::read_dir(&mount).unwrap().count(), 0);
}

#[test]
fn cli_extract_then_clear() {
    let root = tempfile::tempdir().unwrap();
    let tarfile = tarball(root.path());

    let dirs = format!(
        "{},{}",
        root.path().join("a").display(),
        root.path().join("b").display()
    );

    let status = cli()
        .args(["extract", "-d", &dirs, "-n", "n0,n1", "-t"])
        .arg(&tarfile)
        .status()
        .unwrap();
    assert!(status.success());
    assert!(root.path().join("b/n1/linux/Makefile").is_file());

    let status = cli()
        .args(["clear", "-d", &dirs, "-n", "n0,n1"])
        .status()
        .unwrap();
    assert!(status.success());
    assert!(!root.path().join("a/n0").exists());
    assert!(root.path().join("a").is_dir());
}
