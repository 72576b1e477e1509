use crate::{
    config::{check_executable, Backend, ConfigErrors, HarnessConfig, LaunchMode, RemoteShell},
    nodes::PairingStrategy,
};
use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf, time::Duration};

const CONFIG: &str = r#"
launcher:
  backend: ssh
  remote_shell: rsh
  interface: eth1
  mode: nowait
  extra_args: ["-q"]
paths:
  logfile: /var/log/cfs/run.log
kernel:
  tarfile: /srv/linux-2.6.tar.gz
  dir_name: linux-2.6
wait:
  status_interval: 5
  timeout: 3600
  failure_marker: "TEST FAILED"
pairing: inverted
cleanup_before_run: true
nproc: 4
db:
  path: /var/lib/cfs/runs.sqlite
"#;

#[test]
pub fn parse_full_config() {
    let config: HarnessConfig = serde_yaml::from_str(CONFIG).unwrap();

    assert_eq!(config.launcher.backend, Backend::Ssh);
    assert_eq!(config.launcher.remote_shell, RemoteShell::Rsh);
    assert_eq!(config.launcher.interface.as_deref(), Some("eth1"));
    assert_eq!(config.launcher.mode, LaunchMode::NoWait);
    assert_eq!(config.launcher.extra_args, vec!["-q".to_owned()]);
    assert_eq!(config.kernel.dir_name, "linux-2.6");
    assert_eq!(config.pairing, PairingStrategy::Inverted);
    assert!(config.cleanup_before_run);
    assert_eq!(config.nproc_for(2), 4);
    assert_eq!(config.nproc_for(9), 9);
    assert_eq!(
        config.database.unwrap().path,
        PathBuf::from("/var/lib/cfs/runs.sqlite")
    );

    let options = config.wait.options();
    assert_eq!(options.status_interval, Duration::from_secs(5));
    assert_eq!(options.timeout, Some(Duration::from_secs(3600)));
    assert_eq!(options.failure_marker.as_deref(), Some("TEST FAILED"));
}

#[test]
pub fn empty_config_uses_defaults() {
    let config: HarnessConfig = serde_yaml::from_str("{}").unwrap();

    assert_eq!(config.launcher.backend, Backend::Mpi);
    assert_eq!(config.launcher.mpirun, PathBuf::from("/usr/bin/mpirun"));
    assert_eq!(config.launcher.mode, LaunchMode::Wait);
    assert_eq!(config.kernel.dir_name, "linux");
    assert_eq!(config.kernel.make, PathBuf::from("make"));
    assert_eq!(config.wait.status_interval, 30);
    assert_eq!(config.pairing, PairingStrategy::Previous);
    assert_eq!(config.nproc, 1);
    assert!(config.database.is_none());
    assert!(!config.cleanup_before_run);
}

#[test]
pub fn unknown_fields_are_rejected() {
    assert!(serde_yaml::from_str::<HarnessConfig>("launcher:\n  shell: ssh\n").is_err());
    assert!(serde_yaml::from_str::<HarnessConfig>("retries: 3\n").is_err());
}

#[test]
pub fn load_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        HarnessConfig::load(&dir.path().join("absent.yaml")),
        Err(ConfigErrors::FileNotFound(_))
    ));

    let path = dir.path().join("broken.yaml");
    fs::write(&path, "nproc: [1").unwrap();
    assert!(matches!(HarnessConfig::load(&path), Err(ConfigErrors::Parse(_))));
}

#[test]
pub fn preflight_flags_every_problem() {
    let dir = tempfile::tempdir().unwrap();
    let tarfile = dir.path().join("linux.tar");
    fs::write(&tarfile, "").unwrap();

    let mut config = HarnessConfig::default();
    config.launcher.backend = Backend::Local;
    config.kernel.tarfile = Some(tarfile);
    assert!(!config.preflight_checks(true, true));

    config.kernel.tarfile = None;
    assert!(config.preflight_checks(true, true));
    assert!(!config.preflight_checks(true, false));

    config.wait.status_interval = 0;
    assert!(config.preflight_checks(false, false));
    config.wait.status_interval = 30;

    config.kernel.dir_name = "a/b".to_owned();
    assert!(config.preflight_checks(false, false));
    config.kernel.dir_name = "linux".to_owned();

    config.launcher.backend = Backend::Mpi;
    config.launcher.mpirun = dir.path().join("no-mpirun");
    assert!(config.preflight_checks(true, false));
    assert!(!config.preflight_checks(false, false));
}

#[test]
pub fn executable_bits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tool");
    fs::write(&path, "#!/bin/sh\n").unwrap();

    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    assert!(!check_executable(&path).unwrap());

    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    assert!(check_executable(&path).unwrap());

    assert!(matches!(
        check_executable(&dir.path().join("missing")),
        Err(ConfigErrors::FileNotFound(_))
    ));
}
