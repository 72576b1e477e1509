use crate::{
    command::CommandSpec,
    completion::{wait_all, CancelToken, OutcomeKind, RunReport, WaitEvent, WaitOptions, Worker},
};
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use std::{
    fs, thread,
    time::{Duration, Instant},
};

fn shell(script: &str) -> CommandSpec {
    CommandSpec::new("sh").arg("-c").arg(script)
}

fn quick() -> WaitOptions {
    WaitOptions {
        status_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

#[test]
pub fn pending_set_shrinks_to_empty() {
    let workers = [("0.3", 0), ("0.1", 0), ("0.2", 3)]
        .iter()
        .enumerate()
        .map(|(slot, (delay, code))| {
            Worker::spawn(slot, format!("w{slot}"), &shell(&format!("sleep {delay}; exit {code}")))
                .unwrap()
        })
        .collect();

    let mut remaining = Vec::new();
    let mut statuses = 0;

    let outcomes = wait_all(workers, &quick(), &CancelToken::new(), |event| match event {
        WaitEvent::Finished { remaining: left, .. } => remaining.push(left),
        WaitEvent::Status(pending) => {
            assert!(!pending.is_empty());
            statuses += 1;
        }
    });

    assert_eq!(remaining, vec![2, 1, 0]);
    assert!(statuses > 0);
    assert_eq!(outcomes.len(), 3);
    assert_eq!(
        outcomes.iter().map(|outcome| outcome.slot).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(outcomes[2].kind, OutcomeKind::Exited);
    assert_eq!(outcomes[2].code, Some(3));
    assert!(outcomes[0].success());
    assert!(outcomes[0].elapsed_ms >= 250);

    let report = RunReport {
        outcomes,
        ..Default::default()
    };
    assert!(!report.success());
    assert_eq!(report.failures().count(), 1);
}

#[test]
pub fn all_zero_exits_succeed() {
    let workers = (0..3)
        .map(|slot| Worker::spawn(slot, "ok", &CommandSpec::new("true")).unwrap())
        .collect();

    let report = RunReport {
        outcomes: wait_all(workers, &quick(), &CancelToken::new(), |_| ()),
        ..Default::default()
    };

    assert!(report.success());
}

#[test]
pub fn deadline_kills_stuck_worker() {
    let options = WaitOptions {
        timeout: Some(Duration::from_millis(300)),
        ..quick()
    };
    let workers = vec![
        Worker::spawn(0, "stuck", &CommandSpec::new("sleep").arg("30")).unwrap(),
        Worker::spawn(1, "fast", &CommandSpec::new("true")).unwrap(),
    ];

    let start = Instant::now();
    let outcomes = wait_all(workers, &options, &CancelToken::new(), |_| ());

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(outcomes[0].kind, OutcomeKind::TimedOut);
    assert!(outcomes[1].success());
}

#[test]
pub fn cancel_kills_pending_workers() {
    let cancel = CancelToken::new();
    let workers = vec![Worker::spawn(0, "stuck", &CommandSpec::new("sleep").arg("30")).unwrap()];

    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        trigger.cancel();
    });

    let start = Instant::now();
    let outcomes = wait_all(workers, &quick(), &cancel, |_| ());
    canceller.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(outcomes[0].kind, OutcomeKind::Cancelled);
    assert_eq!(outcomes[0].code, Some(9));
}

#[test]
pub fn failure_marker_fails_clean_exit() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.log");
    let bad = dir.path().join("bad.log");

    let options = WaitOptions {
        failure_marker: Some("FAILED".to_owned()),
        ..quick()
    };
    let workers = vec![
        Worker::spawn(0, "good", &shell("echo all fine").log_to(&good)).unwrap(),
        Worker::spawn(1, "bad", &shell("echo test FAILED").log_to(&bad)).unwrap(),
    ];

    let outcomes = wait_all(workers, &options, &CancelToken::new(), |_| ());

    assert!(outcomes[0].success());
    assert_eq!(outcomes[1].kind, OutcomeKind::MarkerFound);
    assert!(fs::read_to_string(&bad).unwrap().contains("FAILED"));
}

#[test]
pub fn signaled_worker_is_reported() {
    let workers = vec![Worker::spawn(0, "self-kill", &shell("kill -TERM $$")).unwrap()];

    let outcomes = wait_all(workers, &quick(), &CancelToken::new(), |_| ());

    assert_eq!(outcomes[0].kind, OutcomeKind::Signaled);
    assert_eq!(outcomes[0].code, Some(15));
    assert!(!outcomes[0].success());
}

#[test]
pub fn cancel_spares_finished_workers() {
    let cancel = CancelToken::new();
    let workers = vec![
        Worker::spawn(0, "done", &CommandSpec::new("true")).unwrap(),
        Worker::spawn(1, "stuck", &CommandSpec::new("sleep").arg("30")).unwrap(),
    ];

    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(400));
        trigger.cancel();
    });

    let outcomes = wait_all(workers, &quick(), &cancel, |_| ());
    canceller.join().unwrap();

    assert!(outcomes[0].success());
    assert_eq!(outcomes[1].kind, OutcomeKind::Cancelled);
}

#[test]
pub fn detached_worker_is_reaped() {
    let worker = Worker::spawn(0, "short", &CommandSpec::new("true")).unwrap();
    let pid = Pid::from_raw(worker.detach() as i32);

    // a zombie still accepts signal 0, a reaped pid is gone
    let start = Instant::now();
    while kill(pid, None).is_ok() {
        assert!(start.elapsed() < Duration::from_secs(10), "worker was never reaped");
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
}
