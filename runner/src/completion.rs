use crate::command::CommandSpec;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{
    collections::BTreeMap,
    fs, io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Child, ExitStatus},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

/// upper bound between two checks of the cancellation token
const CANCEL_TICK: Duration = Duration::from_millis(200);

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum OutcomeKind {
    Exited = 0,
    Signaled = 1,
    MarkerFound = 2,
    TimedOut = 3,
    Cancelled = 4,
    WaitFailed = 5,
}

/// Final state of a single worker process
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub slot: usize,
    pub label: String,
    pub pid: u32,
    pub kind: OutcomeKind,
    /// exit code for `Exited`/`MarkerFound`, signal number for `Signaled`
    pub code: Option<i32>,
    pub elapsed_ms: u64,
}

impl WorkerOutcome {
    pub fn success(&self) -> bool {
        self.kind == OutcomeKind::Exited && self.code == Some(0)
    }
}

/// Aggregated result of one fan-out
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RunReport {
    pub name: String,
    pub host: String,
    pub outcomes: Vec<WorkerOutcome>,
    /// pids left running when the launcher does not wait
    #[serde(default)]
    pub detached: Vec<u32>,
}

impl RunReport {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            ..Default::default()
        }
    }

    /// true only if every waited worker exited with status 0
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(WorkerOutcome::success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &WorkerOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.success())
    }

    pub fn merge(&mut self, other: RunReport) {
        self.outcomes.extend(other.outcomes);
        self.detached.extend(other.detached);
    }
}

/// Shared flag that asks a running wait to kill every pending worker
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct WaitOptions {
    /// interval of the periodic status report
    pub status_interval: Duration,
    /// workers still running after this are killed
    pub timeout: Option<Duration>,
    /// a successful worker whose log contains this marker is reported as failed
    pub failure_marker: Option<String>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(30),
            timeout: None,
            failure_marker: None,
        }
    }
}

/// A spawned worker process
#[derive(Debug)]
pub struct Worker {
    slot: usize,
    label: String,
    child: Child,
    log: Option<PathBuf>,
    started: Instant,
}

impl Worker {
    pub fn spawn(slot: usize, label: impl Into<String>, spec: &CommandSpec) -> io::Result<Self> {
        let label = label.into();
        let child = spec.to_command()?.spawn()?;

        debug!(slot = slot, label = %label, pid = child.id(), command = %spec, "Spawned worker");

        Ok(Self {
            slot,
            label,
            child,
            log: spec.log().map(PathBuf::from),
            started: Instant::now(),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// kill and reap, used when a batch is abandoned before waiting
    pub fn abort(mut self) {
        if let Err(error) = self.child.kill() {
            debug!(pid = self.pid(), error = ?error, "Kill on abort failed");
        }
        let _ = self.child.wait();
    }

    /// Leave the process running. A background thread reaps it once it
    /// exits, nobody looks at the status.
    pub fn detach(self) -> u32 {
        let pid = self.pid();
        let Worker {
            label, mut child, ..
        } = self;

        let reaper = thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => {
                    debug!(pid = pid, label = %label, status = %status, "Detached worker exited")
                }
                Err(error) => warn!(pid = pid, error = ?error, "Failed to reap detached worker"),
            });

        if let Err(error) = reaper {
            warn!(pid = pid, error = ?error, "Failed to start reaper thread");
        }

        pid
    }

    /// Wait in ticks so the token and the deadline are checked while the child
    /// runs. Killing goes through the owned child, which is only reaped here.
    fn wait_until(&mut self, deadline: Option<Instant>, cancel: &CancelToken) -> io::Result<Waited> {
        let mut killed = false;

        loop {
            let tick = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(Waited::Deadline);
                    }
                    left.min(CANCEL_TICK)
                }
                None => CANCEL_TICK,
            };

            if let Some(status) = self.child.wait_timeout(tick)? {
                return Ok(Waited::Exited(status));
            }

            if !killed && cancel.is_cancelled() {
                info!(pid = self.pid(), label = %self.label, "Run cancelled, killing worker");
                if let Err(error) = self.child.kill() {
                    error!(pid = self.pid(), error = ?error, "Failed to kill worker");
                }
                killed = true;
            }
        }
    }

    fn join(
        mut self,
        deadline: Option<Instant>,
        cancel: &CancelToken,
        marker: Option<&str>,
    ) -> WorkerOutcome {
        let pid = self.child.id();

        let (mut kind, code) = match self.wait_until(deadline, cancel) {
            Ok(Waited::Exited(status)) => classify(status, cancel),
            Ok(Waited::Deadline) => {
                warn!(pid = pid, label = %self.label, "Worker ran into the deadline, killing it");

                if let Err(error) = self.child.kill() {
                    error!(pid = pid, error = ?error, "Failed to kill worker");
                }
                let _ = self.child.wait();

                (OutcomeKind::TimedOut, None)
            }
            Err(error) => {
                error!(pid = pid, error = ?error, "Failed to wait for worker");

                (OutcomeKind::WaitFailed, None)
            }
        };

        if kind == OutcomeKind::Exited {
            if let (Some(marker), Some(log)) = (marker, self.log.as_ref()) {
                match fs::read(log) {
                    Ok(content) if String::from_utf8_lossy(&content).contains(marker) => {
                        warn!(pid = pid, log = ?log, "Found failure marker in worker log");
                        kind = OutcomeKind::MarkerFound;
                    }
                    Ok(_) => (),
                    Err(error) => warn!(log = ?log, error = ?error, "Failed to scan worker log"),
                }
            }
        }

        WorkerOutcome {
            slot: self.slot,
            label: self.label,
            pid,
            kind,
            code,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

enum Waited {
    Exited(ExitStatus),
    Deadline,
}

fn classify(status: ExitStatus, cancel: &CancelToken) -> (OutcomeKind, Option<i32>) {
    match (status.code(), status.signal()) {
        (Some(code), _) => (OutcomeKind::Exited, Some(code)),
        (None, _) if cancel.is_cancelled() => (OutcomeKind::Cancelled, status.signal()),
        (None, signal) => (OutcomeKind::Signaled, signal),
    }
}

/// Workers that have been spawned and not yet observed to exit, keyed by slot
#[derive(Debug, Default)]
pub struct PendingSet {
    slots: BTreeMap<usize, (u32, String)>,
}

impl PendingSet {
    pub fn insert(&mut self, slot: usize, pid: u32, label: String) {
        self.slots.insert(slot, (pid, label));
    }

    pub fn remove(&mut self, slot: usize) -> Option<(u32, String)> {
        self.slots.remove(&slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.values().map(|(pid, _)| *pid)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.slots.values().map(|(_, label)| label.as_str())
    }
}

/// Observations made while waiting
#[derive(Debug)]
pub enum WaitEvent<'a> {
    /// periodic report of the workers still running
    Status(&'a PendingSet),
    /// a worker left the pending set
    Finished {
        outcome: &'a WorkerOutcome,
        remaining: usize,
    },
}

/// Block until every worker has exited.
///
/// Each worker is joined by its own scoped thread, which also kills it on
/// cancellation or at the deadline. The caller's thread owns the pending set
/// and removes a slot as soon as its outcome arrives. Without a timeout and
/// without cancellation a worker that never exits blocks this call forever.
pub fn wait_all<F>(
    workers: Vec<Worker>,
    options: &WaitOptions,
    cancel: &CancelToken,
    mut on_event: F,
) -> Vec<WorkerOutcome>
where
    F: FnMut(WaitEvent<'_>),
{
    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let marker = options.failure_marker.as_deref();
    let mut pending = PendingSet::default();
    let mut outcomes = Vec::with_capacity(workers.len());

    info!(count = workers.len(), "Waiting for workers to finish");

    thread::scope(|scope| {
        let (sender, receiver) = mpsc::channel();

        for worker in workers {
            pending.insert(worker.slot, worker.pid(), worker.label.clone());

            let sender = sender.clone();
            let cancel = cancel.clone();

            scope.spawn(move || {
                let outcome = worker.join(deadline, &cancel, marker);
                // the receiver only hangs up after every slot was collected
                let _ = sender.send(outcome);
            });
        }
        drop(sender);

        let mut cancelled = false;
        let mut next_status = Instant::now() + options.status_interval;

        while !pending.is_empty() {
            if !cancelled && cancel.is_cancelled() {
                warn!(pending = pending.len(), "Run cancelled, waiting for the workers to be killed");
                cancelled = true;
            }

            let now = Instant::now();
            if now >= next_status {
                debug!(pending = ?pending.labels().collect::<Vec<_>>(), "Workers still running");
                on_event(WaitEvent::Status(&pending));
                next_status = now + options.status_interval;
            }

            match receiver.recv_timeout(next_status.saturating_duration_since(now).min(CANCEL_TICK)) {
                Ok(outcome) => {
                    pending.remove(outcome.slot);

                    info!(
                        slot = outcome.slot,
                        label = %outcome.label,
                        pid = outcome.pid,
                        kind = ?outcome.kind,
                        code = ?outcome.code,
                        "Worker finished after {:.3} seconds",
                        outcome.elapsed_ms as f64 / 1000.0
                    );

                    on_event(WaitEvent::Finished {
                        outcome: &outcome,
                        remaining: pending.len(),
                    });
                    outcomes.push(outcome);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    error!(pending = pending.len(), "All waiters hung up with workers pending");
                    break;
                }
            }
        }
    });

    outcomes.sort_by_key(|outcome| outcome.slot);
    outcomes
}
