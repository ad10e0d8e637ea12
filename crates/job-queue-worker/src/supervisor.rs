//! Execution supervisor: runs each job in a fresh, independently terminable
//! work horse and turns however it ended into an `Outcome`.

use crate::control::{HorseStop, WorkerControl};
use crate::death_penalty::{DeathPenalty, Escalation};
use crate::handler::HandlerRegistry;
use crate::horse::perform_job;
use crate::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use job_queue_core::{FailureKind, Job, Serializer, MAX_PAYLOAD_SIZE};
use job_queue_protocol::{Frame, HorseCodec, HorseReport, HorseRequest};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to wait for a report still in the pipe after the horse exited
const REPORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a killed in-process job gets to return before it is abandoned
const ABANDON_TIMEOUT: Duration = Duration::from_millis(100);

/// How a work horse ended
#[derive(Debug, Clone, PartialEq)]
pub enum HorseExit {
    /// Exited normally, with the report it wrote, if any
    Exited(Option<HorseReport>),
    /// Killed, crashed or exited with a failure status
    Terminated(String),
}

/// Handle to one running work horse
#[async_trait]
pub trait Horse: Send {
    /// OS process id, when the horse is a process
    fn pid(&self) -> Option<u32>;

    /// Ask the horse to stop early
    fn interrupt(&mut self) -> Result<()>;

    /// Terminate the horse unconditionally
    fn kill(&mut self) -> Result<()>;

    /// Wait for the horse to end. Cancel safe.
    async fn wait(&mut self) -> HorseExit;
}

/// Creates a work horse for a job
#[async_trait]
pub trait Isolation: Send + Sync {
    async fn spawn(&self, job: &Job) -> Result<Box<dyn Horse>>;
}

/// Runs each job in a child process in its own process group.
///
/// The job is sent as a request frame on the child's stdin and the child
/// answers with one report frame on stdout.
#[derive(Debug, Clone)]
pub struct ProcessIsolation {
    program: PathBuf,
    args: Vec<String>,
    serializer: String,
}

impl ProcessIsolation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, serializer: impl Into<String>) -> Self {
        ProcessIsolation {
            program: program.into(),
            args,
            serializer: serializer.into(),
        }
    }

    /// Re-run the current executable as `<exe> horse`
    pub fn current_exe(serializer: impl Into<String>) -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, vec!["horse".to_string()], serializer))
    }
}

#[async_trait]
impl Isolation for ProcessIsolation {
    async fn spawn(&self, job: &Job) -> Result<Box<dyn Horse>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();
        debug!("Spawned work horse {:?} for job {}", pid, job.id);

        if let Some(stdin) = child.stdin.take() {
            let request = Frame::Request(HorseRequest {
                job: job.clone(),
                serializer: self.serializer.clone(),
            });
            let job_id = job.id;
            // A horse that never reads its stdin must not block the supervisor
            tokio::spawn(async move {
                let mut writer = FramedWrite::new(stdin, HorseCodec);
                if let Err(e) = writer.send(request).await {
                    debug!("Could not hand job {} to its work horse: {}", job_id, e);
                }
            });
        }

        let reader = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut frames = FramedRead::new(stdout, HorseCodec);
                match frames.next().await {
                    Some(Ok(Frame::Report(report))) => Some(report),
                    Some(Ok(Frame::Request(_))) => {
                        warn!("Work horse answered with a request frame");
                        None
                    }
                    Some(Err(e)) => {
                        warn!("Unreadable work horse report: {}", e);
                        None
                    }
                    None => None,
                }
            })
        });

        Ok(Box::new(ProcessHorse {
            child,
            pid,
            reader,
            exit: None,
        }))
    }
}

struct ProcessHorse {
    child: Child,
    pid: Option<u32>,
    reader: Option<JoinHandle<Option<HorseReport>>>,
    exit: Option<HorseExit>,
}

impl ProcessHorse {
    fn signal_group(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}

#[async_trait]
impl Horse for ProcessHorse {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn interrupt(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.signal_group(Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.signal_group(Signal::SIGKILL)?;
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait(&mut self) -> HorseExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }

        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => {
                let exit = HorseExit::Terminated(format!("failed to wait for work horse: {}", e));
                self.exit = Some(exit.clone());
                return exit;
            }
        };

        let mut report = None;
        if let Some(reader) = self.reader.as_mut() {
            match tokio::time::timeout(REPORT_DRAIN_TIMEOUT, &mut *reader).await {
                Ok(Ok(read)) => report = read,
                Ok(Err(e)) => warn!("Work horse report reader failed: {}", e),
                Err(_) => {
                    warn!("Work horse exited but its stdout stayed open");
                    reader.abort();
                }
            }
            self.reader = None;
        }

        let exit = if status.success() {
            HorseExit::Exited(report)
        } else {
            HorseExit::Terminated(describe_status(status))
        };
        self.exit = Some(exit.clone());
        exit
    }
}

fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (_, Some(signal)) => match Signal::try_from(signal) {
            Ok(signal) => format!("work horse terminated by {}", signal),
            Err(_) => format!("work horse terminated by signal {}", signal),
        },
        (Some(code), None) => format!("work horse exited with status {}", code),
        (None, None) => "work horse terminated abnormally".to_string(),
    }
}

/// Runs each job inside the worker process, on a dedicated thread with its own
/// runtime so a handler that blocks cannot stall the supervisor.
///
/// Interrupt cancels the job at its next await point. Kill stops waiting for
/// it: a job that does not yield is abandoned on its thread. A panicking job is
/// reported as crashed.
pub struct InProcessIsolation {
    registry: Arc<HandlerRegistry>,
    serializer: Arc<dyn Serializer>,
}

impl InProcessIsolation {
    pub fn new(registry: Arc<HandlerRegistry>, serializer: Arc<dyn Serializer>) -> Self {
        InProcessIsolation { registry, serializer }
    }
}

#[async_trait]
impl Isolation for InProcessIsolation {
    async fn spawn(&self, job: &Job) -> Result<Box<dyn Horse>> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let registry = self.registry.clone();
        let serializer = self.serializer.clone();
        let job = job.clone();
        let (report_tx, report_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("jq-horse-{}", job.id.simple()))
            .spawn(move || {
                let report = runtime.block_on(async {
                    tokio::select! {
                        report = perform_job(&registry, &job, serializer.as_ref()) => report,
                        _ = cancelled.cancelled() => HorseReport::Interrupted,
                    }
                });
                // The supervisor may have given up on this horse already
                let _ = report_tx.send(report);
            })?;

        Ok(Box::new(TaskHorse {
            report: report_rx,
            token,
            killed: false,
            exit: None,
        }))
    }
}

struct TaskHorse {
    report: oneshot::Receiver<HorseReport>,
    token: CancellationToken,
    killed: bool,
    exit: Option<HorseExit>,
}

impl TaskHorse {
    fn received(result: std::result::Result<HorseReport, oneshot::error::RecvError>) -> HorseExit {
        match result {
            Ok(report) => HorseExit::Exited(Some(report)),
            // The thread dropped its sender without reporting
            Err(_) => HorseExit::Terminated("job panicked".to_string()),
        }
    }
}

#[async_trait]
impl Horse for TaskHorse {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn interrupt(&mut self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.token.cancel();
        self.killed = true;
        Ok(())
    }

    async fn wait(&mut self) -> HorseExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = if self.killed {
            match tokio::time::timeout(ABANDON_TIMEOUT, &mut self.report).await {
                Ok(result) => Self::received(result),
                Err(_) => {
                    warn!("In-process job did not yield after kill, abandoning its thread");
                    HorseExit::Terminated("job abandoned after kill".to_string())
                }
            }
        } else {
            Self::received((&mut self.report).await)
        };
        self.exit = Some(exit.clone());
        exit
    }
}

/// Result of executing one job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Encoded return value
    Success(Vec<u8>),
    Failure { kind: FailureKind, error: String },
    /// Ended without a result: stopped by command, forced shutdown, or an external signal
    Stopped(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Failure { kind, .. } => kind.as_str(),
            Outcome::Stopped(_) => "stopped",
        }
    }
}

/// Map how a horse ended to an outcome
pub fn classify(exit: HorseExit, timed_out: bool, stop: Option<HorseStop>, timeout: Duration) -> Outcome {
    match (exit, stop) {
        (_, None) if timed_out => Outcome::Failure {
            kind: FailureKind::Timeout,
            error: format!("job exceeded its {}s timeout", timeout.as_secs_f64()),
        },
        (HorseExit::Exited(Some(HorseReport::Success { result })), _) => {
            if result.len() > MAX_PAYLOAD_SIZE {
                Outcome::Failure {
                    kind: FailureKind::Invalid,
                    error: format!("result of {} bytes exceeds the {} byte limit", result.len(), MAX_PAYLOAD_SIZE),
                }
            } else {
                Outcome::Success(result)
            }
        }
        (_, Some(HorseStop::JobStopped)) => Outcome::Stopped("stopped by stop_job command".to_string()),
        (_, Some(HorseStop::ForcedShutdown)) => Outcome::Stopped("terminated by forced shutdown".to_string()),
        (_, Some(HorseStop::Killed)) => Outcome::Failure {
            kind: FailureKind::Crashed,
            error: "work horse killed by kill_horse command".to_string(),
        },
        (HorseExit::Exited(Some(HorseReport::Raised { error })), None) => Outcome::Failure {
            kind: FailureKind::Raised,
            error,
        },
        (HorseExit::Exited(Some(HorseReport::Invalid { error })), None) => Outcome::Failure {
            kind: FailureKind::Invalid,
            error,
        },
        (HorseExit::Exited(Some(HorseReport::Interrupted)), None) | (HorseExit::Exited(None), None) => {
            Outcome::Stopped("work horse exited without a result".to_string())
        }
        (HorseExit::Terminated(detail), None) => Outcome::Failure {
            kind: FailureKind::Crashed,
            error: detail,
        },
    }
}

/// Runs jobs in work horses under a death penalty
pub struct ExecutionSupervisor {
    isolation: Arc<dyn Isolation>,
    death_penalty: Arc<dyn DeathPenalty>,
}

impl ExecutionSupervisor {
    pub fn new(isolation: Arc<dyn Isolation>, death_penalty: Arc<dyn DeathPenalty>) -> Self {
        ExecutionSupervisor {
            isolation,
            death_penalty,
        }
    }

    /// Execute `job`, enforcing `timeout` and honoring horse-stop requests in `control`
    pub async fn execute(&self, job: &Job, timeout: Duration, control: &WorkerControl) -> Outcome {
        let mut horse = match self.isolation.spawn(job).await {
            Ok(horse) => horse,
            Err(e) => {
                error!("Failed to spawn work horse for job {}: {}", job.id, e);
                return Outcome::Failure {
                    kind: FailureKind::Crashed,
                    error: format!("failed to spawn work horse: {}", e),
                };
            }
        };

        let mut watchdog = self.death_penalty.arm(job.id, timeout);
        let mut stop = None;

        loop {
            if stop.is_none() {
                if let Some(request) = control.take_horse_stop(job.id) {
                    warn!("Terminating work horse of job {}: {:?}", job.id, request);
                    stop = Some(request);
                    if let Err(e) = horse.kill() {
                        error!("Failed to kill work horse of job {}: {}", job.id, e);
                    }
                }
            }

            tokio::select! {
                exit = horse.wait() => {
                    let outcome = classify(exit, watchdog.fired(), stop, timeout);
                    info!("Job {} ended: {}", job.id, outcome.label());
                    return outcome;
                }
                escalation = watchdog.next() => {
                    let result = match escalation {
                        Escalation::Interrupt => {
                            warn!("Job {} exceeded its {:?} timeout, interrupting", job.id, timeout);
                            horse.interrupt()
                        }
                        Escalation::Kill => {
                            warn!("Job {} ignored the interrupt, killing its work horse", job.id);
                            horse.kill()
                        }
                    };
                    if let Err(e) = result {
                        error!("Failed to deliver {:?} to work horse of job {}: {}", escalation, job.id, e);
                    }
                }
                _ = control.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::death_penalty::TimerDeathPenalty;
    use crate::handler::{default_registry, JobHandler, HandlerResult};
    use job_queue_core::{Invocation, JsonSerializer};
    use serde_json::{json, Value};

    struct PanicHandler;

    /// Holds its thread without ever yielding
    struct BlockingHandler;

    #[async_trait]
    impl JobHandler for BlockingHandler {
        async fn call(&self, _args: Value) -> HandlerResult {
            std::thread::sleep(Duration::from_secs(4));
            Ok(json!(1))
        }
    }

    #[async_trait]
    impl JobHandler for PanicHandler {
        async fn call(&self, _args: Value) -> HandlerResult {
            panic!("job blew up")
        }
    }

    fn supervisor(grace: Duration) -> ExecutionSupervisor {
        let registry = default_registry();
        registry.register("panic", PanicHandler);
        registry.register("block", BlockingHandler);
        ExecutionSupervisor::new(
            Arc::new(InProcessIsolation::new(Arc::new(registry), Arc::new(JsonSerializer))),
            Arc::new(TimerDeathPenalty::new(grace)),
        )
    }

    fn job(function: &str, args: Value) -> Job {
        Job::for_call("default", &Invocation::new(function, args), &JsonSerializer)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_classification() {
        let timeout = Duration::from_secs(1);
        let success = HorseExit::Exited(Some(HorseReport::Success { result: b"1".to_vec() }));
        assert_eq!(classify(success.clone(), false, None, timeout), Outcome::Success(b"1".to_vec()));
        // A result that made it out wins over a late stop request
        assert_eq!(
            classify(success.clone(), false, Some(HorseStop::JobStopped), timeout),
            Outcome::Success(b"1".to_vec())
        );
        // A result reported after the deadline does not count
        assert!(matches!(
            classify(success, true, None, timeout),
            Outcome::Failure { kind: FailureKind::Timeout, .. }
        ));

        let killed = HorseExit::Terminated("work horse terminated by SIGKILL".into());
        assert!(matches!(
            classify(killed.clone(), true, None, timeout),
            Outcome::Failure { kind: FailureKind::Timeout, .. }
        ));
        assert!(matches!(
            classify(killed.clone(), false, None, timeout),
            Outcome::Failure { kind: FailureKind::Crashed, .. }
        ));
        assert!(matches!(
            classify(killed.clone(), false, Some(HorseStop::JobStopped), timeout),
            Outcome::Stopped(_)
        ));
        assert!(matches!(
            classify(killed, false, Some(HorseStop::Killed), timeout),
            Outcome::Failure { kind: FailureKind::Crashed, .. }
        ));

        assert!(matches!(
            classify(HorseExit::Exited(None), false, None, timeout),
            Outcome::Stopped(_)
        ));
        assert!(matches!(
            classify(HorseExit::Exited(Some(HorseReport::Raised { error: "e".into() })), false, None, timeout),
            Outcome::Failure { kind: FailureKind::Raised, .. }
        ));
    }

    #[tokio::test]
    async fn test_in_process_success() {
        let control = WorkerControl::new();
        let outcome = supervisor(Duration::from_secs(2))
            .execute(&job("echo", json!([1, 2])), Duration::from_secs(5), &control)
            .await;
        assert_eq!(outcome, Outcome::Success(b"[1,2]".to_vec()));
    }

    #[tokio::test]
    async fn test_in_process_timeout() {
        let control = WorkerControl::new();
        let started = tokio::time::Instant::now();
        let outcome = supervisor(Duration::from_secs(2))
            .execute(&job("sleep", json!(5)), Duration::from_secs(1), &control)
            .await;

        assert!(matches!(outcome, Outcome::Failure { kind: FailureKind::Timeout, .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_in_process_job_that_never_yields_times_out() {
        let control = WorkerControl::new();
        let started = tokio::time::Instant::now();
        let outcome = supervisor(Duration::from_secs(1))
            .execute(&job("block", json!(null)), Duration::from_secs(1), &control)
            .await;

        assert!(matches!(outcome, Outcome::Failure { kind: FailureKind::Timeout, .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_in_process_panic_is_crash() {
        let control = WorkerControl::new();
        let outcome = supervisor(Duration::from_secs(2))
            .execute(&job("panic", json!(null)), Duration::from_secs(5), &control)
            .await;
        assert!(matches!(outcome, Outcome::Failure { kind: FailureKind::Crashed, .. }));
    }

    #[tokio::test]
    async fn test_process_horse_ignoring_sigterm_is_killed() {
        let isolation = ProcessIsolation::new(
            "sh",
            vec!["-c".to_string(), "trap '' TERM; sleep 5".to_string()],
            "json",
        );
        let job = job("sleep", json!(5));
        let mut horse = isolation.spawn(&job).await.unwrap();
        let pid = horse.pid().unwrap();
        horse.interrupt().unwrap();
        horse.kill().unwrap();
        assert!(matches!(horse.wait().await, HorseExit::Terminated(_)));
        assert_eq!(
            nix::sys::signal::kill(Pid::from_raw(pid as i32), None),
            Err(Errno::ESRCH)
        );
    }
}
