//! Work modes: stepwise, threaded, daemonized
//!
//! A [`WorkPlan`] binds a scheduler to the queues it should drive and offers
//! three ways to run them: `serially` advances queues deterministically in
//! the caller's task (tests, cron-style hosts), `threaded` runs one worker
//! per queue until interrupted or timed out, and `daemonized` detaches the
//! process, writes a pid file, and runs `threaded` in its own runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, Instrument};

use crate::queue::Queue;
use crate::scheduler::Scheduler;
use crate::worker::QueueWorker;
use crate::Result;

/// Extension that marks a pid path as the file itself rather than a
/// directory to place one in.
#[cfg(unix)]
const PID_EXTENSION: &str = "pid";

/// Longest process name the kernel keeps (Linux comm limit).
#[cfg(target_os = "linux")]
const PROCESS_NAME_MAX: usize = 15;

/// Directory the daemon logs into unless told otherwise.
#[cfg(unix)]
const DEFAULT_LOG_DIR: &str = "logs";

pub struct WorkPlan {
    scheduler: Scheduler,
    queues: Vec<Arc<Queue>>,
    log_dir: Option<PathBuf>,
}

impl WorkPlan {
    pub(crate) fn new(scheduler: Scheduler, queues: Vec<Arc<Queue>>) -> Self {
        Self {
            scheduler,
            queues,
            log_dir: None,
        }
    }

    /// Directory the daemonized mode writes its log file into. Defaults to
    /// `logs/` under the working directory at daemonization time.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Works up to `steps` tasks per queue, in queue declaration order,
    /// without ever sleeping. Intended for tests and deterministic
    /// advancement; infrastructure errors surface to the caller.
    pub async fn serially(&self, steps: usize) -> Result<()> {
        for queue in &self.queues {
            let worker = QueueWorker::new(queue.clone(), self.scheduler.clone());
            for _ in 0..steps {
                if !worker.work_one().await? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Spawns one worker per queue and supervises them until an interrupt
    /// arrives or `timeout` elapses, then halts and joins every worker. A
    /// panicked worker is logged under its queue name; the others keep
    /// going until the supervisor exits.
    pub async fn threaded(&self, timeout: Option<Duration>) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut workers = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            let worker = QueueWorker::new(queue.clone(), self.scheduler.clone());
            let name = queue.name().to_string();
            let span = tracing::info_span!("queue_worker", queue = %name);
            let handle = tokio::spawn(worker.work(shutdown_tx.subscribe()).instrument(span));
            workers.push((name, handle));
        }
        info!(queues = workers.len(), "Queue workers started");

        match timeout {
            Some(limit) => {
                tokio::select! {
                    _ = sleep(limit) => info!("Work timeout elapsed; halting workers"),
                    signal = tokio::signal::ctrl_c() => log_interrupt(signal),
                }
            }
            None => log_interrupt(tokio::signal::ctrl_c().await),
        }

        let _ = shutdown_tx.send(());
        for (name, handle) in workers {
            if let Err(join_error) = handle.await {
                error!(queue = %name, error = %join_error, "Worker terminated abnormally");
            }
        }
        info!("Queue workers stopped");
        Ok(())
    }

    /// Detaches into a daemon, writes the pid file, renames the process,
    /// and runs [`threaded`](Self::threaded) with no timeout. The pid file
    /// is removed on orderly exit.
    ///
    /// Must be called from a plain synchronous context: it forks first and
    /// builds its own tokio runtime in the daemon child. A live process
    /// owning the pid file aborts the start with `ProcessExists`.
    #[cfg(unix)]
    pub fn daemonized(self, pid_path: Option<&Path>) -> Result<()> {
        use anyhow::Context;

        let pid_path = resolve_pid_path(pid_path);
        let log_dir = absolutize(
            self.log_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
        );
        check_pid_file(&pid_path)?;

        daemon::detach()?;

        // From here on we are the daemon child, with no terminal and no
        // useful standard streams.
        let _log_guard = init_daemon_logging(&log_dir)?;
        write_pid_file(&pid_path)?;
        daemon::rename_process(&program_name());
        info!(pid = std::process::id(), pid_file = %pid_path.display(), "Daemon started");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to build daemon runtime")?;
        let outcome = runtime.block_on(self.threaded(None));

        if let Err(remove_error) = std::fs::remove_file(&pid_path) {
            error!(
                pid_file = %pid_path.display(),
                error = %remove_error,
                "Failed to remove pid file"
            );
        }
        info!("Daemon stopped");
        outcome
    }
}

fn log_interrupt(signal: std::io::Result<()>) {
    match signal {
        Ok(()) => info!("Interrupt received; halting workers"),
        Err(signal_error) => error!(error = %signal_error, "Interrupt handler failed; halting workers"),
    }
}

// ---------------------------------------------------------------------------
// Pid file handling

/// A path carrying the `.pid` extension is used as-is; anything else is
/// treated as a directory to drop `{program}.pid` into. The result is
/// absolute so the daemon's chdir cannot orphan it.
#[cfg(unix)]
pub(crate) fn resolve_pid_path(path: Option<&Path>) -> PathBuf {
    let file_name = format!("{}.pid", program_name());
    let raw = match path {
        Some(path) if path.extension().is_some_and(|ext| ext == PID_EXTENSION) => {
            path.to_path_buf()
        }
        Some(path) => path.join(file_name),
        None => PathBuf::from(file_name),
    };
    absolutize(raw)
}

#[cfg(unix)]
fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Refuses to start over a live daemon; a pid file whose process is gone is
/// replaced with a warning.
#[cfg(unix)]
pub(crate) fn check_pid_file(path: &Path) -> Result<()> {
    use crate::SchedulingError;
    use tracing::warn;

    let content = match std::fs::read_to_string(path) {
        Err(read_error) if read_error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        other => other?,
    };

    if let Ok(pid) = content.trim().parse::<i32>() {
        if daemon::process_alive(pid) {
            return Err(SchedulingError::ProcessExists(pid).into());
        }
    }
    warn!(pid_file = %path.display(), "Replacing stale pid file");
    std::fs::remove_file(path)?;
    Ok(())
}

#[cfg(unix)]
fn write_pid_file(path: &Path) -> Result<()> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Failed to write pid file {}", path.display()))
}

#[cfg(unix)]
fn program_name() -> String {
    let arg0 = std::env::args().next().unwrap_or_default();
    Path::new(&arg0)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// File logging for the daemon: a daily-rolling file named after the
/// program, written through a non-blocking line-atomic writer.
#[cfg(unix)]
fn init_daemon_logging(log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender =
        tracing_appender::rolling::daily(log_dir, format!("{}.log", program_name()));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .try_init();
    Ok(guard)
}

// ---------------------------------------------------------------------------
// Process detachment

#[cfg(unix)]
mod daemon {
    use anyhow::Context;
    use nix::sys::signal::kill;
    use nix::unistd::{fork, setsid, ForkResult, Pid};
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    use crate::Result;

    pub(super) fn process_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    /// Classic double fork: the first fork leaves the caller's process
    /// group, `setsid` drops the controlling terminal, and the second fork
    /// makes reacquiring one impossible. Parents exit on the spot.
    pub(super) fn detach() -> Result<()> {
        match unsafe { fork() }.context("First daemon fork failed")? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }
        setsid().context("Failed to start a new session")?;
        match unsafe { fork() }.context("Second daemon fork failed")? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        std::env::set_current_dir("/").context("Failed to chdir into /")?;
        redirect_standard_streams()
    }

    fn redirect_standard_streams() -> Result<()> {
        let dev_null = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .context("Failed to open /dev/null")?;
        for fd in 0..=2 {
            nix::unistd::dup2(dev_null.as_raw_fd(), fd)
                .context("Failed to redirect standard stream")?;
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    pub(super) fn rename_process(name: &str) {
        let trimmed: String = name.chars().take(super::PROCESS_NAME_MAX).collect();
        if let Ok(name) = std::ffi::CString::new(trimmed) {
            let _ = nix::sys::prctl::set_name(&name);
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn rename_process(_name: &str) {}
}
