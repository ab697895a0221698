//! Single-instance guard and start/stop control for the reply router process.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};

use crate::config::RuntimePaths;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const START_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: Option<u32> },
    /// A pid file is left over from a process that no longer holds the lock.
    Stale { pid: u32 },
    Stopped,
}

/// Held by the running daemon. Dropping it removes the pid file and releases
/// the instance lock.
#[derive(Debug)]
pub struct InstanceGuard {
    pid_path: PathBuf,
    _lock: File,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if read_pid(&self.pid_path) == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.pid_path);
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonLifecycle {
    paths: RuntimePaths,
}

impl DaemonLifecycle {
    pub fn new(paths: RuntimePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// Become the one running daemon, or fail if another instance holds the lock.
    pub fn acquire(&self) -> Result<InstanceGuard> {
        self.paths.ensure_state_dir()?;
        let lock = open_lock_file(&self.paths.daemon_lock)?;
        if !try_lock(&lock) {
            let holder = read_pid(&self.paths.daemon_pid)
                .map(|pid| format!(" (pid {pid})"))
                .unwrap_or_default();
            bail!("pane-relay daemon is already running{holder}");
        }
        if let Some(old_pid) = read_pid(&self.paths.daemon_pid) {
            tracing::warn!(
                target = "pane_relay::daemon",
                old_pid = old_pid,
                "replacing stale pid file"
            );
        }
        write_pid_file(&self.paths.daemon_pid)?;
        Ok(InstanceGuard {
            pid_path: self.paths.daemon_pid.clone(),
            _lock: lock,
        })
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = read_pid(&self.paths.daemon_pid);
        let lock_held = match open_lock_file(&self.paths.daemon_lock) {
            // The probe lock is released when the file drops.
            Ok(lock) => !try_lock(&lock),
            Err(_) => false,
        };
        match (lock_held, pid) {
            (true, pid) => DaemonStatus::Running { pid },
            (false, Some(pid)) if is_pid_alive(pid) && pid != std::process::id() => {
                // Lock files can be deleted by hand; trust a live pid.
                DaemonStatus::Running { pid: Some(pid) }
            }
            (false, Some(pid)) => DaemonStatus::Stale { pid },
            (false, None) => DaemonStatus::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), DaemonStatus::Running { .. })
    }

    /// Launch `<exe> --config <config> daemon run` detached from the caller's
    /// terminal and process group, then wait briefly for it to claim the lock.
    pub fn start(&self, exe: &Path, config_path: &Path) -> Result<DaemonStatus> {
        if let DaemonStatus::Running { pid } = self.status() {
            return Ok(DaemonStatus::Running { pid });
        }
        self.paths.ensure_state_dir()?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.daemon_log)
            .with_context(|| format!("failed to open {}", self.paths.daemon_log.display()))?;

        let mut command = std::process::Command::new(exe);
        command
            .arg("--config")
            .arg(config_path)
            .args(["daemon", "run", "--detached"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", exe.display()))?;
        let child_pid = child.id();
        tracing::info!(target = "pane_relay::daemon", pid = child_pid, "daemon spawned");

        let started = Instant::now();
        while started.elapsed() < START_TIMEOUT {
            if let DaemonStatus::Running { pid } = self.status() {
                return Ok(DaemonStatus::Running { pid });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        if is_pid_alive(child_pid) {
            return Ok(DaemonStatus::Running {
                pid: Some(child_pid),
            });
        }
        bail!(
            "daemon exited during startup; see {}",
            self.paths.daemon_log.display()
        )
    }

    /// SIGTERM the running daemon and wait for it to exit.
    pub fn stop(&self) -> Result<DaemonStatus> {
        let pid = match self.status() {
            DaemonStatus::Running { pid: Some(pid) } => pid,
            DaemonStatus::Running { pid: None } => {
                bail!("daemon holds the lock but wrote no pid file")
            }
            DaemonStatus::Stale { pid } => {
                let _ = std::fs::remove_file(&self.paths.daemon_pid);
                return Ok(DaemonStatus::Stale { pid });
            }
            DaemonStatus::Stopped => return Ok(DaemonStatus::Stopped),
        };
        terminate(pid)?;
        let started = Instant::now();
        while started.elapsed() < STOP_TIMEOUT {
            if !is_pid_alive(pid) {
                let _ = std::fs::remove_file(&self.paths.daemon_pid);
                tracing::info!(target = "pane_relay::daemon", pid = pid, "daemon stopped");
                return Ok(DaemonStatus::Stopped);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        bail!(
            "daemon (pid {pid}) did not exit within {}s",
            STOP_TIMEOUT.as_secs()
        )
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))
}

#[cfg(unix)]
fn try_lock(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_EX | nix::libc::LOCK_NB) };
    rc == 0
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> bool {
    true
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Write the current process PID to the given path atomically.
fn write_pid_file(path: &Path) -> Result<()> {
    let pid = std::process::id();
    let dir = path
        .parent()
        .with_context(|| format!("pid path has no parent: {}", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed creating temp pid file in {}", dir.display()))?;
    write!(tmp, "{pid}")?;
    tmp.persist(path)
        .with_context(|| format!("failed persisting pid file to {}", path.display()))?;
    tracing::info!(target = "pane_relay::daemon", pid = pid, path = %path.display(), "wrote pid file");
    Ok(())
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None) {
        Ok(()) => true,
        // The process exists but belongs to another user.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid).context("pid out of range")?;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(raw),
        nix::sys::signal::Signal::SIGTERM,
    )
    .with_context(|| format!("failed to signal daemon pid {pid}"))
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> Result<()> {
    bail!("stopping the daemon is only supported on unix")
}
