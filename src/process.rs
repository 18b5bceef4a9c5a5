//! Spawning and signalling OS processes
//!
//! The lifecycle never touches `tokio::process` directly; it goes through
//! [`ProcessLauncher`] so a process can be a plain child with pipes, a child
//! attached to a pseudo-terminal (required by checkpoint/restore shell jobs),
//! or a fake in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Exit code reported when the exit status could not be observed
pub const UNKNOWN_EXIT_CODE: i32 = -1;

pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// What to run and how
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnRequest {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Attach the child to a fresh pseudo-terminal instead of pipes
    pub pty: bool,
}

impl SpawnRequest {
    pub fn new(executable: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            ..Default::default()
        }
    }
}

/// Handle to a freshly spawned process
pub struct SpawnedProcess {
    pub pid: u32,
    /// Writes to the process's stdin (or terminal)
    pub input: Option<ProcessInput>,
    /// Reads the process's stdout (or terminal)
    pub output: Option<ProcessOutput>,
    /// Resolves once with the exit code
    pub exit: oneshot::Receiver<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to exit (SIGTERM)
    Terminate,
    /// Force the process to exit (SIGKILL)
    Kill,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<SpawnedProcess>;

    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()>;
}

/// Launches real OS processes
#[derive(Debug, Default, Clone)]
pub struct SystemLauncher;

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<SpawnedProcess> {
        let mut cmd = Command::new(&request.executable);
        cmd.args(&request.args);

        if let Some(ref cwd) = request.cwd {
            cmd.current_dir(cwd);
        }

        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let terminal = if request.pty {
            Some(attach_pty(&mut cmd)?)
        } else {
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            None
        };

        let mut child = cmd.spawn()?;
        // Release our copies of the terminal's slave side so reads see EOF on exit
        drop(cmd);

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Process exited before its pid was read"))?;
        info!(pid, executable = %request.executable, pty = request.pty, "Process spawned");

        let (input, output): (Option<ProcessInput>, Option<ProcessOutput>) = match terminal {
            Some((reader, writer)) => (Some(Box::new(writer)), Some(Box::new(reader))),
            None => {
                if let Some(stderr) = child.stderr.take() {
                    drain_stderr(pid, stderr);
                }
                (
                    child.stdin.take().map(|s| Box::new(s) as ProcessInput),
                    child.stdout.take().map(|s| Box::new(s) as ProcessOutput),
                )
            }
        };

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(pid, error = %e, "Error waiting for process to exit");
                    UNKNOWN_EXIT_CODE
                }
            };
            debug!(pid, code, "Process exited");
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            pid,
            input,
            output,
            exit: exit_rx,
        })
    }

    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()> {
        send_signal(pid, signal)
    }
}

fn drain_stderr(pid: u32, stderr: tokio::process::ChildStderr) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(target: "backend", pid, "{}", line);
        }
    });
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> anyhow::Result<()> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let result = unsafe { libc::kill(pid as libc::pid_t, signo) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone is what we wanted
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) -> anyhow::Result<()> {
    anyhow::bail!("Cannot send {:?} to pid {} on this platform", signal, pid)
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(UNKNOWN_EXIT_CODE)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(UNKNOWN_EXIT_CODE)
}

/// Open a pseudo-terminal, make its slave side the child's stdio and
/// controlling terminal, and return async handles to the master side.
#[cfg(unix)]
fn attach_pty(cmd: &mut Command) -> anyhow::Result<(tokio::fs::File, tokio::fs::File)> {
    use std::os::fd::{FromRawFd, OwnedFd};

    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let result = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if result != 0 {
        return Err(anyhow::anyhow!(
            "Failed to open pseudo-terminal: {}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: openpty succeeded, so both descriptors are open and owned by us
    let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };

    cmd.stdin(Stdio::from(slave.try_clone()?));
    cmd.stdout(Stdio::from(slave.try_clone()?));
    cmd.stderr(Stdio::from(slave));

    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let writer = std::fs::File::from(master.try_clone()?);
    let reader = std::fs::File::from(master);
    Ok((
        tokio::fs::File::from_std(reader),
        tokio::fs::File::from_std(writer),
    ))
}

#[cfg(not(unix))]
fn attach_pty(_cmd: &mut Command) -> anyhow::Result<(tokio::fs::File, tokio::fs::File)> {
    anyhow::bail!("Pseudo-terminals are only supported on unix")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_spawn_reports_exit_code() {
        let launcher = SystemLauncher;
        let request = SpawnRequest::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);

        let process = launcher.spawn(&request).await.unwrap();
        assert!(process.pid > 0);
        assert_eq!(process.exit.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_spawn_pipes_stdin_to_stdout() {
        let launcher = SystemLauncher;
        let request = SpawnRequest::new("sh", vec!["-c".to_string(), "read line; echo got $line".to_string()]);

        let mut process = launcher.spawn(&request).await.unwrap();
        let mut input = process.input.take().unwrap();
        input.write_all(b"stop\n").await.unwrap();
        input.flush().await.unwrap();

        let output = process.output.take().unwrap();
        let mut lines = BufReader::new(output).lines();
        assert_eq!(lines.next_line().await.unwrap(), Some("got stop".to_string()));
        assert_eq!(process.exit.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let launcher = SystemLauncher;
        let request = SpawnRequest::new("/nonexistent/lobbygate-backend", Vec::new());
        assert!(launcher.spawn(&request).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_signal_reports_signal_exit() {
        let launcher = SystemLauncher;
        let request = SpawnRequest::new("sleep", vec!["30".to_string()]);

        let process = launcher.spawn(&request).await.unwrap();
        launcher.signal(process.pid, Signal::Terminate).unwrap();
        assert_eq!(process.exit.await.unwrap(), 128 + libc::SIGTERM);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_to_missing_process_is_ok() {
        // pid_max on Linux is below this value
        assert!(send_signal(4_194_999, Signal::Kill).is_ok());
    }
}
