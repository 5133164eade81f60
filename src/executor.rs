//! Runs a job's shell command under a deadline.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecutionError;

/// Captured result of a command that ran to exit.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// `Ok` for a zero exit status, otherwise the failure it represents.
    pub fn check(&self) -> Result<(), ExecutionError> {
        if self.status.success() {
            return Ok(());
        }
        match self.status.code() {
            Some(code) => Err(ExecutionError::Exit(code)),
            None => Err(ExecutionError::Terminated),
        }
    }

    /// Non-empty output streams, tagged by name.
    pub fn streams(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [("stdout", self.stdout.as_str()), ("stderr", self.stderr.as_str())]
            .into_iter()
            .filter(|(_, chunk)| !chunk.is_empty())
    }
}

enum Finished {
    Exited(io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    TimedOut,
    Cancelled,
}

/// Run `command` through `sh -c`.
///
/// The shell leads its own process group. When `timeout` elapses or `cancel`
/// fires the whole group is killed, so commands the shell started die with
/// it. Whatever was printed up to that point is discarded.
pub async fn run_shell(
    command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ExecutionError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(ExecutionError::Spawn)?;
    // Captured now: `id()` is gone once the child has been reaped.
    let pgid = child.id();
    debug!(pid = pgid, "spawned command");

    let finished = tokio::select! {
        biased;
        _ = cancel.cancelled() => Finished::Cancelled,
        _ = tokio::time::sleep(timeout) => Finished::TimedOut,
        output = collect(&mut child) => Finished::Exited(output),
    };

    match finished {
        Finished::Exited(output) => {
            let (status, stdout, stderr) = output.map_err(ExecutionError::Wait)?;
            Ok(CommandOutput {
                status,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
        Finished::TimedOut => {
            kill_group(&mut child, pgid).await;
            Err(ExecutionError::Timeout(timeout))
        }
        Finished::Cancelled => {
            kill_group(&mut child, pgid).await;
            Err(ExecutionError::Cancelled)
        }
    }
}

// Reads both pipes to EOF while waiting, so a chatty command cannot block on a full pipe.
async fn collect(child: &mut Child) -> io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr, status) =
        tokio::try_join!(read_all(stdout), read_all(stderr), child.wait())?;
    Ok((status, stdout, stderr))
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

async fn kill_group(child: &mut Child, pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        signal_group(pgid);
    }
    // Kills the shell if it is still around and reaps it.
    if let Err(e) = child.kill().await {
        debug!(error = %e, "failed to kill command");
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        // Everything in the group already exited.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "failed to kill command process group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const LONG: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn captures_both_streams() {
        let output = run_shell("echo out; echo err >&2", LONG, &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.check().is_ok());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.streams().count(), 2);
    }

    #[tokio::test]
    async fn silent_command_has_no_streams() {
        let output = run_shell("true", LONG, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.streams().count(), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_with_code() {
        let output = run_shell("echo nope; exit 3", LONG, &CancellationToken::new())
            .await
            .unwrap();
        let err = output.check().unwrap_err();
        assert!(matches!(err, ExecutionError::Exit(3)));
        assert_eq!(err.to_string(), "exit status 3");
        assert_eq!(output.stdout, "nope\n");
    }

    #[tokio::test]
    async fn deadline_kills_command() {
        let started = Instant::now();
        let err = run_shell("sleep 5", Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "command timed out after 100ms");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cancellation_kills_command() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = run_shell("sleep 5", LONG, &cancel).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    /// Shell command that records its process group id, then runs a child
    /// that outlives the shell unless the whole group is killed.
    #[cfg(target_os = "linux")]
    fn compound_command(pid_file: &std::path::Path) -> String {
        format!("echo $$ > '{}'; sleep 30; true", pid_file.display())
    }

    /// Non-zombie processes in the group, read from `/proc`.
    #[cfg(target_os = "linux")]
    fn live_members(pgid: &str) -> usize {
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
            .filter(|stat| {
                // pid (comm) state ppid pgrp ...
                let Some((_, rest)) = stat.rsplit_once(") ") else {
                    return false;
                };
                let fields: Vec<&str> = rest.split_whitespace().take(3).collect();
                fields.len() == 3 && fields[0] != "Z" && fields[2] == pgid
            })
            .count()
    }

    #[cfg(target_os = "linux")]
    async fn group_is_gone(pid_file: &std::path::Path) -> bool {
        let pgid = std::fs::read_to_string(pid_file).unwrap();
        let pgid = pgid.trim();
        for _ in 0..40 {
            if live_members(pgid) == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn deadline_kills_commands_started_by_the_shell() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pgid");

        let err = run_shell(
            &compound_command(&pid_file),
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(group_is_gone(&pid_file).await, "sleep survived the timeout");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancellation_kills_commands_started_by_the_shell() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pgid");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let err = run_shell(&compound_command(&pid_file), LONG, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert!(group_is_gone(&pid_file).await, "sleep survived shutdown");
    }
}
