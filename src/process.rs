//! Child-process helpers shared by the command agent, gate runner and git,
//! plus a liveness check for recorded pids.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output of a finished (or killed) child.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Killed after exceeding its bound.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Last `lines` lines of stderr, falling back to stdout.
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let collected: Vec<&str> = source.lines().collect();
        let start = collected.len().saturating_sub(lines);
        collected[start..].join("\n")
    }
}

/// Run `program args` in `workdir` with extra `envs`, optionally feeding
/// `stdin` and killing the child after `timeout`.
pub async fn run_command(
    program: &str,
    args: &[&str],
    workdir: &Path,
    envs: &[(&str, &str)],
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> std::io::Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .envs(envs.iter().copied())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program, args = %args.join(" "), workdir = %workdir.display(), "spawning");
    let mut child = cmd.spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_vec();
        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        tokio::spawn(async move {
            if let Err(err) = pipe.write_all(&input).await {
                debug!(error = %err, "child closed stdin early");
            }
            drop(pipe);
        });
    }

    let waited = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(program, timeout_secs = limit.as_secs(), "child timed out and was killed");
                return Ok(CommandOutput {
                    timed_out: true,
                    ..Default::default()
                });
            }
        },
        None => child.wait_with_output().await?,
    };

    Ok(CommandOutput {
        code: waited.status.code(),
        success: waited.status.success(),
        stdout: String::from_utf8_lossy(&waited.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&waited.stderr).into_owned(),
        timed_out: false,
    })
}

/// Run a shell command line through `sh -c`.
pub async fn run_shell(
    command_line: &str,
    workdir: &Path,
    envs: &[(&str, &str)],
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> std::io::Result<CommandOutput> {
    run_command("sh", &["-c", command_line], workdir, envs, stdin, timeout).await
}

/// Whether a process with `pid` is running. `EPERM` means it exists under
/// another user.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// No cheap check here; callers fall back on heartbeat age.
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}
