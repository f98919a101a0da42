// SPDX-License-Identifier: MIT OR Apache-2.0
//! Detached process spawning and PID-based termination.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Start a detached child process that survives the parent.
///
/// stdio is redirected to `log_path`, the child runs in its own process
/// group (the POSIX-session equivalent for signal isolation), and only the
/// explicitly passed environment is inherited. Returns the child's PID.
///
/// # Errors
///
/// Spawn failures (missing binary, unwritable log).
pub fn spawn_detached(
    cmd: &str,
    args: &[String],
    log_path: &Path,
    envs: &BTreeMap<String, String>,
) -> std::io::Result<u32> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let log_err = log.try_clone()?;

    let mut command = std::process::Command::new(cmd);
    command
        .args(args)
        .env_clear()
        .envs(envs)
        .stdin(std::process::Stdio::null())
        .stdout(log)
        .stderr(log_err);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New process group: the child is not reaped by our signals and
        // outlives this process.
        command.process_group(0);
    }

    let mut child = command.spawn()?;
    let pid = child.id();
    // Reap in the background so an exited child doesn't linger as a zombie
    // and PID liveness checks stay accurate.
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(pid)
}

/// Terminate a process by PID with an escalating `TERM → KILL` sequence.
///
/// Waits `grace` between signals. Returns the method that took effect
/// (`"term"`, `"kill"`), or an error when the process could not be
/// signalled at all.
///
/// # Errors
///
/// An error string when neither signal could be delivered.
#[cfg(unix)]
pub async fn kill_pid(pid: u32, grace: Duration) -> Result<&'static str, String> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);

    let alive = |target: Pid| kill(target, None).is_ok();

    if !alive(target) {
        return Err(format!("process {pid} is not running"));
    }

    kill(target, Signal::SIGTERM).map_err(|e| format!("TERM {pid}: {e}"))?;

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !alive(target) {
            return Ok("term");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    kill(target, Signal::SIGKILL).map_err(|e| format!("KILL {pid}: {e}"))?;
    Ok("kill")
}

/// Non-Unix fallback: best effort, unsupported.
#[cfg(not(unix))]
pub async fn kill_pid(pid: u32, _grace: Duration) -> Result<&'static str, String> {
    Err(format!("kill is not supported on this platform (pid {pid})"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn spawn_and_kill_roundtrip() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("spawn.log");
        let pid = spawn_detached(
            "sleep",
            &["30".to_string()],
            &log,
            &BTreeMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
        )
        .unwrap();
        assert!(pid > 0);

        let method = kill_pid(pid, Duration::from_secs(2)).await.unwrap();
        assert_eq!(method, "term");
    }

    #[tokio::test]
    async fn killing_a_dead_pid_is_an_error() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("spawn.log");
        let pid = spawn_detached(
            "true",
            &[],
            &log,
            &BTreeMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
        )
        .unwrap();
        // Give the process a moment to exit.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(kill_pid(pid, Duration::from_millis(100)).await.is_err());
    }

    #[tokio::test]
    async fn stdio_lands_in_the_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("spawn.log");
        spawn_detached(
            "sh",
            &["-c".to_string(), "echo detached-output".to_string()],
            &log,
            &BTreeMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("detached-output"));
    }
}
