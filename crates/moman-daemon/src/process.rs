//! Spawned worker processes and the interpreter probe.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tracing::debug;

/// A worker child owned by the supervisor. Output is discarded; the
/// worker reports through its control socket, not stdio.
pub struct WorkerProcess {
    pub class_name: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    child: Child,
}

impl WorkerProcess {
    /// Launches `script` under `interpreter` with the worker's socket
    /// directory passed along, stdio silenced.
    pub fn spawn(
        interpreter: &Path,
        script: &Path,
        class_name: &str,
        args: &[String],
    ) -> io::Result<Self> {
        let child = Command::new(interpreter)
            .arg(script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        debug!(event = "worker_spawned", class = class_name, pid);
        Ok(Self {
            class_name: class_name.to_string(),
            pid,
            started_at: Utc::now(),
            child,
        })
    }

    /// Non-blocking exit check. `Some(code)` means the process has
    /// exited; signal terminations report as `None` inside the JSON.
    pub fn try_exit_code(&mut self) -> io::Result<Option<Option<i32>>> {
        Ok(self.child.try_wait()?.map(|status| status.code()))
    }

    pub fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    pub fn status_json(&self) -> Value {
        json!({
            "Started at": self.started_at.timestamp(),
            "PID": self.pid,
        })
    }
}

/// Probes the environment for a Python 3 interpreter, trying `python`
/// before `python3` and inspecting the version banner. Older pythons
/// print the banner on stderr.
pub async fn find_python() -> Option<PathBuf> {
    for candidate in ["python", "python3"] {
        let output = match Command::new(candidate).arg("--version").output().await {
            Ok(output) => output,
            Err(_) => continue,
        };
        let banner = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        if banner.starts_with("Python 3") {
            return Some(PathBuf::from(candidate));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_reap_short_lived_child() {
        let mut proc = WorkerProcess::spawn(Path::new("/bin/sh"), Path::new("-c"), "Short", &[
            "exit 7".to_string(),
        ])
        .unwrap();
        assert!(proc.pid.is_some());
        // Give the shell a moment to run and exit.
        let mut exit = None;
        for _ in 0..50 {
            if let Some(code) = proc.try_exit_code().unwrap() {
                exit = Some(code);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(exit, Some(Some(7)));
    }

    #[tokio::test]
    async fn kill_terminates_a_sleeper() {
        let mut proc = WorkerProcess::spawn(Path::new("/bin/sh"), Path::new("-c"), "Sleeper", &[
            "sleep 30".to_string(),
        ])
        .unwrap();
        assert!(proc.try_exit_code().unwrap().is_none());
        proc.kill().unwrap();
        let mut exited = false;
        for _ in 0..50 {
            if proc.try_exit_code().unwrap().is_some() {
                exited = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(exited);
    }
}
