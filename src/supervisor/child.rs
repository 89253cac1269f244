//! A supervised child process

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::SupervisorError;

/// What to run for one child
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl ChildSpec {
    /// From a command line where the first element is the program
    pub fn from_command(name: &str, command: &[String]) -> Result<Self, SupervisorError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SupervisorError::EmptyCommand(name.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub(crate) fn spawn(&self) -> Result<RunningChild, SupervisorError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        let pid = child.id();
        info!(child = %self.name, pid, program = %self.program, "Started child");
        Ok(RunningChild {
            name: self.name.clone(),
            pid,
            child,
        })
    }
}

pub(crate) struct RunningChild {
    pub name: String,
    pub pid: Option<u32>,
    child: Child,
}

impl RunningChild {
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Best effort SIGTERM; a process that is already gone is not an error
    fn send_terminate(&self) {
        let Some(pid) = self.pid else {
            debug!(child = %self.name, "No pid to signal");
            return;
        };

        #[cfg(unix)]
        {
            // SAFETY: plain kill(2) on a pid we spawned
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                info!(child = %self.name, pid, "Sent SIGTERM");
            } else {
                debug!(child = %self.name, pid, error = %std::io::Error::last_os_error(), "SIGTERM not delivered");
            }
        }

        #[cfg(not(unix))]
        {
            debug!(child = %self.name, pid, "No SIGTERM on this platform, will kill after grace period");
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn terminate(mut self, grace: Duration) -> Option<ExitStatus> {
        self.send_terminate();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(child = %self.name, %status, "Child exited");
                Some(status)
            }
            Ok(Err(e)) => {
                debug!(child = %self.name, error = %e, "Could not wait for child");
                None
            }
            Err(_) => {
                warn!(child = %self.name, grace_ms = grace.as_millis() as u64, "Child ignored SIGTERM, killing");
                if let Err(e) = self.child.start_kill() {
                    debug!(child = %self.name, error = %e, "Kill failed");
                }
                self.child.wait().await.ok()
            }
        }
    }
}

/// Conventional shell exit code for a child status
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
