//! Process supervisor
//!
//! Runs the sync daemon and the web server as two child processes:
//! 1. Start the daemon
//! 2. Wait the startup delay so the daemon can initialize
//! 3. Start the web server
//! 4. Block until either child exits or a termination signal arrives
//! 5. SIGTERM whatever is still running, SIGKILL it after the grace period
//!
//! There is no restart-on-crash; the child that ended the run is reported in
//! the `Outcome` so callers can tell a clean exit from a crash.

pub mod child;

use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{error, info};

use crate::config::SupervisorConfig;

pub use child::{exit_code, ChildSpec};
use child::RunningChild;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Command for {0} is empty")]
    EmptyCommand(String),

    #[error("Failed to start {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to wait for {name}: {source}")]
    Wait {
        name: String,
        source: std::io::Error,
    },
}

/// Why the supervisor stopped
#[derive(Debug)]
pub enum Outcome {
    /// Termination signal received and forwarded
    Signalled(&'static str),
    /// A child exited on its own
    ChildExited { name: String, status: ExitStatus },
}

impl Outcome {
    /// Process exit code: 0 after a signal, otherwise the child's own code
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Signalled(_) => 0,
            Outcome::ChildExited { status, .. } => exit_code(status),
        }
    }
}

pub struct Supervisor {
    daemon: ChildSpec,
    web: ChildSpec,
    startup_delay: Duration,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub fn new(daemon: ChildSpec, web: ChildSpec, config: &SupervisorConfig) -> Self {
        Self {
            daemon,
            web,
            startup_delay: Duration::from_secs(config.startup_delay_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    pub fn with_timing(mut self, startup_delay: Duration, shutdown_grace: Duration) -> Self {
        self.startup_delay = startup_delay;
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Supervise until a child exits or `shutdown` resolves with the name of
    /// the signal received
    pub async fn run<F>(&self, shutdown: F) -> Result<Outcome, SupervisorError>
    where
        F: Future<Output = &'static str>,
    {
        tokio::pin!(shutdown);

        let mut daemon = self.daemon.spawn()?;

        tokio::select! {
            _ = tokio::time::sleep(self.startup_delay) => {}
            status = daemon.wait() => {
                let outcome = exited(&daemon, status)?;
                error!(child = %daemon.name, "Child exited before startup completed");
                return Ok(outcome);
            }
            signal = &mut shutdown => {
                info!(signal, "Shutdown requested during startup");
                self.stop(vec![daemon]).await;
                return Ok(Outcome::Signalled(signal));
            }
        }

        let mut web = match self.web.spawn() {
            Ok(web) => web,
            Err(e) => {
                self.stop(vec![daemon]).await;
                return Err(e);
            }
        };
        info!(daemon_pid = daemon.pid, web_pid = web.pid, "Supervisor running");

        let (outcome, survivors) = tokio::select! {
            status = daemon.wait() => (exited(&daemon, status), vec![web]),
            status = web.wait() => (exited(&web, status), vec![daemon]),
            signal = &mut shutdown => {
                info!(signal, "Forwarding termination signal to children");
                (Ok(Outcome::Signalled(signal)), vec![daemon, web])
            }
        };

        if let Ok(Outcome::ChildExited { name, status }) = &outcome {
            info!(child = %name, %status, "Child exited, stopping the rest");
        }

        self.stop(survivors).await;
        outcome
    }

    async fn stop(&self, children: Vec<RunningChild>) {
        let grace = self.shutdown_grace;
        futures::future::join_all(children.into_iter().map(|c| c.terminate(grace))).await;
    }
}

fn exited(child: &RunningChild, status: std::io::Result<ExitStatus>) -> Result<Outcome, SupervisorError> {
    let status = status.map_err(|source| SupervisorError::Wait {
        name: child.name.clone(),
        source,
    })?;
    Ok(Outcome::ChildExited {
        name: child.name.clone(),
        status,
    })
}

/// SIGTERM and SIGINT listeners.
///
/// The handlers are registered by `install`, so a signal that arrives before
/// `recv` is first polled is still seen. Install before starting children.
pub struct ShutdownSignals {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
    #[cfg(unix)]
    int: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Must be called inside a tokio runtime
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            Ok(Self {
                term: signal(SignalKind::terminate())?,
                int: signal(SignalKind::interrupt())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolves with the name of the first signal received
    #[cfg_attr(not(unix), allow(unused_mut))]
    pub async fn recv(mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.term.recv() => "SIGTERM",
                _ = self.int.recv() => "SIGINT",
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}
