//! Shutdown signal delivery
//!
//! Signals are raised at this test process itself, so these tests live in
//! their own binary.
#![cfg(unix)]

use std::time::Duration;

use abs_kosync::config::SupervisorConfig;
use abs_kosync::supervisor::{ChildSpec, Outcome, ShutdownSignals, Supervisor};

fn raise_sigterm() {
    unsafe {
        libc::kill(libc::getpid(), libc::SIGTERM);
    }
}

#[tokio::test]
async fn test_signal_before_first_recv_is_kept() {
    let signals = ShutdownSignals::install().unwrap();
    raise_sigterm();

    let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("signal was lost");
    assert_eq!(name, "SIGTERM");
}

#[tokio::test]
async fn test_supervisor_sees_signal_sent_before_it_runs() {
    let child = |name: &str| ChildSpec {
        name: name.to_string(),
        program: "sh".to_string(),
        args: vec!["-c".to_string(), "sleep 30".to_string()],
    };
    let supervisor = Supervisor::new(child("daemon"), child("web"), &SupervisorConfig::default())
        .with_timing(Duration::from_secs(30), Duration::from_secs(1));

    let signals = ShutdownSignals::install().unwrap();
    raise_sigterm();

    let outcome = tokio::time::timeout(Duration::from_secs(10), supervisor.run(signals.recv()))
        .await
        .expect("supervisor ignored the signal")
        .unwrap();
    assert!(matches!(outcome, Outcome::Signalled("SIGTERM")));
}
