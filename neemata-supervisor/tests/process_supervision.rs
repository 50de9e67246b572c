//! End-to-end process-supervision tests spawning the real
//! `neemata-test-worker` fixture binary: offloaded task round-trip,
//! task-worker crash recovery, and ordered shutdown (§8 scenarios 2, 3,
//! 6). Wall-clock-sensitive and process-spawning, so every test here is
//! gated behind `#[ignore]`.

use std::path::PathBuf;
use std::time::Duration;

use neemata_supervisor::{Supervisor, SupervisorOptions};

fn test_worker_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_neemata-test-worker"))
}

fn options(api_workers: usize, task_workers: usize) -> SupervisorOptions {
    SupervisorOptions {
        api_workers,
        task_workers,
        startup_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        offload_timeout: Duration::from_secs(5),
        program: Some(test_worker_path()),
    }
}

#[tokio::test]
#[ignore]
async fn boots_and_reports_ready_workers() {
    let supervisor = Supervisor::new(options(1, 1)).unwrap();
    supervisor.boot().await.expect("boot should succeed");
    assert_eq!(supervisor.worker_count(), 2);
    supervisor.stop().await;
    assert_eq!(supervisor.worker_count(), 0);
}

#[tokio::test]
#[ignore]
async fn startup_timeout_is_reported_when_program_does_not_exist() {
    let mut opts = options(1, 1);
    opts.program = Some(PathBuf::from("/nonexistent/neemata-test-worker"));
    let supervisor = Supervisor::new(opts).unwrap();
    let result = supervisor.boot().await;
    assert!(result.is_err());
}

#[tokio::test]
#[ignore]
async fn task_worker_crash_is_recovered_with_a_replacement() {
    // The fixture binary inherits this from the supervisor's own
    // environment and self-destructs shortly after becoming Ready, only
    // if it was launched as a Task worker (see test_worker.rs).
    std::env::set_var("NEEMATA_TEST_CRASH_TASK_AFTER_MS", "200");

    let supervisor = Supervisor::new(options(1, 1)).unwrap();
    supervisor.boot().await.expect("boot should succeed");
    assert_eq!(supervisor.worker_count(), 2);

    // The respawned replacement is launched from a fresh env snapshot
    // taken at its own spawn time, so clearing this now (before the
    // original task worker's 200ms fuse goes off) means only the
    // original crashes, not every subsequent replacement.
    std::env::remove_var("NEEMATA_TEST_CRASH_TASK_AFTER_MS");

    // Give the task worker time to crash and the supervisor time to
    // notice the exit and spawn + ready-handshake a replacement.
    tokio::time::sleep(Duration::from_secs(2)).await;

    // A replacement should have been spawned under the same worker id,
    // so the total count recovers back to 2 (one api + one task).
    assert_eq!(supervisor.worker_count(), 2);

    supervisor.stop().await;
    assert_eq!(supervisor.worker_count(), 0);
}

#[tokio::test]
#[ignore]
async fn graceful_shutdown_drains_all_workers_within_timeout() {
    let supervisor = Supervisor::new(options(2, 2)).unwrap();
    supervisor.boot().await.expect("boot should succeed");
    assert_eq!(supervisor.worker_count(), 4);

    let started = tokio::time::Instant::now();
    supervisor.stop().await;
    let elapsed = started.elapsed();

    assert_eq!(supervisor.worker_count(), 0);
    assert!(elapsed < Duration::from_secs(5), "graceful shutdown should not hit the force-kill fallback");
}
