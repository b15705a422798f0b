use hookguard::config::{AppConfig, ChildConfig};
use hookguard::coordination::{read_pid, LockManager, ShutdownCoordinator, ShutdownSignal};
use hookguard::error::GuardError;
use hookguard::monitoring::{EvidenceVerdict, HealthStatus};
use hookguard::supervisor::{Supervisor, SupervisorEvent, SupervisorState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn child(name: &str, command: &str, args: &[&str]) -> ChildConfig {
    ChildConfig {
        name: name.to_string(),
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        cwd: None,
        env: Vec::new(),
    }
}

/// Two long-sleeping workers, fast restarts, periodic monitors off
fn test_config(repo: &Path) -> AppConfig {
    std::fs::write(repo.join("worker.js"), "// worker\n").unwrap();

    let mut config = AppConfig {
        repo_root: repo.to_path_buf(),
        children: vec![
            child("guard", "sleep", &["30"]),
            child("tokenMonitor", "sleep", &["30"]),
        ],
        ..AppConfig::default()
    };
    config.restart.debounce_ms = 200;
    config.restart.force_kill_ms = 2_000;
    config.restart.watch_targets = vec!["worker.js".into()];
    config.heartbeat.interval_ms = 100;
    config.heartbeat.max_age_ms = 0;
    config.git_tree.enabled = false;
    config.health.interval_ms = 0;
    config.evidence.poll_interval_ms = 0;
    config
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SupervisorEvent>, timeout: Duration, mut pred: F) -> Option<SupervisorEvent>
where
    F: FnMut(&SupervisorEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

fn pids(supervisor: &Supervisor) -> Vec<Option<u32>> {
    supervisor
        .children()
        .describe_all()
        .into_iter()
        .map(|(_, status)| status.pid)
        .collect()
}

#[tokio::test]
async fn start_and_shutdown_release_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let lock_dir = config.lock_dir();
    let pid_file = config.pid_file();
    let heartbeat_file = config.heartbeat_file();

    let supervisor = Supervisor::new(config, Arc::new(ShutdownCoordinator::new())).unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert!(supervisor.children().is_running("guard"));
    assert!(supervisor.children().is_running("tokenMonitor"));
    assert!(lock_dir.is_dir());
    assert_eq!(read_pid(&pid_file), Some(std::process::id() as i32));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let heartbeat: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&heartbeat_file).unwrap()).unwrap();
    assert_eq!(heartbeat["status"], "healthy");
    assert_eq!(heartbeat["guard"]["running"], true);

    assert!(supervisor.shutdown("test").await);
    assert!(!supervisor.shutdown("again").await);

    assert_eq!(supervisor.state(), SupervisorState::ShuttingDown);
    assert!(!supervisor.children().is_running("guard"));
    assert!(!supervisor.children().is_running("tokenMonitor"));
    assert!(!lock_dir.exists());
    assert!(!pid_file.exists());

    let completed = wait_for(&mut events, Duration::from_secs(1), |e| {
        matches!(e, SupervisorEvent::ShutdownCompleted { .. })
    })
    .await;
    assert_eq!(
        completed,
        Some(SupervisorEvent::ShutdownCompleted {
            reason: "test".to_string()
        })
    );
}

#[tokio::test]
async fn second_instance_exits_without_starting_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let holder = LockManager::new(config.lock_dir(), config.pid_file());
    assert!(holder.acquire());

    let supervisor = Supervisor::new(config, Arc::new(ShutdownCoordinator::new())).unwrap();
    let err = supervisor.run().await.unwrap_err();
    assert!(matches!(err, GuardError::AlreadyRunning(_)));
    assert!(!supervisor.children().is_running("guard"));

    // the foreign lock is untouched
    assert!(holder.lock_dir().is_dir());
    assert!(holder.release());
}

#[tokio::test]
async fn burst_of_triggers_restarts_once() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(test_config(dir.path()), Arc::new(ShutdownCoordinator::new())).unwrap();
    supervisor.start().await.unwrap();
    let before = pids(&supervisor);
    let mut events = supervisor.subscribe();

    let handle = supervisor.restart_handle();
    for i in 0..5 {
        assert!(handle.schedule(format!("burst-{}", i)));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let completed = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, SupervisorEvent::RestartCompleted { .. })
    })
    .await;
    match completed {
        Some(SupervisorEvent::RestartCompleted { reason }) => {
            assert!(reason.contains("burst-0"));
            assert!(reason.contains("burst-4"));
        }
        other => panic!("expected a restart, got {:?}", other),
    }

    // nothing else queued behind the burst
    let extra = wait_for(&mut events, Duration::from_millis(800), |e| {
        matches!(e, SupervisorEvent::RestartScheduled { .. })
    })
    .await;
    assert!(extra.is_none(), "unexpected second restart: {:?}", extra);

    let after = pids(&supervisor);
    assert!(after.iter().all(Option::is_some));
    assert_ne!(before, after);
    assert_eq!(supervisor.state(), SupervisorState::Running);

    supervisor.shutdown("test").await;
}

#[tokio::test]
async fn crashed_worker_is_restarted_with_exit_reason() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.children = vec![
        child("guard", "sleep", &["30"]),
        // crashes on its first run only
        child(
            "crasher",
            "sh",
            &["-c", "if [ -e crashed.flag ]; then exec sleep 30; fi; touch crashed.flag; sleep 0.2; exit 3"],
        ),
    ];
    let supervisor = Supervisor::new(config, Arc::new(ShutdownCoordinator::new())).unwrap();
    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();

    let exited = wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SupervisorEvent::ChildExited { name, .. } if name == "crasher")
    })
    .await;
    assert_eq!(
        exited,
        Some(SupervisorEvent::ChildExited {
            name: "crasher".to_string(),
            code: Some(3),
            signal: None,
        })
    );

    let restarted = wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SupervisorEvent::RestartCompleted { .. })
    })
    .await;
    match restarted {
        Some(SupervisorEvent::RestartCompleted { reason }) => assert_eq!(reason, "crasher-exit:3:null"),
        other => panic!("expected a restart, got {:?}", other),
    }

    // one crash, one restart
    let extra = wait_for(&mut events, Duration::from_millis(1_000), |e| {
        matches!(e, SupervisorEvent::RestartScheduled { .. })
    })
    .await;
    assert!(extra.is_none(), "unexpected second restart: {:?}", extra);
    assert!(supervisor.children().is_running("crasher"));

    supervisor.shutdown("test").await;
    assert!(!supervisor.children().is_running("guard"));
}

#[tokio::test]
async fn watched_file_change_schedules_restart() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(test_config(dir.path()), Arc::new(ShutdownCoordinator::new())).unwrap();
    supervisor.start().await.unwrap();
    let mut events = supervisor.subscribe();

    // give the watcher a moment to register
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(dir.path().join("worker.js"), "// edited\n").unwrap();

    let scheduled = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, SupervisorEvent::RestartScheduled { .. })
    })
    .await;
    match scheduled {
        Some(SupervisorEvent::RestartScheduled { reason }) => assert!(reason.starts_with("worker.js:")),
        other => panic!("expected a scheduled restart, got {:?}", other),
    }

    supervisor.shutdown("test").await;
}

#[tokio::test]
async fn run_returns_after_shutdown_request() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let lock_dir = config.lock_dir();
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let supervisor = Supervisor::new(config, coordinator.clone()).unwrap();

    let mut state = supervisor.subscribe_state();
    let runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    };
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == SupervisorState::Running))
        .await
        .unwrap()
        .unwrap();

    assert!(coordinator.request(ShutdownSignal::Terminate));
    tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(supervisor.is_shutting_down());
    assert!(!lock_dir.exists());
    assert!(!supervisor.children().is_running("guard"));
}

#[tokio::test]
async fn failing_health_checks_leave_workers_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // no evidence file and no git repository: the startup collection reports an error
    config.health.interval_ms = 60_000;
    let supervisor = Supervisor::new(config, Arc::new(ShutdownCoordinator::new())).unwrap();
    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();
    let before = pids(&supervisor);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let snapshot = loop {
        if let Some(snapshot) = supervisor.health().latest() {
            break snapshot;
        }
        assert!(tokio::time::Instant::now() < deadline, "no health snapshot collected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(snapshot.status, HealthStatus::Error);

    let restart = wait_for(&mut events, Duration::from_millis(1_000), |e| {
        matches!(e, SupervisorEvent::RestartScheduled { .. })
    })
    .await;
    assert!(restart.is_none(), "health error restarted workers: {:?}", restart);
    assert_eq!(pids(&supervisor), before);
    assert_eq!(supervisor.recovery().attempts("health"), 0);

    supervisor.shutdown("test").await;
}

#[tokio::test]
async fn repository_edits_hold_back_stale_evidence_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let stale = chrono::Utc::now() - chrono::Duration::minutes(10);
    std::fs::write(
        config.evidence_file(),
        serde_json::json!({ "timestamp": stale.to_rfc3339() }).to_string(),
    )
    .unwrap();

    let supervisor = Supervisor::new(config, Arc::new(ShutdownCoordinator::new())).unwrap();
    supervisor.start().await.unwrap();

    // heartbeat and health files keep changing under .audit_tmp; that is not the user
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        supervisor.evidence().evaluate("test", true).await,
        EvidenceVerdict::Stale { .. }
    ));

    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/lib.rs"), "pub fn edited() {}\n").unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match supervisor.evidence().evaluate("test", true).await {
            EvidenceVerdict::Suppressed { .. } => break,
            other => {
                assert!(tokio::time::Instant::now() < deadline, "edit never counted as activity: {:?}", other);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    supervisor.shutdown("test").await;
}
