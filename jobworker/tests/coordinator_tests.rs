use jobworker::{
    Config, IsolationMode, JobCoordinator, JobError, JobId, JobState, JobStatus, LogEvent,
    ResourceLimits,
};
use std::time::Duration;
use tokio_stream::StreamExt;

fn coordinator(config: Config) -> JobCoordinator {
    JobCoordinator::new(config.with_isolation_mode(IsolationMode::Unconfined))
        .expect("coordinator")
}

fn alice() -> String {
    "alice".to_string()
}

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

async fn wait_terminal(coordinator: &JobCoordinator, job_id: JobId) -> JobStatus {
    for _ in 0..400 {
        let status = coordinator
            .get_job_status(&alice(), job_id)
            .expect("status");
        if status.state.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} never terminated", job_id);
}

async fn collect_events(coordinator: &JobCoordinator, job_id: JobId) -> Vec<LogEvent> {
    coordinator
        .stream_output(&alice(), job_id)
        .expect("stream")
        .into_stream()
        .collect::<Vec<_>>()
        .await
}

fn data_of(events: &[LogEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            LogEvent::Data(blob) => Some(&blob[..]),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

fn terminal_count(events: &[LogEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, LogEvent::Terminal))
        .count()
}

#[tokio::test]
async fn logs_after_exit_replay_everything_then_one_terminal() {
    let coordinator = coordinator(Config::default());
    let job_id = coordinator
        .start_job(&alice(), "echo".into(), vec!["hello".into()])
        .await
        .expect("start");
    let status = wait_terminal(&coordinator, job_id).await;
    assert_eq!(status.state, JobState::Exited);
    assert_eq!(status.exit_code, Some(0));

    let events = collect_events(&coordinator, job_id).await;
    assert_eq!(data_of(&events), b"hello\n");
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(events.last(), Some(&LogEvent::Terminal));
}

#[tokio::test]
async fn stdout_and_stderr_are_merged() {
    let coordinator = coordinator(Config::default());
    let job_id = coordinator
        .start_job(&alice(), "sh".into(), sh("echo out; echo err >&2"))
        .await
        .expect("start");
    wait_terminal(&coordinator, job_id).await;
    let text = String::from_utf8(data_of(&collect_events(&coordinator, job_id).await))
        .expect("utf8");
    assert!(text.contains("out\n"));
    assert!(text.contains("err\n"));
}

#[tokio::test]
async fn late_subscriber_sees_the_same_output() {
    let coordinator = coordinator(Config::default());
    let job_id = coordinator
        .start_job(
            &alice(),
            "sh".into(),
            sh("for i in 1 2 3 4 5 6; do echo line $i; sleep 1; done"),
        )
        .await
        .expect("start");

    let early = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { collect_events(&coordinator, job_id).await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    let late = collect_events(&coordinator, job_id).await;
    let early = early.await.expect("early subscriber");

    let expected: String = (1..=6).map(|i| format!("line {}\n", i)).collect();
    assert_eq!(data_of(&early), expected.as_bytes());
    assert_eq!(data_of(&late), expected.as_bytes());
    assert_eq!(terminal_count(&early), 1);
    assert_eq!(terminal_count(&late), 1);
}

#[tokio::test]
async fn only_the_owner_can_stop() {
    let coordinator = coordinator(Config::default());
    let job_id = coordinator
        .start_job(&alice(), "sleep".into(), vec!["30".into()])
        .await
        .expect("start");

    let denied = coordinator.stop_job(&"mallory".to_string(), job_id).await;
    assert!(matches!(denied, Err(JobError::PermissionDenied)));
    assert_eq!(
        coordinator.get_job_status(&alice(), job_id).expect("status").state,
        JobState::Running
    );

    coordinator.stop_job(&alice(), job_id).await.expect("stop");
    let status = wait_terminal(&coordinator, job_id).await;
    assert_eq!(status.state, JobState::Stopped);
    assert!(status.terminated_at.is_some());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let coordinator = coordinator(Config::default());
    let job_id = coordinator
        .start_job(&alice(), "sh".into(), sh("sleep 30 & sleep 30"))
        .await
        .expect("start");

    coordinator.stop_job(&alice(), job_id).await.expect("first stop");
    coordinator.stop_job(&alice(), job_id).await.expect("second stop");
    let first = wait_terminal(&coordinator, job_id).await;
    coordinator.stop_job(&alice(), job_id).await.expect("stop after terminal");
    let second = coordinator.get_job_status(&alice(), job_id).expect("status");

    assert_eq!(first.state, JobState::Stopped);
    assert_eq!(second.state, JobState::Stopped);
    assert_eq!(first.terminated_at, second.terminated_at);
    assert_eq!(terminal_count(&collect_events(&coordinator, job_id).await), 1);
}

#[tokio::test]
async fn output_held_open_by_an_escaped_process_does_not_block_stop() {
    let coordinator =
        coordinator(Config::default().with_output_drain_timeout(Duration::from_millis(500)));
    let job_id = coordinator
        .start_job(&alice(), "sh".into(), sh("setsid sleep 10 & echo started"))
        .await
        .expect("start");
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(3), coordinator.stop_job(&alice(), job_id))
        .await
        .expect("stop_job returned")
        .expect("stop");
    let status = wait_terminal(&coordinator, job_id).await;
    assert_eq!(status.state, JobState::Exited);
    let events = collect_events(&coordinator, job_id).await;
    assert_eq!(data_of(&events), b"started\n");
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn slow_reader_gets_one_gap_then_retained_output() {
    let coordinator = coordinator(Config::default().with_output_buffer_capacity(64));
    let job_id = coordinator
        .start_job(
            &alice(),
            "sh".into(),
            sh("i=0; while [ $i -lt 100 ]; do printf 0123456789; i=$((i+1)); done"),
        )
        .await
        .expect("start");
    wait_terminal(&coordinator, job_id).await;

    let events = collect_events(&coordinator, job_id).await;
    let gaps: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            LogEvent::Gap { missed } => Some(*missed),
            _ => None,
        })
        .collect();
    assert_eq!(gaps, vec![936]);
    assert!(matches!(events.first(), Some(LogEvent::Gap { .. })));

    let retained = data_of(&events);
    assert_eq!(retained.len(), 64);
    // 936 is a multiple of 10 plus 6, so the window starts at '6'
    assert_eq!(&retained[..10], b"6789012345");
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn state_sequence_only_moves_forward() {
    let coordinator = coordinator(Config::default());
    let job_id = coordinator
        .start_job(&alice(), "sleep".into(), vec!["0.3".into()])
        .await
        .expect("start");

    let mut seen = vec![];
    loop {
        let state = coordinator
            .get_job_status(&alice(), job_id)
            .expect("status")
            .state;
        if seen.last() != Some(&state) {
            seen.push(state);
        }
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for pair in seen.windows(2) {
        assert!(
            pair[0].can_advance_to(pair[1]),
            "illegal transition {} -> {}",
            pair[0],
            pair[1]
        );
    }
    assert_eq!(seen.last(), Some(&JobState::Exited));
}

#[tokio::test]
async fn jobs_are_listed_per_owner() {
    let coordinator = coordinator(Config::default());
    let mine = coordinator
        .start_job(&alice(), "true".into(), vec![])
        .await
        .expect("start");
    coordinator
        .start_job(&"bob".to_string(), "true".into(), vec![])
        .await
        .expect("start");

    let listed: Vec<JobId> = coordinator.list_jobs(&alice()).map(|s| s.job_id).collect();
    assert_eq!(listed, vec![mine]);
}

/// Needs root on a cgroup v2 host.
#[tokio::test]
#[ignore]
async fn memory_ceiling_kills_before_user_visible_work() {
    let coordinator = JobCoordinator::new(
        Config::default()
            .with_isolation_mode(IsolationMode::Cgroup)
            .strict(true),
    )
    .expect("cgroup coordinator");
    let limits = ResourceLimits::default().with_memory_max(8 * 1024 * 1024);
    let job_id = coordinator
        .start_job_with_limits(
            &alice(),
            "sh".into(),
            sh("x=$(head -c 67108864 /dev/zero | tr '\\0' a); echo done"),
            limits,
        )
        .await
        .expect("start");

    let status = wait_terminal(&coordinator, job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failure.as_deref(), Some("out of memory"));
    let output = data_of(&collect_events(&coordinator, job_id).await);
    assert!(!String::from_utf8_lossy(&output).contains("done"));
}
