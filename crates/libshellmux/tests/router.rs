mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness, harness_with, next_close, next_event, next_output, settle};
use libshellmux::config::{FlowConfig, MuxConfig};
use libshellmux::{ChannelSink, LocalSessionOptions, RemoteSessionOptions, SessionError};
use shellmux_protocol::{CloseReason, Event, PortForward, SessionKind};
use zeroize::Zeroizing;

fn remote(session_id: &str, password: Option<&str>) -> RemoteSessionOptions {
    RemoteSessionOptions {
        session_id: session_id.to_string(),
        host: "example.org".to_string(),
        port: 22,
        username: "alice".to_string(),
        password: password.map(|p| Zeroizing::new(p.to_string())),
        private_key_path: None,
        port_forwards: vec![PortForward {
            local_port: 8080,
            remote_host: "localhost".to_string(),
            remote_port: 80,
            bind_address: None,
        }],
        cols: 120,
        rows: 40,
    }
}

fn local(session_id: &str, dir: Option<&str>) -> LocalSessionOptions {
    LocalSessionOptions {
        session_id: session_id.to_string(),
        initial_directory: dir.map(str::to_string),
        cols: 80,
        rows: 24,
    }
}

#[tokio::test(start_paused = true)]
async fn password_is_sent_once_and_prompt_is_not_forwarded() {
    let mut h = harness();
    let router = h.router.clone();
    let create =
        tokio::spawn(async move { router.create_remote_session(remote("r1", Some("hunter2"))).await });

    let process = h.spawner.spawned(0).await;
    assert_eq!(process.request.program, "ssh");
    assert_eq!(process.request.cols, 120);
    assert_eq!(
        process.request.args,
        vec!["-p", "22", "-L", "8080:localhost:80", "alice@example.org"]
    );

    process.output("alice@example.org's password: ");
    process.output("Last login: Mon Oct 19 09:12:01 2026\r\nalice@host:~$ ");
    create.await.unwrap().unwrap();

    assert_eq!(process.written(), b"hunter2\n");
    let text = next_output(&mut h.events).await;
    assert!(!text.contains("password"), "prompt leaked: {text:?}");
    assert!(text.ends_with("alice@host:~$ "));
    assert!(h.router.registry().contains("r1"));
}

#[tokio::test(start_paused = true)]
async fn prompt_split_across_reads_is_not_forwarded() {
    let mut h = harness();
    let router = h.router.clone();
    let create =
        tokio::spawn(async move { router.create_remote_session(remote("r1", Some("hunter2"))).await });

    let process = h.spawner.spawned(0).await;
    process.output("Warning: Permanently added 'example.org' to known hosts.\r\nalice@example.org's pass");
    tokio::time::sleep(Duration::from_millis(50)).await;
    process.output("word: ");
    process.output("alice@host:~$ ");
    create.await.unwrap().unwrap();
    assert_eq!(process.written(), b"hunter2\n");

    let mut text = String::new();
    while !text.ends_with("alice@host:~$ ") {
        text.push_str(&next_output(&mut h.events).await);
    }
    assert!(text.starts_with("Warning: Permanently added"));
    assert!(!text.contains("pass"), "prompt leaked: {text:?}");
}

#[tokio::test(start_paused = true)]
async fn auth_failure_rejects_creation_and_closes() {
    let mut h = harness();
    let router = h.router.clone();
    let create = tokio::spawn(async move { router.create_remote_session(remote("r1", None)).await });

    let process = h.spawner.spawned(0).await;
    process.output("alice@example.org: Permission denied (publickey,password).\r\n");

    let err = create.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::AuthenticationFailed(ref id) if id == "r1"));
    assert!(process.was_killed());

    let (reason, _) = next_close(&mut h.events, "r1").await;
    assert_eq!(reason, CloseReason::Auth);
    assert!(!h.router.registry().contains("r1"));
}

#[tokio::test(start_paused = true)]
async fn permission_denied_after_login_keeps_session() {
    let mut h = harness();
    let router = h.router.clone();
    let create = tokio::spawn(async move { router.create_remote_session(remote("r1", None)).await });

    let process = h.spawner.spawned(0).await;
    process.output("alice@host:~$ ");
    create.await.unwrap().unwrap();
    next_output(&mut h.events).await;

    process.output("rm: cannot remove 'x': Permission denied\r\nalice@host:~$ ");
    let text = next_output(&mut h.events).await;
    assert!(text.contains("Permission denied"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!process.was_killed());
    assert!(h.router.registry().contains("r1"));
}

#[tokio::test(start_paused = true)]
async fn connection_timeout() {
    let mut h = harness();
    let router = h.router.clone();
    let started = tokio::time::Instant::now();
    let create = tokio::spawn(async move { router.create_remote_session(remote("r1", None)).await });

    let process = h.spawner.spawned(0).await;
    let err = create.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConnectionTimeout {
            timeout_secs: 20,
            ..
        }
    ));
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(process.was_killed());

    let (reason, _) = next_close(&mut h.events, "r1").await;
    assert_eq!(reason, CloseReason::Timeout);
}

#[tokio::test(start_paused = true)]
async fn early_exit_is_unexpected_and_classified_as_network() {
    let mut h = harness();
    let router = h.router.clone();
    let create = tokio::spawn(async move { router.create_remote_session(remote("r1", None)).await });

    let process = h.spawner.spawned(0).await;
    process.output("ssh: connect to host example.org port 22: Connection refused\r\n");
    process.exit(Some(255));

    let err = create.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::UnexpectedExit {
            exit_code: Some(255),
            ..
        }
    ));

    let text = next_output(&mut h.events).await;
    assert!(text.contains("Connection refused"));
    let (reason, exit_code) = next_close(&mut h.events, "r1").await;
    assert_eq!(reason, CloseReason::Network);
    assert_eq!(exit_code, Some(255));
}

#[tokio::test(start_paused = true)]
async fn established_session_exit_with_other_code_is_unknown() {
    let mut h = harness();
    let router = h.router.clone();
    let create = tokio::spawn(async move { router.create_remote_session(remote("r1", None)).await });

    let process = h.spawner.spawned(0).await;
    process.output("Welcome to example.org\r\n");
    create.await.unwrap().unwrap();
    process.exit(Some(0));

    let (reason, exit_code) = next_close(&mut h.events, "r1").await;
    assert_eq!(reason, CloseReason::Unknown);
    assert_eq!(exit_code, Some(0));
}

#[tokio::test(start_paused = true)]
async fn closing_while_connecting_rejects_as_closed() {
    let mut h = harness();
    let router = h.router.clone();
    let create = tokio::spawn(async move { router.create_remote_session(remote("r1", None)).await });

    h.spawner.spawned(0).await;
    h.router.close_session("r1", true).unwrap();

    let err = create.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::SessionClosed(_)));
    let (reason, _) = next_close(&mut h.events, "r1").await;
    assert_eq!(reason, CloseReason::User);
}

#[tokio::test(start_paused = true)]
async fn spawn_failure_never_registers() {
    let h = harness();
    h.spawner.fail_next();
    let err = h
        .router
        .create_remote_session(remote("r1", None))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Spawn(_)));
    assert!(h.router.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn local_session_tracks_directory_changes() {
    let h = harness();
    let projects = h.home.join("projects");
    std::fs::create_dir_all(projects.join("app")).unwrap();

    let dir = h
        .router
        .create_local_session(local("l1", Some("projects")))
        .await
        .unwrap();
    assert_eq!(dir, projects);

    let process = h.spawner.spawned(0).await;
    assert_eq!(process.request.cwd.as_deref(), Some(projects.as_path()));

    h.router.send_input("l1", b"cd ap".to_vec()).unwrap();
    h.router.send_input("l1", b"p\r".to_vec()).unwrap();
    assert_eq!(
        h.router.current_directory("l1").await.unwrap(),
        Some(projects.join("app"))
    );

    h.router.send_input("l1", b"cd /definitely/missing\r".to_vec()).unwrap();
    h.router.send_input("l1", b"pushd ~\r".to_vec()).unwrap();
    assert_eq!(h.router.current_directory("l1").await.unwrap(), Some(h.home.clone()));

    h.router.send_input("l1", b"popd\rpopd\r".to_vec()).unwrap();
    assert_eq!(
        h.router.current_directory("l1").await.unwrap(),
        Some(projects.join("app"))
    );

    // The process sees exactly what was typed.
    assert_eq!(
        process.written(),
        b"cd app\rcd /definitely/missing\rpushd ~\rpopd\rpopd\r"
    );
}

#[tokio::test(start_paused = true)]
async fn remote_sessions_report_no_directory() {
    let h = harness();
    let router = h.router.clone();
    let create = tokio::spawn(async move { router.create_remote_session(remote("r1", None)).await });
    h.spawner.spawned(0).await.output("alice@host:~$ ");
    create.await.unwrap().unwrap();

    assert_eq!(h.router.current_directory("r1").await.unwrap(), None);
    assert!(matches!(
        h.router.current_directory("nope").await,
        Err(SessionError::SessionNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn close_flushes_pending_output_exactly_once() {
    let mut h = harness();
    h.router.create_local_session(local("l1", None)).await.unwrap();
    let process = h.spawner.spawned(0).await;

    process.output("partial ");
    process.output("line");
    settle().await;
    assert!(h.events.try_recv().is_err(), "flushed before the timer");

    h.router.close_session("l1", true).unwrap();
    assert_eq!(next_output(&mut h.events).await, "partial line");
    match next_event(&mut h.events).await {
        Event::SessionClosed { reason, .. } => assert_eq!(reason, CloseReason::User),
        other => panic!("expected close, got {other:?}"),
    }
    assert!(process.was_killed());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.events.try_recv().is_err());
    assert!(h.router.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn output_batches_are_coalesced() {
    let mut h = harness();
    h.router.create_local_session(local("l1", None)).await.unwrap();
    let process = h.spawner.spawned(0).await;

    for chunk in ["a", "b", "c", "d"] {
        process.output(chunk);
    }
    assert_eq!(next_output(&mut h.events).await, "abcd");
}

#[tokio::test(start_paused = true)]
async fn recreate_replaces_previous_session() {
    let mut h = harness();
    h.router.create_local_session(local("l1", None)).await.unwrap();
    let first = h.spawner.spawned(0).await;

    h.router.create_local_session(local("l1", None)).await.unwrap();
    let second = h.spawner.spawned(1).await;
    assert!(first.was_killed());
    assert!(!second.was_killed());

    let (reason, _) = next_close(&mut h.events, "l1").await;
    assert_eq!(reason, CloseReason::User);
    assert_eq!(h.router.registry().ids(), vec!["l1".to_string()]);

    h.router.send_input("l1", b"ls\r".to_vec()).unwrap();
    h.router.resize("l1", 132, 50).unwrap();
    settle().await;
    assert_eq!(second.written(), b"ls\r");
    assert_eq!(second.resizes(), vec![(132, 50)]);
    assert!(first.written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_replacement_does_not_delay_other_sessions() {
    let mut h = harness();
    h.spawner.linger_on_kill();
    h.router.create_local_session(local("a", None)).await.unwrap();

    let router = h.router.clone();
    let replace = tokio::spawn(async move { router.create_local_session(local("a", None)).await });
    settle().await;
    assert_eq!(h.spawner.count(), 1, "replacement still waiting on the old process");

    let started = tokio::time::Instant::now();
    h.router.create_local_session(local("b", None)).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(h.router.registry().contains("b"));

    // The old "a" is only torn down once its close grace expires.
    replace.await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_secs(3));
    let (reason, _) = next_close(&mut h.events, "a").await;
    assert_eq!(reason, CloseReason::User);
}

#[tokio::test(start_paused = true)]
async fn flow_control_pauses_and_resumes() {
    let config = MuxConfig {
        flow: FlowConfig {
            high_water_bytes: 1_000,
            low_water_bytes: 100,
        },
        ..MuxConfig::default()
    };
    let mut h = harness_with(config);
    h.router.create_local_session(local("l1", None)).await.unwrap();
    let process = h.spawner.spawned(0).await;

    process.output(&"x".repeat(1_500));
    assert_eq!(next_output(&mut h.events).await.len(), 1_500);

    let summary = &h.router.list_sessions().await[0];
    assert_eq!(summary.kind, SessionKind::Local);
    assert_eq!(summary.queued_bytes, 1_500);
    assert!(summary.paused);

    // Still delivering while paused.
    process.output("more");
    assert_eq!(next_output(&mut h.events).await, "more");

    h.router.acknowledge_consumed("l1", 1_000).unwrap();
    let summary = &h.router.list_sessions().await[0];
    assert_eq!(summary.queued_bytes, 504);
    assert!(summary.paused);

    h.router.acknowledge_consumed("l1", 10_000).unwrap();
    let summary = &h.router.list_sessions().await[0];
    assert_eq!(summary.queued_bytes, 0);
    assert!(!summary.paused);
}

#[tokio::test(start_paused = true)]
async fn commands_for_unknown_sessions_fail() {
    let h = harness();
    assert!(matches!(
        h.router.send_input("ghost", b"x".to_vec()),
        Err(SessionError::SessionNotFound(_))
    ));
    assert!(h.router.resize("ghost", 1, 1).is_err());
    assert!(h.router.close_session("ghost", true).is_err());
    assert!(h.router.acknowledge_consumed("ghost", 1).is_err());
}

#[tokio::test(start_paused = true)]
async fn reattached_sink_receives_later_output() {
    let mut h = harness();
    h.router.create_local_session(local("l1", None)).await.unwrap();
    let process = h.spawner.spawned(0).await;

    h.router.detach_sink();
    process.output("lost");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.events.try_recv().is_err());

    let (sink, mut events) = ChannelSink::new();
    h.router.attach_sink(Arc::new(sink));
    process.output("kept");
    assert_eq!(next_output(&mut events).await, "kept");

    // Dropped batches are not counted as queued.
    assert_eq!(h.router.list_sessions().await[0].queued_bytes, 4);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_everything() {
    let mut h = harness();
    h.router.create_local_session(local("a", None)).await.unwrap();
    h.router.create_local_session(local("b", None)).await.unwrap();
    assert_eq!(h.router.list_sessions().await.len(), 2);

    h.router.shutdown().await;
    assert!(h.router.registry().is_empty());
    assert!(h.spawner.spawned(0).await.was_killed());
    assert!(h.spawner.spawned(1).await.was_killed());

    let mut closed = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        if let Event::SessionClosed { session_id, reason, .. } = event {
            assert_eq!(reason, CloseReason::User);
            closed.push(session_id);
        }
    }
    closed.sort();
    assert_eq!(closed, vec!["a", "b"]);
}
