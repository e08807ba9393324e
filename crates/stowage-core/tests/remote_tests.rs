//! Integration tests for remote persistence against the mock backend.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use stowage_core::ipc::Operation;
use stowage_core::{ConnectionState, PersistError, Persistence, PrettyJsonCodec, StorageMode};
use stowage_test_utils::tracing_setup::init_test_tracing;
use stowage_test_utils::{Faults, MockBackend, TestConfigBuilder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Inventory {
    gold: u32,
    items: Vec<String>,
}

async fn connected(backend: &MockBackend) -> Persistence {
    let session = Persistence::init(&backend.config()).unwrap();
    session.wait_ready(Duration::from_secs(2)).await.unwrap();
    session
}

// ── Round trips ───────────────────────────────────────────────────

#[tokio::test]
async fn test_save_then_load_remote() {
    init_test_tracing();
    let backend = MockBackend::start().await;
    let session = connected(&backend).await;
    assert_eq!(session.mode(), StorageMode::Remote);
    assert_eq!(session.connection_state(), Some(ConnectionState::Connected));

    session.save("scores", "player1", &42).await.unwrap();
    assert_eq!(backend.stored("scores", "player1").as_deref(), Some("42"));
    assert_eq!(session.load::<i32>("scores", "player1").await.unwrap(), 42);
    assert_eq!(session.load::<String>("scores", "player1").await.unwrap(), "42");
}

#[tokio::test]
async fn test_structured_value_nests_as_string() {
    init_test_tracing();
    let backend = MockBackend::start().await;
    let session = connected(&backend).await;

    let inv = Inventory {
        gold: 7,
        items: vec!["rope".into(), "lamp \"brass\"".into()],
    };
    session.save("player", "inv", &inv).await.unwrap();

    let stored = backend.stored("player", "inv").unwrap();
    assert_eq!(stored, r#"{"gold":7,"items":["rope","lamp \"brass\""]}"#);
    assert_eq!(session.load::<Inventory>("player", "inv").await.unwrap(), inv);
    assert_eq!(session.load_raw("player", "inv").await.unwrap(), stored);
}

#[tokio::test]
async fn test_explicit_codec() {
    let backend = MockBackend::start().await;
    let session = connected(&backend).await;

    let inv = Inventory {
        gold: 1,
        items: vec![],
    };
    session
        .save_with("player", "inv", &inv, &PrettyJsonCodec)
        .await
        .unwrap();
    assert!(backend.stored("player", "inv").unwrap().contains('\n'));
    assert_eq!(
        session
            .load_with::<Inventory>("player", "inv", &PrettyJsonCodec)
            .await
            .unwrap(),
        inv
    );
}

#[tokio::test]
async fn test_flush_and_wire_ids() {
    let backend = MockBackend::start().await;
    let session = connected(&backend).await;

    session.save_raw("g", "k", "v".into()).await.unwrap();
    session.flush().await.unwrap();
    assert_eq!(backend.flush_count(), 1);

    let requests = backend.requests();
    assert_eq!(backend.request_ids(), vec![0, 1]);
    assert!(matches!(requests[1].operation(), Operation::Flush));
}

#[tokio::test]
async fn test_backend_error_surfaces_as_remote() {
    let backend = MockBackend::start().await;
    let session = connected(&backend).await;

    match session.load::<i32>("scores", "nobody").await {
        Err(PersistError::Remote(message)) => assert_eq!(message, "value not found"),
        other => panic!("expected Remote, got {other:?}"),
    }
    let response = session.load_response("scores", "nobody").await.unwrap();
    assert!(response.is_err());
    assert_eq!(response.as_type::<i32>(), None);

    backend.set_faults(Faults {
        reject: Some("read-only".into()),
        ..Faults::default()
    });
    assert!(matches!(
        session.save("scores", "p", &1).await,
        Err(PersistError::Remote(m)) if m == "read-only"
    ));
}

// ── Correlation ───────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_requests_get_unique_ids() {
    let backend = MockBackend::start().await;
    let session = Arc::new(connected(&backend).await);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..32u32 {
        let session = Arc::clone(&session);
        tasks.spawn(async move { session.save("bulk", &format!("k{i}"), &i).await });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    let mut ids = backend.request_ids();
    ids.sort_unstable();
    assert_eq!(ids, (0..32).collect::<Vec<u64>>());
    for i in 0..32 {
        assert_eq!(backend.stored("bulk", &format!("k{i}")), Some(i.to_string()));
    }
}

#[tokio::test]
async fn test_reverse_order_replies_reach_their_callers() {
    init_test_tracing();
    let backend = MockBackend::start().await;
    let session = connected(&backend).await;
    for i in 0..4 {
        session.save("order", &format!("k{i}"), &(i * 10)).await.unwrap();
    }

    backend.set_faults(Faults {
        reverse_batch: 4,
        ..Faults::default()
    });
    let (a, b, c, d) = tokio::join!(
        session.load::<u32>("order", "k0"),
        session.load::<u32>("order", "k1"),
        session.load::<u32>("order", "k2"),
        session.load::<u32>("order", "k3"),
    );
    assert_eq!(
        (a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()),
        (0, 10, 20, 30)
    );
}

#[tokio::test]
async fn test_withheld_reply_times_out() {
    let backend = MockBackend::start().await;
    let config = TestConfigBuilder::new()
        .remote(backend.socket_path())
        .request_timeout_ms(150)
        .build();
    let session = Persistence::init(&config).unwrap();
    session.wait_ready(Duration::from_secs(2)).await.unwrap();

    backend.set_faults(Faults {
        withhold: true,
        ..Faults::default()
    });
    assert!(matches!(
        session.flush().await,
        Err(PersistError::TimedOut { .. })
    ));

    backend.set_faults(Faults::default());
    session.flush().await.unwrap();
}

#[tokio::test]
async fn test_garbage_and_unsolicited_lines_are_ignored() {
    init_test_tracing();
    let backend = MockBackend::start().await;
    let session = connected(&backend).await;

    backend.inject_line("this is not json");
    backend.inject_line(r#"{"request_id": 9999, "type": "Object", "data": "stray"}"#);
    backend.inject_line("");

    session.save("g", "k", "real").await.unwrap();
    assert_eq!(session.load::<String>("g", "k").await.unwrap(), "real");
}

// ── Connection lifecycle ──────────────────────────────────────────

#[tokio::test]
async fn test_hang_up_fails_pending_and_later_requests() {
    init_test_tracing();
    let backend = MockBackend::start().await;
    let config = TestConfigBuilder::new()
        .remote(backend.socket_path())
        .request_timeout_ms(5_000)
        .build();
    let session = Persistence::init(&config).unwrap();
    session.wait_ready(Duration::from_secs(2)).await.unwrap();

    backend.set_faults(Faults {
        withhold: true,
        ..Faults::default()
    });
    let pending = session.flush();
    let hang_up = async {
        while backend.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        backend.hang_up();
    };
    let (result, ()) = tokio::join!(pending, hang_up);
    assert!(matches!(result, Err(PersistError::BackendUnavailable(_))));

    assert!(matches!(
        session.save("g", "k", &1).await,
        Err(PersistError::BackendUnavailable(_))
    ));
    tokio::time::timeout(Duration::from_secs(2), async {
        while !matches!(
            session.connection_state(),
            Some(ConnectionState::Disconnected { .. })
        ) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_save_waits_for_late_backend() {
    init_test_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let socket = dir.path().join("late.sock");
    let config = TestConfigBuilder::new()
        .remote(&socket)
        .reconnect_interval_ms(20)
        .ready_timeout_ms(3_000)
        .build();

    let session = Persistence::init(&config).unwrap();
    assert!(matches!(
        session.connection_state(),
        Some(ConnectionState::Connecting { .. })
    ));

    let starter = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        MockBackend::start_at(&socket).await
    };
    let (saved, backend) = tokio::join!(session.save("scores", "player1", &42), starter);
    saved.unwrap();
    assert_eq!(backend.stored("scores", "player1").as_deref(), Some("42"));
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn test_save_without_backend_is_not_initialized() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = TestConfigBuilder::new()
        .remote(&dir.path().join("nobody.sock"))
        .ready_timeout_ms(100)
        .build();

    let session = Persistence::init(&config).unwrap();
    assert!(matches!(
        session.save("scores", "player1", &42).await,
        Err(PersistError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_giving_up_is_backend_unavailable() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = TestConfigBuilder::new()
        .remote(&dir.path().join("nobody.sock"))
        .reconnect_interval_ms(10)
        .max_attempts(2)
        .build();

    let session = Persistence::init(&config).unwrap();
    assert!(matches!(
        session.load::<i32>("scores", "player1").await,
        Err(PersistError::BackendUnavailable(_))
    ));
    assert_eq!(
        session.connection_state(),
        Some(ConnectionState::GaveUp { attempts: 2 })
    );
}

#[tokio::test]
async fn test_shutdown_releases_connection() {
    let backend = MockBackend::start().await;
    let session = connected(&backend).await;
    session.shutdown().await;

    // The backend is free to accept a new client.
    let again = connected(&backend).await;
    again.flush().await.unwrap();
    assert_eq!(backend.connections(), 2);
}

// ── Blocking variants ─────────────────────────────────────────────

#[test]
fn test_blocking_calls_from_plain_threads() {
    init_test_tracing();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let backend = rt.block_on(MockBackend::start());
    let session = Persistence::init_on(&backend.config(), rt.handle().clone()).unwrap();
    session.wait_ready_blocking(Duration::from_secs(2)).unwrap();

    std::thread::scope(|scope| {
        for t in 0..4 {
            let session = &session;
            scope.spawn(move || {
                session.save_blocking("threads", &format!("t{t}"), &t).unwrap();
                assert_eq!(session.load_blocking::<i32>("threads", &format!("t{t}")).unwrap(), t);
            });
        }
    });
    session.flush_blocking().unwrap();
    assert_eq!(backend.flush_count(), 1);

    drop(session);
    drop(backend);
}
