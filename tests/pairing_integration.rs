//! Integration tests for the pairing session lifecycle.
//!
//! Drives the manager through the public API with a scripted loopback
//! backend: phone number → session → code, then the connection's fate
//! (linked, logged out, dropped) and what it does to the session's storage.
//! Uses temp directory for isolation.

use std::sync::Arc;
use std::time::Duration;

use pairlink::cli::{SessionsCommand, run_sessions_command_with_store};
use pairlink::error::PairingError;
use pairlink::observability::NoopObserver;
use pairlink::pairing::{
    ConnectionPhase, FileSessionStore, PairingConfig, PairingSessionManager, SessionId,
    SessionStore,
};
use pairlink::protocol::{
    ConnectionState, DisconnectCause, LoopbackAdapter, LoopbackScript, ProtocolEvent,
};
use tempfile::TempDir;

struct TestEnv {
    manager: Arc<PairingSessionManager>,
    store: Arc<FileSessionStore>,
    adapter: Arc<LoopbackAdapter>,
    _dir: TempDir,
}

fn test_env(script: LoopbackScript, settle_delay: Duration) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path()));
    let adapter = Arc::new(LoopbackAdapter::new(script));
    let config = PairingConfig {
        session_dir: dir.path().to_path_buf(),
        settle_delay,
        request_timeout: Duration::from_secs(2),
        closed_retention: Duration::from_secs(600),
    };
    let manager = Arc::new(PairingSessionManager::new(
        config,
        store.clone(),
        adapter.clone(),
        Arc::new(NoopObserver),
    ));
    TestEnv {
        manager,
        store,
        adapter,
        _dir: dir,
    }
}

async fn wait_until_closed(env: &TestEnv, id: &SessionId) {
    for _ in 0..300 {
        match env.manager.session(id).await {
            Some(s) if s.phase == ConnectionPhase::Closed => return,
            None => return,
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("session {id} did not close");
}

#[tokio::test]
async fn test_full_flow_code_then_linked() {
    let env = test_env(
        LoopbackScript::quiet()
            .with_code("ABC123XYZ")
            .on_open(vec![ProtocolEvent::ConnectionUpdate(ConnectionState::Connecting)])
            .after_code(vec![
                ProtocolEvent::CredsUpdate(pairlink::pairing::CredentialDelta::registered(true)),
                ProtocolEvent::ConnectionUpdate(ConnectionState::Open),
            ])
            .after_code_delay(Duration::from_millis(20)),
        Duration::from_millis(30),
    );

    // 1. The caller gets the grouped code
    let code = env.manager.start_pairing("+1 (555) 123-4567").await.unwrap();
    assert_eq!(code.as_str(), "ABC-123-XYZ");
    assert_eq!(env.adapter.code_request_count(), 1);

    // 2. The device links and the credentials say so
    let id = env.store.list().unwrap().pop().unwrap();
    for _ in 0..300 {
        if env.manager.session(&id).await.unwrap().phase == ConnectionPhase::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        env.manager.session(&id).await.unwrap().phase,
        ConnectionPhase::Connected
    );
    assert!(env.store.open(&id).unwrap().registered());

    // 3. The stored session shows up in the CLI listing as registered
    let mut out = Vec::new();
    run_sessions_command_with_store(
        SessionsCommand::List { verbose: true },
        env.store.as_ref(),
        &mut out,
    )
    .unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains(&format!("{id}  registered")));
}

#[tokio::test]
async fn test_timeout_close_before_delay() {
    let env = test_env(
        LoopbackScript::quiet().on_open(vec![ProtocolEvent::closed(
            DisconnectCause::from_status_code(Some(408)),
        )]),
        Duration::from_millis(200),
    );

    let err = env.manager.start_pairing("15551234567").await.unwrap_err();
    assert!(matches!(err, PairingError::ConnectionError(_)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(env.adapter.code_request_count(), 0);
    let ids = env.store.list().unwrap();
    assert_eq!(ids.len(), 1, "storage retained after a non-logout close");
    assert_eq!(
        env.manager.session(&ids[0]).await.unwrap().phase,
        ConnectionPhase::Closed
    );
}

#[tokio::test]
async fn test_logout_purges_storage() {
    let env = test_env(
        LoopbackScript::quiet()
            .with_code("123456789")
            .after_code(vec![ProtocolEvent::closed(
                DisconnectCause::from_status_code(Some(401)),
            )])
            .after_code_delay(Duration::from_millis(20)),
        Duration::from_millis(10),
    );

    let code = env.manager.start_pairing("15551234567").await.unwrap();
    assert_eq!(code.as_str(), "123-456-789");

    let id = env.store.list().unwrap().pop().unwrap();
    wait_until_closed(&env, &id).await;
    assert!(!env.store.exists(&id));
    assert!(env.manager.session(&id).await.is_none());
}

#[tokio::test]
async fn test_already_registered_skips_code_request() {
    let env = test_env(
        LoopbackScript::quiet().already_registered(),
        Duration::from_millis(10),
    );

    let err = env.manager.start_pairing("15551234567").await.unwrap_err();
    assert!(matches!(err, PairingError::AlreadyRegistered(_)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.adapter.code_request_count(), 0);
}

#[tokio::test]
async fn test_connect_and_request_failures() {
    let env = test_env(
        LoopbackScript::quiet().failing_connect("service unreachable"),
        Duration::from_millis(10),
    );
    let err = env.manager.start_pairing("15551234567").await.unwrap_err();
    assert!(matches!(err, PairingError::ConnectionError(_)));
    assert_eq!(env.store.list().unwrap().len(), 1);

    let env = test_env(
        LoopbackScript::quiet().failing_code("bad request"),
        Duration::from_millis(10),
    );
    let err = env.manager.start_pairing("15551234567").await.unwrap_err();
    assert!(matches!(err, PairingError::PairingRequestFailed(_)));
    let id = env.store.list().unwrap().pop().unwrap();
    wait_until_closed(&env, &id).await;
    assert!(env.store.exists(&id));
}

#[tokio::test]
async fn test_empty_phone_number_creates_no_session() {
    let env = test_env(LoopbackScript::quiet(), Duration::from_millis(10));
    for input in ["", "   ", "+", "555-CALL-NOW"] {
        let err = env.manager.start_pairing(input).await.unwrap_err();
        assert!(matches!(err, PairingError::InvalidInput(_)), "{input:?}");
    }
    assert!(env.store.list().unwrap().is_empty());
    assert_eq!(env.adapter.open_count(), 0);
}

#[tokio::test]
async fn test_parallel_requests_get_distinct_sessions() {
    let env = test_env(
        LoopbackScript::quiet().code_latency(Duration::from_millis(20)),
        Duration::from_millis(20),
    );

    let mut callers = Vec::new();
    for i in 0..20 {
        let manager = env.manager.clone();
        callers.push(tokio::spawn(async move {
            manager.start_pairing(&format!("1555{i:07}")).await
        }));
    }
    for caller in callers {
        let code = caller.await.unwrap().unwrap();
        assert_eq!(code.as_str().len(), 9, "8 chars grouped 4-4: {code}");
    }

    let ids = env.store.list().unwrap();
    assert_eq!(ids.len(), 20);
    assert_eq!(env.adapter.code_request_count(), 20);
}

#[tokio::test]
async fn test_purge_and_resume_while_connecting() {
    let env = test_env(
        LoopbackScript::quiet()
            .with_code("123456789")
            .open_latency(Duration::from_millis(150)),
        Duration::from_millis(10),
    );

    // 1. A purge that lands while the connection is opening wins
    let caller = {
        let manager = env.manager.clone();
        tokio::spawn(async move { manager.start_pairing("15551234567").await })
    };
    let mut reserved = None;
    for _ in 0..200 {
        if env.adapter.open_count() == 1 {
            reserved = env.manager.sessions().await.pop();
            if reserved.is_some() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let id = reserved.expect("session never reached the adapter").id;
    env.manager.purge_session(&id).await.unwrap();

    let err = caller.await.unwrap().unwrap_err();
    assert!(matches!(err, PairingError::ConnectionError(_)), "{err:?}");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.adapter.code_request_count(), 0);
    assert!(env.store.list().unwrap().is_empty());
    assert_eq!(env.manager.active_sessions().await, 0);

    // 2. Two resumes of one retained session open a single connection
    let id = SessionId::generate();
    env.store.open(&id).unwrap();
    let (a, b) = tokio::join!(
        env.manager.resume_pairing(&id, "15551234567"),
        env.manager.resume_pairing(&id, "15551234567"),
    );
    assert_eq!(
        [&a, &b].iter().filter(|r| r.is_ok()).count(),
        1,
        "{a:?} {b:?}"
    );
    assert!(
        [&a, &b]
            .iter()
            .any(|r| matches!(r, Err(PairingError::InvalidInput(_))))
    );
    assert_eq!(env.adapter.open_count(), 2);
}

#[test]
fn test_generated_ids_are_unique() {
    let mut seen = std::collections::HashSet::new();
    for _ in 0..10_000 {
        assert!(seen.insert(SessionId::generate()));
    }
}

#[test]
fn test_purge_twice_is_ok() {
    let dir = TempDir::new().unwrap();
    let store = FileSessionStore::new(dir.path());
    let id = SessionId::generate();
    store.open(&id).unwrap();
    store.purge(&id).unwrap();
    store.purge(&id).unwrap();
    assert!(!store.exists(&id));
}
