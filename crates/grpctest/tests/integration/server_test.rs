use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tonic::transport::Server;

use grpctest::{ConnectContext, TestServer};
use grpctest_proto::echo::v1::echo_service_server::EchoServiceServer;

use crate::helpers::{Echo, Stalled, echo, echo_server, must_echo};

const WAIT: Duration = Duration::from_secs(5);

// ── Connectivity ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_echo_hello_world() {
    let server = echo_server();
    let _guard = server.close_on_cleanup();
    server.start();

    let conn = server.client_conn().await.unwrap();

    assert_eq!(echo(&conn, "Hello, world").await.unwrap(), "Hello, world");
}

#[tokio::test]
async fn should_expose_connection_info_to_handlers() {
    let echo_svc = Echo::default();
    let seen = echo_svc.seen_handle();
    let server = TestServer::new();
    let _guard = server.close_on_cleanup();
    server.add_service(EchoServiceServer::new(echo_svc));
    server.start();

    let first = server.client_conn().await.unwrap();
    let second = server.client_conn().await.unwrap();
    must_echo(&first, "one").await;
    must_echo(&second, "two").await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0], seen[1], "each connection should have its own id");
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_treat_repeated_start_as_noop() {
    let server = echo_server();
    let _guard = server.close_on_cleanup();

    server.start();
    server.start();

    let conn = server.client_conn().await.unwrap();
    must_echo(&conn, "serve twice").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_spawn_one_serve_task_under_concurrent_start() {
    let server = echo_server();
    let _guard = server.close_on_cleanup();

    let starts: Vec<_> = (0..8)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(async move { server.start() })
        })
        .collect();
    for start in starts {
        start.await.unwrap();
    }

    let conn = server.client_conn().await.unwrap();
    must_echo(&conn, "concurrent start").await;

    server.close().await;
    // A second serve task would have failed to take the listener.
    assert!(server.err().await.is_ok());
}

#[tokio::test]
async fn should_fail_rpc_on_existing_connection_after_close() {
    let server = echo_server();
    let _guard = server.close_on_cleanup();
    server.start();

    let conn = server.client_conn().await.unwrap();
    must_echo(&conn, "before close").await;

    server.close().await;

    let result = tokio::time::timeout(WAIT, echo(&conn, "after close"))
        .await
        .expect("RPC hung after close");
    assert!(result.is_err(), "expected RPC to fail after close, got {result:?}");
}

#[tokio::test]
async fn should_fail_inflight_rpc_on_close() {
    let stalled = Stalled::default();
    let entered = Arc::clone(&stalled.entered);
    let server = TestServer::new();
    server.add_service(EchoServiceServer::new(stalled));
    let _guard = server.close_on_cleanup();
    server.start();

    let conn = server.client_conn().await.unwrap();
    let call = {
        let conn = conn.clone();
        tokio::spawn(async move { echo(&conn, "never answered").await })
    };
    entered.notified().await;

    tokio::time::timeout(Duration::from_secs(1), server.close())
        .await
        .expect("close waited for the in-flight handler");

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("in-flight RPC survived close")
        .unwrap();
    assert!(result.is_err(), "expected in-flight RPC to fail, got {result:?}");
    assert!(server.err().await.is_ok());
}

#[tokio::test]
async fn should_fail_first_rpc_when_closed_right_after_connecting() {
    let server = echo_server();
    server.start();

    let conn = server.client_conn().await.unwrap();
    server.close().await;

    let result = tokio::time::timeout(WAIT, echo(&conn, "Hello, world"))
        .await
        .expect("RPC hung after close");
    assert!(result.is_err(), "expected RPC to fail after close, got {result:?}");
}

#[tokio::test]
async fn should_fail_new_connection_after_close() {
    let server = echo_server();
    server.start();
    server.close().await;

    let ctx = ConnectContext::with_timeout(Duration::from_millis(200));
    let err = server.client_conn_context(&ctx, None).await.unwrap_err();

    assert!(err.is_deadline_exceeded(), "got {err:?}");
}

#[tokio::test]
async fn should_allow_close_before_start() {
    let server = echo_server();
    server.close().await;
    server.close().await;

    server.start();
    assert!(server.err().await.unwrap_err().is_stopped());
}

// ── Options ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_apply_server_options_and_interceptors() {
    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);

    let server = TestServer::with_server(
        Server::builder()
            .concurrency_limit_per_connection(32)
            .timeout(Duration::from_secs(10)),
    );
    let _guard = server.close_on_cleanup();
    server.add_service(EchoServiceServer::with_interceptor(
        Echo::default(),
        move |req: tonic::Request<()>| -> Result<tonic::Request<()>, tonic::Status> {
            flag.store(true, Ordering::SeqCst);
            Ok(req)
        },
    ));
    server.start();

    let conn = server.client_conn().await.unwrap();
    must_echo(&conn, "custom options").await;

    assert!(called.load(Ordering::SeqCst), "interceptor was not called");
}

#[tokio::test]
async fn should_respect_service_message_limits() {
    let server = TestServer::new();
    let _guard = server.close_on_cleanup();
    server.add_service(
        EchoServiceServer::new(Echo::default()).max_decoding_message_size(64),
    );
    server.start();

    let conn = server.client_conn().await.unwrap();
    must_echo(&conn, "small").await;

    let status = echo(&conn, &"x".repeat(1024)).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::OutOfRange);
}

#[test]
#[should_panic(expected = "registered before the server is started")]
fn should_reject_registration_after_start() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let server = echo_server();
        server.start();
        server.add_service(EchoServiceServer::new(Echo::default()));
    });
}

// ── Err ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_return_ok_from_err_on_graceful_shutdown() {
    let server = echo_server();
    let _guard = server.close_on_cleanup();
    server.start();

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move { server.err().await })
    };

    server.close().await;

    let result = tokio::time::timeout(WAIT, waiter)
        .await
        .expect("err() did not return after close")
        .unwrap();
    match result {
        Ok(()) => {}
        Err(err) if err.is_stopped() => {}
        Err(err) => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn should_block_err_until_server_stops() {
    let server = echo_server();
    let _guard = server.close_on_cleanup();
    server.start();

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move { server.err().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished(), "err() returned before close");

    server.close().await;

    tokio::time::timeout(WAIT, waiter)
        .await
        .expect("err() did not return after close")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_wake_every_err_waiter() {
    let server = echo_server();
    let _guard = server.close_on_cleanup();
    server.start();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(async move { server.err().await })
        })
        .collect();

    server.close().await;

    for waiter in waiters {
        tokio::time::timeout(WAIT, waiter)
            .await
            .expect("err() waiter was not woken")
            .unwrap()
            .unwrap();
    }
    // Late callers see the same result without blocking.
    assert!(server.err().await.is_ok());
}

#[tokio::test]
async fn should_close_when_guard_is_dropped_during_panic() {
    let server = echo_server();
    server.start();

    let inner = server.clone();
    let outcome = tokio::spawn(async move {
        let _guard = inner.close_on_cleanup();
        panic!("test body failed");
    })
    .await;
    assert!(outcome.is_err());

    tokio::time::timeout(WAIT, server.err())
        .await
        .expect("server was not closed by the guard")
        .unwrap();
}
