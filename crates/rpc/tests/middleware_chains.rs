//! Rate limit, retry, auth, and metadata scenarios through the full stack.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use ferrule_rpc::{
    BearerAuth, CallContext, Client, Encoding, Error, MetadataInjector, RateLimit, Recover, Retry,
    Server, Target,
};

use common::{EchoService, FlakyService, MetadataProbe, TestServer, init_tracing, loopback};

async fn echo_server() -> TestServer {
    let server = Server::builder()
        .listen(loopback())
        .service(EchoService)
        .build()
        .await
        .unwrap();
    TestServer::spawn(server).await
}

#[tokio::test]
async fn rate_limit_allows_one_per_second() {
    init_tracing();
    let server = echo_server().await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .layer(Arc::new(RateLimit::per_second(1.0)))
        .build()
        .unwrap();

    let call = |payload: &'static [u8]| {
        client.invoke(
            CallContext::new(),
            "/echo.Echo/Ping",
            Encoding::Json,
            Bytes::from_static(payload),
        )
    };

    call(b"\"first\"").await.unwrap();

    let err = call(b"\"second\"").await.unwrap_err();
    assert!(matches!(err, Error::RateLimited));
    assert_eq!(err.to_string(), "rate: limit exceeded");

    tokio::time::sleep(Duration::from_millis(1050)).await;
    call(b"\"third\"").await.unwrap();

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn retry_succeeds_on_third_invocation() {
    init_tracing();

    let invocations = Arc::new(AtomicUsize::new(0));
    let server = Server::builder()
        .listen(loopback())
        .service(FlakyService {
            failures: 2,
            invocations: Arc::clone(&invocations),
        })
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .layer(Arc::new(Retry::new(5, Duration::from_millis(10), 1)))
        .build()
        .unwrap();

    let reply = client
        .invoke(
            CallContext::new(),
            "/flaky.Flaky/Call",
            Encoding::Json,
            Bytes::from_static(b"\"eventually\""),
        )
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"\"eventually\""));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn retry_gives_up_after_max_attempts() {
    init_tracing();

    let invocations = Arc::new(AtomicUsize::new(0));
    let server = Server::builder()
        .listen(loopback())
        .service(FlakyService {
            failures: usize::MAX,
            invocations: Arc::clone(&invocations),
        })
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .layer(Arc::new(Retry::new(3, Duration::from_millis(5), 1)))
        .build()
        .unwrap();

    let err = client
        .invoke(
            CallContext::new(),
            "/flaky.Flaky/Call",
            Encoding::Json,
            Bytes::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { .. }));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn bearer_auth_rejects_and_accepts() {
    init_tracing();

    let server = Server::builder()
        .listen(loopback())
        .service(EchoService)
        .layer(Arc::new(Recover::new()))
        .layer(Arc::new(BearerAuth::new("auth.token", |token| {
            token == "secret"
        })))
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .build()
        .unwrap();

    let invoke = |ctx: CallContext| {
        client.invoke(
            ctx,
            "/echo.Echo/Ping",
            Encoding::Json,
            Bytes::from_static(b"\"authed\""),
        )
    };

    let err = invoke(CallContext::new()).await.unwrap_err();
    match err {
        Error::Remote { code, message } => {
            assert_eq!(code, "MISSING_CREDENTIALS");
            assert!(message.contains("missing credentials"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut ctx = CallContext::new();
    ctx.insert("auth.token", "wrong");
    let err = invoke(ctx).await.unwrap_err();
    match err {
        Error::Remote { code, message } => {
            assert_eq!(code, "INVALID_CREDENTIALS");
            assert!(message.contains("invalid credentials"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut ctx = CallContext::new();
    ctx.insert("auth.token", "secret");
    let reply = invoke(ctx).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"\"authed\""));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn injected_metadata_reaches_the_handler() {
    init_tracing();

    let server = Server::builder()
        .listen(loopback())
        .service(MetadataProbe {
            key: "tenant".to_string(),
            expected: "acme".to_string(),
        })
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let entries: HashMap<String, String> =
        [("tenant".to_string(), "acme".to_string())].into_iter().collect();
    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .layer(Arc::new(MetadataInjector::new(entries)))
        .build()
        .unwrap();

    let reply = client
        .invoke(
            CallContext::new(),
            "/meta.Probe/Check",
            Encoding::Json,
            Bytes::from_static(b"null"),
        )
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"\"ok\""));

    client.close().await;
    server.stop().await;
}
