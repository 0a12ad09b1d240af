//! Unary round-trips over TCP, TLS, and unix sockets.

mod common;

use bytes::Bytes;
use ferrule_rpc::tls::{ClientTlsOptions, ServerTlsOptions, TlsMaterial};
use ferrule_rpc::{CallContext, Client, Encoding, Error, Server, Target};

use common::{EchoService, TestServer, fixture, init_tracing, loopback};

#[tokio::test]
async fn plain_unary_roundtrip() {
    init_tracing();

    let server = Server::builder()
        .listen(loopback())
        .service(EchoService)
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .build()
        .unwrap();

    let reply = client
        .invoke(
            CallContext::new(),
            "/echo.Echo/Ping",
            Encoding::Protobuf,
            Bytes::from_static(b"exact payload"),
        )
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"exact payload"));

    assert!(!client.is_active().await);
    client.close().await;
    // Repeated close must not fail.
    client.close().await;
    assert!(client.closed().is_cancelled());

    server.stop().await;
}

#[tokio::test]
async fn tls_roundtrip_returns_identical_payload() {
    init_tracing();

    let tls = ServerTlsOptions::new(
        TlsMaterial::path(fixture("server.pem")),
        TlsMaterial::path(fixture("server.key")),
    );
    let server = Server::builder()
        .listen(loopback())
        .service(EchoService)
        .tls(tls)
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let mut tls = ClientTlsOptions::new("localhost");
    tls.ca = vec![TlsMaterial::path(fixture("ca.pem"))];
    let client = Client::builder()
        .target(Target::Tcp(format!("localhost:{}", server.addr.port())))
        .tls(tls)
        .build()
        .unwrap();

    let reply = client
        .invoke(
            CallContext::new(),
            "/echo.Echo/Ping",
            Encoding::Protobuf,
            Bytes::from_static(b"exact payload"),
        )
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"exact payload"));

    client.close().await;
    server.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_roundtrip_replaces_stale_path() {
    init_tracing();

    let path = std::env::temp_dir().join(format!("ferrule-test-{}.sock", std::process::id()));
    // A stale file must be replaced, not rejected.
    std::fs::write(&path, b"stale").unwrap();

    let server = Server::builder()
        .listen(ferrule_rpc::ListenOn::Unix(path.clone()))
        .service(EchoService)
        .build()
        .await
        .unwrap();
    let server = std::sync::Arc::new(server);
    let handle = tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let client = Client::builder()
        .target(Target::Unix(path.clone()))
        .build()
        .unwrap();

    let reply = client
        .invoke(
            CallContext::new(),
            "/echo.Echo/Ping",
            Encoding::Json,
            Bytes::from_static(b"\"over unix\""),
        )
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"\"over unix\""));

    client.close().await;
    server.stop().await;
    let _ = handle.await;
    assert!(!path.exists());
}

#[tokio::test]
async fn unknown_service_surfaces_remote_error() {
    init_tracing();

    let server = Server::builder()
        .listen(loopback())
        .service(EchoService)
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .build()
        .unwrap();

    let err = client
        .invoke(
            CallContext::new(),
            "/missing.Service/Call",
            Encoding::Json,
            Bytes::new(),
        )
        .await
        .unwrap_err();
    match err {
        Error::Remote { code, .. } => assert_eq!(code, "NOT_FOUND"),
        other => panic!("unexpected error: {other}"),
    }

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn stop_unblocks_pending_start() {
    init_tracing();

    let server = Server::builder()
        .listen(loopback())
        .service(EchoService)
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let server_ref = std::sync::Arc::clone(&server.server);
    server.stop().await;

    // A stopped server cannot be started again.
    assert!(matches!(
        server_ref.start().await.unwrap_err(),
        Error::AlreadyStarted
    ));
}
