//! One port, two protocols: native RPC and the HTTP bridge.

mod common;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ferrule_rpc::{CallContext, Client, Encoding, Server, Target};

use common::{EchoService, MetadataProbe, TestServer, init_tracing, loopback};

async fn shared_port_server() -> TestServer {
    let server = Server::builder()
        .listen(loopback())
        .service(EchoService)
        .service(MetadataProbe {
            key: "tenant".to_string(),
            expected: "acme".to_string(),
        })
        .http(true)
        .build()
        .await
        .unwrap();
    TestServer::spawn(server).await
}

async fn raw_http_request(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn native_rpc_shares_the_port_via_protocol_header() {
    init_tracing();
    let server = shared_port_server().await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .http_compat()
        .build()
        .unwrap();

    let reply = client
        .invoke(
            CallContext::new(),
            "/echo.Echo/Ping",
            Encoding::Protobuf,
            Bytes::from_static(b"muxed"),
        )
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"muxed"));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn http_post_reaches_the_bridge() {
    init_tracing();
    let server = shared_port_server().await;

    let body = "\"hello bridge\"";
    let request = format!(
        "POST /echo.Echo/Ping HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let response = raw_http_request(server.addr, &request).await;

    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.contains("\"hello bridge\""), "response: {response}");

    server.stop().await;
}

#[tokio::test]
async fn bridge_rejects_unsupported_content_type() {
    init_tracing();
    let server = shared_port_server().await;

    let request = "POST /echo.Echo/Ping HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi";
    let response = raw_http_request(server.addr, request).await;

    assert!(response.starts_with("HTTP/1.1 415"), "response: {response}");
    assert!(response.contains("UNSUPPORTED_CONTENT_TYPE"), "response: {response}");

    server.stop().await;
}

#[tokio::test]
async fn bridge_forwards_metadata_headers() {
    init_tracing();
    let server = shared_port_server().await;

    let request = "POST /meta.Probe/Check HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nrpc-metadata-tenant: acme\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnull";
    let response = raw_http_request(server.addr, request).await;

    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.contains("\"ok\""), "response: {response}");

    server.stop().await;
}

#[tokio::test]
async fn bridge_maps_handler_errors_to_statuses() {
    init_tracing();
    let server = shared_port_server().await;

    // Unknown service: 404 with a machine-readable code.
    let request = "POST /missing.Service/Call HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnull";
    let response = raw_http_request(server.addr, request).await;

    assert!(response.starts_with("HTTP/1.1 404"), "response: {response}");
    assert!(response.contains("NOT_FOUND"), "response: {response}");

    server.stop().await;
}
