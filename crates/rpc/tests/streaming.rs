//! Duplex streams over the native transport.

mod common;

use bytes::Bytes;
use ferrule_rpc::{CallContext, Client, Encoding, MessageStream, Server, Target};

use common::{ChunkService, EchoService, TestServer, init_tracing, loopback};

#[tokio::test]
async fn server_stream_over_native_transport() {
    init_tracing();

    let server = Server::builder()
        .listen(loopback())
        .service(ChunkService { count: 10 })
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .build()
        .unwrap();

    let stream = client
        .open_stream(CallContext::new(), "/stream.Chunks/Download", Encoding::Json)
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Some(chunk) = stream.recv().await.unwrap() {
        received.push(chunk);
    }
    assert_eq!(received.len(), 10);
    assert_eq!(received[0], Bytes::from_static(b"\"chunk-0\""));

    stream.close().await.unwrap();
    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn duplex_echo_stream() {
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

    let stream = client
        .open_stream(CallContext::new(), "/echo.Echo/Ping", Encoding::Protobuf)
        .await
        .unwrap();

    for i in 0..5u8 {
        stream.send(Bytes::from(vec![i; 3])).await.unwrap();
        let echoed = stream.recv().await.unwrap().unwrap();
        assert_eq!(echoed, Bytes::from(vec![i; 3]));
    }

    stream.close_send().await.unwrap();
    assert_eq!(stream.recv().await.unwrap(), None);

    stream.close().await.unwrap();
    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn connection_returns_to_pool_while_stream_is_open() {
    init_tracing();

    let server = Server::builder()
        .listen(loopback())
        .service(ChunkService { count: 2 })
        .build()
        .await
        .unwrap();
    let server = TestServer::spawn(server).await;

    let client = Client::builder()
        .target(Target::Tcp(server.addr.to_string()))
        .pool_limit(1)
        .build()
        .unwrap();

    let first = client
        .open_stream(CallContext::new(), "/stream.Chunks/Download", Encoding::Json)
        .await
        .unwrap();

    // With a pool of one, a second stream must reuse the same connection,
    // which is only possible if open_stream returned it to the pool.
    let second = client
        .open_stream(CallContext::new(), "/stream.Chunks/Download", Encoding::Json)
        .await
        .unwrap();

    for stream in [&first, &second] {
        let mut count = 0;
        while stream.recv().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    drop(first);
    drop(second);
    client.close().await;
    server.stop().await;
}
