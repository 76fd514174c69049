//! End-to-end tests driving two real `Mux` instances over loopback UDP.
use std::time::Duration;

use packetloom_core::{Config, Error, Mux};

#[tokio::test]
async fn single_chunk_message_roundtrip() {
    let key = [5u8; 32];
    let client = Mux::bind(Config::new("127.0.0.1:0".parse().unwrap(), key)).unwrap();
    let server = Mux::bind(Config::new("127.0.0.1:0".parse().unwrap(), key)).unwrap();
    let server_addr = server.local_addr().unwrap();

    let client_session = client.open_session(server_addr).await.unwrap();

    let open_fut = client_session.open_stream();
    let server_session = tokio::time::timeout(Duration::from_secs(1), server.accept())
        .await
        .expect("server never saw the session")
        .unwrap();

    let (client_stream, server_stream) = tokio::join!(open_fut, server_session.accept_stream());
    let client_stream = client_stream.unwrap();
    let server_stream = server_stream.unwrap();

    let write_fut = client_stream.write(b"Hello, world!");
    let read_fut = async {
        let mut buf = [0u8; 65535];
        let n = server_stream.read(&mut buf).await.unwrap();
        (n, buf[..n].to_vec())
    };

    let (written, (n, received)) = tokio::join!(write_fut, read_fut);
    assert_eq!(written.unwrap(), 13);
    assert_eq!(n, 13);
    assert_eq!(&received, b"Hello, world!");
}

#[tokio::test]
async fn session_terminate_wakes_peer_read_with_interrupted() {
    let key = [6u8; 32];
    let client = Mux::bind(Config::new("127.0.0.1:0".parse().unwrap(), key)).unwrap();
    let server = Mux::bind(Config::new("127.0.0.1:0".parse().unwrap(), key)).unwrap();
    let server_addr = server.local_addr().unwrap();

    let client_session = client.open_session(server_addr).await.unwrap();
    let open_fut = client_session.open_stream();

    let server_session = tokio::time::timeout(Duration::from_secs(1), server.accept())
        .await
        .unwrap()
        .unwrap();
    let accept_fut = server_session.accept_stream();

    let (client_stream, server_stream) = tokio::join!(open_fut, accept_fut);
    let client_stream = client_stream.unwrap();
    let server_stream = server_stream.unwrap();

    client_session.close().await.unwrap();

    // The client side already knows it's closed.
    let err = client_stream.read(&mut [0u8; 8]).await.unwrap_err();
    assert!(matches!(err, Error::Interrupted));

    // The server side learns about it from the inbound Terminate packet.
    let err = tokio::time::timeout(Duration::from_secs(1), server_stream.read(&mut [0u8; 8]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Interrupted));
}
