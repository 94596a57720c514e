//! Framed channels over real sockets.

use std::time::Duration;

use ioworker::connection::{
    Address, BackendState, ChannelBackend, Connection, ConnectionError, Frame, TransportKind,
};

const WAIT: Duration = Duration::from_secs(5);

/// Listen on a fresh backend and return both ends of an accepted channel.
async fn pair(kind: TransportKind, dir: &std::path::Path) -> (Connection, Connection) {
    let mut backend = ChannelBackend::new(kind).with_socket_dir(dir);
    let address = backend.listen().unwrap();
    assert_eq!(backend.state(), BackendState::Listening);

    let client = tokio::spawn(async move { Connection::connect(&address, WAIT).await.unwrap() });
    let transport = backend.accept(Some(WAIT)).await.unwrap();
    (client.await.unwrap(), Connection::from_transport(transport))
}

async fn recv(conn: &mut Connection) -> Option<Frame> {
    tokio::time::timeout(WAIT, conn.receive())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
}

#[tokio::test]
async fn test_local_socket_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let (mut client, mut server) = pair(TransportKind::Local, dir.path()).await;

    client.send(0x43, b"file:///etc".to_vec()).await.unwrap();
    let frame = recv(&mut server).await.unwrap();
    assert_eq!(frame, Frame::new(0x43, b"file:///etc".to_vec()));

    server.send(0x68, Vec::new()).await.unwrap();
    assert_eq!(recv(&mut client).await.unwrap(), Frame::empty(0x68));
}

#[tokio::test]
async fn test_tcp_loopback_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let (mut client, mut server) = pair(TransportKind::Tcp, dir.path()).await;

    let big = vec![0xabu8; 300_000];
    server.send(0x64, big.clone()).await.unwrap();
    server.send(0x64, Vec::new()).await.unwrap();

    assert_eq!(recv(&mut client).await.unwrap().payload, big);
    assert!(recv(&mut client).await.unwrap().payload.is_empty());
}

#[tokio::test]
async fn test_local_socket_file_removed_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = ChannelBackend::new(TransportKind::Local).with_socket_dir(dir.path());
    let address = backend.listen().unwrap();
    let Address::Local(path) = &address else {
        panic!("expected a local address, got {address}");
    };
    assert!(path.starts_with(dir.path()));
    assert!(path.exists());

    backend.close();
    assert!(!path.exists());
    assert_eq!(backend.state(), BackendState::Closed);
    assert!(matches!(
        backend.accept(Some(WAIT)).await,
        Err(ConnectionError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_accept_times_out_without_peer() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = ChannelBackend::new(TransportKind::Tcp).with_socket_dir(dir.path());
    backend.listen().unwrap();
    let err = backend.accept(Some(Duration::from_millis(50))).await.unwrap_err();
    assert!(matches!(err, ConnectionError::AcceptTimeout(_)));
}

#[tokio::test]
async fn test_connect_to_missing_socket_fails() {
    let dir = tempfile::tempdir().unwrap();
    let address = Address::Local(dir.path().join("nobody.sock"));
    assert!(Connection::connect(&address, WAIT).await.is_err());
}

#[tokio::test]
async fn test_frames_sent_before_attach_are_flushed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = ChannelBackend::new(TransportKind::Local).with_socket_dir(dir.path());
    let address = backend.listen().unwrap();

    let mut pending = Connection::new();
    assert!(!pending.is_connected());
    for code in [0x30u8, 0x50, 0x43] {
        pending.send(code, vec![code]).await.unwrap();
    }
    assert_eq!(pending.queued(), 3);

    let mut peer = Connection::connect(&address, WAIT).await.unwrap();
    let transport = backend.accept(Some(WAIT)).await.unwrap();
    pending.attach(transport).await.unwrap();
    assert_eq!(pending.queued(), 0);
    assert!(pending.is_connected());

    pending.send(0x44, Vec::new()).await.unwrap();
    let mut codes = Vec::new();
    for _ in 0..4 {
        codes.push(recv(&mut peer).await.unwrap().code);
    }
    assert_eq!(codes, vec![0x30, 0x50, 0x43, 0x44]);
}

#[tokio::test]
async fn test_suspended_channel_holds_frames_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let (mut client, mut server) = pair(TransportKind::Local, dir.path()).await;

    server.suspend();
    assert!(server.is_suspended());
    client.send(0x64, b"late".to_vec()).await.unwrap();

    let paused = tokio::time::timeout(Duration::from_millis(100), server.receive()).await;
    assert!(paused.is_err(), "suspended channel delivered a frame");

    let suspender = server.suspender();
    suspender.resume();
    assert_eq!(recv(&mut server).await.unwrap().payload, b"late");
}

#[tokio::test]
async fn test_peer_close_ends_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (mut client, mut server) = pair(TransportKind::Local, dir.path()).await;

    client.send(0x68, Vec::new()).await.unwrap();
    client.close().await;
    client.close().await;
    assert!(matches!(
        client.send(0x68, Vec::new()).await,
        Err(ConnectionError::Closed)
    ));

    assert_eq!(recv(&mut server).await, Some(Frame::empty(0x68)));
    assert_eq!(recv(&mut server).await, None);
    assert!(!server.is_connected());
}

#[tokio::test]
async fn test_split_channel_runs_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let (mut client, server) = pair(TransportKind::Tcp, dir.path()).await;
    let (mut source, mut sink) = server.into_split().unwrap();

    // Echo every frame back with its code bumped by one.
    let echo = tokio::spawn(async move {
        while let Some(frame) = source.next().await {
            sink.send(Frame::new(frame.code + 1, frame.payload)).await.unwrap();
        }
        sink.close().await;
    });

    client.send(0x10, b"a".to_vec()).await.unwrap();
    client.send(0x20, b"b".to_vec()).await.unwrap();
    assert_eq!(recv(&mut client).await.unwrap(), Frame::new(0x11, b"a".to_vec()));
    assert_eq!(recv(&mut client).await.unwrap(), Frame::new(0x21, b"b".to_vec()));

    client.close().await;
    tokio::time::timeout(WAIT, echo).await.unwrap().unwrap();
}

#[test]
fn test_unattached_channel_cannot_split() {
    assert!(matches!(
        Connection::new().into_split(),
        Err(ConnectionError::NotConnected)
    ));
}
