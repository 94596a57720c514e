//! The worker dispatch loop driven by a raw client over a socket.

#[path = "../common/mod.rs"]
mod common;

use common::{Latch, WAIT};
use ioworker::config::WorkerSettings;
use ioworker::connection::{Address, ChannelBackend, Connection, TransportKind};
use ioworker::protocol::{ErrorCode, HostArgs, Locator, Reply, Request};
use ioworker::worker::{WorkerContext, WorkerProtocol, WorkerResult, WorkerRuntime};
use ioworker::workers::{file, FileWorker};
use tokio::task::JoinHandle;

/// Run `protocol` behind a fresh channel and return the client end.
async fn serve<P>(
    protocol: P,
    name: &str,
    settings: WorkerSettings,
) -> (Connection, JoinHandle<WorkerResult<()>>)
where
    P: WorkerProtocol + 'static,
{
    serve_with_pool(protocol, name, settings, None).await
}

async fn serve_with_pool<P>(
    protocol: P,
    name: &str,
    settings: WorkerSettings,
    pool: Option<Address>,
) -> (Connection, JoinHandle<WorkerResult<()>>)
where
    P: WorkerProtocol + 'static,
{
    let mut backend = ChannelBackend::new(TransportKind::Tcp);
    let address = backend.listen().unwrap();
    let (client, transport) = tokio::join!(
        Connection::connect(&address, WAIT),
        backend.accept(Some(WAIT))
    );
    let mut ctx = WorkerContext::new(name, Connection::from_transport(transport.unwrap()), &settings);
    if let Some(pool) = pool {
        ctx = ctx.with_pool(pool);
    }
    let worker = tokio::spawn(WorkerRuntime::new(protocol, ctx).run());
    (client.unwrap(), worker)
}

/// Accept the worker's next connection on `backend`.
async fn accept(backend: &ChannelBackend) -> Connection {
    Connection::from_transport(backend.accept(Some(WAIT)).await.unwrap())
}

async fn send(conn: &mut Connection, request: Request) {
    conn.send(request.code().as_u8(), request.encode().unwrap())
        .await
        .unwrap();
}

async fn reply(conn: &mut Connection) -> Reply {
    let frame = tokio::time::timeout(WAIT, conn.receive())
        .await
        .expect("timed out waiting for a reply")
        .unwrap()
        .expect("worker closed the channel");
    Reply::decode(frame.code, &frame.payload).unwrap()
}

/// Replies up to and including the terminal one.
async fn until_terminal(conn: &mut Connection) -> Vec<Reply> {
    let mut replies = Vec::new();
    loop {
        let next = reply(conn).await;
        let done = matches!(next, Reply::Finished | Reply::Error { .. });
        replies.push(next);
        if done {
            return replies;
        }
    }
}

fn host(name: &str) -> HostArgs {
    HostArgs {
        host: name.to_string(),
        ..HostArgs::default()
    }
}

async fn status(conn: &mut Connection) -> ioworker::protocol::WorkerStatusReport {
    send(conn, Request::WorkerStatus).await;
    match reply(conn).await {
        Reply::WorkerStatus(report) => report,
        other => panic!("expected a status report, got {other:?}"),
    }
}

#[tokio::test]
async fn test_file_get_streams_after_mime_type() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, b"hello world").unwrap();

    let (mut client, worker) = serve(FileWorker, file::PROTOCOL, WorkerSettings::default()).await;
    send(&mut client, Request::Get(Locator::file(&path))).await;

    assert_eq!(reply(&mut client).await, Reply::MimeType("text/plain".to_string()));
    send(&mut client, Request::None).await;

    let replies = until_terminal(&mut client).await;
    assert_eq!(replies.first(), Some(&Reply::TotalSize(11)));
    assert_eq!(replies.last(), Some(&Reply::Finished));
    let data: Vec<u8> = replies
        .iter()
        .filter_map(|r| match r {
            Reply::Data(bytes) => Some(bytes.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(data, b"hello world");
    assert!(replies.contains(&Reply::Data(Vec::new())));

    client.close().await;
    tokio::time::timeout(WAIT, worker).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_status_reports_protocol_and_host() {
    let (mut client, _worker) = serve(Latch::default(), "latch", WorkerSettings::default()).await;

    send(&mut client, Request::Host(host("alpha"))).await;
    let report = status(&mut client).await;
    assert_eq!(report.protocol, "latch");
    assert_eq!(report.host, "alpha");
    assert_eq!(report.pid, std::process::id());
    assert!(!report.connected);
    assert!(report.on_hold.is_none());

    send(&mut client, Request::Connect).await;
    assert_eq!(reply(&mut client).await, Reply::Connected);
    assert!(status(&mut client).await.connected);

    send(&mut client, Request::Disconnect).await;
    assert!(!status(&mut client).await.connected);
}

#[tokio::test]
async fn test_host_change_waits_for_the_running_operation() {
    let (mut client, _worker) = serve(Latch::default(), "latch", WorkerSettings::default()).await;

    send(&mut client, Request::Host(host("a"))).await;
    send(&mut client, Request::Get("latch://a/f".parse().unwrap())).await;
    assert!(matches!(reply(&mut client).await, Reply::MimeType(_)));
    send(&mut client, Request::None).await;
    assert_eq!(reply(&mut client).await, Reply::DataReq);

    send(&mut client, Request::Host(host("b"))).await;
    assert_eq!(status(&mut client).await.host, "a");

    send(&mut client, Request::Data(b"chunk".to_vec())).await;
    let replies = until_terminal(&mut client).await;
    assert_eq!(
        replies,
        vec![
            Reply::Data(b"chunk".to_vec()),
            Reply::Data(Vec::new()),
            Reply::Finished
        ]
    );
    assert_eq!(status(&mut client).await.host, "b");
}

#[tokio::test]
async fn test_host_ignored_during_mime_type_pause() {
    let (mut client, _worker) = serve(Latch::default(), "latch", WorkerSettings::default()).await;

    send(&mut client, Request::Host(host("a"))).await;
    send(&mut client, Request::Get("latch://a/f".parse().unwrap())).await;
    assert!(matches!(reply(&mut client).await, Reply::MimeType(_)));

    send(&mut client, Request::Host(host("elsewhere"))).await;
    send(&mut client, Request::None).await;
    assert_eq!(reply(&mut client).await, Reply::DataReq);
    send(&mut client, Request::Data(Vec::new())).await;
    until_terminal(&mut client).await;

    assert_eq!(status(&mut client).await.host, "a");
}

#[tokio::test]
async fn test_unsupported_operation_is_an_error_reply() {
    let (mut client, _worker) = serve(FileWorker, file::PROTOCOL, WorkerSettings::default()).await;

    send(&mut client, Request::Special(b"\x01\x02".to_vec())).await;
    match reply(&mut client).await {
        Reply::Error { code, .. } => assert_eq!(code, ErrorCode::UnsupportedAction),
        other => panic!("expected an error, got {other:?}"),
    }

    // The loop keeps serving after an operation error.
    let report = status(&mut client).await;
    assert_eq!(report.protocol, "file");
}

#[tokio::test]
async fn test_listing_is_sent_in_batches() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a", "b", "c", "d", "e"] {
        std::fs::write(dir.path().join(name), name).unwrap();
    }
    let settings = WorkerSettings {
        list_batch_initial: 2,
        list_flush_slow_ms: 60_000,
        list_flush_fast_ms: 0,
        ..WorkerSettings::default()
    };

    let (mut client, _worker) = serve(FileWorker, file::PROTOCOL, settings).await;
    send(&mut client, Request::ListDir(Locator::file(dir.path()))).await;
    let replies = until_terminal(&mut client).await;

    let batches: Vec<usize> = replies
        .iter()
        .filter_map(|r| match r {
            Reply::ListEntries(entries) => Some(entries.len()),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![3, 2]);

    let mut names: Vec<String> = replies
        .iter()
        .filter_map(|r| match r {
            Reply::ListEntries(entries) => Some(entries.iter().map(|e| e.name.clone())),
            _ => None,
        })
        .flatten()
        .collect();
    names.sort();
    assert_eq!(names, ["a", "b", "c", "d", "e"]);

    assert!(replies.contains(&Reply::TotalSize(5)));
    assert_eq!(replies.last(), Some(&Reply::Finished));
}

#[tokio::test]
async fn test_worker_exits_when_client_leaves() {
    let (mut client, worker) = serve(Latch::default(), "latch", WorkerSettings::default()).await;
    let report = status(&mut client).await;
    assert_eq!(report.protocol, "latch");

    client.close().await;
    let result = tokio::time::timeout(WAIT, worker).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_worker_connect_moves_to_new_client() {
    let (mut client, _worker) = serve(Latch::default(), "latch", WorkerSettings::default()).await;
    send(&mut client, Request::Host(host("alpha"))).await;

    let mut next = ChannelBackend::new(TransportKind::Tcp);
    let address = next.listen().unwrap();
    send(&mut client, Request::WorkerConnect(address.to_string())).await;
    assert_eq!(reply(&mut client).await, Reply::WorkerAck);

    let mut adopted = accept(&next).await;
    let report = status(&mut adopted).await;
    assert_eq!(report.host, "alpha");
    assert!(report.on_hold.is_none());

    let old = tokio::time::timeout(WAIT, client.receive()).await.unwrap();
    assert!(matches!(old, Ok(None)), "old client still attached: {old:?}");
}

#[tokio::test]
async fn test_worker_hold_parks_on_pool_endpoint() {
    let mut pool = ChannelBackend::new(TransportKind::Tcp);
    let pool_address = pool.listen().unwrap();
    let (mut client, _worker) = serve_with_pool(
        Latch::default(),
        "latch",
        WorkerSettings::default(),
        Some(pool_address),
    )
    .await;

    let target: Locator = "latch://a/movie".parse().unwrap();
    send(&mut client, Request::WorkerHold(target.clone())).await;

    let mut pooled = accept(&pool).await;
    assert_eq!(status(&mut pooled).await.on_hold, Some(target));
}

#[tokio::test]
async fn test_worker_returns_to_pool_when_client_leaves() {
    let mut pool = ChannelBackend::new(TransportKind::Tcp);
    let pool_address = pool.listen().unwrap();
    let (mut client, worker) = serve_with_pool(
        Latch::default(),
        "latch",
        WorkerSettings::default(),
        Some(pool_address),
    )
    .await;

    send(&mut client, Request::Host(host("alpha"))).await;
    assert_eq!(status(&mut client).await.host, "alpha");
    client.close().await;

    let mut pooled = accept(&pool).await;
    assert_eq!(status(&mut pooled).await.host, "alpha");
    assert!(!worker.is_finished());

    // With the pool gone too the worker stops.
    pooled.close().await;
    tokio::time::timeout(WAIT, worker).await.unwrap().unwrap().unwrap();
}
