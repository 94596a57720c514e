//! Worker lifecycle: eviction, death, cancellation, hold and teardown.

#[path = "../common/mod.rs"]
mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use ioworker::connection::{ChannelBackend, Connection, TransportKind};
use ioworker::protocol::{CommandCode, Reply, Request};
use ioworker::scheduler::{
    InProcessLauncher, Job, JobError, JobEvent, LaunchError, Launcher, Scheduler, SchedulerError,
    SchedulerOptions, Spawned,
};

/// Starts workers that answer every operation with an unassigned result
/// code.
struct GarbledLauncher {
    socket_dir: PathBuf,
}

#[async_trait]
impl Launcher for GarbledLauncher {
    async fn spawn(&self, _protocol: &str, _host_hint: &str) -> Result<Spawned, LaunchError> {
        let mut backend = ChannelBackend::new(TransportKind::Local).with_socket_dir(self.socket_dir.clone());
        let address = backend.listen()?;
        tokio::spawn(async move {
            let Ok(transport) = backend.accept(Some(WAIT)).await else {
                return;
            };
            let mut conn = Connection::from_transport(transport);
            while let Ok(Some(frame)) = conn.receive().await {
                if CommandCode::from_u8(frame.code).is_some_and(CommandCode::is_operation) {
                    let _ = conn.send(0xee, Vec::new()).await;
                }
            }
        });
        Ok(Spawned { pid: 7, address })
    }

    async fn terminate(&self, _pid: u32) {}
}

#[tokio::test]
async fn test_idle_worker_evicted_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions::default().with_idle_timeout(Duration::from_millis(200));
    let (scheduler, launcher) = start(dir.path(), options);

    scheduler.submit(Job::stat(locator("latch://a/f"))).unwrap().wait().await.unwrap();
    let snapshot = scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.idle_count("latch"), 1);

    let snapshot = wait_for(&scheduler, |s| s.workers == 0).await;
    assert_eq!(snapshot.idle_count("latch"), 0);

    let deadline = tokio::time::Instant::now() + WAIT;
    while !launcher.live_pids().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "worker task still running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_busy_worker_not_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions::default().with_idle_timeout(Duration::from_millis(50));
    let (scheduler, _launcher) = start(dir.path(), options);

    let mut job = scheduler.submit(Job::get(locator("latch://a/f"))).unwrap();
    wait_data_request(&mut job).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    job.send_data(b"still here".to_vec()).unwrap();
    assert_eq!(job.wait().await.unwrap().data, b"still here");
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_death_fails_bound_job() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());

    let mut job = scheduler.submit(Job::get(locator("latch://a/f"))).unwrap();
    let (_, pid) = assigned(&mut job).await;
    wait_data_request(&mut job).await;

    launcher.terminate(pid).await;
    assert_eq!(finished(&mut job).await, JobEvent::Finished(Err(JobError::WorkerDied)));

    let snapshot = wait_for(&scheduler, |s| s.workers == 0).await;
    assert_eq!(snapshot.active_count("latch"), 0);

    // The pool recovers with a fresh worker.
    scheduler.submit(Job::stat(locator("latch://a/f"))).unwrap().wait().await.unwrap();
    assert_eq!(launcher.spawn_count(), 2);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_death_frees_capacity_for_queued_job() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions::default().with_max_workers(1);
    let (scheduler, launcher) = start(dir.path(), options);

    let mut first = scheduler.submit(Job::get(locator("latch://a/f"))).unwrap();
    let (_, pid) = assigned(&mut first).await;
    let queued = scheduler.submit(Job::stat(locator("latch://a/g"))).unwrap();
    wait_for(&scheduler, |s| s.queued_count("latch") == 1).await;

    launcher.terminate(pid).await;
    assert_eq!(finished(&mut first).await, JobEvent::Finished(Err(JobError::WorkerDied)));
    let output = queued.wait().await.unwrap();
    assert_eq!(output.stat.unwrap().name, "g");
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_bound_job_kills_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());

    let mut job = scheduler.submit(Job::get(locator("latch://a/f"))).unwrap();
    let (_, pid) = assigned(&mut job).await;
    wait_data_request(&mut job).await;

    job.cancel().unwrap();
    assert_eq!(finished(&mut job).await, JobEvent::Finished(Err(JobError::Cancelled)));
    assert_eq!(job.next_event().await, None);

    wait_for(&scheduler, |s| s.workers == 0).await;
    let deadline = tokio::time::Instant::now() + WAIT;
    while launcher.live_pids().contains(&pid) {
        assert!(tokio::time::Instant::now() < deadline, "cancelled worker still running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions::default().with_max_workers(1);
    let (scheduler, _launcher) = start(dir.path(), options);

    let mut running = scheduler.submit(Job::get(locator("latch://a/f"))).unwrap();
    wait_data_request(&mut running).await;
    let mut queued = scheduler.submit(Job::stat(locator("latch://a/g"))).unwrap();
    wait_for(&scheduler, |s| s.queued_count("latch") == 1).await;

    queued.cancel().unwrap();
    assert_eq!(finished(&mut queued).await, JobEvent::Finished(Err(JobError::Cancelled)));
    let snapshot = wait_for(&scheduler, |s| s.queued_count("latch") == 0).await;
    assert_eq!(snapshot.active_count("latch"), 1);

    // Cancelling twice is a no-op.
    queued.cancel().unwrap();

    running.send_data(Vec::new()).unwrap();
    running.wait().await.unwrap();
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_held_worker_serves_matching_get() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());
    let target = locator("latch://a/movie");

    let mut preview = scheduler
        .submit(Job::get(target.clone()).hold_on_mime_type(true))
        .unwrap();
    let (worker, _) = assigned(&mut preview).await;
    expect_event(&mut preview, |e| matches!(e, JobEvent::MimeType(_))).await;

    scheduler.put_worker_on_hold(preview.id(), target.clone()).await.unwrap();
    assert_eq!(finished(&mut preview).await, JobEvent::Finished(Ok(())));

    let snapshot = scheduler.snapshot().await.unwrap();
    let held = snapshot.held.as_ref().expect("worker on hold");
    assert_eq!(held.worker.id, worker);
    assert_eq!(held.locator, target);
    assert_eq!(snapshot.active_count("latch"), 0);
    assert_eq!(snapshot.idle_count("latch"), 0);

    let mut fetch = scheduler.submit(Job::get(target.clone())).unwrap();
    assert_eq!(assigned(&mut fetch).await.0, worker);
    wait_data_request(&mut fetch).await;
    fetch.send_data(b"frames".to_vec()).unwrap();
    let output = fetch.wait().await.unwrap();
    assert_eq!(output.data, b"frames");
    assert_eq!(launcher.spawn_count(), 1);

    let snapshot = wait_for(&scheduler, |s| s.idle_count("latch") == 1).await;
    assert!(snapshot.held.is_none());
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_hold_replaces_first() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());

    let mut first = scheduler
        .submit(Job::get(locator("latch://a/one")).hold_on_mime_type(true))
        .unwrap();
    let (_, first_pid) = assigned(&mut first).await;
    expect_event(&mut first, |e| matches!(e, JobEvent::MimeType(_))).await;

    let mut second = scheduler
        .submit(Job::get(locator("latch://a/two")).hold_on_mime_type(true))
        .unwrap();
    let (second_worker, _) = assigned(&mut second).await;
    expect_event(&mut second, |e| matches!(e, JobEvent::MimeType(_))).await;

    scheduler.put_worker_on_hold(first.id(), locator("latch://a/one")).await.unwrap();
    scheduler.put_worker_on_hold(second.id(), locator("latch://a/two")).await.unwrap();

    let snapshot = scheduler.snapshot().await.unwrap();
    let held = snapshot.held.expect("worker on hold");
    assert_eq!(held.worker.id, second_worker);
    assert_eq!(held.locator, locator("latch://a/two"));
    assert_eq!(snapshot.workers, 1);

    let deadline = tokio::time::Instant::now() + WAIT;
    while launcher.live_pids().contains(&first_pid) {
        assert!(tokio::time::Instant::now() < deadline, "replaced held worker still running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_non_matching_job_discards_held_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());

    let mut preview = scheduler
        .submit(Job::get(locator("latch://a/one")).hold_on_mime_type(true))
        .unwrap();
    expect_event(&mut preview, |e| matches!(e, JobEvent::MimeType(_))).await;
    scheduler.put_worker_on_hold(preview.id(), locator("latch://a/one")).await.unwrap();

    let output = scheduler
        .submit(Job::stat(locator("latch://a/other")))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(output.stat.unwrap().name, "other");
    assert_eq!(launcher.spawn_count(), 2);

    let snapshot = wait_for(&scheduler, |s| s.workers == 1).await;
    assert!(snapshot.held.is_none());
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_worker_on_hold() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, _launcher) = start(dir.path(), SchedulerOptions::default());

    let mut preview = scheduler
        .submit(Job::get(locator("latch://a/one")).hold_on_mime_type(true))
        .unwrap();
    expect_event(&mut preview, |e| matches!(e, JobEvent::MimeType(_))).await;
    scheduler.put_worker_on_hold(preview.id(), locator("latch://a/one")).await.unwrap();

    scheduler.remove_worker_on_hold().unwrap();
    let snapshot = wait_for(&scheduler, |s| s.held.is_none()).await;
    assert_eq!(snapshot.workers, 0);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hold_requires_bound_job() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions::default().with_max_workers(1);
    let (scheduler, _launcher) = start(dir.path(), options);

    let mut running = scheduler.submit(Job::get(locator("latch://a/f"))).unwrap();
    wait_data_request(&mut running).await;
    let queued = scheduler.submit(Job::stat(locator("latch://a/g"))).unwrap();
    wait_for(&scheduler, |s| s.queued_count("latch") == 1).await;

    let err = scheduler
        .put_worker_on_hold(queued.id(), locator("latch://a/g"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NotBound(id) if id == queued.id()));

    running.send_data(Vec::new()).unwrap();
    finished(&mut running).await;
    let err = scheduler
        .put_worker_on_hold(running.id(), locator("latch://a/f"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownJob(_)));

    queued.wait().await.unwrap();
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reparse_configuration_resends_config() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());

    scheduler.submit(Job::stat(locator("latch://a/f"))).unwrap().wait().await.unwrap();
    scheduler.reparse_configuration(Some("latch")).unwrap();

    let snapshot = scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.pool("latch").unwrap().idle[0].key, None);

    let output = scheduler
        .submit(Job::stat(locator("latch://a/g")))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(output.stat.unwrap().extra["host"], "a");
    assert_eq!(launcher.spawn_count(), 1);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_everything() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions::default().with_max_workers(1);
    let (scheduler, launcher) = start(dir.path(), options);

    let mut running = scheduler.submit(Job::get(locator("latch://a/f"))).unwrap();
    wait_data_request(&mut running).await;
    let mut queued = scheduler.submit(Job::stat(locator("latch://a/g"))).unwrap();
    wait_for(&scheduler, |s| s.queued_count("latch") == 1).await;

    scheduler.shutdown().await.unwrap();

    assert_eq!(finished(&mut running).await, JobEvent::Finished(Err(JobError::Cancelled)));
    assert_eq!(finished(&mut queued).await, JobEvent::Finished(Err(JobError::Cancelled)));

    let deadline = tokio::time::Instant::now() + WAIT;
    while scheduler.is_running() || !launcher.live_pids().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "scheduler did not stop");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(
        scheduler.submit(Job::stat(locator("latch://a/h"))),
        Err(SchedulerError::Stopped)
    ));
    assert!(matches!(scheduler.shutdown().await, Err(SchedulerError::Stopped)));
}

#[tokio::test]
async fn test_invalid_reply_fails_job_with_internal_error() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(GarbledLauncher {
        socket_dir: dir.path().to_path_buf(),
    });
    let scheduler = Scheduler::start(SchedulerOptions::default(), launcher);

    let job = scheduler.submit(Job::stat(locator("latch://a/f"))).unwrap();
    let result = tokio::time::timeout(WAIT, job.wait()).await.expect("job never resolved");
    assert!(matches!(result, Err(JobError::Internal(_))), "{result:?}");

    let snapshot = wait_for(&scheduler, |s| s.workers == 0).await;
    assert_eq!(snapshot.active_count("latch"), 0);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unusable_held_worker_killed_while_pool_is_full() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions::default().with_max_workers(1);
    let (scheduler, launcher) = start(dir.path(), options);

    let mut preview = scheduler
        .submit(Job::get(locator("latch://a/movie")).hold_on_mime_type(true))
        .unwrap();
    let (_, held_pid) = assigned(&mut preview).await;
    expect_event(&mut preview, |e| matches!(e, JobEvent::MimeType(_))).await;

    let mut direct = scheduler.submit_direct(Job::get(locator("latch://a/d"))).unwrap();
    wait_data_request(&mut direct).await;
    let queued = scheduler.submit(Job::stat(locator("latch://a/other"))).unwrap();
    wait_for(&scheduler, |s| s.queued_count("latch") == 1).await;

    scheduler.put_worker_on_hold(preview.id(), locator("latch://a/movie")).await.unwrap();
    let snapshot = wait_for(&scheduler, |s| s.held.is_none()).await;
    assert_eq!(snapshot.queued_count("latch"), 1);
    assert_eq!(snapshot.active_count("latch"), 1);
    assert_eq!(snapshot.workers, 1);

    let deadline = tokio::time::Instant::now() + WAIT;
    while launcher.live_pids().contains(&held_pid) {
        assert!(tokio::time::Instant::now() < deadline, "unusable held worker still running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    direct.send_data(Vec::new()).unwrap();
    finished(&mut direct).await;
    let output = queued.wait().await.unwrap();
    assert_eq!(output.stat.unwrap().name, "other");
    assert_eq!(launcher.spawn_count(), 2);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_published_hold_moves_worker_to_pool_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = ChannelBackend::new(TransportKind::Local).with_socket_dir(dir.path());
    let pool_address = pool.listen().unwrap();
    let launcher = Arc::new(
        InProcessLauncher::new(TransportKind::Local)
            .with_socket_dir(dir.path())
            .with_pool_address(pool_address)
            .register("latch", Latch::default),
    );
    let scheduler = Scheduler::start(SchedulerOptions::default(), launcher.clone());
    let target = locator("latch://a/movie");

    let mut preview = scheduler
        .submit(Job::get(target.clone()).hold_on_mime_type(true))
        .unwrap();
    expect_event(&mut preview, |e| matches!(e, JobEvent::MimeType(_))).await;
    scheduler.put_worker_on_hold(preview.id(), target.clone()).await.unwrap();

    scheduler.publish_worker_on_hold().unwrap();
    let snapshot = wait_for(&scheduler, |s| s.held.is_none()).await;
    assert_eq!(snapshot.workers, 0);

    let transport = pool.accept(Some(WAIT)).await.unwrap();
    let mut pooled = Connection::from_transport(transport);
    let request = Request::WorkerStatus;
    pooled
        .send(request.code().as_u8(), request.encode().unwrap())
        .await
        .unwrap();
    let frame = tokio::time::timeout(WAIT, pooled.receive())
        .await
        .expect("no status from the published worker")
        .unwrap()
        .expect("published worker closed the channel");
    match Reply::decode(frame.code, &frame.payload).unwrap() {
        Reply::WorkerStatus(report) => assert_eq!(report.on_hold, Some(target)),
        other => panic!("expected a status report, got {other:?}"),
    }

    // Published, not killed.
    assert_eq!(launcher.live_pids().len(), 1);
    scheduler.shutdown().await.unwrap();
}
