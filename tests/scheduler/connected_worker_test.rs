//! Workers reserved for one caller through `get_connected_worker`.

#[path = "../common/mod.rs"]
mod common;

use common::*;
use ioworker::protocol::MetaData;
use ioworker::scheduler::{ConnectedEvent, Job, JobError, JobEvent, Launcher, SchedulerError, SchedulerOptions};

async fn next_connected_event(worker: &mut ioworker::scheduler::ConnectedWorker) -> ConnectedEvent {
    tokio::time::timeout(WAIT, worker.next_event())
        .await
        .expect("timed out waiting for connected worker event")
        .expect("connected worker event stream ended")
}

#[tokio::test]
async fn test_connect_run_and_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());

    let mut worker = scheduler
        .get_connected_worker(locator("latch://server/"), MetaData::new())
        .await
        .unwrap();
    assert_eq!(next_connected_event(&mut worker).await, ConnectedEvent::Connected);

    let snapshot = scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.connected.len(), 1);
    assert_eq!(snapshot.connected[0].id, worker.id());
    assert_eq!(snapshot.active_count("latch"), 0);

    let first = scheduler
        .assign_job_to_worker(worker.id(), Job::stat(locator("latch://server/a")))
        .await
        .unwrap();
    let second = scheduler
        .assign_job_to_worker(worker.id(), Job::stat(locator("latch://server/b")))
        .await
        .unwrap();
    let a = first.wait().await.unwrap();
    let b = second.wait().await.unwrap();
    assert_eq!(a.worker, Some(worker.id()));
    assert_eq!(a.stat.unwrap().extra["served"], "1");
    assert_eq!(b.stat.unwrap().extra["served"], "2");

    scheduler.disconnect_worker(worker.id()).await.unwrap();
    let snapshot = scheduler.snapshot().await.unwrap();
    assert!(snapshot.connected.is_empty());
    assert_eq!(snapshot.idle_count("latch"), 1);

    // Back in the pool, the worker serves ordinary jobs.
    let output = scheduler
        .submit(Job::stat(locator("latch://server/c")))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(output.worker, Some(worker.id()));
    assert_eq!(launcher.spawn_count(), 1);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_jobs_assigned_before_connected_wait() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, _launcher) = start(dir.path(), SchedulerOptions::default());

    let mut worker = scheduler
        .get_connected_worker(locator("latch://server/"), MetaData::new())
        .await
        .unwrap();
    let job = scheduler
        .assign_job_to_worker(worker.id(), Job::stat(locator("latch://server/a")))
        .await
        .unwrap();

    assert_eq!(next_connected_event(&mut worker).await, ConnectedEvent::Connected);
    let output = job.wait().await.unwrap();
    assert_eq!(output.stat.unwrap().name, "a");
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connected_worker_ignores_cap() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions::default().with_max_workers(1);
    let (scheduler, launcher) = start(dir.path(), options);

    let mut running = scheduler.submit(Job::get(locator("latch://a/f"))).unwrap();
    wait_data_request(&mut running).await;

    let mut worker = scheduler
        .get_connected_worker(locator("latch://server/"), MetaData::new())
        .await
        .unwrap();
    assert_eq!(next_connected_event(&mut worker).await, ConnectedEvent::Connected);
    assert_eq!(launcher.spawn_count(), 2);

    running.send_data(Vec::new()).unwrap();
    running.wait().await.unwrap();
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connected_worker_takes_idle_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());

    scheduler.submit(Job::stat(locator("latch://a/f"))).unwrap().wait().await.unwrap();
    let mut worker = scheduler
        .get_connected_worker(locator("latch://server/"), MetaData::new())
        .await
        .unwrap();
    assert_eq!(next_connected_event(&mut worker).await, ConnectedEvent::Connected);

    let snapshot = scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.idle_count("latch"), 0);
    assert_eq!(launcher.spawn_count(), 1);

    let output = scheduler
        .assign_job_to_worker(worker.id(), Job::stat(locator("latch://server/x")))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(output.stat.unwrap().extra["host"], "server");
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_assign_rejects_other_protocol_and_unknown_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, _launcher) = start(dir.path(), SchedulerOptions::default());

    let worker = scheduler
        .get_connected_worker(locator("latch://server/"), MetaData::new())
        .await
        .unwrap();

    let err = scheduler
        .assign_job_to_worker(worker.id(), Job::stat(locator("file:///tmp")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::ProtocolMismatch { ref expected, ref actual, .. }
            if expected == "latch" && actual == "file"
    ));

    // A pooled worker is not a connected worker.
    scheduler.disconnect_worker(worker.id()).await.unwrap();
    let err = scheduler
        .assign_job_to_worker(worker.id(), Job::stat(locator("latch://server/a")))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownWorker(id) if id == worker.id()));
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connected_worker_death_fails_its_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, launcher) = start(dir.path(), SchedulerOptions::default());

    let mut worker = scheduler
        .get_connected_worker(locator("latch://server/"), MetaData::new())
        .await
        .unwrap();
    assert_eq!(next_connected_event(&mut worker).await, ConnectedEvent::Connected);

    let mut running = scheduler
        .assign_job_to_worker(worker.id(), Job::get(locator("latch://server/a")))
        .await
        .unwrap();
    let mut waiting = scheduler
        .assign_job_to_worker(worker.id(), Job::stat(locator("latch://server/b")))
        .await
        .unwrap();
    wait_data_request(&mut running).await;

    launcher.terminate(worker.pid()).await;
    assert_eq!(next_connected_event(&mut worker).await, ConnectedEvent::Died);
    assert_eq!(finished(&mut running).await, JobEvent::Finished(Err(JobError::WorkerDied)));
    assert_eq!(finished(&mut waiting).await, JobEvent::Finished(Err(JobError::WorkerDied)));

    let snapshot = wait_for(&scheduler, |s| s.workers == 0).await;
    assert!(snapshot.connected.is_empty());
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_cancels_queued_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let (scheduler, _launcher) = start(dir.path(), SchedulerOptions::default());

    let mut worker = scheduler
        .get_connected_worker(locator("latch://server/"), MetaData::new())
        .await
        .unwrap();
    assert_eq!(next_connected_event(&mut worker).await, ConnectedEvent::Connected);

    let mut running = scheduler
        .assign_job_to_worker(worker.id(), Job::get(locator("latch://server/a")))
        .await
        .unwrap();
    let mut queued = scheduler
        .assign_job_to_worker(worker.id(), Job::stat(locator("latch://server/b")))
        .await
        .unwrap();
    wait_data_request(&mut running).await;

    scheduler.disconnect_worker(worker.id()).await.unwrap();
    assert_eq!(finished(&mut queued).await, JobEvent::Finished(Err(JobError::Cancelled)));
    assert_eq!(finished(&mut running).await, JobEvent::Finished(Err(JobError::Cancelled)));

    let snapshot = wait_for(&scheduler, |s| s.workers == 0).await;
    assert!(snapshot.connected.is_empty());
    scheduler.shutdown().await.unwrap();
}
