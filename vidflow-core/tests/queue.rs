use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use vidflow_core::queue::JobFilter;
use vidflow_core::{JobQueue, JobStatus, QueueError};

const LEASE: Duration = Duration::from_secs(120);

fn temp_queue(dir: &Path) -> JobQueue {
    let queue = JobQueue::builder()
        .path(dir.join("jobs.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create queue");
    queue.initialize().expect("initialize queue");
    queue
}

#[test]
fn jobs_are_claimed_in_arrival_order() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    for id in ["a", "b", "c"] {
        assert!(queue.enqueue(id).unwrap().is_some());
    }

    let first = queue.claim_next("w1", LEASE).unwrap().unwrap();
    let second = queue.claim_next("w2", LEASE).unwrap().unwrap();
    assert_eq!(first.video_id, "a");
    assert_eq!(second.video_id, "b");
    assert_eq!(first.status, JobStatus::Active);
    assert_eq!(first.worker.as_deref(), Some("w1"));
    assert_eq!(first.attempts, 1);

    let counts = queue.counts().unwrap();
    assert_eq!((counts.queued, counts.active), (1, 2));
}

#[test]
fn duplicate_enqueue_is_ignored_while_job_exists() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    assert!(queue.enqueue("a").unwrap().is_some());
    assert!(queue.enqueue("a").unwrap().is_none());

    let job = queue.claim_next("w1", LEASE).unwrap().unwrap();
    assert!(queue.enqueue("a").unwrap().is_none());
    queue.complete(job.id).unwrap();
    assert!(queue.enqueue("a").unwrap().is_some());
}

#[test]
fn only_queued_jobs_can_be_removed() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    queue.enqueue("a").unwrap();
    queue.enqueue("b").unwrap();
    queue.claim_next("w1", LEASE).unwrap();

    assert!(!queue.remove_queued("a").unwrap());
    assert!(queue.remove_queued("b").unwrap());
    let remaining = queue.list(&JobFilter::default()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].video_id, "a");
}

#[test]
fn live_leases_survive_recovery() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    queue.enqueue("a").unwrap();
    let held = queue.claim_next("busy", LEASE).unwrap().unwrap();

    assert_eq!(queue.recover_stale().unwrap(), 0);
    assert!(queue.claim_next("w2", LEASE).unwrap().is_none());
    let job = queue.find_by_video("a").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.worker.as_deref(), Some("busy"));
    assert_eq!(job.id, held.id);
}

#[test]
fn expired_leases_are_requeued() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    queue.enqueue("a").unwrap();
    queue.enqueue("b").unwrap();
    queue.claim_next("crashed", LEASE).unwrap();

    let later = chrono::Utc::now() + chrono::Duration::seconds(600);
    assert_eq!(queue.recover_expired(later).unwrap(), 1);
    let again = queue.claim_next("w2", LEASE).unwrap().unwrap();
    assert_eq!(again.video_id, "a");
    assert_eq!(again.attempts, 2);
    assert!(again.is_redelivery());
}

#[test]
fn completing_an_unknown_job_is_not_found() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    let err = queue.complete(42).unwrap_err();
    assert!(matches!(err, QueueError::NotFound(42)));
    assert!(queue.claim_next("w1", LEASE).unwrap().is_none());
}
