use db::Oid;
use processor::request::Request;
use processor::{monitor, mq};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{Duration, sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_idle_blocks_until_tracker_empties() {
    let uri = "local://monitor-wait-idle";
    let mon = monitor::start(uri).unwrap();
    let sid = Oid::new();
    let fid = Oid::new();
    mq::change_status(uri, &Request::start_submission(sid)).unwrap();
    mq::change_status(uri, &Request::add_file(sid, fid)).unwrap();
    sleep(Duration::from_millis(100)).await;

    let returned = Arc::new(AtomicUsize::new(0));
    let mut waiters = Vec::new();
    for _ in 0..5 {
        let returned = Arc::clone(&returned);
        waiters.push(tokio::spawn(async move {
            mq::wait_idle(uri).await.unwrap();
            returned.fetch_add(1, Ordering::SeqCst);
        }));
    }
    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        returned.load(Ordering::SeqCst),
        0,
        "no waiter may return while a submission is outstanding"
    );

    mq::change_status(uri, &Request::remove_file(sid, fid)).unwrap();
    mq::change_status(uri, &Request::stop_submission(sid)).unwrap();

    let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
        .await
        .expect("every waiter must be released once the tracker is idle");
    for r in results {
        r.unwrap();
    }
    assert_eq!(returned.load(Ordering::SeqCst), 5);

    mon.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_idle_returns_immediately_when_idle() {
    let uri = "local://monitor-already-idle";
    let mon = monitor::start(uri).unwrap();
    timeout(Duration::from_secs(2), mq::wait_idle(uri))
        .await
        .expect("an idle pipeline must release waiters at once")
        .unwrap();
    mon.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_status_snapshots_the_tracker() {
    let uri = "local://monitor-status";
    let mon = monitor::start(uri).unwrap();
    let sid = Oid::new();
    let f1 = Oid::new();
    let f2 = Oid::new();
    mq::change_status(uri, &Request::start_submission(sid)).unwrap();
    mq::change_status(uri, &Request::add_file(sid, f1)).unwrap();
    mq::change_status(uri, &Request::add_file(sid, f2)).unwrap();
    sleep(Duration::from_millis(100)).await;

    let status = mq::get_status(uri).await.unwrap();
    assert_eq!(status.file_count, 2);
    assert_eq!(status.submissions[&sid.hex()].len(), 2);

    // At-least-once delivery: a duplicate add is rejected by the tracker
    // and must not change the counts.
    mq::change_status(uri, &Request::add_file(sid, f1)).unwrap();
    sleep(Duration::from_millis(100)).await;
    let status = mq::get_status(uri).await.unwrap();
    assert_eq!(status.file_count, 2);

    mon.shutdown().await.unwrap();
}
