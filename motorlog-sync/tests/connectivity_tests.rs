use motorlog_sync::{ReachableEdge, connectivity_monitor};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const DWELL: Duration = Duration::from_millis(50);

#[tokio::test]
async fn starts_at_initial_state() {
    let (online, _) = connectivity_monitor(true, DWELL);
    let (offline, _) = connectivity_monitor(false, DWELL);
    assert!(online.is_online());
    assert!(!offline.is_online());
}

#[tokio::test]
async fn change_commits_after_dwell() {
    let (monitor, debouncer) = connectivity_monitor(false, DWELL);
    tokio::spawn(debouncer.run());
    let mut edges = monitor.subscribe_edges();

    monitor.report(true);
    assert!(!monitor.is_online(), "committed before the dwell elapsed");

    let mut rx = monitor.subscribe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| *v))
        .await
        .unwrap()
        .unwrap();
    assert!(monitor.is_online());
    assert_eq!(edges.recv().await.unwrap(), ReachableEdge);
}

#[tokio::test]
async fn flap_shorter_than_dwell_is_ignored() {
    let (monitor, debouncer) = connectivity_monitor(true, Duration::from_millis(200));
    tokio::spawn(debouncer.run());
    let mut edges = monitor.subscribe_edges();

    monitor.report(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    monitor.report(true);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(monitor.is_online());
    assert!(matches!(edges.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn going_offline_publishes_no_edge() {
    let (monitor, debouncer) = connectivity_monitor(true, DWELL);
    tokio::spawn(debouncer.run());
    let mut edges = monitor.subscribe_edges();

    monitor.report(false);
    let mut rx = monitor.subscribe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| !*v))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(edges.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn each_recovery_publishes_one_edge() {
    let (monitor, debouncer) = connectivity_monitor(false, Duration::from_millis(10));
    tokio::spawn(debouncer.run());
    let mut edges = monitor.subscribe_edges();
    let mut rx = monitor.subscribe();

    for _ in 0..2 {
        monitor.report(true);
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| *v))
            .await
            .unwrap()
            .unwrap();
        monitor.report(false);
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| !*v))
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(edges.try_recv().unwrap(), ReachableEdge);
    assert_eq!(edges.try_recv().unwrap(), ReachableEdge);
    assert!(matches!(edges.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn repeated_reports_do_not_restart_the_dwell() {
    let (monitor, debouncer) = connectivity_monitor(false, Duration::from_millis(60));
    tokio::spawn(debouncer.run());

    monitor.report(true);
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.report(true);
    }

    assert!(monitor.is_online());
}
