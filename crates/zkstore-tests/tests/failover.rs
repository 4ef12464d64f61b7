//! Failover behavior under membership change, session expiry and ambiguous
//! writes. Every scenario records a history and checks that acknowledged
//! writes stay readable and reads never return values nobody wrote.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use zkstore_core::{ConnectionError, SessionStatus, StoreError, ZkStore};
use zkstore_tests::{
    with_retries, EnsembleFixture, FaultInjector, FaultType, HistoryReport, WriteHistory,
};

async fn writer(
    store: ZkStore,
    history: Arc<WriteHistory>,
    process: usize,
    key: String,
    rounds: usize,
) {
    for seq in 0..rounds {
        let value = format!("p{}-{}", process, seq);
        let id = history.invoke_write(&key, value.as_bytes());
        let result = store.write(&key, value.as_bytes()).await;
        history.record_write(id, &result);
    }
}

async fn reader(
    store: ZkStore,
    history: Arc<WriteHistory>,
    keys: Vec<String>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        for key in &keys {
            let stamp = history.invoke_read();
            match store.read(key).await {
                Ok(value) => history.read_ok(key, stamp, Some(value.to_vec())),
                Err(e) if e.is_not_found() => history.read_ok(key, stamp, None),
                // No observation.
                Err(_) => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

async fn final_reads(store: &ZkStore, history: &WriteHistory) {
    for key in history.keys() {
        let stamp = history.invoke_read();
        match with_retries(20, || store.read(&key)).await {
            Ok(value) => history.read_ok(&key, stamp, Some(value.to_vec())),
            Err(e) if e.is_not_found() => history.read_ok(&key, stamp, None),
            Err(e) => panic!("final read of {} failed: {}", key, e),
        }
    }
}

fn assert_valid(report: &HistoryReport) {
    assert!(
        report.is_valid(),
        "{} violations, first: {:?}",
        report.violations.len(),
        report.violations.first()
    );
    assert!(report.writes_acked > 0, "no write was ever acknowledged");
}

/// Runs writers and a reader on `keys` while `nemesis` runs, then checks the
/// history.
async fn run_workload(
    fixture: &EnsembleFixture,
    keys: &[&str],
    rounds: usize,
    nemesis: impl std::future::Future<Output = ()>,
) -> HistoryReport {
    let history = Arc::new(WriteHistory::new());
    let stop = Arc::new(AtomicBool::new(false));
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();

    let mut writers = Vec::new();
    for process in 0..keys.len() * 2 {
        writers.push(tokio::spawn(writer(
            fixture.store().clone(),
            Arc::clone(&history),
            process,
            keys[process % keys.len()].clone(),
            rounds,
        )));
    }
    let reader = tokio::spawn(reader(
        fixture.store().clone(),
        Arc::clone(&history),
        keys.clone(),
        Arc::clone(&stop),
    ));

    nemesis.await;
    for task in writers {
        task.await.unwrap();
    }
    stop.store(true, Ordering::Release);
    reader.await.unwrap();

    final_reads(fixture.store(), &history).await;
    history.check()
}

#[tokio::test]
async fn test_acknowledged_writes_survive_leader_changes() {
    let fixture = EnsembleFixture::three_node("leader-change").unwrap();
    let ensemble = fixture.ensemble().unwrap().clone();
    ensemble.set_latency(Duration::from_millis(1));
    let mut injector = FaultInjector::new(ensemble.clone());

    let report = run_workload(&fixture, &["k0", "k1"], 25, async {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(7)).await;
            injector.inject(FaultType::LeaderChange).unwrap();
        }
    })
    .await;

    assert_valid(&report);
    assert_eq!(injector.injected().len(), 10);
    assert_eq!(fixture.store().session_stats().sessions_established, 1);
    assert!(fixture.store().session_stats().disconnects >= 1);
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_member_crash_under_writes() {
    let fixture = EnsembleFixture::three_node("member-crash").unwrap();
    let ensemble = fixture.ensemble().unwrap().clone();
    ensemble.set_latency(Duration::from_millis(1));
    let mut injector = FaultInjector::new(ensemble.clone());

    let report = run_workload(&fixture, &["a", "b"], 20, async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let leader = injector.inject(FaultType::MemberCrash(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        let follower = injector.inject(FaultType::MemberCrash(2)).unwrap();
        // Quorum is gone until a member comes back.
        tokio::time::sleep(Duration::from_millis(20)).await;
        injector.clear(follower);
        tokio::time::sleep(Duration::from_millis(10)).await;
        injector.clear(leader);
    })
    .await;

    assert_valid(&report);
    assert!(ensemble.has_quorum());
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_quorum_loss_fails_with_retryable_errors() {
    let fixture = EnsembleFixture::three_node("quorum-loss").unwrap();
    let ensemble = fixture.ensemble().unwrap().clone();
    let store = fixture.store();
    store.write("k", b"before").await.unwrap();

    ensemble.crash_member(1);
    ensemble.crash_member(2);
    assert!(
        store
            .sessions()
            .wait_for_status(SessionStatus::Disconnected, Duration::from_secs(1))
            .await
    );
    let err = store.write("k", b"during").await.unwrap_err();
    assert!(err.is_retryable(), "{:?}", err);
    assert!(matches!(
        err,
        StoreError::Connection(ConnectionError::Timeout { waited_ms: 1_000 })
    ));

    ensemble.restart_member(2);
    assert_eq!(&store.read("k").await.unwrap()[..], b"before");
    store.write("k", b"after").await.unwrap();
    assert_eq!(&store.read("k").await.unwrap()[..], b"after");
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_session_expiry_fails_in_flight_calls() {
    let fixture = EnsembleFixture::single_node("expiry").unwrap();
    let ensemble = fixture.ensemble().unwrap().clone();
    let store = fixture.store().clone();
    store.write("k", b"v").await.unwrap();

    ensemble.set_latency(Duration::from_millis(50));
    let in_flight = {
        let store = store.clone();
        tokio::spawn(async move { store.read("k").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    ensemble.expire_sessions();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, StoreError::SessionExpired { session_id: 1 }));
    assert!(err.is_retryable());

    ensemble.set_latency(Duration::ZERO);
    assert_eq!(&store.read("k").await.unwrap()[..], b"v");
    let stats = store.session_stats();
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.sessions_established, 2);
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_ridden_out() {
    let fixture = EnsembleFixture::single_node("disconnect").unwrap();
    let ensemble = fixture.ensemble().unwrap().clone();
    let mut injector = FaultInjector::new(ensemble);
    let store = fixture.store().clone();
    store.write("k", b"v").await.unwrap();

    let handle = injector.inject(FaultType::Disconnect).unwrap();
    let pending = {
        let store = store.clone();
        tokio::spawn(async move { store.stat("k").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());
    injector.clear(handle);

    let entry = pending.await.unwrap().unwrap();
    assert_eq!(entry.content_length, 1);
    assert_eq!(store.session_stats().sessions_established, 1);
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_ambiguous_write_is_reported_as_lost() {
    let fixture = EnsembleFixture::single_node("ambiguous").unwrap();
    let mut injector = FaultInjector::new(fixture.ensemble().unwrap().clone());
    let store = fixture.store();
    let history = WriteHistory::new();

    let id = history.invoke_write("k", b"v1");
    let result = store.write("k", b"v1").await;
    history.record_write(id, &result);
    result.unwrap();

    injector.inject(FaultType::AmbiguousWrite).unwrap();
    let id = history.invoke_write("k", b"v2");
    let result = store.write("k", b"v2").await;
    history.record_write(id, &result);
    assert_eq!(
        result.unwrap_err(),
        StoreError::Connection(ConnectionError::Lost)
    );

    final_reads(store, &history).await;
    let report = history.check();
    assert_valid(&report);
    assert_eq!(report.writes_indeterminate, 1);
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_random_nemesis() {
    let fixture = EnsembleFixture::three_node("nemesis").unwrap();
    let ensemble = fixture.ensemble().unwrap().clone();
    let mut injector = FaultInjector::new(ensemble.clone());
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let report = run_workload(&fixture, &["x", "y", "z"], 30, async {
        for _ in 0..12 {
            let fault = FaultType::random(&mut rng, 3);
            injector.inject(fault).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            injector.clear_all();
        }
    })
    .await;

    assert_valid(&report);
    assert_eq!(injector.active_faults(), 0);
    fixture.teardown().await.unwrap();
}
