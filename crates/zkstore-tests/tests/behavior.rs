//! Behavior suite against simulated single-node and three-node ensembles.

use zkstore_tests::{run_behavior_suite, EnsembleFixture};

#[tokio::test]
async fn test_suite_single_node() {
    let fixture = EnsembleFixture::single_node("suite-single").unwrap();
    let report = run_behavior_suite(fixture.store()).await;
    assert!(report.all_passed(), "failed cases: {:?}", report.failed);
    assert_eq!(report.passed.len(), 10);
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_suite_three_node() {
    let fixture = EnsembleFixture::three_node("suite-three").unwrap();
    let report = run_behavior_suite(fixture.store()).await;
    assert!(report.all_passed(), "failed cases: {:?}", report.failed);
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_suite_after_member_crash() {
    let fixture = EnsembleFixture::three_node("suite-degraded").unwrap();
    let ensemble = fixture.ensemble().unwrap().clone();
    fixture.store().write("warmup", b"1").await.unwrap();

    ensemble.crash_member(0);
    let report = run_behavior_suite(fixture.store()).await;
    assert!(report.all_passed(), "failed cases: {:?}", report.failed);
    assert_eq!(fixture.store().session_stats().sessions_established, 1);
    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_clients_share_the_tree() {
    let fixture = EnsembleFixture::single_node("shared-tree").unwrap();
    let other = fixture.open_client().unwrap();

    fixture.store().write("dir/from-first", b"1").await.unwrap();
    other.write("dir/from-second", b"2").await.unwrap();

    let names: Vec<String> = fixture
        .store()
        .list("dir")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    assert_eq!(names, vec!["from-first", "from-second"]);
    other.shutdown().await;
    fixture.teardown().await.unwrap();
}
