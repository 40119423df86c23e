//! End-to-end ingestion tests driven through the devkit harness

use chrono::Utc;
use perfwatch_agent::{CycleError, RetentionStrategy, SamplingError};
use perfwatch_devkit::{ScriptedProbe, TestHarness};

const MIB: u64 = 1_048_576;

#[tokio::test]
async fn test_cycles_store_sampled_values_then_respect_window() {
    let window = 10;
    let harness = TestHarness::new(window);
    // cpu: 90%, 75%, 0%, 100%
    for (idle, total) in [(10, 100), (25, 100), (100, 100), (0, 100)] {
        harness.probe.script_cpu_window(idle, total);
    }
    harness.probe.set_memory(1000, 250);
    harness.probe.set_disk(33.0);
    harness.probe.set_counters("eth0", 10 * MIB, 5 * MIB);

    let mut ingestion = harness.start().await.unwrap();
    let host = ingestion.host_identity().clone();

    for result in TestHarness::run_ticks(&mut ingestion, 4).await {
        result.unwrap();
    }

    let rows = harness.rows_for(&host).await.unwrap();
    assert_eq!(rows.len(), 4);
    let cpu: Vec<f64> = rows.iter().rev().map(|r| r.cpu_usage).collect();
    assert_eq!(cpu, vec![90.0, 75.0, 0.0, 100.0]);
    for row in &rows {
        assert_eq!(row.system_id, host.as_str());
        assert_eq!(row.server_name, None);
        assert_eq!(row.memory_usage, 75.0);
        assert_eq!(row.disk_usage, 33.0);
        assert_eq!(row.network_in, 10.0);
        assert_eq!(row.network_out, 5.0);
    }

    let mut inserted = Vec::new();
    for result in TestHarness::run_ticks(&mut ingestion, window as usize + 5).await {
        inserted.push(result.unwrap().row_id);
    }

    let rows = harness.rows_for(&host).await.unwrap();
    assert_eq!(rows.len(), window as usize);
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let newest: Vec<i64> = inserted.iter().rev().take(window as usize).copied().collect();
    assert_eq!(ids, newest);
    assert!(rows.windows(2).all(|pair| pair[0].timestamp >= pair[1].timestamp));

    let stats = ingestion.stats();
    assert_eq!(stats.rows_inserted, 4 + window + 5);
    assert_eq!(stats.rows_pruned, 9);
}

#[tokio::test]
async fn test_count_then_trim_keeps_window() {
    let harness = TestHarness::new(4).with_strategy(RetentionStrategy::CountThenTrim);
    let mut ingestion = harness.start().await.unwrap();

    for result in TestHarness::run_ticks(&mut ingestion, 9).await {
        result.unwrap();
    }

    let rows = harness.rows_for(ingestion.host_identity()).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(ingestion.stats().rows_pruned, 5);
}

#[tokio::test]
async fn test_configured_label_replaces_stored_label() {
    let harness = TestHarness::new(10).with_label("B");
    let host = harness.identity().unwrap();
    harness.store.inner().seed(&host, Some("A"), Utc::now());

    let mut ingestion = harness.start().await.unwrap();

    let rows = harness.rows_for(&host).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].server_name.as_deref(), Some("B"));

    ingestion.tick().await.unwrap();
    let rows = harness.rows_for(&host).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.server_name.as_deref() == Some("B")));
}

#[tokio::test]
async fn test_disk_failure_skips_only_that_tick() {
    let harness = TestHarness::new(10);
    let mut ingestion = harness.start().await.unwrap();
    let host = ingestion.host_identity().clone();

    harness.probe.fail_disk_once("permission denied");
    let err = ingestion.tick().await.unwrap_err();
    assert!(matches!(err, CycleError::Sampling(SamplingError::DiskRead(_))));
    assert!(harness.rows_for(&host).await.unwrap().is_empty());

    ingestion.tick().await.unwrap();
    assert_eq!(harness.rows_for(&host).await.unwrap().len(), 1);
    assert_eq!(ingestion.stats().sampling_failures, 1);
    assert_eq!(ingestion.stats().completed, 1);
}

#[tokio::test]
async fn test_stalled_cpu_counters_skip_tick() {
    let harness = TestHarness::new(10);
    harness.probe.script_cpu(&[(500, 1000), (500, 1000)]);
    let mut ingestion = harness.start().await.unwrap();

    let err = ingestion.tick().await.unwrap_err();
    assert!(matches!(err, CycleError::Sampling(SamplingError::CpuTiming { .. })));
    assert!(harness.store.inner().is_empty());
}

#[tokio::test]
async fn test_missing_network_interface_skips_tick() {
    let harness = TestHarness::new(10);
    let mut ingestion = harness.start().await.unwrap();

    // identity is already resolved; losing the IPv4 interface only affects sampling
    harness.probe.set_interfaces(vec![ScriptedProbe::interface(
        "eth0",
        Some([0x52, 0x54, 0x00, 0xab, 0xcd, 0xef]),
        false,
        false,
    )]);

    let err = ingestion.tick().await.unwrap_err();
    assert!(matches!(
        err,
        CycleError::Sampling(SamplingError::NetworkInterfaceNotFound)
    ));
    assert!(harness.store.inner().is_empty());
}

#[tokio::test]
async fn test_persistence_failure_skips_pruning() {
    let harness = TestHarness::new(3);
    let mut ingestion = harness.start().await.unwrap();
    let host = ingestion.host_identity().clone();

    harness.store.fail_next_inserts(1);
    harness.store.fail_next_prunes(1);

    let err = ingestion.tick().await.unwrap_err();
    assert!(matches!(err, CycleError::Persistence(_)));
    assert!(harness.rows_for(&host).await.unwrap().is_empty());

    // the armed prune failure was not consumed by the failed cycle
    let err = ingestion.tick().await.unwrap_err();
    assert!(matches!(err, CycleError::Retention(_)));
    assert_eq!(harness.rows_for(&host).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_prune_failures_converge_on_next_success() {
    let harness = TestHarness::new(3);
    let mut ingestion = harness.start().await.unwrap();
    let host = ingestion.host_identity().clone();

    for result in TestHarness::run_ticks(&mut ingestion, 3).await {
        result.unwrap();
    }

    harness.store.fail_next_prunes(2);
    for result in TestHarness::run_ticks(&mut ingestion, 2).await {
        assert!(matches!(result, Err(CycleError::Retention(_))));
    }
    assert_eq!(harness.rows_for(&host).await.unwrap().len(), 5);

    let report = ingestion.tick().await.unwrap();
    assert_eq!(report.pruned, 3);
    assert_eq!(harness.rows_for(&host).await.unwrap().len(), 3);
    assert_eq!(ingestion.stats().retention_failures, 2);
}

#[tokio::test]
async fn test_enforce_leaves_other_hosts_untouched() {
    let harness = TestHarness::new(2);
    let other = perfwatch_agent::HostIdentity::from_token("other-host");
    for _ in 0..6 {
        harness.store.inner().seed(&other, Some("neighbour"), Utc::now());
    }

    let mut ingestion = harness.start().await.unwrap();
    for result in TestHarness::run_ticks(&mut ingestion, 5).await {
        result.unwrap();
    }

    assert_eq!(harness.rows_for(ingestion.host_identity()).await.unwrap().len(), 2);
    assert_eq!(harness.rows_for(&other).await.unwrap().len(), 6);
}
