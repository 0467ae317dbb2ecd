use edge_config::{AppConfig, ConnectorKind, GatewayFile, OverflowPolicySetting, spawn_config_watcher};
use std::time::Duration;

const GATEWAY_JSON: &str = r#"{
  "machines": [
    { "site": "plant-a", "area": "stamping", "line": "line-1", "cell": "cell-2",
      "machine": "press-01", "ideal_cycle_s": 30.0 }
  ],
  "connectors": [
    { "id": "plc-1", "kind": "modbus_tcp", "settings": { "host": "10.0.0.5" } }
  ],
  "mappings": [
    { "machine_id": "press-01", "address": "hr:1:100", "signal": "counter.good" }
  ],
  "fault_groups": [ { "name": "hydraulic", "codes": [101, 102] } ]
}"#;

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("EDGE_HTTP_ADDR", "127.0.0.1:8081");
        std::env::set_var("EDGE_NODE_ID", "node-7");
        std::env::set_var("EDGE_QUEUE_OVERFLOW", "reject_newest");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.http_addr, "127.0.0.1:8081");
    assert_eq!(config.node_id, "node-7");
    assert_eq!(config.queue_overflow, OverflowPolicySetting::RejectNewest);
    assert_eq!(config.backpressure_upper, 1_000);
    assert_eq!(config.backpressure_lower, 500);
    assert_eq!(config.reconnect_min_ms, 2_000);
    assert_eq!(config.queue_watermark_bytes, 500 * 1024 * 1024);
}

#[test]
fn parse_gateway_file() {
    let file = GatewayFile::from_json(GATEWAY_JSON).expect("file");
    assert_eq!(file.machines[0].ideal_cycle_s, 30.0);
    assert_eq!(file.machines[0].oee_window_s, 8 * 3600);
    assert_eq!(file.connectors[0].kind, ConnectorKind::ModbusTcp);
    assert!(file.connectors[0].enabled);
    let registry = file.asset_registry();
    assert_eq!(
        registry.resolve("press-01").map(|path| path.line.as_str()),
        Some("line-1")
    );
    let table = file.mapping_table(1);
    assert!(table.get("press-01", "hr:1:100").is_some());
}

#[test]
fn reject_mapping_for_unknown_machine() {
    let json = r#"{ "mappings": [
        { "machine_id": "ghost", "address": "hr:1:1", "signal": "state.run" } ] }"#;
    let err = GatewayFile::from_json(json).expect_err("unknown machine");
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn watcher_picks_up_modified_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gateway.json");
    std::fs::write(&path, GATEWAY_JSON).expect("write");

    let watcher = spawn_config_watcher(&path, Duration::from_millis(20)).expect("watcher");
    let mut rx = watcher.subscribe();
    assert_eq!(watcher.current().0, 1);

    // 保证 mtime 变化可被观察到。
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let updated = GATEWAY_JSON.replace("counter.good", "counter.total");
    std::fs::write(&path, updated).expect("rewrite");

    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .expect("reload in time")
        .expect("sender alive");
    let (version, file) = watcher.current();
    assert_eq!(version, 2);
    assert_eq!(file.mappings[0].signal.as_str(), "counter.total");
}
