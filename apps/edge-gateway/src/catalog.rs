//! 采集配置文件 → 流水线视图（资产、窗口参数、故障策略、点位映射），含热加载。

use edge_config::{ConnectorEntry, GatewayFile};
use edge_fault::FaultPolicy;
use edge_normalize::StaticMappingProvider;
use edge_oee::WindowSettings;
use edge_pipeline::PipelineCatalog;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub fn pipeline_catalog(file: &GatewayFile, fault_dedup_window_ms: i64) -> PipelineCatalog {
    let machines: HashMap<String, WindowSettings> = file
        .machines
        .iter()
        .map(|entry| {
            (
                entry.path.machine.clone(),
                WindowSettings {
                    ideal_cycle_s: entry.ideal_cycle_s,
                    window_ms: (entry.oee_window_s as i64).saturating_mul(1_000),
                },
            )
        })
        .collect();
    let fault_policy = file
        .fault_groups
        .iter()
        .fold(FaultPolicy::new(fault_dedup_window_ms), |policy, group| {
            policy.with_group(group.name.clone(), group.codes.iter().copied())
        });
    PipelineCatalog {
        assets: file.asset_registry(),
        machines,
        fault_policy,
    }
}

/// 连接器点位配置中出现的机台（`tags[]` 或 `items[]` 的 `machine_id`）。
pub fn connector_machines(entry: &ConnectorEntry) -> Vec<String> {
    let mut machines: Vec<String> = ["tags", "items"]
        .iter()
        .filter_map(|key| entry.settings.get(key)?.as_array())
        .flatten()
        .filter_map(|item| item.get("machine_id")?.as_str().map(str::to_string))
        .collect();
    machines.sort();
    machines.dedup();
    machines
}

/// 跟随配置文件热加载：替换映射表并发布新的流水线视图。
///
/// 连接器增删需要重启进程，这里只记录告警。
pub async fn follow_reloads(
    mut files: watch::Receiver<(u64, Arc<GatewayFile>)>,
    mappings: Arc<StaticMappingProvider>,
    catalog: watch::Sender<Arc<PipelineCatalog>>,
    fault_dedup_window_ms: i64,
) {
    let mut connectors = files.borrow().1.connectors.clone();
    while files.changed().await.is_ok() {
        let (version, file) = files.borrow_and_update().clone();
        mappings.replace(file.mapping_table(version));
        catalog.send_replace(Arc::new(pipeline_catalog(&file, fault_dedup_window_ms)));
        if file.connectors != connectors {
            warn!(target: "edge.gateway", version, "connector_changes_require_restart");
            connectors = file.connectors.clone();
        }
        info!(
            target: "edge.gateway",
            version,
            machines = file.machines.len(),
            mappings = file.mappings.len(),
            "catalog_applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"{
        "machines": [{ "site": "plant-a", "area": "stamping", "line": "line-1", "cell": "cell-3",
                       "machine": "press-01", "ideal_cycle_s": 30.0, "oee_window_s": 3600 }],
        "connectors": [{ "id": "plc-1", "kind": "modbus_tcp", "settings": {
            "host": "127.0.0.1",
            "tags": [
                { "machine_id": "press-02", "address": "hr:1:100", "data_type": "uint16" },
                { "machine_id": "press-01", "address": "hr:1:101", "data_type": "uint16" },
                { "machine_id": "press-01", "address": "hr:1:102", "data_type": "uint16" }
            ] } }],
        "mappings": [{ "machine_id": "press-01", "address": "hr:1:101", "signal": "counter.good" }],
        "fault_groups": [{ "name": "hydraulic", "codes": [101, 102] }]
    }"#;

    #[test]
    fn catalog_carries_windows_and_groups() {
        let file = GatewayFile::from_json(FILE).expect("file");
        let catalog = pipeline_catalog(&file, 120_000);
        let window = catalog.window_for("press-01");
        assert_eq!(window.ideal_cycle_s, 30.0);
        assert_eq!(window.window_ms, 3_600_000);
        assert_eq!(catalog.fault_policy.dedup_window_ms, 120_000);
        assert_eq!(catalog.fault_policy.group_of(102), Some("hydraulic"));
        assert!(catalog.assets.resolve("press-01").is_some());
    }

    #[test]
    fn connector_machines_are_unique() {
        let file = GatewayFile::from_json(FILE).expect("file");
        assert_eq!(
            connector_machines(&file.connectors[0]),
            vec!["press-01".to_string(), "press-02".to_string()]
        );
    }
}
