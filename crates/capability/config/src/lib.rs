//! 网关运行配置加载。
//!
//! - 进程级参数来自 `EDGE_*` 环境变量（`AppConfig::from_env`）
//! - 采集配置（资产、连接器、点位映射）来自 JSON 文件，按修改时间轮询热加载

mod file;
mod watch;

pub use file::{ConnectorEntry, ConnectorKind, FaultGroup, GatewayFile, MachineEntry};
pub use watch::{ConfigWatcher, spawn_config_watcher};

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("config file error: {0}")]
    File(String),
}

/// 断网续传队列溢出策略（配置层表示）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicySetting {
    RejectNewest,
    EvictOldest,
}

/// 遥测输出目标。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// 仅 tracing 日志。
    Log,
    /// 以 JSON 发布到 MQTT。
    Mqtt,
}

/// 网关运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_addr: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keep_alive_seconds: u64,
    pub group_id: String,
    pub node_id: String,
    pub host_id: Option<String>,
    pub queue_dir: String,
    pub queue_watermark_bytes: u64,
    pub queue_overflow: OverflowPolicySetting,
    pub publish_timeout_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub backpressure_interval_ms: u64,
    pub backpressure_upper: u64,
    pub backpressure_lower: u64,
    pub backpressure_delay_ms: u64,
    pub backpressure_factor: u32,
    pub pipeline_enabled: bool,
    pub channel_capacity: usize,
    pub sink: SinkKind,
    pub sink_topic_prefix: String,
    pub sink_batch_size: usize,
    pub oee_tick_ms: u64,
    pub fault_dedup_window_ms: i64,
    pub duplicate_window_ms: i64,
    pub context_ttl_ms: u64,
    pub config_file: String,
    pub config_reload_ms: u64,
}

impl AppConfig {
    /// 从环境变量读取配置（全部带默认值）。
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_addr = env::var("EDGE_HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let mqtt_host = env::var("EDGE_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = read_u16_with_default("EDGE_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("EDGE_MQTT_USERNAME");
        let mqtt_password = read_optional("EDGE_MQTT_PASSWORD");
        let mqtt_keep_alive_seconds = read_u64_with_default("EDGE_MQTT_KEEP_ALIVE_SECONDS", 30)?;
        let group_id = env::var("EDGE_GROUP_ID").unwrap_or_else(|_| "line-1".to_string());
        let node_id = env::var("EDGE_NODE_ID").unwrap_or_else(|_| "edge-node-1".to_string());
        let host_id = read_optional("EDGE_HOST_ID");
        validate_topic_token("EDGE_GROUP_ID", &group_id)?;
        validate_topic_token("EDGE_NODE_ID", &node_id)?;

        let queue_dir = env::var("EDGE_QUEUE_DIR").unwrap_or_else(|_| "./data/queue".to_string());
        let queue_watermark_bytes =
            read_u64_with_default("EDGE_QUEUE_WATERMARK_BYTES", 500 * 1024 * 1024)?;
        let queue_overflow = match read_optional("EDGE_QUEUE_OVERFLOW").as_deref() {
            None | Some("evict_oldest") => OverflowPolicySetting::EvictOldest,
            Some("reject_newest") => OverflowPolicySetting::RejectNewest,
            Some(other) => {
                return Err(ConfigError::Invalid(
                    "EDGE_QUEUE_OVERFLOW".to_string(),
                    other.to_string(),
                ));
            }
        };
        let publish_timeout_ms = read_u64_with_default("EDGE_PUBLISH_TIMEOUT_MS", 5_000)?;
        let reconnect_min_ms = read_u64_with_default("EDGE_RECONNECT_MIN_MS", 2_000)?;
        let reconnect_max_ms = read_u64_with_default("EDGE_RECONNECT_MAX_MS", 60_000)?;
        if reconnect_min_ms == 0 || reconnect_max_ms < reconnect_min_ms {
            return Err(ConfigError::Invalid(
                "EDGE_RECONNECT_MAX_MS".to_string(),
                reconnect_max_ms.to_string(),
            ));
        }

        let backpressure_interval_ms =
            read_u64_with_default("EDGE_BACKPRESSURE_INTERVAL_MS", 5_000)?;
        let backpressure_upper = read_u64_with_default("EDGE_BACKPRESSURE_UPPER", 1_000)?;
        let backpressure_lower = read_u64_with_default("EDGE_BACKPRESSURE_LOWER", 500)?;
        let backpressure_delay_ms = read_u64_with_default("EDGE_BACKPRESSURE_DELAY_MS", 5_000)?;
        let backpressure_factor = read_u64_with_default("EDGE_BACKPRESSURE_FACTOR", 8)? as u32;
        if backpressure_lower >= backpressure_upper {
            return Err(ConfigError::Invalid(
                "EDGE_BACKPRESSURE_LOWER".to_string(),
                backpressure_lower.to_string(),
            ));
        }
        if backpressure_factor == 0 {
            return Err(ConfigError::Invalid(
                "EDGE_BACKPRESSURE_FACTOR".to_string(),
                "0".to_string(),
            ));
        }

        let pipeline_enabled = read_bool_with_default("EDGE_PIPELINE", true);
        let channel_capacity = read_u64_with_default("EDGE_CHANNEL_CAPACITY", 1_024)? as usize;
        let sink = match read_optional("EDGE_SINK").as_deref() {
            None | Some("log") => SinkKind::Log,
            Some("mqtt") => SinkKind::Mqtt,
            Some(other) => {
                return Err(ConfigError::Invalid(
                    "EDGE_SINK".to_string(),
                    other.to_string(),
                ));
            }
        };
        let sink_topic_prefix =
            env::var("EDGE_SINK_TOPIC_PREFIX").unwrap_or_else(|_| "edge/out".to_string());
        let sink_batch_size = read_u64_with_default("EDGE_SINK_BATCH_SIZE", 100)? as usize;
        let oee_tick_ms = read_u64_with_default("EDGE_OEE_TICK_MS", 60_000)?;
        let fault_dedup_window_ms = read_u64_with_default("EDGE_FAULT_DEDUP_WINDOW_MS", 300_000)? as i64;
        let duplicate_window_ms = read_u64_with_default("EDGE_DUPLICATE_WINDOW_MS", 60_000)? as i64;
        let context_ttl_ms = read_u64_with_default("EDGE_CONTEXT_TTL_MS", 300_000)?;
        let config_file =
            env::var("EDGE_CONFIG_FILE").unwrap_or_else(|_| "gateway.json".to_string());
        let config_reload_ms = read_u64_with_default("EDGE_CONFIG_RELOAD_MS", 5_000)?;

        Ok(Self {
            http_addr,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_keep_alive_seconds,
            group_id,
            node_id,
            host_id,
            queue_dir,
            queue_watermark_bytes,
            queue_overflow,
            publish_timeout_ms,
            reconnect_min_ms,
            reconnect_max_ms,
            backpressure_interval_ms,
            backpressure_upper,
            backpressure_lower,
            backpressure_delay_ms,
            backpressure_factor,
            pipeline_enabled,
            channel_capacity: channel_capacity.max(1),
            sink,
            sink_topic_prefix,
            sink_batch_size: sink_batch_size.max(1),
            oee_tick_ms,
            fault_dedup_window_ms,
            duplicate_window_ms,
            context_ttl_ms,
            config_file,
            config_reload_ms,
        })
    }
}

/// Sparkplug topic 片段不得包含通配符与分隔符。
fn validate_topic_token(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.contains(['/', '+', '#']) {
        return Err(ConfigError::Invalid(key.to_string(), value.to_string()));
    }
    Ok(())
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
