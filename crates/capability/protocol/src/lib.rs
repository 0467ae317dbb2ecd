//! # 协议连接器能力模块
//!
//! 从异构 PLC 采集点位数据，支持：
//! - **轮询型**：按 (从站, 寄存器区) 合并批量读取，Modbus TCP 实现基于 tokio-modbus
//! - **订阅型**：OPC 风格的服务器推送，按 (采样间隔, 死区) 分组订阅
//!
//! ## 架构设计
//!
//! ```text
//! 采集配置 (connectors[].settings)
//!       │
//!       ▼
//! Connector::run(sink, control)
//!       │
//!       ├── PollingConnector<ModbusRegisterReader>
//!       └── SubscriptionConnector<C: SubscriptionClient>
//!       │
//!       ├── mpsc<TagSample>            → 会话运行器
//!       └── mpsc<ConnectorHealthEvent> → 事件输出
//!
//! BackpressureCoordinator ── watch<RateMode> ──▶ 各连接器
//! ```
//!
//! ## 配置格式
//!
//! ### Modbus TCP
//! ```json
//! { "host": "192.168.1.100", "port": 502, "fast_cycle_ms": 100, "slow_cycle_ms": 1000,
//!   "tags": [{ "machine_id": "press-01", "address": "hr:1:100",
//!              "data_type": "uint32", "byte_order": "cdab", "cycle": "fast" }] }
//! ```
//!
//! ### 订阅型
//! ```json
//! { "items": [{ "machine_id": "oven-01", "address": "ns=2;s=Temp",
//!               "sampling_interval_ms": 500, "deadband": { "mode": "absolute", "value": 0.5 } }] }
//! ```

mod backoff;
mod byte_order;
mod connector;
mod error;
mod modbus_tcp;
mod polling;
mod subscription;
mod types;

pub use backoff::Backoff;
pub use byte_order::{decode_registers, encode_value};
pub use connector::{
    Connector, ConnectorControl, ConnectorHandle, ConnectorHealthEvent, HealthKind, RateMode,
    WriteRequest,
};
pub use error::ConnectorError;
pub use modbus_tcp::{describe_exception, ModbusRegisterReader, ModbusTcpConfig, ModbusTcpConnector};
pub use polling::{
    PollingConnector, PollingSettings, ReadBatch, RegisterReader, ScriptedRegisterReader,
};
pub use subscription::{
    DataChange, SimulatedServer, SimulatedSubscriptionClient, SubscriptionClient,
    SubscriptionConnector, SubscriptionGroup, SubscriptionId, SubscriptionSettings,
};
pub use types::*;
