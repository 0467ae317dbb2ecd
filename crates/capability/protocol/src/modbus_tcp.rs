//! Modbus TCP 寄存器读写器
//!
//! 连接 Modbus 从设备，为轮询型连接器提供读写能力。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let connector = ModbusTcpConnector::from_json("plc-1", r#"{
//!     "host": "192.168.1.100", "port": 502,
//!     "tags": [{ "machine_id": "press-01", "address": "hr:1:100", "data_type": "uint32" }]
//! }"#)?;
//! connector.run(sink, control).await?;
//! ```

use crate::error::ConnectorError;
use crate::polling::{PollingConnector, PollingSettings, RegisterReader};
use crate::types::RegisterTable;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

/// Modbus TCP 配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModbusTcpConfig {
    /// Modbus 服务器主机地址
    pub host: String,
    /// Modbus 服务器端口（默认 502）
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(flatten)]
    pub polling: PollingSettings,
}

fn default_modbus_port() -> u16 {
    502
}

/// Modbus TCP 轮询连接器
pub type ModbusTcpConnector = PollingConnector<ModbusRegisterReader>;

impl PollingConnector<ModbusRegisterReader> {
    /// 从 JSON 配置字符串解析
    pub fn from_json(id: &str, json: &str) -> Result<Self, ConnectorError> {
        let config: ModbusTcpConfig =
            serde_json::from_str(json).map_err(|e| ConnectorError::ConfigParse(e.to_string()))?;
        Self::from_config(id, config)
    }

    /// 从采集配置文件中连接器条目的 `settings` 解析
    pub fn from_value(id: &str, settings: &serde_json::Value) -> Result<Self, ConnectorError> {
        let config: ModbusTcpConfig = serde_json::from_value(settings.clone())
            .map_err(|e| ConnectorError::ConfigParse(e.to_string()))?;
        Self::from_config(id, config)
    }

    fn from_config(id: &str, config: ModbusTcpConfig) -> Result<Self, ConnectorError> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ConnectorError::ConfigParse(format!("invalid address: {}", e)))?;
        PollingConnector::new(id, ModbusRegisterReader::new(addr), config.polling)
    }
}

/// 基于 tokio-modbus 的读写器
pub struct ModbusRegisterReader {
    addr: SocketAddr,
    ctx: Option<tokio_modbus::client::Context>,
}

impl ModbusRegisterReader {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, ctx: None }
    }

    fn context(&mut self) -> Result<&mut tokio_modbus::client::Context, ConnectorError> {
        self.ctx
            .as_mut()
            .ok_or_else(|| ConnectorError::Connection("not connected".to_string()))
    }
}

/// 将异常码转为可读诊断。
pub fn describe_exception(code: &str) -> String {
    let text = match code {
        "IllegalFunction" => "illegal function (01)",
        "IllegalDataAddress" => "illegal data address (02)",
        "IllegalDataValue" => "illegal data value (03)",
        "ServerDeviceFailure" => "server device failure (04)",
        "Acknowledge" => "acknowledge, request still processing (05)",
        "ServerDeviceBusy" => "server device busy (06)",
        "MemoryParityError" => "memory parity error (08)",
        "GatewayPathUnavailable" => "gateway path unavailable (0A)",
        "GatewayTargetDevice" => "gateway target device failed to respond (0B)",
        other => return format!("exception {}", other),
    };
    text.to_string()
}

fn transport_error(err: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Connection(err.to_string())
}

fn exception_error(code: impl std::fmt::Debug) -> ConnectorError {
    ConnectorError::Exception(describe_exception(&format!("{:?}", code)))
}

#[async_trait]
impl RegisterReader for ModbusRegisterReader {
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        let ctx = tcp::connect(self.addr).await.map_err(transport_error)?;
        info!(target: "edge.protocol", addr = %self.addr, "modbus_connected");
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn read(
        &mut self,
        unit_id: u8,
        table: RegisterTable,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ConnectorError> {
        let ctx = self.context()?;
        ctx.set_slave(Slave(unit_id));

        let registers = match table {
            RegisterTable::Coil => ctx
                .read_coils(start, count)
                .await
                .map_err(transport_error)?
                .map_err(exception_error)?
                .into_iter()
                .map(u16::from)
                .collect(),
            RegisterTable::DiscreteInput => ctx
                .read_discrete_inputs(start, count)
                .await
                .map_err(transport_error)?
                .map_err(exception_error)?
                .into_iter()
                .map(u16::from)
                .collect(),
            RegisterTable::Holding => ctx
                .read_holding_registers(start, count)
                .await
                .map_err(transport_error)?
                .map_err(exception_error)?,
            RegisterTable::Input => ctx
                .read_input_registers(start, count)
                .await
                .map_err(transport_error)?
                .map_err(exception_error)?,
        };

        debug!(
            target: "edge.protocol",
            slave = unit_id,
            table = table.prefix(),
            start,
            count,
            "modbus_read"
        );
        Ok(registers)
    }

    async fn write(
        &mut self,
        unit_id: u8,
        table: RegisterTable,
        start: u16,
        values: &[u16],
    ) -> Result<(), ConnectorError> {
        let ctx = self.context()?;
        ctx.set_slave(Slave(unit_id));
        match table {
            RegisterTable::Coil => {
                let coils: Vec<bool> = values.iter().map(|value| *value != 0).collect();
                ctx.write_multiple_coils(start, &coils)
                    .await
                    .map_err(transport_error)?
                    .map_err(exception_error)?;
            }
            RegisterTable::Holding => {
                ctx.write_multiple_registers(start, values)
                    .await
                    .map_err(transport_error)?
                    .map_err(exception_error)?;
            }
            RegisterTable::DiscreteInput | RegisterTable::Input => {
                return Err(ConnectorError::ConfigParse(format!(
                    "{} is read-only",
                    table.prefix()
                )));
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        // 丢弃上下文即关闭底层连接
        self.ctx = None;
    }
}
