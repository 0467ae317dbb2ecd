//! 连接器错误类型定义

/// 连接器错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectorError {
    /// 连接错误（拒绝、断开）
    #[error("connection error: {0}")]
    Connection(String),

    /// 设备异常应答（已转换为可读诊断）
    #[error("device exception: {0}")]
    Exception(String),

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// 数据解析错误（地址/类型不匹配）
    #[error("data parse error: {0}")]
    DataParse(String),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,
}

impl ConnectorError {
    /// 链路级故障：计入连续失败次数并触发退避重连。
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::Connection(_) | ConnectorError::Timeout(_)
        )
    }
}
