//! # 数据流水线
//!
//! 主机侧的解码 → 标准化 → 丰富 → 校验 → 路由。各阶段是独立任务，
//! 以有界通道串联；同一条消息严格按阶段顺序流过。
//!
//! ```text
//! DecodedMessage ─▶ decode ─▶ normalize ─▶ enrich ─▶ validate ─▶ route ─┬─▶ telemetry sink
//!                                                                      ├─▶ MachineActor (OEE + 故障)
//!                                                                      └─▶ events sink
//! ```

mod decode;
mod enrich;
mod machine;
mod runtime;
mod sink;
mod validate;

pub use decode::{DecodeError, decode_message};
pub use enrich::{
    CachedContext, ContextProvider, NoContext, ProductionContext, StaticContextProvider,
};
pub use machine::{MachineActor, MachineInput};
pub use runtime::{
    FaultAcknowledger, PipelineCatalog, PipelineConfig, PipelineControl, PipelineHandle,
    PipelineRuntime,
};
pub use sink::{
    BatchConfig, BatchWriter, ChannelSink, LogSink, MqttJsonSink, RecordSink, SharedEventSink,
    SharedTelemetrySink,
};
pub use validate::{Validated, Validator};

/// 流水线错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("normalize error: {0}")]
    Normalize(String),
    #[error("context error: {0}")]
    Context(String),
    #[error("sink error: {0}")]
    Sink(String),
    #[error("backpressure: {0}")]
    Backpressure(String),
    #[error("fault error: {0}")]
    Fault(String),
    #[error("pipeline closed")]
    Closed,
}
