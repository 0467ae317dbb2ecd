//! OEE 计算引擎。
//!
//! - `calc`：纯函数，A × P × Q 与 MTTR/MTBF，零分母一律得 0
//! - `window`：单机台窗口累加器，由计数器增量与运行/计划状态积分得到输入

pub mod calc;
pub mod window;

pub use calc::{OeeInput, OeeMetrics, calculate, mtbf_ms, mttr_ms};
pub use window::{OeeWindow, WindowSettings};
