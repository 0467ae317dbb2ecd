/// 单窗口计算输入。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OeeInput {
    pub planned_ms: i64,
    pub run_ms: i64,
    pub good_count: u64,
    pub total_count: u64,
    pub ideal_cycle_s: f64,
}

/// 计算结果（比率均为 0..=1，`performance_raw`/`oee_raw` 可能超过 1）。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OeeMetrics {
    pub availability: f64,
    pub performance: f64,
    pub performance_raw: f64,
    pub performance_anomaly: bool,
    pub quality: f64,
    pub oee: f64,
    pub oee_raw: f64,
}

pub fn calculate(input: &OeeInput) -> OeeMetrics {
    let availability = ratio(input.run_ms as f64, input.planned_ms as f64);
    let performance_raw = ratio(
        input.ideal_cycle_s * input.good_count as f64,
        input.run_ms as f64 / 1000.0,
    );
    let quality = ratio(input.good_count as f64, input.total_count as f64);
    let performance = performance_raw.min(1.0);
    OeeMetrics {
        availability,
        performance,
        performance_raw,
        // 理想节拍偏大或计数异常
        performance_anomaly: performance_raw > 1.0,
        quality,
        oee: availability * performance * quality,
        oee_raw: availability * performance_raw * quality,
    }
}

/// 平均修复时间；无修复记录为 0。
pub fn mttr_ms(total_repair_ms: i64, repairs: u32) -> f64 {
    ratio(total_repair_ms as f64, f64::from(repairs))
}

/// 平均故障间隔（运行时间 / 故障次数）；无故障为 0。
pub fn mtbf_ms(run_ms: i64, failures: u32) -> f64 {
    ratio(run_ms as f64, f64::from(failures))
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 || !numerator.is_finite() || numerator <= 0.0 {
        return 0.0;
    }
    numerator / denominator
}
