//! 单机台 OEE 窗口。
//!
//! 时间按样本时间戳积分：两次观测之间沿用上一状态，计划内时间计入 planned，
//! 计划内且运行计入 run。PLC 计数器为累计值，窗口内只累加增量；读数回落视为
//! 计数器复位，新读数整体作为增量。

use crate::calc::{OeeInput, calculate, mtbf_ms, mttr_ms};
use domain::signal::{
    COUNTER_GOOD, COUNTER_REJECT, COUNTER_TOTAL, CYCLE_TIME, STATE_PLANNED, STATE_RUN,
};
use domain::{OeeReport, Quality, TagSample};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSettings {
    /// 理想节拍（秒）；未配置（≤0）时取窗口内观测到的最短节拍。
    pub ideal_cycle_s: f64,
    pub window_ms: i64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            ideal_cycle_s: 0.0,
            window_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CounterTrack {
    last: Option<u64>,
    accumulated: u64,
    seen: bool,
}

impl CounterTrack {
    fn update(&mut self, reading: u64) -> bool {
        let (delta, reset) = match self.last {
            None => (0, false),
            Some(previous) if reading >= previous => (reading - previous, false),
            Some(_) => (reading, true),
        };
        self.last = Some(reading);
        self.accumulated = self.accumulated.saturating_add(delta);
        self.seen = true;
        reset
    }

    fn restart(&mut self) {
        self.accumulated = 0;
        self.seen = self.last.is_some();
    }
}

/// 机台窗口累加器（由机台 actor 独占）。
#[derive(Debug, Clone)]
pub struct OeeWindow {
    machine_id: String,
    settings: WindowSettings,
    window_start_ms: i64,
    clock_ms: Option<i64>,
    running: bool,
    /// 未接入计划信号时整段视为计划内。
    planned: Option<bool>,
    planned_ms: i64,
    run_ms: i64,
    good: CounterTrack,
    total: CounterTrack,
    reject: CounterTrack,
    fastest_cycle_s: Option<f64>,
    failures: u32,
    repairs: u32,
    repair_total_ms: i64,
}

impl OeeWindow {
    pub fn new(machine_id: impl Into<String>, settings: WindowSettings, start_ms: i64) -> Self {
        Self {
            machine_id: machine_id.into(),
            settings,
            window_start_ms: start_ms,
            clock_ms: None,
            running: false,
            planned: None,
            planned_ms: 0,
            run_ms: 0,
            good: CounterTrack::default(),
            total: CounterTrack::default(),
            reject: CounterTrack::default(),
            fastest_cycle_s: None,
            failures: 0,
            repairs: 0,
            repair_total_ms: 0,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn window_start_ms(&self) -> i64 {
        self.window_start_ms
    }

    /// 配置热加载后更新理想节拍与窗口长度，当前累计值保留。
    pub fn update_settings(&mut self, settings: WindowSettings) {
        self.settings = settings;
    }

    /// 吸收一条样本；与 OEE 无关或坏质量的样本返回 false。
    pub fn observe(&mut self, sample: &TagSample) -> bool {
        if sample.quality == Quality::Bad {
            return false;
        }
        let Some(signal) = sample.signal.as_ref() else {
            return false;
        };
        let name = signal.as_str();
        if ![
            STATE_RUN,
            STATE_PLANNED,
            COUNTER_GOOD,
            COUNTER_TOTAL,
            COUNTER_REJECT,
            CYCLE_TIME,
        ]
        .contains(&name)
        {
            return false;
        }

        self.advance(sample.ts_ms);
        match name {
            STATE_RUN => {
                if let Some(running) = sample.value.as_bool() {
                    self.running = running;
                }
            }
            STATE_PLANNED => {
                if let Some(planned) = sample.value.as_bool() {
                    self.planned = Some(planned);
                }
            }
            CYCLE_TIME => {
                if let Some(cycle) = sample.value.as_f64().filter(|cycle| *cycle > 0.0) {
                    self.fastest_cycle_s =
                        Some(self.fastest_cycle_s.map_or(cycle, |fastest| fastest.min(cycle)));
                }
            }
            counter => {
                let Some(reading) = sample.value.as_i64().and_then(|v| u64::try_from(v).ok())
                else {
                    return false;
                };
                let track = match counter {
                    COUNTER_GOOD => &mut self.good,
                    COUNTER_TOTAL => &mut self.total,
                    _ => &mut self.reject,
                };
                if track.update(reading) {
                    warn!(
                        target: "edge.oee",
                        machine_id = %self.machine_id,
                        signal = counter,
                        reading,
                        "counter_reset_detected"
                    );
                }
            }
        }
        true
    }

    /// 记录一次故障（MTBF 分母）。
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// 记录一次修复时长（MTTR）。
    pub fn record_repair(&mut self, repair_ms: i64) {
        self.repairs += 1;
        self.repair_total_ms = self.repair_total_ms.saturating_add(repair_ms.max(0));
    }

    /// 窗口是否已到期。
    pub fn is_due(&self, now_ms: i64) -> bool {
        now_ms >= self.window_start_ms.saturating_add(self.settings.window_ms)
    }

    /// 周期性中间结果（窗口继续累计）。
    pub fn snapshot(&mut self, now_ms: i64) -> OeeReport {
        self.advance(now_ms);
        self.report(now_ms, false)
    }

    /// 关闭当前窗口并开启下一个；计数器基线与运行状态延续。
    pub fn roll(&mut self, now_ms: i64) -> OeeReport {
        self.advance(now_ms);
        let report = self.report(now_ms, true);
        debug!(
            target: "edge.oee",
            machine_id = %self.machine_id,
            oee = report.oee,
            good = report.good_count,
            total = report.total_count,
            "oee_window_closed"
        );
        self.window_start_ms = now_ms;
        self.planned_ms = 0;
        self.run_ms = 0;
        self.good.restart();
        self.total.restart();
        self.reject.restart();
        self.fastest_cycle_s = None;
        self.failures = 0;
        self.repairs = 0;
        self.repair_total_ms = 0;
        report
    }

    fn advance(&mut self, ts_ms: i64) {
        let Some(clock) = self.clock_ms else {
            self.clock_ms = Some(ts_ms.max(self.window_start_ms));
            return;
        };
        // 回放的历史样本只更新状态，不倒拨时钟
        if ts_ms <= clock {
            return;
        }
        let elapsed = ts_ms - clock;
        if self.planned.unwrap_or(true) {
            self.planned_ms += elapsed;
            if self.running {
                self.run_ms += elapsed;
            }
        }
        self.clock_ms = Some(ts_ms);
    }

    fn counts(&self) -> (u64, u64) {
        let good = if self.good.seen {
            self.good.accumulated
        } else {
            self.total.accumulated.saturating_sub(self.reject.accumulated)
        };
        let total = if self.total.seen {
            self.total.accumulated
        } else {
            good.saturating_add(self.reject.accumulated)
        };
        (good, total)
    }

    fn report(&self, now_ms: i64, closed: bool) -> OeeReport {
        let (good_count, total_count) = self.counts();
        let ideal_cycle_s = if self.settings.ideal_cycle_s > 0.0 {
            self.settings.ideal_cycle_s
        } else {
            self.fastest_cycle_s.unwrap_or(0.0)
        };
        let metrics = calculate(&OeeInput {
            planned_ms: self.planned_ms,
            run_ms: self.run_ms,
            good_count,
            total_count,
            ideal_cycle_s,
        });
        if metrics.performance_anomaly {
            warn!(
                target: "edge.oee",
                machine_id = %self.machine_id,
                performance_raw = metrics.performance_raw,
                "performance_above_ideal"
            );
        }
        edge_telemetry::set_machine_oee(&self.machine_id, metrics.oee);
        OeeReport {
            machine_id: self.machine_id.clone(),
            window_start_ms: self.window_start_ms,
            window_end_ms: now_ms,
            closed,
            planned_ms: self.planned_ms,
            run_ms: self.run_ms,
            good_count,
            total_count,
            ideal_cycle_s,
            availability: metrics.availability,
            performance: metrics.performance,
            performance_raw: metrics.performance_raw,
            performance_anomaly: metrics.performance_anomaly,
            quality: metrics.quality,
            oee: metrics.oee,
            oee_raw: metrics.oee_raw,
            failures: self.failures,
            repairs: self.repairs,
            mttr_ms: mttr_ms(self.repair_total_ms, self.repairs),
            mtbf_ms: mtbf_ms(self.run_ms, self.failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{CanonicalSignal, TagValue};

    const MINUTE_MS: i64 = 60_000;

    fn sample(signal: &str, value: TagValue, ts_ms: i64) -> TagSample {
        TagSample::new("press-01", signal, value, Quality::Good, ts_ms)
            .with_signal(Some(CanonicalSignal::parse(signal).expect("signal")))
    }

    fn window() -> OeeWindow {
        OeeWindow::new(
            "press-01",
            WindowSettings {
                ideal_cycle_s: 30.0,
                window_ms: 480 * MINUTE_MS,
            },
            0,
        )
    }

    #[test]
    fn integrates_state_and_counter_deltas() {
        let mut window = window();
        window.observe(&sample(STATE_RUN, TagValue::Bool(true), 0));
        window.observe(&sample(COUNTER_GOOD, TagValue::UInt(1_000), 0));
        window.observe(&sample(COUNTER_TOTAL, TagValue::UInt(2_000), 0));
        // 运行 400 分钟后停机 80 分钟
        window.observe(&sample(STATE_RUN, TagValue::Bool(false), 400 * MINUTE_MS));
        window.observe(&sample(COUNTER_GOOD, TagValue::UInt(1_700), 400 * MINUTE_MS));
        window.observe(&sample(COUNTER_TOTAL, TagValue::UInt(2_720), 400 * MINUTE_MS));

        assert!(window.is_due(480 * MINUTE_MS));
        let report = window.roll(480 * MINUTE_MS);
        assert!(report.closed);
        assert_eq!(report.planned_ms, 480 * MINUTE_MS);
        assert_eq!(report.run_ms, 400 * MINUTE_MS);
        assert_eq!(report.good_count, 700);
        assert_eq!(report.total_count, 720);
        assert!((report.oee - 0.7089).abs() < 1e-4);
    }

    #[test]
    fn counter_reset_counts_new_reading_as_delta() {
        let mut window = window();
        window.observe(&sample(COUNTER_TOTAL, TagValue::UInt(65_530), 0));
        window.observe(&sample(COUNTER_TOTAL, TagValue::UInt(65_535), 1_000));
        window.observe(&sample(COUNTER_TOTAL, TagValue::UInt(4), 2_000));
        let report = window.snapshot(3_000);
        assert!(!report.closed);
        assert_eq!(report.total_count, 9);
    }

    #[test]
    fn unplanned_time_is_excluded() {
        let mut window = window();
        window.observe(&sample(STATE_PLANNED, TagValue::Bool(false), 0));
        window.observe(&sample(STATE_RUN, TagValue::Bool(true), 0));
        window.observe(&sample(STATE_PLANNED, TagValue::Bool(true), 10 * MINUTE_MS));
        let report = window.snapshot(40 * MINUTE_MS);
        assert_eq!(report.planned_ms, 30 * MINUTE_MS);
        assert_eq!(report.run_ms, 30 * MINUTE_MS);
        assert_eq!(report.availability, 1.0);
    }

    #[test]
    fn roll_keeps_baselines_and_resets_totals() {
        let mut window = window();
        window.observe(&sample(COUNTER_GOOD, TagValue::UInt(10), 0));
        window.observe(&sample(COUNTER_GOOD, TagValue::UInt(15), MINUTE_MS));
        window.record_failure();
        window.record_repair(30_000);
        let first = window.roll(2 * MINUTE_MS);
        assert_eq!(first.good_count, 5);
        assert_eq!(first.failures, 1);
        assert_eq!(first.mttr_ms, 30_000.0);

        window.observe(&sample(COUNTER_GOOD, TagValue::UInt(18), 3 * MINUTE_MS));
        let second = window.roll(4 * MINUTE_MS);
        assert_eq!(second.window_start_ms, 2 * MINUTE_MS);
        assert_eq!(second.good_count, 3);
        assert_eq!(second.failures, 0);
        assert_eq!(second.mttr_ms, 0.0);
    }

    #[test]
    fn bad_quality_and_unrelated_signals_are_ignored() {
        let mut window = window();
        let bad = TagSample::bad("press-01", "hr:1:1", 0)
            .with_signal(Some(CanonicalSignal::parse(STATE_RUN).expect("signal")));
        assert!(!window.observe(&bad));
        assert!(!window.observe(&sample("pv.temperature", TagValue::Float(20.0), 0)));
    }
}
