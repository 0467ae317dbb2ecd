//! 背压协调：出站深度超过上限并持续一段时间后降频，低于下限并持续后恢复。

use edge_protocol::RateMode;
use edge_telemetry::{record_backpressure_activation, set_throttled};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

/// 背压参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureSettings {
    pub interval: Duration,
    pub upper: u64,
    pub lower: u64,
    pub delay: Duration,
    pub factor: u32,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            upper: 1_000,
            lower: 500,
            delay: Duration::from_secs(5),
            factor: 8,
        }
    }
}

/// 滞回控制器（纯状态机，时间由调用方提供）。
#[derive(Debug, Clone)]
pub struct HysteresisController {
    upper: u64,
    lower: u64,
    delay: Duration,
    throttled: bool,
    crossing_since: Option<Instant>,
}

impl HysteresisController {
    pub fn new(upper: u64, lower: u64, delay: Duration) -> Self {
        Self {
            upper,
            lower: lower.min(upper),
            delay,
            throttled: false,
            crossing_since: None,
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// 输入一次深度采样；状态切换时返回新的降频标志。
    pub fn observe(&mut self, depth: u64, now: Instant) -> Option<bool> {
        let crossing = if self.throttled {
            depth <= self.lower
        } else {
            depth >= self.upper
        };
        if !crossing {
            self.crossing_since = None;
            return None;
        }
        let since = *self.crossing_since.get_or_insert(now);
        if now.saturating_duration_since(since) < self.delay {
            return None;
        }
        self.throttled = !self.throttled;
        self.crossing_since = None;
        Some(self.throttled)
    }
}

/// 背压协调任务：周期采样深度并通过 watch 下发采样倍率。
pub struct BackpressureCoordinator {
    settings: BackpressureSettings,
    controller: HysteresisController,
    rate: watch::Sender<RateMode>,
}

impl BackpressureCoordinator {
    pub fn new(settings: BackpressureSettings, rate: watch::Sender<RateMode>) -> Self {
        Self {
            controller: HysteresisController::new(settings.upper, settings.lower, settings.delay),
            settings,
            rate,
        }
    }

    /// 处理一次采样，返回当前倍率。
    pub fn tick(&mut self, depth: u64, now: Instant) -> RateMode {
        if let Some(throttled) = self.controller.observe(depth, now) {
            let mode = if throttled {
                record_backpressure_activation();
                RateMode::Throttled {
                    factor: self.settings.factor,
                }
            } else {
                RateMode::Normal
            };
            set_throttled(throttled);
            info!(
                target: "edge.transport",
                depth,
                throttled,
                factor = mode.factor(),
                "backpressure_transition"
            );
            self.rate.send_replace(mode);
        }
        *self.rate.borrow()
    }

    /// 运行直到 shutdown；`depth` 返回当前出站深度（队列 + 通道积压）。
    pub async fn run<F>(mut self, depth: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn() -> u64 + Send,
    {
        let mut ticker = tokio::time::interval(self.settings.interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(depth(), Instant::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    #[test]
    fn activation_requires_sustained_depth() {
        let t0 = Instant::now();
        let mut controller = HysteresisController::new(1_000, 500, Duration::from_secs(5));
        assert_eq!(controller.observe(1_200, t0), None);
        assert_eq!(controller.observe(1_200, secs(t0, 3)), None);
        // 中途回落，计时重置
        assert_eq!(controller.observe(900, secs(t0, 4)), None);
        assert_eq!(controller.observe(1_100, secs(t0, 5)), None);
        assert_eq!(controller.observe(1_100, secs(t0, 9)), None);
        assert_eq!(controller.observe(1_100, secs(t0, 10)), Some(true));
        assert!(controller.is_throttled());
    }

    #[test]
    fn between_thresholds_nothing_changes() {
        let t0 = Instant::now();
        let mut controller = HysteresisController::new(1_000, 500, Duration::from_secs(5));
        controller.observe(1_000, t0);
        assert_eq!(controller.observe(1_000, secs(t0, 5)), Some(true));
        for step in 6..30 {
            assert_eq!(controller.observe(700, secs(t0, step)), None);
        }
        assert!(controller.is_throttled());
        assert_eq!(controller.observe(500, secs(t0, 30)), None);
        assert_eq!(controller.observe(100, secs(t0, 35)), Some(false));
        assert!(!controller.is_throttled());
    }

    #[test]
    fn coordinator_publishes_rate_mode() {
        let (tx, rx) = watch::channel(RateMode::Normal);
        let settings = BackpressureSettings {
            delay: Duration::ZERO,
            ..BackpressureSettings::default()
        };
        let mut coordinator = BackpressureCoordinator::new(settings, tx);
        let now = Instant::now();
        assert_eq!(
            coordinator.tick(2_000, now),
            RateMode::Throttled { factor: 8 }
        );
        assert_eq!(*rx.borrow(), RateMode::Throttled { factor: 8 });
        assert_eq!(coordinator.tick(800, now), RateMode::Throttled { factor: 8 });
        assert_eq!(coordinator.tick(0, now), RateMode::Normal);
        assert_eq!(*rx.borrow(), RateMode::Normal);
    }
}
