//! 机台 actor：独占该机台的 OEE 窗口与故障簿（单写者）。

use crate::PipelineError;
use domain::{EventRecord, FaultEvent, FaultTransition, SignalKind, TagSample};
use edge_fault::{FaultBook, FaultPolicy};
use edge_oee::{OeeWindow, WindowSettings};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

const INPUT_CAPACITY: usize = 256;

/// actor 输入。
#[derive(Debug)]
pub enum MachineInput {
    Sample(TagSample),
    /// 周期计算：窗口到期则关闭，否则产出中间结果。
    Tick { now_ms: i64 },
    Acknowledge {
        code: i64,
        operator: String,
        reply: oneshot::Sender<Result<FaultEvent, PipelineError>>,
    },
    Reconfigure {
        window: WindowSettings,
        policy: FaultPolicy,
    },
}

pub struct MachineActor {
    window: OeeWindow,
    faults: FaultBook,
}

impl MachineActor {
    pub fn new(
        machine_id: impl Into<String>,
        window: WindowSettings,
        policy: FaultPolicy,
        start_ms: i64,
    ) -> Self {
        let machine_id = machine_id.into();
        Self {
            window: OeeWindow::new(machine_id.clone(), window, start_ms),
            faults: FaultBook::new(machine_id, policy),
        }
    }

    pub fn machine_id(&self) -> &str {
        self.window.machine_id()
    }

    /// 处理一条输入，返回派生事件。
    pub fn handle(&mut self, input: MachineInput) -> Vec<EventRecord> {
        match input {
            MachineInput::Sample(sample) => self.on_sample(sample),
            MachineInput::Tick { now_ms } => {
                let report = if self.window.is_due(now_ms) {
                    self.window.roll(now_ms)
                } else {
                    self.window.snapshot(now_ms)
                };
                vec![EventRecord::Oee(report)]
            }
            MachineInput::Acknowledge {
                code,
                operator,
                reply,
            } => {
                let result = self
                    .faults
                    .acknowledge(code, &operator, domain::now_epoch_ms())
                    .map_err(|err| PipelineError::Fault(err.to_string()));
                let events = match &result {
                    Ok(event) => vec![EventRecord::Fault(event.clone())],
                    Err(_) => Vec::new(),
                };
                let _ = reply.send(result);
                events
            }
            MachineInput::Reconfigure { window, policy } => {
                self.window.update_settings(window);
                self.faults.set_policy(policy);
                Vec::new()
            }
        }
    }

    fn on_sample(&mut self, sample: TagSample) -> Vec<EventRecord> {
        let Some(signal) = sample.signal.as_ref() else {
            return Vec::new();
        };
        if signal.kind() != SignalKind::Fault {
            self.window.observe(&sample);
            return Vec::new();
        }
        let events = self
            .faults
            .observe(signal.as_str(), &sample.value, sample.ts_ms);
        for event in &events {
            match event.transition {
                FaultTransition::Opened => self.window.record_failure(),
                FaultTransition::Resolved => {
                    if let Some(repair_ms) = event.record.repair_ms() {
                        self.window.record_repair(repair_ms);
                    }
                }
                _ => {}
            }
        }
        events.into_iter().map(EventRecord::Fault).collect()
    }

    /// 启动 actor 任务；输入通道关闭后退出。
    pub fn spawn(
        mut self,
        events: mpsc::Sender<EventRecord>,
    ) -> (mpsc::Sender<MachineInput>, JoinHandle<()>) {
        let (sender, mut inputs) = mpsc::channel(INPUT_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(input) = inputs.recv().await {
                for event in self.handle(input) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            debug!(target: "edge.pipeline", machine_id = %self.machine_id(), "machine_actor_stopped");
        });
        (sender, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{CanonicalSignal, Quality, TagValue};

    fn sample(signal: &str, value: TagValue, ts_ms: i64) -> TagSample {
        TagSample::new("press-01", signal, value, Quality::Good, ts_ms)
            .with_signal(Some(CanonicalSignal::parse(signal).expect("signal")))
    }

    fn actor() -> MachineActor {
        MachineActor::new(
            "press-01",
            WindowSettings {
                ideal_cycle_s: 30.0,
                window_ms: 3_600_000,
            },
            FaultPolicy::default(),
            0,
        )
    }

    #[test]
    fn fault_lifecycle_feeds_mean_times() {
        let mut actor = actor();
        actor.handle(MachineInput::Sample(sample("state.run", TagValue::Bool(true), 0)));
        let opened = actor.handle(MachineInput::Sample(sample(
            "fault.code",
            TagValue::Int(101),
            60_000,
        )));
        assert!(matches!(
            &opened[..],
            [EventRecord::Fault(FaultEvent {
                transition: FaultTransition::Opened,
                ..
            })]
        ));
        actor.handle(MachineInput::Sample(sample("fault.code", TagValue::Int(0), 120_000)));

        let events = actor.handle(MachineInput::Tick { now_ms: 600_000 });
        let [EventRecord::Oee(report)] = &events[..] else {
            panic!("expected one report, got {:?}", events);
        };
        assert!(!report.closed);
        assert_eq!(report.failures, 1);
        assert_eq!(report.repairs, 1);
        assert_eq!(report.mttr_ms, 60_000.0);
        assert_eq!(report.mtbf_ms, 600_000.0);
    }

    #[test]
    fn tick_after_window_closes_it() {
        let mut actor = actor();
        actor.handle(MachineInput::Sample(sample("state.run", TagValue::Bool(true), 0)));
        let events = actor.handle(MachineInput::Tick { now_ms: 3_600_000 });
        let [EventRecord::Oee(report)] = &events[..] else {
            panic!("expected one report");
        };
        assert!(report.closed);
        assert_eq!(report.availability, 1.0);
    }

    #[tokio::test]
    async fn acknowledge_replies_through_actor() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (inputs, _task) = actor().spawn(events_tx);
        inputs
            .send(MachineInput::Sample(sample("fault.code", TagValue::Int(7), 0)))
            .await
            .expect("send");
        let (reply, result) = oneshot::channel();
        inputs
            .send(MachineInput::Acknowledge {
                code: 7,
                operator: "op".to_string(),
                reply,
            })
            .await
            .expect("send");
        let event = result.await.expect("reply").expect("ack");
        assert_eq!(event.transition, FaultTransition::Acknowledged);

        let (reply, result) = oneshot::channel();
        inputs
            .send(MachineInput::Acknowledge {
                code: 99,
                operator: "op".to_string(),
                reply,
            })
            .await
            .expect("send");
        assert!(result.await.expect("reply").is_err());

        assert!(matches!(events_rx.recv().await, Some(EventRecord::Fault(_))));
        assert!(matches!(events_rx.recv().await, Some(EventRecord::Fault(_))));
    }
}
