//! Spawns the cooperative periodic tasks spec.md §5/§9 describe, plus the
//! inbound-message dispatch loop, against one shared `Arc<RwLock<Pack>>`.
//!
//! Grounded on the teacher's `controller/scheduler.rs`: one tokio task per
//! period, each tracked by a `TaskStatus` health snapshot.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{error, warn};

use crate::balancer::Balancer;
use crate::battery_module::ModuleId;
use crate::cell::CellId;
use crate::gateway::{topics, SlaveGateway};
use crate::pack::Pack;
use crate::safety::SafetySupervisor;

const HEARTBEAT_SEND_INTERVAL: Duration = Duration::from_secs(1);
const STATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(2);
const BALANCE_TICK_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const FRESHNESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const SAFETY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Per-task health snapshot, mirroring the teacher's `TaskStatus`.
#[derive(Debug, Clone, Default)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatus {
    fn record_start(&mut self) {
        self.last_run = Some(Utc::now());
        self.run_count += 1;
    }

    fn record_success(&mut self) {
        self.last_success = Some(Utc::now());
        self.success_count += 1;
    }

    fn record_error(&mut self, err: impl std::fmt::Display) {
        self.last_error = Some(err.to_string());
        self.error_count += 1;
    }
}

/// Shared runtime state the scheduler's tasks and the gateway dispatch loop
/// both operate on: one conceptual resource behind one lock, per spec.md §5.
pub struct PackRuntime {
    pub pack: RwLock<Pack>,
    pub balancer: RwLock<Balancer>,
    pub safety: RwLock<SafetySupervisor>,
    pub gateway: Arc<dyn SlaveGateway>,
    statuses: RwLock<HashMap<&'static str, TaskStatus>>,
}

impl PackRuntime {
    pub fn new(pack: Pack, gateway: Arc<dyn SlaveGateway>) -> Arc<Self> {
        Arc::new(Self {
            pack: RwLock::new(pack),
            balancer: RwLock::new(Balancer::new()),
            safety: RwLock::new(SafetySupervisor::new()),
            gateway,
            statuses: RwLock::new(HashMap::new()),
        })
    }

    pub async fn health_snapshot(&self) -> HashMap<&'static str, TaskStatus> {
        self.statuses.read().await.clone()
    }

    async fn mark_start(&self, name: &'static str) {
        self.statuses.write().await.entry(name).or_default().record_start();
    }

    async fn mark_success(&self, name: &'static str) {
        self.statuses.write().await.entry(name).or_default().record_success();
    }

    async fn mark_error(&self, name: &'static str, err: impl std::fmt::Display) {
        self.statuses.write().await.entry(name).or_default().record_error(err);
    }

    /// Runs `f`, catching both its `Err` and any panic inside it so the
    /// caller's loop keeps ticking: "the cooperative loop must not die on a
    /// transient bug."
    async fn run_task<F, Fut>(&self, name: &'static str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        self.mark_start(name).await;
        match AssertUnwindSafe(f()).catch_unwind().await {
            Ok(Ok(())) => self.mark_success(name).await,
            Ok(Err(err)) => {
                error!(task = name, %err, "periodic task failed");
                self.mark_error(name, err).await;
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(task = name, panic = %msg, "periodic task panicked; continuing");
                self.mark_error(name, format!("panicked: {msg}")).await;
            }
        }
    }

    /// Like `run_task` but does not catch a panic inside `f`: used only for
    /// the safety-disconnect path, which must propagate rather than be
    /// swallowed as a transient bug.
    async fn run_task_propagating<F, Fut>(&self, name: &'static str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        self.mark_start(name).await;
        match f().await {
            Ok(()) => self.mark_success(name).await,
            Err(err) => {
                error!(task = name, %err, "periodic task failed");
                self.mark_error(name, err).await;
            }
        }
    }
}

/// Extracts a human-readable message from a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub struct TaskScheduler {
    runtime: Arc<PackRuntime>,
}

impl TaskScheduler {
    pub fn new(runtime: Arc<PackRuntime>) -> Self {
        Self { runtime }
    }

    /// Spawns every periodic task as its own tokio task. Returns immediately;
    /// tasks run until the process exits (there is no graceful stop handle,
    /// matching spec.md §5's "no user-facing cancellation").
    pub fn start(self: Arc<Self>) {
        self.spawn_heartbeat_send();
        self.spawn_state_publish();
        self.spawn_balance_tick();
        self.spawn_heartbeat_check();
        self.spawn_freshness_check();
        self.spawn_safety_check();
        self.spawn_inbound_dispatch();
        self.spawn_connect_dispatch();
    }

    fn spawn_heartbeat_send(&self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let mut tick = interval(HEARTBEAT_SEND_INTERVAL);
            let start = tokio::time::Instant::now();
            loop {
                tick.tick().await;
                let task_runtime = runtime.clone();
                let uptime_ms = start.elapsed().as_millis().to_string();
                runtime
                    .run_task("heartbeat_send", || async move {
                        task_runtime.gateway.publish("master/uptime", &uptime_ms).await?;
                        Ok(())
                    })
                    .await;
            }
        });
    }

    fn spawn_state_publish(&self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let mut tick = interval(STATE_PUBLISH_INTERVAL);
            loop {
                tick.tick().await;
                let task_runtime = runtime.clone();
                runtime
                    .run_task("state_publish", || async move { publish_state(&task_runtime).await })
                    .await;
            }
        });
    }

    fn spawn_balance_tick(&self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let mut tick = interval(BALANCE_TICK_INTERVAL);
            loop {
                tick.tick().await;
                let task_runtime = runtime.clone();
                runtime
                    .run_task("balance_tick", || async move {
                        let mut pack = task_runtime.pack.write().await;
                        let mut balancer = task_runtime.balancer.write().await;
                        balancer.tick(&mut pack, task_runtime.gateway.as_ref()).await?;
                        Ok(())
                    })
                    .await;
            }
        });
    }

    fn spawn_heartbeat_check(&self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let mut tick = interval(HEARTBEAT_CHECK_INTERVAL);
            loop {
                tick.tick().await;
                let pack = runtime.pack.read().await;
                match std::panic::catch_unwind(AssertUnwindSafe(|| pack.check_heartbeats())) {
                    Ok(missed_list) => {
                        drop(pack);
                        for (module_id, missed) in missed_list {
                            if missed {
                                warn!(module = module_id.0, "module heartbeat check: missed");
                            }
                        }
                    }
                    Err(panic) => {
                        drop(pack);
                        error!(
                            task = "heartbeat_check",
                            panic = %panic_message(&panic),
                            "periodic task panicked; continuing"
                        );
                    }
                }
            }
        });
    }

    fn spawn_freshness_check(&self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let mut tick = interval(FRESHNESS_CHECK_INTERVAL);
            loop {
                tick.tick().await;
                let task_runtime = runtime.clone();
                runtime
                    .run_task("freshness_check", || async move {
                        let pack = task_runtime.pack.read().await;
                        let mut safety = task_runtime.safety.write().await;
                        safety
                            .check_cell_voltage_staleness(&pack, task_runtime.gateway.as_ref())
                            .await?;
                        Ok(())
                    })
                    .await;
            }
        });
    }

    fn spawn_safety_check(&self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let mut tick = interval(SAFETY_CHECK_INTERVAL);
            loop {
                tick.tick().await;
                let task_runtime = runtime.clone();
                runtime
                    .run_task_propagating("safety_check", || async move {
                        let pack = task_runtime.pack.read().await;
                        let mut safety = task_runtime.safety.write().await;
                        safety.check(&pack, task_runtime.gateway.as_ref()).await?;
                        safety.update_limits(&pack, task_runtime.gateway.as_ref()).await?;
                        Ok(())
                    })
                    .await;
            }
        });
    }

    fn spawn_inbound_dispatch(&self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let mut rx = runtime.gateway.subscribe_inbound();
            loop {
                let msg = match rx.recv().await {
                    Ok(msg) => msg,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "inbound message dispatch lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let decoded = match topics::decode(&msg.topic, &msg.payload) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        warn!(topic = %msg.topic, payload = %msg.payload, %err, "malformed inbound message");
                        continue;
                    }
                };
                let task_runtime = runtime.clone();
                let result = AssertUnwindSafe(dispatch_one(task_runtime, decoded))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(%err, "inbound dispatch failed");
                    }
                    Err(panic) => {
                        error!(
                            task = "inbound_dispatch",
                            panic = %panic_message(&panic),
                            "periodic task panicked; continuing"
                        );
                    }
                }
            }
        });
    }

    fn spawn_connect_dispatch(&self) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let mut rx = runtime.gateway.subscribe_connect();
            loop {
                match rx.recv().await {
                    Ok(()) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "gateway connect dispatch lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
                let task_runtime = runtime.clone();
                runtime
                    .run_task("connect_dispatch", || async move {
                        task_runtime
                            .balancer
                            .read()
                            .await
                            .publish_config(task_runtime.gateway.as_ref())
                            .await?;
                        Ok(())
                    })
                    .await;
            }
        });
    }
}

/// Applies one decoded inbound message against the shared runtime, republishing
/// balancer config whenever `enabled`/`ignore_slaves` changes.
async fn dispatch_one(runtime: Arc<PackRuntime>, decoded: topics::Inbound) -> anyhow::Result<()> {
    match decoded {
        topics::Inbound::BalancingEnabledSet(enabled) => {
            runtime.balancer.write().await.enabled = enabled;
            runtime
                .balancer
                .read()
                .await
                .publish_config(runtime.gateway.as_ref())
                .await?;
        }
        topics::Inbound::BalancingIgnoreSlavesSet(ids) => {
            runtime.balancer.write().await.ignore_slaves = ids.into_iter().collect();
            runtime
                .balancer
                .read()
                .await
                .publish_config(runtime.gateway.as_ref())
                .await?;
        }
        decoded => {
            let mut pack = runtime.pack.write().await;
            apply_inbound(&mut pack, decoded);
        }
    }
    Ok(())
}

fn apply_inbound(pack: &mut Pack, decoded: topics::Inbound) {
    use topics::Inbound;
    match decoded {
        Inbound::ModuleUptime { module, uptime_ms } => {
            if let Some(m) = pack.module_mut(ModuleId(module)) {
                m.update_esp_uptime(uptime_ms);
            }
        }
        Inbound::ModuleVoltage { module, voltage } => {
            if let Some(m) = pack.module_mut(ModuleId(module)) {
                m.update_voltage(voltage);
            }
        }
        Inbound::ModuleTemps { module, temp1, temp2 } => {
            if let Some(m) = pack.module_mut(ModuleId(module)) {
                m.update_module_temps(temp1, temp2);
            }
        }
        Inbound::ChipTemp { module, temp } => {
            if let Some(m) = pack.module_mut(ModuleId(module)) {
                m.update_chip_temp(temp);
            }
        }
        Inbound::CellVoltage { module, cell, voltage } => {
            if let Some(c) = pack.cell_mut(CellId { module_id: module, cell_id: cell }) {
                c.update_voltage(voltage);
            }
        }
        Inbound::CellAccurateVoltage { module, cell, voltage } => {
            if let Some(c) = pack.cell_mut(CellId { module_id: module, cell_id: cell }) {
                c.update_accurate_voltage(voltage);
            }
        }
        Inbound::CellIsBalancing { module, cell, balancing } => {
            if let Some(c) = pack.cell_mut(CellId { module_id: module, cell_id: cell }) {
                c.on_balance_pin_reported(balancing);
            }
        }
        Inbound::TotalVoltage(v) => pack.update_voltage(v),
        Inbound::TotalCurrent(a) => pack.update_current(a),
        Inbound::BalancingEnabledSet(_) | Inbound::BalancingIgnoreSlavesSet(_) => {
            unreachable!("dispatched to the balancer before reaching apply_inbound")
        }
    }
}

async fn publish_state(runtime: &PackRuntime) -> anyhow::Result<()> {
    let mut pack = runtime.pack.write().await;
    let gateway = runtime.gateway.as_ref();

    if let Some(soc) = pack.sliding_window_soc() {
        gateway.publish("master/core/soc", &soc.to_string()).await?;
        gateway
            .publish("master/can/battery/soc/set", &soc.to_string())
            .await?;
    }
    if let Some(v) = pack.calculated_voltage() {
        gateway
            .publish("master/core/calculated_system_voltage", &v.to_string())
            .await?;
    }
    if let Some(v) = pack.load_adjusted_calculated_voltage() {
        gateway
            .publish("master/core/load_adjusted_calculated_voltage", &v.to_string())
            .await?;
    }
    if let Some(diff) = pack.max_cell_diff() {
        gateway
            .publish("master/core/max_cell_diff", &diff.to_string())
            .await?;
    }
    if let (Some(v), Some(a)) = (pack.calculated_voltage(), pack.current.value()) {
        gateway
            .publish("master/core/system_power", &(v * a).to_string())
            .await?;
    }
    if let Some(t) = pack.temp() {
        gateway
            .publish("master/can/battery/temp/set", &t.to_string())
            .await?;
    }
    if let Some(t) = pack.highest_module_temp() {
        gateway
            .publish("master/can/battery/max_cell_temp/set", &t.to_string())
            .await?;
    }
    if let Some(t) = pack.lowest_module_temp() {
        gateway
            .publish("master/can/battery/min_cell_temp/set", &t.to_string())
            .await?;
    }

    for module in &pack.modules {
        if let Some(c) = module.min_voltage_cell() {
            if let Some(v) = c.voltage.value() {
                gateway
                    .publish(&topics::min_cell_voltage_topic(module.id.0), &v.to_string())
                    .await?;
            }
        }
        if let Some(c) = module.max_voltage_cell() {
            if let Some(v) = c.voltage.value() {
                gateway
                    .publish(&topics::max_cell_voltage_topic(module.id.0), &v.to_string())
                    .await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ChannelGateway;
    use std::sync::Arc;

    #[tokio::test]
    async fn publish_state_skips_uninitialized_aggregates_silently() {
        let pack = Pack::new(1, 2);
        let gateway: Arc<dyn SlaveGateway> = Arc::new(ChannelGateway::new());
        let runtime = PackRuntime::new(pack, gateway);
        publish_state(&runtime).await.unwrap();
    }

    #[tokio::test]
    async fn publish_state_emits_soc_once_a_cell_has_voltage() {
        let mut pack = Pack::new(1, 1);
        pack.modules[0].cells[0].update_voltage(3.825);
        pack.update_current(0.0);
        let gw = Arc::new(ChannelGateway::new());
        let runtime = PackRuntime::new(pack, gw.clone());
        publish_state(&runtime).await.unwrap();
        assert!(gw.last_published("master/core/soc").is_some());
    }

    #[tokio::test]
    async fn inbound_balancing_enabled_set_reaches_balancer_not_pack() {
        let pack = Pack::new(1, 2);
        let gw: Arc<dyn SlaveGateway> = Arc::new(ChannelGateway::new());
        let runtime = PackRuntime::new(pack, gw);
        assert!(runtime.balancer.read().await.enabled);
        let decoded =
            topics::decode("master/core/config/balancing_enabled/set", "false").unwrap();
        match decoded {
            topics::Inbound::BalancingEnabledSet(enabled) => {
                runtime.balancer.write().await.enabled = enabled;
            }
            _ => unreachable!(),
        }
        assert!(!runtime.balancer.read().await.enabled);
    }

    #[tokio::test]
    async fn inbound_cell_voltage_dispatch_updates_pack() {
        let pack = Pack::new(1, 2);
        let gw: Arc<dyn SlaveGateway> = Arc::new(ChannelGateway::new());
        let runtime = PackRuntime::new(pack, gw);
        let decoded = topics::decode("esp-module/1/cell/1/voltage", "3.71").unwrap();
        apply_inbound(&mut *runtime.pack.write().await, decoded);
        let pack = runtime.pack.read().await;
        assert_eq!(pack.modules[0].cells[0].voltage.value(), Some(3.71));
    }

    #[tokio::test]
    async fn dispatch_one_balancing_enabled_set_republishes_config() {
        let pack = Pack::new(1, 2);
        let gw = Arc::new(ChannelGateway::new());
        let gateway: Arc<dyn SlaveGateway> = gw.clone();
        let runtime = PackRuntime::new(pack, gateway);
        let decoded =
            topics::decode("master/core/config/balancing_enabled/set", "false").unwrap();
        dispatch_one(runtime.clone(), decoded).await.unwrap();
        assert!(!runtime.balancer.read().await.enabled);
        assert_eq!(
            gw.last_published("master/core/config/balancing_enabled"),
            Some("false".to_string())
        );
    }

    #[tokio::test]
    async fn run_task_survives_a_panicking_tick() {
        let pack = Pack::new(1, 2);
        let gateway: Arc<dyn SlaveGateway> = Arc::new(ChannelGateway::new());
        let runtime = PackRuntime::new(pack, gateway);
        runtime
            .run_task("panicking_task", || async move { panic!("boom") })
            .await;
        let statuses = runtime.health_snapshot().await;
        let status = statuses.get("panicking_task").unwrap();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.error_count, 1);
        assert!(status.last_error.as_ref().unwrap().contains("boom"));
    }
}
