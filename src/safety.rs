//! Event-driven escalation to a safety disconnect, plus SOC-hysteresis
//! charge/discharge gating.
//!
//! Grounded on `original_source/battery_manager.py` for policy (the debounce
//! thresholds, the hysteresis SOC points) and on the teacher's
//! `controller/safety_monitor.rs` for the Rust realization: rather than
//! wiring a closure onto every Measurement's `EventSink` at construction (the
//! source's approach), this supervisor is invoked by the scheduler once per
//! tick and inspects the shared pack directly. A closure fired from inside
//! `Measurement::update` while the pack's lock is already held would have no
//! safe way to re-enter the same lock to read counters back out, so the
//! escalation policy here is realized as a poll over monotonic counters
//! instead of nested event dispatch; since the counters themselves are the
//! same stateful escalation counters the source updates, the triggering
//! behavior is unchanged — only the wiring moved from "notify on write" to
//! "inspect on tick".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::battery_module::ModuleId;
use crate::cell::CellId;
use crate::gateway::{GatewayError, SlaveGateway};
use crate::measurement::{Classification, Measurement};
use crate::pack::Pack;
use crate::soc_curve::SocCurve;

const LOG_RATE_LIMIT: Duration = Duration::from_secs(60);
const CRITICAL_DISCONNECT_THRESHOLD: u32 = 4;
const IMPLAUSIBLE_DISCONNECT_THRESHOLD: u32 = 20;
const CELL_VOLTAGE_WARNING_STALE_AFTER: f64 = 60.0;
const CELL_VOLTAGE_CRITICAL_STALE_AFTER: f64 = 7200.0;

const RELAYS: [&str; 5] = [
    "battery_plus",
    "battery_precharge",
    "battery_minus",
    "1",
    "2",
];
const CAN_LIMITS: [&str; 4] = [
    "max_voltage",
    "min_voltage",
    "max_charge_current",
    "max_discharge_current",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationSubject {
    PackVoltage,
    PackCurrent,
    ModuleTemp(ModuleId),
    ChipTemp(ModuleId),
    ModuleVoltage(ModuleId),
    CellVoltage(CellId),
}

impl std::fmt::Display for ViolationSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PackVoltage => write!(f, "pack voltage"),
            Self::PackCurrent => write!(f, "pack current"),
            Self::ModuleTemp(m) => write!(f, "module {} temperature", m.0),
            Self::ChipTemp(m) => write!(f, "module {} chip temperature", m.0),
            Self::ModuleVoltage(m) => write!(f, "module {} voltage", m.0),
            Self::CellVoltage(c) => write!(f, "module {} cell {} voltage", c.module_id, c.cell_id),
        }
    }
}

pub struct SafetySupervisor {
    soc_curve: SocCurve,
    pub allow_charge: bool,
    pub allow_discharge: bool,
    last_warning_time: HashMap<ViolationSubject, Instant>,
    disconnected: bool,
}

impl Default for SafetySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetySupervisor {
    pub fn new() -> Self {
        Self {
            soc_curve: SocCurve::new(),
            allow_charge: true,
            allow_discharge: true,
            last_warning_time: HashMap::new(),
            disconnected: false,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn should_log(&mut self, subject: ViolationSubject) -> bool {
        let now = Instant::now();
        let due = self
            .last_warning_time
            .get(&subject)
            .map(|t| now.duration_since(*t) >= LOG_RATE_LIMIT)
            .unwrap_or(true);
        if due {
            self.last_warning_time.insert(subject, now);
        }
        due
    }

    /// Walks every cell/module/pack Measurement once and acts on its current
    /// classification, matching the per-quantity policy in spec.md §4.8.
    pub async fn check(
        &mut self,
        pack: &Pack,
        gateway: &dyn SlaveGateway,
    ) -> Result<(), GatewayError> {
        self.evaluate(ViolationSubject::PackVoltage, &pack.voltage, gateway)
            .await?;
        self.evaluate(ViolationSubject::PackCurrent, &pack.current, gateway)
            .await?;

        for module in &pack.modules {
            self.evaluate(
                ViolationSubject::ModuleTemp(module.id),
                &module.module_temp1,
                gateway,
            )
            .await?;
            self.evaluate(
                ViolationSubject::ModuleTemp(module.id),
                &module.module_temp2,
                gateway,
            )
            .await?;
            self.evaluate(
                ViolationSubject::ChipTemp(module.id),
                &module.chip_temp,
                gateway,
            )
            .await?;
            self.evaluate(
                ViolationSubject::ModuleVoltage(module.id),
                &module.voltage,
                gateway,
            )
            .await?;

            for cell in &module.cells {
                self.evaluate(
                    ViolationSubject::CellVoltage(cell.id),
                    &cell.voltage,
                    gateway,
                )
                .await?;
            }
        }

        for (module_id, missed) in pack.check_heartbeats() {
            if missed {
                warn!(module = module_id.0, "heartbeat missed");
            }
        }

        Ok(())
    }

    async fn evaluate<Owner: Clone>(
        &mut self,
        subject: ViolationSubject,
        measurement: &Measurement<Owner>,
        gateway: &dyn SlaveGateway,
    ) -> Result<(), GatewayError> {
        let Some(value) = measurement.value() else {
            return Ok(());
        };
        match measurement.classification() {
            Some(Classification::Implausible) => {
                if self.should_log(subject) {
                    warn!(%subject, value, "implausible reading");
                }
                if measurement.implausible_counter() > IMPLAUSIBLE_DISCONNECT_THRESHOLD {
                    let reason = format!("implausible {subject}: {value}");
                    self.trigger_safety_disconnect(&reason, gateway).await?;
                }
            }
            Some(Classification::Critical) => {
                if self.should_log(subject) {
                    warn!(%subject, value, "critical reading");
                }
                if measurement.critical_counter() > CRITICAL_DISCONNECT_THRESHOLD {
                    let reason = format!("critical {subject}: {value}");
                    self.trigger_safety_disconnect(&reason, gateway).await?;
                }
            }
            Some(Classification::Warning) => {
                if self.should_log(subject) {
                    warn!(%subject, value, "warning reading");
                }
            }
            Some(Classification::Ok) | None => {}
        }
        Ok(())
    }

    /// Periodic (5 s) staleness sweep, separate from the per-quantity
    /// classification check above: a cell that stopped reporting entirely
    /// never crosses a voltage threshold, so it needs its own check.
    pub async fn check_cell_voltage_staleness(
        &mut self,
        pack: &Pack,
        gateway: &dyn SlaveGateway,
    ) -> Result<(), GatewayError> {
        let cells = pack.cells();
        if cells.has_voltage_older_than(CELL_VOLTAGE_CRITICAL_STALE_AFTER) {
            let reason = format!(
                "cell voltage reading older than {CELL_VOLTAGE_CRITICAL_STALE_AFTER}s"
            );
            warn!(%reason, "cell voltage stale, disconnecting");
            self.trigger_safety_disconnect(&reason, gateway).await?;
            return Ok(());
        }
        if cells.has_voltage_older_than(CELL_VOLTAGE_WARNING_STALE_AFTER) {
            warn!(
                "cell voltage reading older than {}s",
                CELL_VOLTAGE_WARNING_STALE_AFTER
            );
        }
        Ok(())
    }

    /// SOC-derived hysteresis on `allow_charge`/`allow_discharge`. Mirrors
    /// the source exactly: the "disallow" branch republishes every time the
    /// condition holds, the "re-allow" branch only publishes on the
    /// false-to-true transition.
    pub async fn update_limits(
        &mut self,
        pack: &Pack,
        gateway: &dyn SlaveGateway,
    ) -> Result<(), GatewayError> {
        if let Some(lowest) = pack.lowest_cell_voltage() {
            let cutoff_low = self.soc_curve.soc_to_voltage(0.37).unwrap_or(f64::NEG_INFINITY);
            let cutoff_high = self.soc_curve.soc_to_voltage(0.41).unwrap_or(f64::INFINITY);
            if lowest <= cutoff_low {
                self.allow_discharge = false;
                gateway
                    .publish("master/can/limits/max_discharge_current/set", "0")
                    .await?;
            } else if lowest >= cutoff_high && !self.allow_discharge {
                self.allow_discharge = true;
                gateway
                    .publish("master/can/limits/max_discharge_current/reset", "")
                    .await?;
            }
        }

        if let Some(highest) = pack.highest_cell_voltage() {
            let cutoff_high = self.soc_curve.soc_to_voltage(0.93).unwrap_or(f64::INFINITY);
            let cutoff_low = self.soc_curve.soc_to_voltage(0.90).unwrap_or(f64::NEG_INFINITY);
            if highest >= cutoff_high {
                self.allow_charge = false;
                gateway
                    .publish("master/can/limits/max_charge_current/set", "0")
                    .await?;
            } else if highest <= cutoff_low && !self.allow_charge {
                self.allow_charge = true;
                gateway
                    .publish("master/can/limits/max_charge_current/reset", "")
                    .await?;
            }
        }

        Ok(())
    }

    /// Opens every relay, zeroes every published CAN limit, and publishes the
    /// reason. Idempotent: always safe to call again.
    pub async fn trigger_safety_disconnect(
        &mut self,
        reason: &str,
        gateway: &dyn SlaveGateway,
    ) -> Result<(), GatewayError> {
        self.disconnected = true;
        for relay in RELAYS {
            gateway
                .publish(&format!("master/relays/{relay}/set"), "off")
                .await?;
        }
        for limit in CAN_LIMITS {
            gateway
                .publish(&format!("master/can/limits/{limit}/set"), "0")
                .await?;
        }
        gateway
            .publish("master/core/safety_disconnect_reason", reason)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ChannelGateway;

    #[tokio::test]
    async fn critical_below_debounce_threshold_does_not_disconnect() {
        let mut pack = Pack::new(1, 1);
        for _ in 0..4 {
            pack.modules[0].cells[0].update_voltage(2.9); // critical
        }
        let gw = ChannelGateway::new();
        let mut supervisor = SafetySupervisor::new();
        supervisor.check(&pack, &gw).await.unwrap();
        assert!(!supervisor.is_disconnected());
    }

    #[tokio::test]
    async fn critical_past_debounce_threshold_disconnects() {
        let mut pack = Pack::new(1, 1);
        for _ in 0..6 {
            pack.modules[0].cells[0].update_voltage(2.9); // critical, counter climbs
        }
        let gw = ChannelGateway::new();
        let mut supervisor = SafetySupervisor::new();
        supervisor.check(&pack, &gw).await.unwrap();
        assert!(supervisor.is_disconnected());
        assert_eq!(
            gw.last_published("master/can/limits/max_voltage/set"),
            Some("0".to_string())
        );
        assert_eq!(
            gw.last_published("master/relays/battery_plus/set"),
            Some("off".to_string())
        );
    }

    #[tokio::test]
    async fn warning_never_disconnects() {
        let mut pack = Pack::new(1, 1);
        for _ in 0..100 {
            pack.modules[0].cells[0].update_voltage(3.18); // warning band
        }
        let gw = ChannelGateway::new();
        let mut supervisor = SafetySupervisor::new();
        supervisor.check(&pack, &gw).await.unwrap();
        assert!(!supervisor.is_disconnected());
    }

    #[tokio::test]
    async fn s6_stale_cell_voltage_triggers_disconnect() {
        let pack = Pack::new(1, 1); // voltage never updated: infinitely old
        let gw = ChannelGateway::new();
        let mut supervisor = SafetySupervisor::new();
        supervisor.check_cell_voltage_staleness(&pack, &gw).await.unwrap();
        assert!(supervisor.is_disconnected());
    }

    #[tokio::test]
    async fn discharge_disallowed_below_37_percent_and_reallowed_above_41() {
        let mut pack = Pack::new(1, 1);
        let gw = ChannelGateway::new();
        let mut supervisor = SafetySupervisor::new();
        let curve = SocCurve::new();

        let low = curve.soc_to_voltage(0.30).unwrap();
        pack.modules[0].cells[0].update_voltage(low);
        supervisor.update_limits(&pack, &gw).await.unwrap();
        assert!(!supervisor.allow_discharge);

        let high = curve.soc_to_voltage(0.5).unwrap();
        pack.modules[0].cells[0].update_voltage(high);
        supervisor.update_limits(&pack, &gw).await.unwrap();
        assert!(supervisor.allow_discharge);
    }

    #[tokio::test]
    async fn p6_disconnect_publishes_all_four_can_limits_as_zero() {
        let gw = ChannelGateway::new();
        let mut supervisor = SafetySupervisor::new();
        supervisor
            .trigger_safety_disconnect("test", &gw)
            .await
            .unwrap();
        for limit in CAN_LIMITS {
            assert_eq!(
                gw.last_published(&format!("master/can/limits/{limit}/set")),
                Some("0".to_string())
            );
        }
    }
}
