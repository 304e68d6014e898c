//! One slave's worth of series cells plus its own temperature/voltage
//! readings and heartbeat tracking.
//!
//! Grounded on `original_source/battery_module.py`; the module-voltage limits
//! are derived from the per-cell limits times the series count rather than
//! hardcoded for a fixed 12-cell module, and the heartbeat timeout uses
//! spec.md's 20 s rather than the source's 5 s.

use std::time::{Duration, Instant};

use crate::cell::{Cell, CellId, CELL_VOLTAGE_LIMITS};
use crate::measurement::{Measurement, MeasurementLimits};

pub const ESP_TIMEOUT: Duration = Duration::from_secs(20);

pub const MODULE_TEMP_LIMITS: MeasurementLimits =
    MeasurementLimits::new(-100.0, -20.0, -10.0, 45.0, 50.0, 500.0);

pub const CHIP_TEMP_LIMITS: MeasurementLimits =
    MeasurementLimits::new(-100.0, -40.0, -30.0, 60.0, 80.0, 500.0);

fn module_voltage_limits(series_cells: u32) -> MeasurementLimits {
    let n = series_cells as f64;
    MeasurementLimits::new(
        CELL_VOLTAGE_LIMITS.implausible_lower * n,
        CELL_VOLTAGE_LIMITS.critical_lower * n,
        CELL_VOLTAGE_LIMITS.warning_lower * n,
        CELL_VOLTAGE_LIMITS.warning_upper * n,
        CELL_VOLTAGE_LIMITS.critical_upper * n,
        CELL_VOLTAGE_LIMITS.implausible_upper * n,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// Owns a fixed-size cell vector and the module-level Measurements. `id` is
/// handed into fired events instead of a back-pointer.
pub struct Module {
    pub id: ModuleId,
    pub cells: Vec<Cell>,
    pub module_temp1: Measurement<ModuleId>,
    pub module_temp2: Measurement<ModuleId>,
    pub chip_temp: Measurement<ModuleId>,
    pub voltage: Measurement<ModuleId>,
    last_esp_uptime_ms: Option<u64>,
    last_esp_uptime_in_own_time: Option<Instant>,
}

impl Module {
    pub fn new(id: ModuleId, series_cells: u32) -> Self {
        let cells = (0..series_cells)
            .map(|i| {
                Cell::new(CellId {
                    module_id: id.0,
                    cell_id: i,
                })
            })
            .collect();
        let voltage_limits = module_voltage_limits(series_cells);
        Self {
            id,
            cells,
            module_temp1: Measurement::new(id, MODULE_TEMP_LIMITS),
            module_temp2: Measurement::new(id, MODULE_TEMP_LIMITS),
            chip_temp: Measurement::new(id, CHIP_TEMP_LIMITS),
            voltage: Measurement::new(id, voltage_limits),
            last_esp_uptime_ms: None,
            last_esp_uptime_in_own_time: None,
        }
    }

    pub fn update_module_temps(&mut self, t1: f64, t2: f64) {
        self.module_temp1.update(t1);
        self.module_temp2.update(t2);
    }

    pub fn update_chip_temp(&mut self, t: f64) {
        self.chip_temp.update(t);
    }

    pub fn update_voltage(&mut self, v: f64) {
        self.voltage.update(v);
    }

    /// Stamps the receipt time and records the slave-reported uptime.
    /// Heartbeat staleness is read back on demand (`heartbeat_missed`) by the
    /// scheduler's periodic sweep rather than pushed via an event.
    pub fn update_esp_uptime(&mut self, uptime_ms: u64) {
        self.last_esp_uptime_ms = Some(uptime_ms);
        self.last_esp_uptime_in_own_time = Some(Instant::now());
    }

    pub fn last_esp_uptime(&self) -> Option<u64> {
        self.last_esp_uptime_ms
    }

    /// `true` if no heartbeat has ever been received (caller should log and
    /// skip rather than treat this as a missed heartbeat).
    pub fn heartbeat_uninitialized(&self) -> bool {
        self.last_esp_uptime_in_own_time.is_none()
    }

    /// `true` when the last heartbeat is older than `ESP_TIMEOUT`. Callers
    /// must check `heartbeat_uninitialized()` first.
    pub fn heartbeat_missed(&self) -> bool {
        match self.last_esp_uptime_in_own_time {
            Some(t) => t.elapsed() > ESP_TIMEOUT,
            None => false,
        }
    }

    pub fn temp(&self) -> Option<f64> {
        Some((self.module_temp1.value()? + self.module_temp2.value()?) / 2.0)
    }

    pub fn min_temp(&self) -> Option<f64> {
        match (self.module_temp1.value(), self.module_temp2.value()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        }
    }

    pub fn max_temp(&self) -> Option<f64> {
        match (self.module_temp1.value(), self.module_temp2.value()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        }
    }

    pub fn soc(&self) -> Option<f64> {
        let socs: Vec<f64> = self.cells.iter().filter_map(Cell::soc).collect();
        if socs.is_empty() {
            return None;
        }
        Some(socs.iter().sum::<f64>() / socs.len() as f64)
    }

    pub fn load_adjusted_soc(&self, current: f64) -> Option<f64> {
        let socs: Vec<f64> = self
            .cells
            .iter()
            .filter_map(|c| c.load_adjusted_soc(current))
            .collect();
        if socs.is_empty() {
            return None;
        }
        Some(socs.iter().sum::<f64>() / socs.len() as f64)
    }

    pub fn min_voltage_cell(&self) -> Option<&Cell> {
        self.cells
            .iter()
            .filter(|c| c.voltage.initialized())
            .min_by(|a, b| a.voltage.value().partial_cmp(&b.voltage.value()).unwrap())
    }

    pub fn max_voltage_cell(&self) -> Option<&Cell> {
        self.cells
            .iter()
            .filter(|c| c.voltage.initialized())
            .max_by(|a, b| a.voltage.value().partial_cmp(&b.voltage.value()).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voltage_limits_scale_with_series_count() {
        let m = Module::new(ModuleId(0), 12);
        assert!((m.voltage.limits.critical_lower - 36.0).abs() < 1e-9);
        assert!((m.voltage.limits.critical_upper - 50.4).abs() < 1e-9);
        assert!((m.voltage.limits.warning_lower - 38.4).abs() < 1e-9);
        assert!((m.voltage.limits.warning_upper - 49.8).abs() < 1e-9);
    }

    #[test]
    fn heartbeat_uninitialized_before_first_uptime() {
        let m = Module::new(ModuleId(0), 12);
        assert!(m.heartbeat_uninitialized());
        assert!(!m.heartbeat_missed());
    }

    #[test]
    fn heartbeat_fresh_right_after_update() {
        let mut m = Module::new(ModuleId(0), 12);
        m.update_esp_uptime(1000);
        assert!(!m.heartbeat_uninitialized());
        assert!(!m.heartbeat_missed());
        assert_eq!(m.last_esp_uptime(), Some(1000));
    }

    #[test]
    fn soc_is_none_until_a_cell_has_voltage() {
        let m = Module::new(ModuleId(0), 12);
        assert_eq!(m.soc(), None);
    }

    #[test]
    fn soc_averages_initialized_cells() {
        let mut m = Module::new(ModuleId(0), 2);
        m.cells[0].update_voltage(3.825); // ~0.70
        m.cells[1].update_voltage(3.825);
        let soc = m.soc().unwrap();
        assert!((soc - 0.70).abs() < 0.01);
    }
}
