//! Whole-pack aggregate: owns all modules, the pack-level voltage/current
//! Measurements, and the sliding-window SOC estimator.
//!
//! Grounded on `original_source/battery_system.py`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::battery_module::{Module, ModuleId};
use crate::cell::{Cell, CellId, DEFAULT_INTERNAL_IMPEDANCE_OHM};
use crate::cell_list::CellListView;
use crate::measurement::{Measurement, MeasurementLimits};

pub const SLIDING_WINDOW: Duration = Duration::from_secs(180);

pub const PACK_CURRENT_LIMITS: MeasurementLimits =
    MeasurementLimits::new(-500.0, -32.0, -30.0, 30.0, 32.0, 500.0);

fn pack_voltage_limits(total_series_cells: u32) -> MeasurementLimits {
    let n = total_series_cells as f64;
    MeasurementLimits::new(-10000.0, 3.0 * n, 3.2 * n, 4.15 * n, 4.2 * n, 10000.0)
}

/// Unit struct: the pack is a singleton within a process, so its events just
/// need a stable, cheap-to-clone owner handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PackId;

pub struct Pack {
    pub modules: Vec<Module>,
    pub voltage: Measurement<PackId>,
    pub current: Measurement<PackId>,
    soc_window: VecDeque<(Instant, f64)>,
}

impl Pack {
    /// `number_of_modules` must be in `1..=16`, matching the source's assert.
    pub fn new(number_of_modules: u32, number_of_serial_cells: u32) -> Self {
        assert!(
            (1..=16).contains(&number_of_modules),
            "number_of_modules must be in 1..=16"
        );
        let modules = (0..number_of_modules)
            .map(|i| Module::new(ModuleId(i), number_of_serial_cells))
            .collect();
        let total_series_cells = number_of_modules * number_of_serial_cells;
        Self {
            modules,
            voltage: Measurement::new(PackId, pack_voltage_limits(total_series_cells)),
            current: Measurement::new(PackId, PACK_CURRENT_LIMITS),
            soc_window: VecDeque::new(),
        }
    }

    pub fn update_voltage(&mut self, v: f64) {
        self.voltage.update(v);
    }

    pub fn update_current(&mut self, a: f64) {
        self.current.update(a);
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.modules.iter_mut().find(|m| m.id == id)
    }

    pub fn cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.module_mut(ModuleId(id.module_id))?
            .cells
            .iter_mut()
            .find(|c| c.id == id)
    }

    pub fn cells(&self) -> CellListView<'_> {
        CellListView::new(self.modules.iter().flat_map(|m| m.cells.iter()).collect())
    }

    pub fn calculated_voltage(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut any = false;
        for c in self.modules.iter().flat_map(|m| &m.cells) {
            sum += c.voltage.value()?;
            any = true;
        }
        any.then_some(sum)
    }

    /// Applies internal-impedance correction with the current pack current
    /// to every cell before summing, rather than correcting the sum once.
    pub fn load_adjusted_calculated_voltage(&self) -> Option<f64> {
        let current = self.current.value()?;
        let mut sum = 0.0;
        for c in self.modules.iter().flat_map(|m| &m.cells) {
            sum += c.voltage.value()? + current * DEFAULT_INTERNAL_IMPEDANCE_OHM;
        }
        Some(sum)
    }

    pub fn max_cell_diff(&self) -> Option<f64> {
        self.cells().max_diff()
    }

    pub fn temp(&self) -> Option<f64> {
        let temps: Vec<f64> = self.modules.iter().filter_map(Module::temp).collect();
        if temps.is_empty() {
            return None;
        }
        Some(temps.iter().sum::<f64>() / temps.len() as f64)
    }

    pub fn soc(&self) -> Option<f64> {
        let socs: Vec<f64> = self.modules.iter().filter_map(Module::soc).collect();
        if socs.is_empty() {
            return None;
        }
        Some(socs.iter().sum::<f64>() / socs.len() as f64)
    }

    pub fn load_adjusted_soc(&self) -> Option<f64> {
        let current = self.current.value()?;
        let socs: Vec<f64> = self
            .modules
            .iter()
            .filter_map(|m| m.load_adjusted_soc(current))
            .collect();
        if socs.is_empty() {
            return None;
        }
        Some(socs.iter().sum::<f64>() / socs.len() as f64)
    }

    /// Appends the current `load_adjusted_soc()` sample, prunes samples older
    /// than the sliding window, then returns the arithmetic mean of what
    /// remains. The window is append-only between calls: it only shrinks
    /// here, on read, never on a timer.
    ///
    /// Returns `None` if no SOC sample could be computed yet (no cell has
    /// reported voltage).
    pub fn sliding_window_soc(&mut self) -> Option<f64> {
        let sample = self.load_adjusted_soc()?;
        self.soc_window.push_back((Instant::now(), sample));

        while let Some((t, _)) = self.soc_window.front() {
            if t.elapsed() > SLIDING_WINDOW {
                self.soc_window.pop_front();
            } else {
                break;
            }
        }

        let sum: f64 = self.soc_window.iter().map(|(_, s)| s).sum();
        Some(sum / self.soc_window.len() as f64)
    }

    pub fn lowest_module_temp(&self) -> Option<f64> {
        self.modules
            .iter()
            .filter_map(Module::min_temp)
            .fold(None, |acc, t| Some(acc.map_or(t, |m: f64| m.min(t))))
    }

    pub fn highest_module_temp(&self) -> Option<f64> {
        self.modules
            .iter()
            .filter_map(Module::max_temp)
            .fold(None, |acc, t| Some(acc.map_or(t, |m: f64| m.max(t))))
    }

    pub fn highest_cell_voltage(&self) -> Option<f64> {
        self.cells().highest_voltage()
    }

    pub fn lowest_cell_voltage(&self) -> Option<f64> {
        self.cells().lowest_voltage()
    }

    /// Returns exactly `number` cells, highest voltage first (inclusive of
    /// `number` itself, per the documented resolution of spec.md's open
    /// question about this boundary).
    pub fn highest_voltage_cells(&self, number: usize) -> Vec<&Cell> {
        let mut cells: Vec<&Cell> = self.modules.iter().flat_map(|m| &m.cells).collect();
        cells.sort_by(|a, b| {
            b.voltage
                .value()
                .partial_cmp(&a.voltage.value())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        cells.truncate(number);
        cells
    }

    pub fn is_in_relax_time(&self) -> bool {
        self.cells().in_relax_time()
    }

    pub fn is_currently_balancing(&self) -> bool {
        self.cells().currently_balancing()
    }

    pub fn check_heartbeats(&self) -> Vec<(ModuleId, bool)> {
        self.modules
            .iter()
            .filter(|m| !m.heartbeat_uninitialized())
            .map(|m| (m.id, m.heartbeat_missed()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn rejects_zero_modules() {
        Pack::new(0, 12);
    }

    #[test]
    fn calculated_voltage_sums_all_cells() {
        let mut pack = Pack::new(1, 2);
        pack.modules[0].cells[0].update_voltage(3.7);
        pack.modules[0].cells[1].update_voltage(3.7);
        assert!((pack.calculated_voltage().unwrap() - 7.4).abs() < 1e-9);
    }

    #[test]
    fn calculated_voltage_none_until_all_cells_reported() {
        let mut pack = Pack::new(1, 2);
        pack.modules[0].cells[0].update_voltage(3.7);
        assert_eq!(pack.calculated_voltage(), None);
    }

    #[test]
    fn sliding_window_soc_is_non_empty_mean_after_first_call() {
        let mut pack = Pack::new(1, 1);
        pack.modules[0].cells[0].update_voltage(3.825);
        pack.update_current(0.0);
        let soc = pack.sliding_window_soc().unwrap();
        assert!((soc - 0.70).abs() < 0.01);
    }

    #[test]
    fn highest_voltage_cells_returns_exactly_n_sorted_descending() {
        let mut pack = Pack::new(1, 4);
        let voltages = [3.6, 3.9, 3.7, 3.8];
        for (cell, v) in pack.modules[0].cells.iter_mut().zip(voltages) {
            cell.update_voltage(v);
        }
        let top2 = pack.highest_voltage_cells(2);
        assert_eq!(top2.len(), 2);
        assert!((top2[0].voltage.value().unwrap() - 3.9).abs() < 1e-9);
        assert!((top2[1].voltage.value().unwrap() - 3.8).abs() < 1e-9);
    }

    #[test]
    fn pack_voltage_limits_scale_by_total_series_cells() {
        let pack = Pack::new(2, 12); // 24 series cells total
        assert!((pack.voltage.limits.critical_lower - 72.0).abs() < 1e-9);
        assert!((pack.voltage.limits.critical_upper - 100.8).abs() < 1e-9);
    }
}
