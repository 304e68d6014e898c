//! Single series cell: voltage measurement pair plus passive-balancing pin
//! state.
//!
//! Grounded on `original_source/battery_cell.py`.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::measurement::{Measurement, MeasurementLimits};
use crate::soc_curve::SocCurve;

/// `(module_id, cell_id)`, cheap to pass by value into event handlers instead
/// of a back-reference to the owning `Cell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId {
    pub module_id: u32,
    pub cell_id: u32,
}

/// Cell-level voltage thresholds, matching
/// `BatteryCell.{LOWER,UPPER}_VOLTAGE_LIMIT_*`.
pub const CELL_VOLTAGE_LIMITS: MeasurementLimits =
    MeasurementLimits::new(-1000.0, 3.0, 3.2, 4.15, 4.2, 1000.0);

/// Default pack-referred internal impedance used for load-adjusted SOC, for
/// a 2-parallel cell group.
pub const DEFAULT_INTERNAL_IMPEDANCE_OHM: f64 = 0.000975;

pub const DEFAULT_RELAX_TIME: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum CellError {
    #[error("start_balance_discharge on cell {0:?} has no registered listener")]
    NoBalanceListener(CellId),
}

/// Passive-balancing discharge pin, tri-state because a freshly constructed
/// cell has never heard from its slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancePinState {
    Unknown,
    Off,
    On,
}

pub struct Cell {
    pub id: CellId,
    pub voltage: Measurement<CellId>,
    pub accurate_voltage: Measurement<CellId>,
    pub relax_time: Duration,
    balance_pin_state: BalancePinState,
    last_discharge_time: Option<Instant>,
    soc_curve: SocCurve,
    balance_listener_registered: bool,
}

impl Cell {
    pub fn new(id: CellId) -> Self {
        Self {
            id,
            voltage: Measurement::new(id, CELL_VOLTAGE_LIMITS),
            accurate_voltage: Measurement::new(id, CELL_VOLTAGE_LIMITS),
            relax_time: DEFAULT_RELAX_TIME,
            balance_pin_state: BalancePinState::Unknown,
            last_discharge_time: None,
            soc_curve: SocCurve::new(),
            balance_listener_registered: false,
        }
    }

    /// Must be called once before `start_balance_discharge` is usable; mirrors
    /// the source's assertion that a listener is wired to the communication
    /// event before balancing is attempted.
    pub fn register_balance_listener(&mut self) {
        self.balance_listener_registered = true;
    }

    pub fn update_voltage(&mut self, v: f64) {
        self.voltage.update(v);
    }

    pub fn update_accurate_voltage(&mut self, v: f64) {
        self.accurate_voltage.update(v);
    }

    /// State of charge from the standard (non-accurate) voltage reading.
    pub fn soc(&self) -> Option<f64> {
        let v = self.voltage.value()?;
        self.soc_curve.voltage_to_soc(v).ok()
    }

    /// SOC corrected for the voltage drop the given pack current would cause
    /// across this cell's internal impedance: `v_corr = v + I * R`.
    pub fn load_adjusted_soc(&self, current: f64) -> Option<f64> {
        let v = self.voltage.value()?;
        let corrected = v + current * DEFAULT_INTERNAL_IMPEDANCE_OHM;
        self.soc_curve.voltage_to_soc(corrected).ok()
    }

    pub fn is_relaxing(&self) -> bool {
        match self.last_discharge_time {
            Some(t) => t.elapsed() < self.relax_time,
            None => false,
        }
    }

    pub fn balance_pin_state(&self) -> BalancePinState {
        self.balance_pin_state
    }

    pub fn is_balance_discharging(&self) -> bool {
        self.balance_pin_state == BalancePinState::On
    }

    /// Request the slave start discharging this cell for `duration`. The
    /// caller (balancer) is responsible for actually publishing the request
    /// through the gateway; this only flips local state and enforces the
    /// precondition that someone is listening.
    pub fn start_balance_discharge(&mut self) -> Result<(), CellError> {
        if !self.balance_listener_registered {
            return Err(CellError::NoBalanceListener(self.id));
        }
        self.balance_pin_state = BalancePinState::On;
        Ok(())
    }

    /// No-op if the pin was already off (mirrors the source, which never
    /// guards this but is only ever called from the "is_balancing == 0"
    /// inbound handler).
    pub fn on_balance_discharged_stopped(&mut self) {
        self.balance_pin_state = BalancePinState::Off;
        self.last_discharge_time = Some(Instant::now());
    }

    /// Slave-reported balance pin state, independent of whether the master
    /// ever requested it. Unlike `start_balance_discharge`, this has no
    /// listener-registration precondition: it reflects what the slave says
    /// is happening, not what the master asked for.
    pub fn on_balance_pin_reported(&mut self, on: bool) {
        if on {
            self.balance_pin_state = BalancePinState::On;
        } else {
            self.on_balance_discharged_stopped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> CellId {
        CellId { module_id: 0, cell_id: 0 }
    }

    #[test]
    fn balance_discharge_requires_listener() {
        let mut cell = Cell::new(id());
        assert!(matches!(
            cell.start_balance_discharge(),
            Err(CellError::NoBalanceListener(_))
        ));
        cell.register_balance_listener();
        assert!(cell.start_balance_discharge().is_ok());
        assert_eq!(cell.balance_pin_state(), BalancePinState::On);
    }

    #[test]
    fn stopping_discharge_starts_relax_window() {
        let mut cell = Cell::new(id());
        cell.register_balance_listener();
        cell.start_balance_discharge().unwrap();
        assert!(!cell.is_relaxing());
        cell.on_balance_discharged_stopped();
        assert_eq!(cell.balance_pin_state(), BalancePinState::Off);
        assert!(cell.is_relaxing());
    }

    #[test]
    fn soc_is_none_until_first_update() {
        let cell = Cell::new(id());
        assert_eq!(cell.soc(), None);
    }

    #[test]
    fn soc_tracks_voltage_update() {
        let mut cell = Cell::new(id());
        cell.update_voltage(3.825);
        let soc = cell.soc().unwrap();
        assert!((soc - 0.70).abs() < 0.01);
    }

    #[test]
    fn balance_pin_reported_on_sets_pin_without_a_listener() {
        let mut cell = Cell::new(id());
        cell.on_balance_pin_reported(true);
        assert_eq!(cell.balance_pin_state(), BalancePinState::On);
    }

    #[test]
    fn balance_pin_reported_off_starts_relax_window() {
        let mut cell = Cell::new(id());
        cell.on_balance_pin_reported(true);
        cell.on_balance_pin_reported(false);
        assert_eq!(cell.balance_pin_state(), BalancePinState::Off);
        assert!(cell.is_relaxing());
    }

    #[test]
    fn load_adjusted_soc_differs_under_current() {
        let mut cell = Cell::new(id());
        cell.update_voltage(3.825);
        let unloaded = cell.soc().unwrap();
        let loaded = cell.load_adjusted_soc(-30.0).unwrap(); // discharging
        assert!(loaded < unloaded);
    }
}
