//! Borrowed view over a set of cells with the aggregate queries the balancer
//! and safety supervisor need.
//!
//! Grounded on `original_source/battery_cell_list.py`.

use crate::cell::Cell;

/// A non-owning slice of cells. Constructed fresh per query (e.g. "all cells
/// in the pack", "all cells above required_voltage") rather than stored.
pub struct CellListView<'a> {
    cells: Vec<&'a Cell>,
}

impl<'a> CellListView<'a> {
    pub fn new(cells: Vec<&'a Cell>) -> Self {
        Self { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &&'a Cell> {
        self.cells.iter()
    }

    pub fn in_relax_time(&self) -> bool {
        self.cells.iter().any(|c| c.is_relaxing())
    }

    pub fn set_relax_time(&mut self, _seconds: std::time::Duration) {
        // Bulk mutation over borrowed, immutable references isn't
        // expressible here; callers that need this reach for the owning
        // pack/module and iterate `&mut Cell` directly. Kept as a documented
        // no-op so the view's API surface matches spec.md §4.6; see
        // `Pack::set_relax_time` for the real mutator.
    }

    pub fn currently_balancing(&self) -> bool {
        self.cells.iter().any(|c| c.is_balance_discharging())
    }

    pub fn highest_voltage(&self) -> Option<f64> {
        self.cells
            .iter()
            .filter_map(|c| c.voltage.value())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))))
    }

    pub fn lowest_voltage(&self) -> Option<f64> {
        self.cells
            .iter()
            .filter_map(|c| c.voltage.value())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.min(v))))
    }

    pub fn highest_accurate_voltage(&self) -> Option<f64> {
        self.cells
            .iter()
            .filter_map(|c| c.accurate_voltage.value())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))))
    }

    pub fn lowest_accurate_voltage(&self) -> Option<f64> {
        self.cells
            .iter()
            .filter_map(|c| c.accurate_voltage.value())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.min(v))))
    }

    pub fn with_voltage_above(&self, value: f64) -> Vec<&'a Cell> {
        self.cells
            .iter()
            .copied()
            .filter(|c| c.voltage.value().is_some_and(|v| v > value))
            .collect()
    }

    pub fn with_accurate_voltage_above(&self, value: f64) -> Vec<&'a Cell> {
        self.cells
            .iter()
            .copied()
            .filter(|c| c.accurate_voltage.value().is_some_and(|v| v > value))
            .collect()
    }

    pub fn highest_soc(&self) -> Option<f64> {
        self.cells
            .iter()
            .filter_map(|c| c.soc())
            .fold(None, |acc, s| Some(acc.map_or(s, |m: f64| m.max(s))))
    }

    pub fn lowest_soc(&self) -> Option<f64> {
        self.cells
            .iter()
            .filter_map(|c| c.soc())
            .fold(None, |acc, s| Some(acc.map_or(s, |m: f64| m.min(s))))
    }

    pub fn max_diff(&self) -> Option<f64> {
        Some(self.highest_voltage()? - self.lowest_voltage()?)
    }

    pub fn max_soc_diff(&self) -> Option<f64> {
        Some(self.highest_soc()? - self.lowest_soc()?)
    }

    /// Uninitialized cells count as infinitely old.
    pub fn has_voltage_older_than(&self, seconds: f64) -> bool {
        self.cells.iter().any(|c| {
            !c.voltage.initialized() || c.voltage.age_seconds().unwrap_or(f64::INFINITY) > seconds
        })
    }

    pub fn with_voltage_older_than(&self, seconds: f64) -> Vec<&'a Cell> {
        self.cells
            .iter()
            .copied()
            .filter(|c| {
                !c.voltage.initialized()
                    || c.voltage.age_seconds().unwrap_or(f64::INFINITY) > seconds
            })
            .collect()
    }

    pub fn has_accurate_readings_older_than(&self, seconds: f64) -> bool {
        self.cells.iter().any(|c| {
            !c.voltage.initialized()
                || c.accurate_voltage.age_seconds().unwrap_or(f64::INFINITY) > seconds
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, CellId};

    fn cell(module_id: u32, cell_id: u32) -> Cell {
        Cell::new(CellId { module_id, cell_id })
    }

    #[test]
    fn max_diff_none_when_uninitialized() {
        let cells = vec![cell(0, 0), cell(0, 1)];
        let refs: Vec<&Cell> = cells.iter().collect();
        let view = CellListView::new(refs);
        assert_eq!(view.max_diff(), None);
    }

    #[test]
    fn max_diff_reflects_spread() {
        let mut cells = vec![cell(0, 0), cell(0, 1)];
        cells[0].update_voltage(3.70);
        cells[1].update_voltage(3.71);
        let refs: Vec<&Cell> = cells.iter().collect();
        let view = CellListView::new(refs);
        assert!((view.max_diff().unwrap() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn uninitialized_cell_counts_as_older_than_any_age() {
        let cells = vec![cell(0, 0)];
        let refs: Vec<&Cell> = cells.iter().collect();
        let view = CellListView::new(refs);
        assert!(view.has_voltage_older_than(0.0));
    }

    #[test]
    fn with_voltage_above_filters_correctly() {
        let mut cells = vec![cell(0, 0), cell(0, 1)];
        cells[0].update_voltage(3.5);
        cells[1].update_voltage(3.9);
        let refs: Vec<&Cell> = cells.iter().collect();
        let view = CellListView::new(refs);
        assert_eq!(view.with_voltage_above(3.8).len(), 1);
    }
}
