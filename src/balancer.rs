//! Passive-balancing scheduler: on a 5 s tick, selects which cells discharge,
//! for how long, under which voltage-spread regime.
//!
//! Grounded on `original_source/battery_system_balancer.py` for the overall
//! algorithm shape and the `required_voltage` formula; the three-tier regime
//! table in spec.md §4.7 (absent from that revision, which only implemented
//! a single flattened tier) is the authoritative decision table implemented
//! here.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::battery_module::ModuleId;
use crate::cell::Cell;
use crate::cell_list::CellListView;
use crate::gateway::{topics, GatewayError, SlaveGateway};
use crate::pack::Pack;
use crate::soc_curve::SocCurve;

pub const DEFAULT_MIN_DIFF_FOR_BALANCING: f64 = 0.003;
pub const MAX_DIFF_FOR_BALANCING: f64 = 0.5;
const ACCURATE_READING_STALE_AFTER: Duration = Duration::from_secs(20);
const ACCURATE_REQUEST_RATE_LIMIT_ACTIVE: Duration = Duration::from_secs(10);
const ACCURATE_REQUEST_RATE_LIMIT_IDLE: Duration = Duration::from_secs(120);
const TARGET_FLOOR_SOC: f64 = 0.15;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, Copy)]
struct Regime {
    relax_time: Duration,
    discharge_time: Duration,
    effective_min_diff: f64,
}

fn regime_for(diff: f64, configured_min_diff: f64) -> Regime {
    if diff > 0.010 {
        Regime {
            relax_time: Duration::from_secs(5),
            discharge_time: Duration::from_secs(120),
            effective_min_diff: configured_min_diff.max(0.010),
        }
    } else if diff > 0.005 {
        Regime {
            relax_time: Duration::from_secs(10),
            discharge_time: Duration::from_secs(60),
            effective_min_diff: configured_min_diff.max(0.005),
        }
    } else {
        Regime {
            relax_time: Duration::from_secs(20),
            discharge_time: Duration::from_secs(30),
            effective_min_diff: configured_min_diff.max(0.003),
        }
    }
}

/// What the tick actually did, returned for logging/tests instead of being
/// buried in side effects only.
#[derive(Debug, PartialEq)]
pub enum TickOutcome {
    Disabled,
    StillRelaxingOrBalancing,
    RequestedAccurateReadings,
    Idle { diff: f64 },
    UnsafeSpread { diff: f64 },
    Balanced { diff: f64, cells_discharging: usize },
}

pub struct Balancer {
    pub enabled: bool,
    pub ignore_slaves: HashSet<u32>,
    pub min_diff_for_balancing: f64,
    soc_curve: SocCurve,
    last_accurate_request: HashMap<u32, Instant>,
    is_idle: bool,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ignore_slaves: HashSet::new(),
            min_diff_for_balancing: DEFAULT_MIN_DIFF_FOR_BALANCING,
            soc_curve: SocCurve::new(),
            last_accurate_request: HashMap::new(),
            is_idle: true,
        }
    }

    /// Republish the current enabled/ignore-slaves config. Called on every
    /// gateway (re)connect and whenever either field is mutated, mirroring
    /// `battery_system_balancer.py`'s `on_connect += self.publish_config`.
    pub async fn publish_config(&self, gateway: &dyn SlaveGateway) -> Result<(), BalancerError> {
        gateway
            .publish(
                "master/core/config/balancing_enabled",
                &self.enabled.to_string(),
            )
            .await?;
        let mut ignored: Vec<u32> = self.ignore_slaves.iter().copied().collect();
        ignored.sort_unstable();
        gateway
            .publish(
                "master/core/config/balancing_ignore_slaves",
                &topics::format_ignore_slaves(&ignored),
            )
            .await?;
        Ok(())
    }

    fn possible_modules(pack: &Pack, ignore_slaves: &HashSet<u32>) -> Vec<ModuleId> {
        pack.modules
            .iter()
            .filter(|m| !ignore_slaves.contains(&m.id.0))
            .map(|m| m.id)
            .collect()
    }

    fn possible_cells<'a>(pack: &'a Pack, modules: &[ModuleId]) -> CellListView<'a> {
        let cells: Vec<&Cell> = pack
            .modules
            .iter()
            .filter(|m| modules.contains(&m.id))
            .flat_map(|m| &m.cells)
            .collect();
        CellListView::new(cells)
    }

    /// Run one balancing decision against `pack`, publishing diagnostics and
    /// balance requests through `gateway`. Never emits a request for a cell
    /// whose module is in `ignore_slaves` (P5).
    pub async fn tick(
        &mut self,
        pack: &mut Pack,
        gateway: &dyn SlaveGateway,
    ) -> Result<TickOutcome, BalancerError> {
        if !self.enabled {
            return Ok(TickOutcome::Disabled);
        }

        let modules = Self::possible_modules(pack, &self.ignore_slaves);
        {
            let possible = Self::possible_cells(pack, &modules);
            if possible.in_relax_time() || possible.currently_balancing() {
                return Ok(TickOutcome::StillRelaxingOrBalancing);
            }

            if possible.has_accurate_readings_older_than(ACCURATE_READING_STALE_AFTER.as_secs_f64())
            {
                let rate_limit = if self.is_idle {
                    ACCURATE_REQUEST_RATE_LIMIT_IDLE
                } else {
                    ACCURATE_REQUEST_RATE_LIMIT_ACTIVE
                };
                for &module in &modules {
                    let due = self
                        .last_accurate_request
                        .get(&module.0)
                        .map(|t| t.elapsed() >= rate_limit)
                        .unwrap_or(true);
                    if due {
                        gateway
                            .publish(&topics::read_accurate_topic(module.0), "1")
                            .await?;
                        self.last_accurate_request.insert(module.0, Instant::now());
                    }
                }
                return Ok(TickOutcome::RequestedAccurateReadings);
            }
        }

        let (hi, lo) = {
            let possible = Self::possible_cells(pack, &modules);
            match (
                possible.highest_accurate_voltage(),
                possible.lowest_accurate_voltage(),
            ) {
                (Some(hi), Some(lo)) => (hi, lo),
                _ => return Ok(TickOutcome::RequestedAccurateReadings),
            }
        };
        let diff = hi - lo;

        gateway
            .publish("master/core/balancer_cell_diff", &diff.to_string())
            .await?;
        gateway
            .publish("master/core/balancer_min_voltage", &lo.to_string())
            .await?;
        gateway
            .publish("master/core/balancer_max_voltage", &hi.to_string())
            .await?;

        if diff < self.min_diff_for_balancing {
            self.is_idle = true;
            return Ok(TickOutcome::Idle { diff });
        }
        if diff > MAX_DIFF_FOR_BALANCING {
            warn!(diff, "cell voltage spread exceeds safe balancing range");
            self.is_idle = true;
            return Ok(TickOutcome::UnsafeSpread { diff });
        }

        self.is_idle = false;
        let regime = regime_for(diff, self.min_diff_for_balancing);

        for module in pack.modules.iter_mut() {
            if self.ignore_slaves.contains(&module.id.0) {
                continue;
            }
            for cell in module.cells.iter_mut() {
                cell.relax_time = regime.relax_time;
            }
        }

        let required_voltage = (lo + regime.effective_min_diff)
            .max(self.soc_curve.soc_to_voltage(TARGET_FLOOR_SOC).unwrap_or(lo));

        let mut discharging = 0;
        for module in pack.modules.iter_mut() {
            if self.ignore_slaves.contains(&module.id.0) {
                continue;
            }
            let module_idx = module.id.0;
            for cell in module.cells.iter_mut() {
                if cell
                    .accurate_voltage
                    .value()
                    .is_some_and(|v| v > required_voltage)
                {
                    cell.register_balance_listener();
                    if cell.start_balance_discharge().is_ok() {
                        gateway
                            .publish(
                                &topics::cell_balance_request_topic(module_idx, cell.id.cell_id),
                                &regime.discharge_time.as_millis().to_string(),
                            )
                            .await?;
                        discharging += 1;
                    }
                }
            }
        }

        Ok(TickOutcome::Balanced {
            diff,
            cells_discharging: discharging,
        })
    }
}
