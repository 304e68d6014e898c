//! Typed, windowed, threshold-classified scalar reading with hysteresis-style
//! escalation counters.
//!
//! Grounded on `original_source/measurement.py`. The escalation counter reset
//! policy is kept bit-for-bit identical to the source: see the comment on
//! `Measurement::update` for the open question this reproduces.

use std::time::{Duration, Instant};

/// The zone a value falls into, worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Classification {
    Ok,
    Warning,
    Critical,
    Implausible,
}

/// Frozen thresholds for one scalar quantity. `warning < critical < implausible`
/// on both sides of the band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementLimits {
    pub warning_lower: f64,
    pub warning_upper: f64,
    pub critical_lower: f64,
    pub critical_upper: f64,
    pub implausible_lower: f64,
    pub implausible_upper: f64,
}

impl MeasurementLimits {
    pub const fn new(
        implausible_lower: f64,
        critical_lower: f64,
        warning_lower: f64,
        warning_upper: f64,
        critical_upper: f64,
        implausible_upper: f64,
    ) -> Self {
        Self {
            warning_lower,
            warning_upper,
            critical_lower,
            critical_upper,
            implausible_lower,
            implausible_upper,
        }
    }

    /// Classify `value` into the worst zone it falls into. Intervals are
    /// closed (`[lo, hi]`); the outermost match wins.
    pub fn classify(&self, value: f64) -> Classification {
        if value < self.implausible_lower || value > self.implausible_upper {
            Classification::Implausible
        } else if value < self.critical_lower || value > self.critical_upper {
            Classification::Critical
        } else if value < self.warning_lower || value > self.warning_upper {
            Classification::Warning
        } else {
            Classification::Ok
        }
    }
}

/// A single subscribed callback. The owner handle is passed by value so
/// handlers don't need to borrow the pack.
type Handler<Owner> = Box<dyn Fn(Owner) + Send + Sync>;

/// Closed set of events a `Measurement` can fire, matching spec.md §9's
/// closed event-name list.
#[derive(Default)]
pub struct EventSink<Owner> {
    on_warning: Vec<Handler<Owner>>,
    on_critical: Vec<Handler<Owner>>,
    on_implausible: Vec<Handler<Owner>>,
}

impl<Owner: Clone> EventSink<Owner> {
    pub fn new() -> Self {
        Self {
            on_warning: Vec::new(),
            on_critical: Vec::new(),
            on_implausible: Vec::new(),
        }
    }

    pub fn on_warning(&mut self, f: impl Fn(Owner) + Send + Sync + 'static) {
        self.on_warning.push(Box::new(f));
    }

    pub fn on_critical(&mut self, f: impl Fn(Owner) + Send + Sync + 'static) {
        self.on_critical.push(Box::new(f));
    }

    pub fn on_implausible(&mut self, f: impl Fn(Owner) + Send + Sync + 'static) {
        self.on_implausible.push(Box::new(f));
    }

    fn fire_warning(&self, owner: &Owner) {
        for h in &self.on_warning {
            h(owner.clone());
        }
    }

    fn fire_critical(&self, owner: &Owner) {
        for h in &self.on_critical {
            h(owner.clone());
        }
    }

    fn fire_implausible(&self, owner: &Owner) {
        for h in &self.on_implausible {
            h(owner.clone());
        }
    }
}

/// Mutable cell/module/pack-level reading with escalation counters.
///
/// Invariant P1/P2 (spec.md §8): at most one counter increments per
/// `update`, and a value landing in the ok band zeroes all three.
pub struct Measurement<Owner> {
    value: Option<f64>,
    timestamp: Option<Instant>,
    pub limits: MeasurementLimits,
    implausible_counter: u32,
    critical_counter: u32,
    warning_counter: u32,
    owner: Owner,
    pub events: EventSink<Owner>,
}

impl<Owner: Clone> Measurement<Owner> {
    pub fn new(owner: Owner, limits: MeasurementLimits) -> Self {
        Self {
            value: None,
            timestamp: None,
            limits,
            implausible_counter: 0,
            critical_counter: 0,
            warning_counter: 0,
            owner,
            events: EventSink::new(),
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn initialized(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Age since the last update. `None` if never updated (callers must
    /// check `initialized()` first, per spec.md §4.2).
    pub fn age(&self) -> Option<Duration> {
        self.timestamp.map(|t| t.elapsed())
    }

    pub fn age_seconds(&self) -> Option<f64> {
        self.age().map(|d| d.as_secs_f64())
    }

    pub fn implausible_counter(&self) -> u32 {
        self.implausible_counter
    }

    pub fn critical_counter(&self) -> u32 {
        self.critical_counter
    }

    pub fn warning_counter(&self) -> u32 {
        self.warning_counter
    }

    pub fn classification(&self) -> Option<Classification> {
        self.value.map(|v| self.limits.classify(v))
    }

    /// Update the value, reclassify, advance the counter for the active
    /// severity, and fire the matching event.
    ///
    /// Counter-reset policy (reproduced exactly from
    /// `original_source/measurement.py::Measurement.update`, flagged as an
    /// open question in spec.md §9 — do not change without a domain-expert
    /// sign-off): reaching critical or warning resets every *less* severe
    /// counter, and falling back to ok resets all three. Reaching
    /// implausible resets nothing else: a value oscillating between warning
    /// and implausible leaves the warning counter climbing forever, because
    /// the source never emits an `on_ok` event to clear it.
    pub fn update(&mut self, value: f64) -> Classification {
        self.value = Some(value);
        self.timestamp = Some(Instant::now());

        let classification = self.limits.classify(value);
        match classification {
            Classification::Implausible => {
                self.implausible_counter += 1;
                self.events.fire_implausible(&self.owner);
            }
            Classification::Critical => {
                self.critical_counter += 1;
                self.implausible_counter = 0;
                self.events.fire_critical(&self.owner);
            }
            Classification::Warning => {
                self.warning_counter += 1;
                self.implausible_counter = 0;
                self.critical_counter = 0;
                self.events.fire_warning(&self.owner);
            }
            Classification::Ok => {
                self.warning_counter = 0;
                self.implausible_counter = 0;
                self.critical_counter = 0;
            }
        }
        classification
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MeasurementLimits {
        // implausible < critical < warning < ok-band < warning < critical < implausible
        MeasurementLimits::new(-1000.0, 3.0, 3.2, 4.15, 4.2, 1000.0)
    }

    #[test]
    fn p1_at_most_one_counter_increments() {
        let mut m = Measurement::new(1u32, limits());
        m.update(4.18); // warning zone
        assert_eq!(m.warning_counter(), 1);
        assert_eq!(m.critical_counter(), 0);
        assert_eq!(m.implausible_counter(), 0);
    }

    #[test]
    fn p2_ok_value_zeroes_all_counters() {
        let mut m = Measurement::new(1u32, limits());
        m.update(4.18); // warning
        m.update(3.7); // ok
        assert_eq!(m.warning_counter(), 0);
        assert_eq!(m.critical_counter(), 0);
        assert_eq!(m.implausible_counter(), 0);
    }

    #[test]
    fn implausible_lower_boundary_is_not_implausible() {
        // closed interval: value == implausible_lower classifies as critical, not implausible
        let l = limits();
        assert_eq!(l.classify(l.implausible_lower), Classification::Critical);
    }

    #[test]
    fn critical_resets_implausible_but_not_warning() {
        let mut m = Measurement::new(1u32, limits());
        m.update(2000.0); // implausible
        assert_eq!(m.implausible_counter(), 1);
        m.update(4.18); // warning, bumps warning, resets implausible+critical
        assert_eq!(m.warning_counter(), 1);
        assert_eq!(m.implausible_counter(), 0);
        m.update(3.1); // critical: resets implausible only, warning untouched
        assert_eq!(m.critical_counter(), 1);
        assert_eq!(m.warning_counter(), 1);
        assert_eq!(m.implausible_counter(), 0);
    }

    #[test]
    fn r3_age_is_zero_right_after_update() {
        let mut m = Measurement::new(1u32, limits());
        m.update(3.7);
        assert!(m.age_seconds().unwrap() < 0.01);
    }

    #[test]
    fn uninitialized_reports_not_initialized() {
        let m: Measurement<u32> = Measurement::new(1u32, limits());
        assert!(!m.initialized());
        assert_eq!(m.value(), None);
    }

    #[test]
    fn s2_warning_event_fires_exactly_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicU32::new(0));
        let mut m = Measurement::new(1u32, limits());
        let count_clone = count.clone();
        m.events.on_warning(move |_owner| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        m.update(4.18);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        m.update(3.7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
