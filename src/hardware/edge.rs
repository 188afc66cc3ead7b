//! Edge detection on busy/idle status channels.
//!
//! Status channels report floating point values; both sides of an update are
//! rounded to the nearest integer before classification so `0.9999 -> 0.0`
//! still counts as a falling edge.

/// Transition between two consecutive channel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEdge {
    /// 0 -> 1: the subsystem just became busy.
    Rising,
    /// 1 -> 0: the subsystem just became idle.
    Falling,
    /// Anything else, including repeats of the same level.
    None,
}

impl StatusEdge {
    /// Classify an `(old, new)` pair.
    pub fn classify(old: f64, new: f64) -> Self {
        match (level(old), level(new)) {
            (0, 1) => StatusEdge::Rising,
            (1, 0) => StatusEdge::Falling,
            _ => StatusEdge::None,
        }
    }
}

fn level(value: f64) -> i64 {
    value.round() as i64
}

/// Latch that reports completion only after an observed start.
///
/// A falling edge that arrives before any rising edge (for example the
/// connection-time callback of a device that was already idle) is ignored.
/// Once completion has been reported the latch stays closed, so duplicated
/// notifications cannot complete twice.
#[derive(Debug, Default, Clone, Copy)]
pub struct EdgeLatch {
    was_busy: bool,
    completed: bool,
}

impl EdgeLatch {
    /// New latch that has not yet seen the device busy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one edge; returns `true` exactly once, on the completing edge.
    pub fn observe(&mut self, edge: StatusEdge) -> bool {
        if self.completed {
            return false;
        }
        match edge {
            StatusEdge::Rising => {
                self.was_busy = true;
                false
            }
            StatusEdge::Falling if self.was_busy => {
                self.completed = true;
                true
            }
            _ => false,
        }
    }

    /// Whether a rising edge has been seen.
    pub fn was_busy(&self) -> bool {
        self.was_busy
    }

    /// Whether completion has been reported.
    pub fn is_complete(&self) -> bool {
        self.completed
    }
}
