use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Direction in which an event function must cross zero to count as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventDirection {
    /// Negative to non-negative.
    Rising,
    /// Positive to non-positive.
    Falling,
    Either,
}

impl EventDirection {
    /// Whether the transition `before -> after` is a crossing in this direction.
    ///
    /// A function that starts exactly at zero has not crossed, so an integration that
    /// starts on a switching surface does not re-trigger the event it just handled.
    pub fn crossed(self, before: f64, after: f64) -> bool {
        let rising = before < 0.0 && after >= 0.0;
        let falling = before > 0.0 && after <= 0.0;
        match self {
            EventDirection::Rising => rising,
            EventDirection::Falling => falling,
            EventDirection::Either => rising || falling,
        }
    }
}

pub type EventFunction = Arc<dyn Fn(f64, &[f64]) -> f64 + Send + Sync>;

/// A scalar event function `g(t, y)` with a crossing direction and a terminal flag.
#[derive(Clone)]
pub struct EventDescriptor {
    function: EventFunction,
    direction: EventDirection,
    terminal: bool,
}

impl EventDescriptor {
    pub fn new<F>(function: F, direction: EventDirection, terminal: bool) -> Self
    where
        F: Fn(f64, &[f64]) -> f64 + Send + Sync + 'static,
    {
        Self {
            function: Arc::new(function),
            direction,
            terminal,
        }
    }

    pub fn value(&self, t: f64, x: &[f64]) -> f64 {
        (self.function)(t, x)
    }

    pub fn direction(&self) -> EventDirection {
        self.direction
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }
}

impl fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("direction", &self.direction)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

const MAX_ROOT_ITERATIONS: usize = 100;

/// Locates the zero of `g` bracketed by `[a, b]` with the Illinois variant of regula falsi.
///
/// `g_a` and `g_b` must have opposite signs (or `g_b == 0`). The returned time lies on the
/// `b` side of the crossing, so the state there is already past the switching surface.
pub fn locate_crossing<G>(g: G, mut a: f64, mut b: f64, mut g_a: f64, mut g_b: f64) -> f64
where
    G: Fn(f64) -> f64,
{
    if g_b == 0.0 {
        return b;
    }
    let tolerance = 4.0 * f64::EPSILON * a.abs().max(b.abs()).max((b - a).abs());
    let mut side = 0i8;

    for _ in 0..MAX_ROOT_ITERATIONS {
        if (b - a).abs() <= tolerance {
            break;
        }
        let mut t = (a * g_b - b * g_a) / (g_b - g_a);
        if !(t > a.min(b) && t < a.max(b)) {
            t = 0.5 * (a + b);
        }
        let g_t = g(t);
        if g_t == 0.0 {
            return t;
        }
        if (g_t > 0.0) == (g_b > 0.0) {
            b = t;
            g_b = g_t;
            if side == -1 {
                g_a *= 0.5;
            }
            side = -1;
        } else {
            a = t;
            g_a = g_t;
            if side == 1 {
                g_b *= 0.5;
            }
            side = 1;
        }
    }
    b
}
