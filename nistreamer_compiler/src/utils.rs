use std::time::Instant;

use tracing::debug;

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the previous tick (or construction).
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        debug!("{msg}: {diff:.3} ms");
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a flat line index of a port-splitting card into `(port, line)`.
/// `None` for `lines_per_port == 0`.
pub fn flat_to_port_line(idx: usize, lines_per_port: usize) -> Option<(usize, usize)> {
    Some((
        idx.checked_div(lines_per_port)?,
        idx.checked_rem(lines_per_port)?,
    ))
}

/// Rounds `t` onto the clock grid of `samp_rate`.
///
/// `None` if the tick is not finite, negative, or leaves no room for one more tick in `usize`.
pub fn time_to_tick(t: f64, samp_rate: f64) -> Option<usize> {
    let pos = (t * samp_rate).round();
    if pos.is_finite() && pos >= 0.0 && pos < usize::MAX as f64 {
        Some(pos as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use crate::utils::*;

    #[test]
    fn flat_index_split() {
        assert_eq!(flat_to_port_line(19, 8), Some((2, 3)));
        assert_eq!(flat_to_port_line(63, 32), Some((1, 31)));
        assert_eq!(flat_to_port_line(3, 0), None);
    }

    #[test]
    fn tick_must_fit_usize() {
        assert_eq!(time_to_tick(0.25, 1e6), Some(250_000));
        assert_eq!(time_to_tick(1.04, 10.0), Some(10));
        assert_eq!(time_to_tick(1e300, 10.0), None);
        assert_eq!(time_to_tick(f64::INFINITY, 10.0), None);
        assert_eq!(time_to_tick(-1.0, 10.0), None);
    }
}
