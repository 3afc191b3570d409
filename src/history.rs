//! Fixed-depth smoothing ring buffer for per-device benchmark history.

/// History depth (`H`): number of most recent benchmarks kept per device.
pub const HISTORY_DEPTH: usize = 10;

/// Ring of the `HISTORY_DEPTH` most recent benchmarks for each of `D`
/// devices, used by the load balancer to smooth over OS-noise hiccups.
#[derive(Clone, Debug)]
pub struct History {
    /// `slots[h][d]`, `h` in insertion order (oldest first after a shift).
    slots: Vec<Vec<f64>>,
    device_count: usize,
}

impl History {
    pub fn new(device_count: usize) -> Self {
        Self {
            slots: Vec::with_capacity(HISTORY_DEPTH),
            device_count,
        }
    }

    /// Shifts history by one and stores `benchmarks` as the newest entry.
    /// `benchmarks.len()` must equal `device_count`.
    pub fn push(&mut self, benchmarks: &[f64]) {
        debug_assert_eq!(benchmarks.len(), self.device_count);
        if self.slots.len() == HISTORY_DEPTH {
            self.slots.remove(0);
        }
        self.slots.push(benchmarks.to_vec());
    }

    /// Arithmetic mean of the non-zero entries in `history[*][d]`; `None`
    /// if there is no history yet or every entry for `d` is zero.
    pub fn mean(&self, d: usize) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0u32;
        for row in &self.slots {
            let v = row[d];
            if v > 0.0 {
                sum += v;
                count += 1;
            }
        }
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }

    /// Full `history[H][D]` snapshot in the same layout the spec's
    /// `performanceHistory()` query exposes.
    pub fn snapshot(&self) -> Vec<Vec<f64>> {
        self.slots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_ignores_zero_entries() {
        let mut h = History::new(2);
        h.push(&[10.0, 0.0]);
        h.push(&[20.0, 5.0]);
        assert_eq!(h.mean(0), Some(15.0));
        assert_eq!(h.mean(1), Some(5.0));
    }

    #[test]
    fn empty_history_has_no_mean() {
        let h = History::new(2);
        assert_eq!(h.mean(0), None);
    }

    #[test]
    fn caps_at_history_depth() {
        let mut h = History::new(1);
        for i in 0..(HISTORY_DEPTH + 5) {
            h.push(&[i as f64 + 1.0]);
        }
        assert_eq!(h.snapshot().len(), HISTORY_DEPTH);
    }
}
