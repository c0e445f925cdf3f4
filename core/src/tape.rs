//! Per-hydrophone signal tape: a time-indexed accumulator for future
//! receptions with a read-and-purge discipline (spec §4.1).
//!
//! Contributions from future transmissions arrive in non-monotonic order
//! (later transmissions may have smaller arrival times than earlier ones
//! due to path differences), so the tape is a flat additive buffer rather
//! than an ordered queue: `append` is O(1) amortized and `read` sums every
//! Reception overlapping the requested window before clamping.

use parking_lot::Mutex;

/// One contribution spanning `[t_start, t_start + samples.len())` on a
/// single hydrophone.
#[derive(Debug, Clone)]
pub struct Reception {
    pub t_start: i64,
    pub samples: Vec<f32>,
}

impl Reception {
    pub fn new(t_start: i64, samples: Vec<f32>) -> Self {
        Self { t_start, samples }
    }

    /// Sample index one past the last sample this reception contributes to.
    fn end(&self) -> i64 {
        self.t_start + self.samples.len() as i64
    }
}

/// Time-indexed accumulator of future receptions for one hydrophone.
///
/// All mutation goes through an internal lock so `append` (driven by the
/// transmit pipeline) and `read`/`purge` (driven by the scheduler) can be
/// called from different threads without an external lock, per spec §5's
/// "Tapes: mutated by transmit, read by scheduler. Must be protected."
pub struct SignalTape {
    receptions: Mutex<Vec<Reception>>,
}

impl Default for SignalTape {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalTape {
    pub fn new() -> Self {
        Self {
            receptions: Mutex::new(Vec::new()),
        }
    }

    /// Adds a contribution to the tape. O(1) amortized.
    pub fn append(&self, t_start: i64, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        self.receptions
            .lock()
            .push(Reception::new(t_start, samples));
    }

    /// Returns the additive sum of all contributions intersecting
    /// `[t_start, t_start + n)`, clamped to `[-1.0, 1.0]`. When `purge` is
    /// true, drops any Reception whose last sample index is
    /// `< t_start + n`.
    pub fn read(&self, t_start: i64, n: usize, purge: bool) -> Vec<f32> {
        let mut out = vec![0.0f32; n];
        let window_end = t_start + n as i64;

        let mut guard = self.receptions.lock();
        for r in guard.iter() {
            let overlap_start = r.t_start.max(t_start);
            let overlap_end = r.end().min(window_end);
            if overlap_start >= overlap_end {
                continue;
            }
            let out_offset = (overlap_start - t_start) as usize;
            let in_offset = (overlap_start - r.t_start) as usize;
            let len = (overlap_end - overlap_start) as usize;
            for i in 0..len {
                out[out_offset + i] += r.samples[in_offset + i];
            }
        }

        if purge {
            guard.retain(|r| r.end() - 1 >= window_end);
        }
        drop(guard);

        for s in &mut out {
            *s = s.clamp(-1.0, 1.0);
        }
        out
    }

    /// Drops Receptions entirely before `t_keep_from`.
    pub fn purge(&self, t_keep_from: i64) {
        self.receptions
            .lock()
            .retain(|r| r.end() - 1 >= t_keep_from);
    }

    /// Number of Receptions currently retained (testing/introspection).
    pub fn len(&self) -> usize {
        self.receptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_sums_overlapping_contributions() {
        let tape = SignalTape::new();
        tape.append(0, vec![0.5, 0.5, 0.5]);
        tape.append(1, vec![0.25, 0.25]);
        let out = tape.read(0, 3, false);
        assert_eq!(out, vec![0.5, 0.75, 0.75]);
    }

    #[test]
    fn read_clamps_saturating() {
        let tape = SignalTape::new();
        tape.append(0, vec![0.9]);
        tape.append(0, vec![0.9]);
        let out = tape.read(0, 1, false);
        assert_eq!(out, vec![1.0]);

        let tape2 = SignalTape::new();
        tape2.append(0, vec![-0.9]);
        tape2.append(0, vec![-0.9]);
        assert_eq!(tape2.read(0, 1, false), vec![-1.0]);
    }

    #[test]
    fn purge_on_read_drops_fully_consumed_receptions() {
        let tape = SignalTape::new();
        tape.append(0, vec![1.0, 1.0]);
        assert_eq!(tape.len(), 1);
        let _ = tape.read(0, 2, true);
        assert_eq!(tape.len(), 0, "reception fully within window must be purged");
    }

    #[test]
    fn purge_on_read_keeps_receptions_extending_past_window() {
        let tape = SignalTape::new();
        tape.append(0, vec![1.0, 1.0, 1.0, 1.0]);
        let _ = tape.read(0, 2, true);
        assert_eq!(tape.len(), 1, "reception extending past the window must survive");
        let out = tape.read(2, 2, true);
        assert_eq!(out, vec![1.0, 1.0]);
        assert_eq!(tape.len(), 0);
    }

    #[test]
    fn out_of_order_arrivals_accumulate_correctly() {
        // Later transmissions can have smaller arrival times due to path
        // differences; the tape must not assume monotonic t_start.
        let tape = SignalTape::new();
        tape.append(100, vec![1.0, 1.0]);
        tape.append(10, vec![2.0, 2.0]);
        assert_eq!(tape.read(10, 2, false), vec![2.0, 2.0]);
        assert_eq!(tape.read(100, 2, false), vec![1.0, 1.0]);
    }

    #[test]
    fn explicit_purge_drops_receptions_before_cutoff() {
        let tape = SignalTape::new();
        tape.append(0, vec![1.0, 1.0]);
        tape.append(10, vec![1.0, 1.0]);
        tape.purge(5);
        assert_eq!(tape.len(), 1);
        assert_eq!(tape.read(10, 2, false), vec![1.0, 1.0]);
    }

    #[test]
    fn straddling_reception_partially_overlaps_window() {
        let tape = SignalTape::new();
        tape.append(-2, vec![1.0, 1.0, 1.0, 1.0]);
        let out = tape.read(0, 2, false);
        assert_eq!(out, vec![1.0, 1.0]);
    }

    #[test]
    fn empty_append_is_ignored() {
        let tape = SignalTape::new();
        tape.append(0, vec![]);
        assert_eq!(tape.len(), 0);
    }
}
