/// Readiness barrier for one break: opens once every track has settled.
///
/// A track settles when it first reports it can play through (or, under the
/// skip policy, when it is given up on).  Each track index settles at most
/// once, so a backend repeating an event cannot open the gate early, and the
/// gate reports opening exactly once per instance.
#[derive(Debug)]
pub struct LoadGate {
    settled: Vec<bool>,
    remaining: usize,
    fired: bool,
}

impl LoadGate {
    pub fn new(tracks: usize) -> Self {
        Self {
            settled: vec![false; tracks],
            remaining: tracks,
            fired: false,
        }
    }

    /// A gate over zero tracks never opens; callers report that case separately.
    pub fn is_empty(&self) -> bool {
        self.settled.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    #[cfg(test)]
    pub fn is_settled(&self, index: usize) -> bool {
        self.settled.get(index).copied().unwrap_or(false)
    }

    /// Settle track `index`.  Returns `true` on the one call that settles the
    /// last outstanding track, `false` otherwise (including repeats and
    /// out-of-range indices).
    pub fn notify_one_loaded(&mut self, index: usize) -> bool {
        let Some(settled) = self.settled.get_mut(index) else {
            return false;
        };
        if *settled {
            return false;
        }
        *settled = true;
        self.remaining -= 1;

        if self.remaining == 0 && !self.fired {
            self.fired = true;
            return true;
        }
        false
    }
}
