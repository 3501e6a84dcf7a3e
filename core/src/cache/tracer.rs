use std::cell::Cell;

/// Accumulates metered cost for a single call. `start`/`stop` bracket one
/// execution so the same `CacheDriver` (and its tracer) can be reused
/// bag-to-bag without leaking accounting between calls; reads and writes
/// through the cache only add cost while the tracer is running.
#[derive(Debug, Default)]
pub struct Tracer {
    running: Cell<bool>,
    accumulated: Cell<u64>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.running.set(true);
        self.accumulated.set(0);
    }

    /// Stops the tracer and returns the total accumulated cost.
    pub fn stop(&self) -> u64 {
        self.running.set(false);
        self.accumulated.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn add_cost(&self, cost: u64) {
        if self.running.get() {
            self.accumulated.set(self.accumulated.get().saturating_add(cost));
        }
    }

    pub fn accumulated(&self) -> u64 {
        self.accumulated.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_accumulates_while_running() {
        let tracer = Tracer::new();
        tracer.add_cost(10);
        assert_eq!(tracer.accumulated(), 0);

        tracer.start();
        tracer.add_cost(10);
        tracer.add_cost(5);
        assert_eq!(tracer.accumulated(), 15);

        assert_eq!(tracer.stop(), 15);
        assert!(!tracer.is_running());
    }

    #[test]
    fn start_resets_accumulator() {
        let tracer = Tracer::new();
        tracer.start();
        tracer.add_cost(100);
        tracer.start();
        assert_eq!(tracer.accumulated(), 0);
    }
}
