use std::time::Duration;
use tokio::time::sleep;

/// Delay that grows with every consecutive use until it hits `max` seconds.
pub struct CappedGrowingInterval {
    growth_formula: fn(f64) -> f64,
    iter_count: usize,
    max: f64,
}

impl CappedGrowingInterval {
    pub fn new(max: f64, growth_formula: fn(f64) -> f64) -> Self {
        Self {
            growth_formula,
            iter_count: 0,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let secs = (self.growth_formula)(self.iter_count as f64).min(self.max);
        self.iter_count += 1;

        Duration::from_secs_f64(secs.max(0.0))
    }

    pub async fn tick(&mut self) {
        sleep(self.next_delay()).await;
    }

    pub fn reset(&mut self) {
        self.iter_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::CappedGrowingInterval;
    use std::time::Duration;

    #[test]
    fn grows_then_caps() {
        let mut interval = CappedGrowingInterval::new(20.0, |x| 5.0 * 2f64.powf(x));

        assert_eq!(Duration::from_secs(5), interval.next_delay());
        assert_eq!(Duration::from_secs(10), interval.next_delay());
        assert_eq!(Duration::from_secs(20), interval.next_delay());
        assert_eq!(Duration::from_secs(20), interval.next_delay());

        interval.reset();
        assert_eq!(Duration::from_secs(5), interval.next_delay());
    }
}
