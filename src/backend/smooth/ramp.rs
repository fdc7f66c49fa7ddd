use std::time::Duration;

/// Timing of a brightness ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampConfig {
    /// Time a ramp across the full range takes.
    pub full_scale: Duration,
    /// Tick period while ramping.
    pub min_interval: Duration,
    /// No ramp is shorter than this.
    pub min_period: Duration,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            full_scale: Duration::from_millis(1000),
            min_interval: Duration::from_millis(10),
            min_period: Duration::from_millis(1000),
        }
    }
}

/// Worker-side view of where the device is and where it is headed.
///
/// `step` always points from `real` towards `target` and never exceeds the
/// remaining distance, so ticks neither stall nor overshoot.
#[derive(Debug, Clone)]
pub struct Ramp {
    config: RampConfig,
    max: u32,
    real: i64,
    target: i64,
    step: i64,
    interval: Option<Duration>,
}

impl Ramp {
    pub fn new(config: RampConfig, max: u32, current: u32) -> Self {
        let mut ramp = Self {
            config,
            max: max.max(1),
            real: i64::from(current),
            target: i64::from(current),
            step: 0,
            interval: None,
        };
        ramp.plan();
        ramp
    }

    pub fn real(&self) -> u32 {
        self.real as u32
    }

    pub fn target(&self) -> u32 {
        self.target as u32
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    /// How long to wait for the next message; `None` while idle.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn is_idle(&self) -> bool {
        self.real == self.target
    }

    /// Replaces the target; earlier targets are forgotten.
    pub fn retarget(&mut self, requested: i32) {
        self.target = i64::from(requested).clamp(0, i64::from(self.max));
        self.plan();
    }

    /// Advances one step and returns the value to write, if any.
    pub fn tick(&mut self) -> Option<u32> {
        self.plan();
        if self.is_idle() {
            return None;
        }
        self.real += self.step;
        self.plan();
        Some(self.real as u32)
    }

    fn plan(&mut self) {
        let total = self.target - self.real;
        if total == 0 {
            self.step = 0;
            self.interval = None;
            return;
        }

        let max = i64::from(self.max);
        let full_scale = millis(self.config.full_scale);
        let min_interval = millis(self.config.min_interval).max(1);
        let min_period = millis(self.config.min_period);

        let period = (total
            .abs()
            .saturating_mul(full_scale)
            .saturating_add(max / 2)
            / max)
            .max(min_period);
        let ticks = (period / min_interval).max(1);

        self.step = match total / ticks {
            0 => total.signum(),
            step => step,
        };
        self.interval = Some(Duration::from_millis(min_interval as u64));
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_to_rest(ramp: &mut Ramp) -> Vec<u32> {
        let mut writes = Vec::new();
        while let Some(value) = ramp.tick() {
            writes.push(value);
            assert!(writes.len() < 100_000, "ramp did not converge");
        }
        writes
    }

    #[test]
    fn starts_idle_at_current_value() {
        let ramp = Ramp::new(RampConfig::default(), 255, 100);
        assert!(ramp.is_idle());
        assert_eq!(ramp.interval(), None);
        assert_eq!(ramp.step(), 0);
    }

    #[test]
    fn full_range_ramp_starts_at_one_percent_steps() {
        let mut ramp = Ramp::new(RampConfig::default(), 1000, 0);
        ramp.retarget(1000);
        assert_eq!(ramp.step(), 10);
        assert_eq!(ramp.interval(), Some(Duration::from_millis(10)));

        // Steps are re-planned from the remaining distance after every tick.
        assert_eq!(ramp.tick(), Some(10));
        assert_eq!(ramp.step(), 9);
        run_to_rest(&mut ramp);
        assert_eq!(ramp.real(), 1000);
        assert_eq!(ramp.interval(), None);
    }

    #[test]
    fn small_moves_step_by_one() {
        let mut ramp = Ramp::new(RampConfig::default(), 255, 100);
        ramp.retarget(97);
        assert_eq!(ramp.step(), -1);
        assert_eq!(run_to_rest(&mut ramp), vec![99, 98, 97]);
    }

    #[test]
    fn rising_ramp_is_monotonic_and_bounded() {
        let mut ramp = Ramp::new(RampConfig::default(), 255, 3);
        ramp.retarget(250);
        let writes = run_to_rest(&mut ramp);
        assert!(writes.windows(2).all(|w| w[0] <= w[1]));
        assert!(writes.iter().all(|&v| v <= 250));
        assert_eq!(writes.last(), Some(&250));
    }

    #[test]
    fn falling_ramp_is_monotonic_and_bounded() {
        let mut ramp = Ramp::new(RampConfig::default(), 7500, 7500);
        ramp.retarget(1);
        let writes = run_to_rest(&mut ramp);
        assert!(writes.windows(2).all(|w| w[0] >= w[1]));
        assert!(writes.iter().all(|&v| v >= 1));
        assert_eq!(writes.last(), Some(&1));
    }

    #[test]
    fn repeated_target_does_not_change_outcome() {
        let mut once = Ramp::new(RampConfig::default(), 255, 0);
        once.retarget(200);
        let once_writes = run_to_rest(&mut once);

        let mut twice = Ramp::new(RampConfig::default(), 255, 0);
        twice.retarget(200);
        twice.retarget(200);
        let twice_writes = run_to_rest(&mut twice);

        assert_eq!(once_writes, twice_writes);
        assert_eq!(twice.real(), 200);
    }

    #[test]
    fn retarget_mid_ramp_reverses_without_overshoot() {
        let mut ramp = Ramp::new(RampConfig::default(), 255, 0);
        ramp.retarget(255);
        for _ in 0..10 {
            ramp.tick();
        }
        let reached = ramp.real();
        assert!(reached > 0);

        ramp.retarget(1);
        assert!(ramp.step() < 0);
        let writes = run_to_rest(&mut ramp);
        assert!(writes.iter().all(|&v| v < reached && v >= 1));
        assert_eq!(ramp.real(), 1);
    }

    #[test]
    fn retarget_clamps_out_of_range_requests() {
        let mut ramp = Ramp::new(RampConfig::default(), 255, 10);
        ramp.retarget(9000);
        assert_eq!(ramp.target(), 255);
        ramp.retarget(-3);
        assert_eq!(ramp.target(), 0);
    }

    #[test]
    fn degenerate_timing_still_progresses() {
        let config = RampConfig {
            full_scale: Duration::ZERO,
            min_interval: Duration::ZERO,
            min_period: Duration::ZERO,
        };
        let mut ramp = Ramp::new(config, 100, 0);
        ramp.retarget(100);
        assert_eq!(ramp.step(), 100);
        assert_eq!(run_to_rest(&mut ramp), vec![100]);
    }

    #[test]
    fn huge_full_scale_saturates_instead_of_overflowing() {
        let config = RampConfig {
            full_scale: Duration::MAX,
            ..RampConfig::default()
        };
        let mut ramp = Ramp::new(config, 255, 0);
        ramp.retarget(255);
        assert_eq!(ramp.step(), 1);
        assert_eq!(ramp.interval(), Some(Duration::from_millis(10)));
        assert_eq!(ramp.tick(), Some(1));
    }
}
