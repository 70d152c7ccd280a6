//! Learning-rate schedule: linear warmup, then linear decay or constant.

use relm_core::LrSchedule;

#[derive(Debug, Clone, Copy)]
pub struct LrScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    kind: LrSchedule,
}

impl LrScheduler {
    /// `warmup_proportion` of `total_steps` is spent warming up.
    pub fn new(base_lr: f64, total_steps: usize, warmup_proportion: f64, kind: LrSchedule) -> Self {
        let warmup_steps = (total_steps as f64 * warmup_proportion) as usize;
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            kind,
        }
    }

    #[must_use]
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Learning rate for the update that follows `step` completed updates.
    #[must_use]
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        match self.kind {
            LrSchedule::Constant => self.base_lr,
            LrSchedule::Linear => {
                let remaining = self.total_steps.saturating_sub(step) as f64;
                let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
                self.base_lr * (remaining / span).max(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_warmup_and_decay() {
        let s = LrScheduler::new(1.0, 100, 0.1, LrSchedule::Linear);
        assert_eq!(s.warmup_steps(), 10);
        assert_eq!(s.lr_at(0), 0.0);
        assert!((s.lr_at(5) - 0.5).abs() < 1e-12);
        assert_eq!(s.lr_at(10), 1.0);
        assert!((s.lr_at(55) - 0.5).abs() < 1e-12);
        assert_eq!(s.lr_at(100), 0.0);
        assert_eq!(s.lr_at(150), 0.0);
    }

    #[test]
    fn test_constant_after_warmup() {
        let s = LrScheduler::new(2e-5, 50, 0.2, LrSchedule::Constant);
        assert_eq!(s.lr_at(10), 2e-5);
        assert_eq!(s.lr_at(49), 2e-5);
    }

    #[test]
    fn test_no_warmup() {
        let s = LrScheduler::new(1.0, 10, 0.0, LrSchedule::Linear);
        assert_eq!(s.lr_at(0), 1.0);
    }
}
