use std::f64::consts::PI;

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum LrScheduleKind {
    Linear,
    Cosine,
    CosineWithRestarts,
    Polynomial,
    Constant,
    ConstantWithWarmup,
}

/// Learning-rate multiplier as a function of the optimizer step.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    kind: LrScheduleKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: usize,
    power: f64,
}

/// Final learning rate of the polynomial schedule.
const POLY_LR_END: f64 = 1e-7;

impl LrSchedule {
    pub fn new(
        kind: LrScheduleKind,
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            num_cycles: 1,
            power: 1.0,
        }
    }

    pub fn with_cycles(mut self, num_cycles: usize) -> Self {
        self.num_cycles = num_cycles.max(1);
        self
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    fn warmup(&self, step: usize) -> Option<f64> {
        if step < self.warmup_steps {
            Some(step as f64 / self.warmup_steps.max(1) as f64)
        } else {
            None
        }
    }

    fn progress(&self, step: usize) -> f64 {
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        (step - self.warmup_steps) as f64 / span as f64
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        self.base_lr * self.factor(step)
    }

    fn factor(&self, step: usize) -> f64 {
        if self.kind == LrScheduleKind::Constant {
            return 1.0;
        }
        if let Some(w) = self.warmup(step) {
            return w;
        }
        match self.kind {
            LrScheduleKind::Constant | LrScheduleKind::ConstantWithWarmup => 1.0,
            LrScheduleKind::Linear => {
                let remaining = self.total_steps.saturating_sub(step) as f64;
                let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
                (remaining / span).max(0.)
            }
            LrScheduleKind::Cosine => {
                let progress = self.progress(step);
                (0.5 * (1.0 + (PI * progress).cos())).max(0.)
            }
            LrScheduleKind::CosineWithRestarts => {
                let progress = self.progress(step);
                if progress >= 1.0 {
                    return 0.;
                }
                let cycle = (self.num_cycles as f64 * progress) % 1.0;
                (0.5 * (1.0 + (PI * cycle).cos())).max(0.)
            }
            LrScheduleKind::Polynomial => {
                if step > self.total_steps {
                    return POLY_LR_END / self.base_lr;
                }
                let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
                let pct_remaining = 1.0 - (step - self.warmup_steps) as f64 / decay_steps;
                let lr_range = self.base_lr - POLY_LR_END;
                (lr_range * pct_remaining.powf(self.power) + POLY_LR_END) / self.base_lr
            }
        }
    }
}
