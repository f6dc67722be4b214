//! Pluggable worker provisioning and load-driven autoscaling.

use crate::WorkerId;
use async_trait::async_trait;
use mason_error::Result;
use parking_lot::Mutex;

/// Cloud-provider seam. The core never talks to a provider API
/// directly; deployments plug in an implementation. Provisioning is
/// network I/O, so the trait is async and runs on detached tasks.
#[async_trait]
pub trait WorkerProvisioner: Send + Sync {
    async fn provision(&self, count: usize) -> Result<Vec<WorkerId>>;
    async fn terminate(&self, id: &WorkerId) -> Result<()>;
}

/// What the autoscaler wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(usize),
    Down(usize),
    Hold,
}

#[derive(Debug)]
struct ScalerState {
    smoothed_load: f64,
    /// Consecutive observations on the same side of a threshold.
    streak: i32,
}

/// Exponentially smoothed load with hysteresis so brief spikes never
/// flap the pool size.
#[derive(Debug)]
pub struct Autoscaler {
    alpha: f64,
    scale_up_threshold: f64,
    scale_down_threshold: f64,
    /// Observations required past a threshold before acting.
    hysteresis: i32,
    min_workers: usize,
    max_workers: usize,
    state: Mutex<ScalerState>,
}

impl Autoscaler {
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        Self {
            alpha: 0.3,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            hysteresis: 3,
            min_workers,
            max_workers,
            state: Mutex::new(ScalerState {
                smoothed_load: 0.0,
                streak: 0,
            }),
        }
    }

    pub fn with_thresholds(mut self, down: f64, up: f64) -> Self {
        self.scale_down_threshold = down;
        self.scale_up_threshold = up;
        self
    }

    pub fn with_hysteresis(mut self, observations: i32) -> Self {
        self.hysteresis = observations.max(1);
        self
    }

    pub fn smoothed_load(&self) -> f64 {
        self.state.lock().smoothed_load
    }

    /// Feed one load observation (mean load across workers, in [0, 1])
    /// and get a decision. Decisions only fire after `hysteresis`
    /// consecutive observations beyond a threshold.
    pub fn observe(&self, load: f64, current_workers: usize) -> ScaleDecision {
        let mut state = self.state.lock();
        state.smoothed_load =
            self.alpha * load.clamp(0.0, 1.0) + (1.0 - self.alpha) * state.smoothed_load;

        if state.smoothed_load > self.scale_up_threshold {
            state.streak = state.streak.max(0) + 1;
            if state.streak >= self.hysteresis && current_workers < self.max_workers {
                state.streak = 0;
                let grow = ((current_workers + 1) / 2).max(1);
                return ScaleDecision::Up(grow.min(self.max_workers - current_workers));
            }
        } else if state.smoothed_load < self.scale_down_threshold {
            state.streak = state.streak.min(0) - 1;
            if -state.streak >= self.hysteresis && current_workers > self.min_workers {
                state.streak = 0;
                let shrink = (current_workers / 4).max(1);
                return ScaleDecision::Down(shrink.min(current_workers - self.min_workers));
            }
        } else {
            // Inside the band: any streak is broken.
            state.streak = 0;
        }
        ScaleDecision::Hold
    }
}
