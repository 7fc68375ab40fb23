//! Bookkeeping for the epoch loop.
//!
//! Checkpoint selection and learning-rate decay look at the score history
//! differently: a checkpoint is kept when the epoch beats every earlier
//! epoch, while decay triggers when the epoch fails to beat the one right
//! before it.

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub global_step: usize,
    pub current_lr: f64,
    dev_scores: Vec<f64>,
}

impl TrainingState {
    pub fn new(lr: f64) -> Self {
        Self {
            global_step: 0,
            current_lr: lr,
            dev_scores: Vec::new(),
        }
    }

    /// Whether an epoch scoring `score` should be checkpointed. Call before
    /// [`TrainingState::record`].
    pub fn is_new_best(&self, score: f64) -> bool {
        self.dev_scores.iter().all(|&prev| score > prev)
    }

    /// Whether the learning rate should decay after `epoch` (1-based).
    /// Call before [`TrainingState::record`].
    pub fn should_decay(&self, epoch: usize, decay_epoch: usize, score: f64) -> bool {
        epoch > decay_epoch && self.dev_scores.last().is_some_and(|&prev| score <= prev)
    }

    /// Multiply the current rate by `factor` and return the new rate.
    pub fn decay(&mut self, factor: f64) -> f64 {
        self.current_lr *= factor;
        self.current_lr
    }

    pub fn record(&mut self, score: f64) {
        self.dev_scores.push(score);
    }

    pub fn history(&self) -> &[f64] {
        &self.dev_scores
    }

    /// Best score and the 1-based epoch it was first reached at.
    pub fn best(&self) -> Option<(f64, usize)> {
        let mut best: Option<(f64, usize)> = None;
        for (i, &score) in self.dev_scores.iter().enumerate() {
            if best.is_none_or(|(b, _)| score > b) {
                best = Some((score, i + 1));
            }
        }
        best
    }
}
