//! Stand-in learner: each node pulls the model toward its own private target,
//! so the swarm average drifts toward the mean of all targets.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use swarm_learning::{Learner, ModelParameters, Result, SwarmError};

pub struct DriftLearner {
    target: Vec<f32>,
    lr: f32,
    samples: u64,
    step_time: Duration,
}

impl DriftLearner {
    pub fn new(dim: usize, lr: f32, step_time: Duration) -> Self {
        let mut rng = rand::thread_rng();
        let target = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Self { target, lr, samples: rng.gen_range(50..500), step_time }
    }

    #[cfg(test)]
    fn with_target(target: Vec<f32>, lr: f32) -> Self { Self { target, lr, samples: 100, step_time: Duration::ZERO } }
}

#[async_trait]
impl Learner for DriftLearner {
    async fn train_locally(&self, model: &ModelParameters) -> Result<(Vec<u8>, f64)> {
        if model.len() != self.target.len() {
            return Err(SwarmError::Codec(format!("model has {} parameters, learner expects {}", model.len(), self.target.len())));
        }
        if !self.step_time.is_zero() { tokio::time::sleep(self.step_time).await; }
        let trained: Vec<f32> = model.0.iter().zip(&self.target).map(|(p, t)| p + self.lr * (t - p)).collect();
        Ok((ModelParameters(trained).to_bytes(), self.samples as f64))
    }

    fn apply(&self, model: &mut ModelParameters, payload: &[u8]) -> Result<()> {
        let aggregated = ModelParameters::from_bytes(payload)?;
        if aggregated.len() != self.target.len() {
            return Err(SwarmError::Codec(format!("aggregate has {} parameters, learner expects {}", aggregated.len(), self.target.len())));
        }
        *model = aggregated;
        Ok(())
    }
}
